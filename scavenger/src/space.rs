use std::sync::atomic::{AtomicUsize, Ordering};

use object::{Address, ObjectWalker, WORD_SIZE, fill_hole};

/// A contiguous chunk handed out by a [`SubSpace`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub base: Address,
    pub top: Address,
}

impl Region {
    #[inline(always)]
    pub fn new(base: Address, top: Address) -> Self {
        debug_assert!(base <= top);
        Self { base, top }
    }

    #[inline(always)]
    pub fn empty() -> Self {
        Self {
            base: Address::NULL,
            top: Address::NULL,
        }
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        self.top - self.base
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.base == self.top
    }

    #[inline(always)]
    pub fn contains(&self, address: Address) -> bool {
        address >= self.base && address < self.top
    }
}

/// Memory the collector copies into.
///
/// All operations are safe to call from many GC threads at once.
pub trait SubSpace: Send + Sync {
    /// Exactly `size` contiguous bytes, or `None` if the space is full.
    fn collector_allocate(&self, size: usize) -> Option<Address>;

    /// A thread-local chunk of at least `min` and at most `preferred` bytes.
    fn collector_allocate_tlh(&self, min: usize, preferred: usize) -> Option<Region>;

    /// Give back `[base, top)` as dead space. The range stays walkable.
    fn abandon_heap_chunk(&self, base: Address, top: Address);

    fn free_bytes(&self) -> usize;

    fn region(&self) -> Region;
}

/// Bump-pointer space with a shared atomic cursor.
#[derive(Debug)]
pub struct BumpSpace {
    base: Address,
    end: Address,
    cursor: AtomicUsize,
}

impl BumpSpace {
    /// # Safety
    ///
    /// `[base, base + size)` must be mapped, writable and owned by this space
    /// for its whole lifetime.
    pub unsafe fn new(base: Address, size: usize) -> Self {
        debug_assert!(base.is_aligned(WORD_SIZE));
        Self {
            base,
            end: base.offset(size),
            cursor: AtomicUsize::new(base.as_usize()),
        }
    }

    #[inline(always)]
    pub fn base(&self) -> Address {
        self.base
    }

    #[inline(always)]
    pub fn end(&self) -> Address {
        self.end
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.end - self.base
    }

    /// First unallocated byte.
    #[inline(always)]
    pub fn cursor(&self) -> Address {
        Address::from_usize(self.cursor.load(Ordering::Acquire))
    }

    #[inline(always)]
    pub fn used(&self) -> usize {
        self.cursor() - self.base
    }

    #[inline(always)]
    pub fn contains(&self, address: Address) -> bool {
        address >= self.base && address < self.end
    }

    /// Bump by at least `min` and at most `max` bytes.
    fn bump(&self, min: usize, max: usize) -> Option<Region> {
        debug_assert!(min % WORD_SIZE == 0 && max % WORD_SIZE == 0 && min <= max);
        let end = self.end.as_usize();
        let mut current = self.cursor.load(Ordering::Relaxed);
        loop {
            let available = end - current;
            if available < min || min == 0 {
                return None;
            }
            let take = available.min(max);
            match self.cursor.compare_exchange_weak(
                current,
                current + take,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    let base = Address::from_usize(current);
                    return Some(Region::new(base, base.offset(take)));
                }
                Err(updated) => current = updated,
            }
        }
    }

    /// Current cursor, to rewind to later.
    #[inline(always)]
    pub fn mark(&self) -> Address {
        self.cursor()
    }

    /// Drop everything allocated since `mark`. Only valid while no other
    /// thread allocates here.
    pub fn rewind(&self, mark: Address) {
        debug_assert!(mark >= self.base && mark <= self.cursor());
        self.cursor.store(mark.as_usize(), Ordering::Release);
    }

    /// Forget every allocation.
    pub fn reset(&self) {
        self.rewind(self.base);
    }

    /// Walk everything allocated so far.
    ///
    /// # Safety
    ///
    /// No chunk may be handed out and left unparsable; all caches carved
    /// from this space must have been retired.
    pub unsafe fn walk(&self) -> ObjectWalker {
        // SAFETY: parsability per caller
        unsafe { ObjectWalker::new(self.base, self.cursor()) }
    }
}

impl SubSpace for BumpSpace {
    #[inline]
    fn collector_allocate(&self, size: usize) -> Option<Address> {
        self.bump(size, size).map(|region| region.base)
    }

    #[inline]
    fn collector_allocate_tlh(&self, min: usize, preferred: usize) -> Option<Region> {
        self.bump(min, preferred.max(min))
    }

    fn abandon_heap_chunk(&self, base: Address, top: Address) {
        debug_assert!(self.base <= base && top <= self.end);
        // SAFETY: the range was handed out by this space and is unused
        unsafe { fill_hole(base, top) };
    }

    #[inline]
    fn free_bytes(&self) -> usize {
        self.end - self.cursor()
    }

    #[inline]
    fn region(&self) -> Region {
        Region::new(self.base, self.end)
    }
}
