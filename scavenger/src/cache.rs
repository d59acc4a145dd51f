//! Copy-scan caches.
//!
//! A cache is a bump-allocated chunk of survivor or tenure space that is a
//! copy destination and, once objects land in it, a unit of scan work.
//! Caches move between owners as `Box<CopyScanCache>`: a thread's active
//! copy caches, its deferred slot, the scan queue and the free pool. Only
//! the owner touches a cache, so a cache being scanned by one thread can
//! never be offered to another as a copy target.

use object::{Address, WORD_SIZE, fill_hole};

use crate::{object_model::ObjectScanner, space::Region};

/// Where a cache's memory lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheRole {
    Semispace,
    Tenurespace,
}

/// What a cache is currently used for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheMode {
    /// Active copy destination of one thread.
    Copy,
    /// Retired from copying; `[scan_current, alloc)` still needs scanning.
    Scan,
    /// Carries the tail of a large array; no memory of its own.
    SplitArray(ObjectScanner),
    /// No memory attached.
    Cleared,
}

#[derive(Debug)]
pub struct CopyScanCache {
    base: Address,
    alloc: Address,
    scan_current: Address,
    top: Address,
    role: CacheRole,
    mode: CacheMode,
    /// Object whose scan was interrupted to follow a child elsewhere.
    suspended: Option<ObjectScanner>,
    /// Header was paid for with heap memory after the pool ran dry.
    heap_carved: bool,
}

impl Default for CopyScanCache {
    fn default() -> Self {
        Self::new(false)
    }
}

impl CopyScanCache {
    pub fn new(heap_carved: bool) -> Self {
        Self {
            base: Address::NULL,
            alloc: Address::NULL,
            scan_current: Address::NULL,
            top: Address::NULL,
            role: CacheRole::Semispace,
            mode: CacheMode::Cleared,
            suspended: None,
            heap_carved,
        }
    }

    /// Attach `region` and make the cache a copy destination.
    pub fn activate(&mut self, role: CacheRole, region: Region) {
        debug_assert!(matches!(self.mode, CacheMode::Cleared));
        self.base = region.base;
        self.alloc = region.base;
        self.scan_current = region.base;
        self.top = region.top;
        self.role = role;
        self.mode = CacheMode::Copy;
        self.suspended = None;
        self.check_invariant();
    }

    /// Scan work for the tail of a split array.
    pub fn activate_split(&mut self, scanner: ObjectScanner) {
        debug_assert!(matches!(self.mode, CacheMode::Cleared));
        self.base = Address::NULL;
        self.alloc = Address::NULL;
        self.scan_current = Address::NULL;
        self.top = Address::NULL;
        self.mode = CacheMode::SplitArray(scanner);
    }

    #[inline(always)]
    pub fn role(&self) -> CacheRole {
        self.role
    }

    #[inline(always)]
    pub fn mode(&self) -> &CacheMode {
        &self.mode
    }

    #[inline(always)]
    pub fn is_copy(&self) -> bool {
        matches!(self.mode, CacheMode::Copy)
    }

    #[inline(always)]
    pub fn is_heap_carved(&self) -> bool {
        self.heap_carved
    }

    #[inline(always)]
    pub fn base(&self) -> Address {
        self.base
    }

    #[inline(always)]
    pub fn alloc(&self) -> Address {
        self.alloc
    }

    #[inline(always)]
    pub fn top(&self) -> Address {
        self.top
    }

    #[inline(always)]
    pub fn scan_current(&self) -> Address {
        self.scan_current
    }

    #[inline(always)]
    pub fn free_bytes(&self) -> usize {
        self.top - self.alloc
    }

    /// Bytes copied in but not yet scanned.
    #[inline(always)]
    pub fn scan_backlog(&self) -> usize {
        self.alloc - self.scan_current
    }

    pub fn contains(&self, address: Address) -> bool {
        address >= self.base && address < self.alloc
    }

    /// Bump `size` bytes off a copy cache.
    ///
    /// With `line` set, small objects that would straddle a `line`-sized
    /// boundary are pushed to the next boundary and the gap is filled.
    pub fn reserve(&mut self, size: usize, line: usize) -> Option<Address> {
        debug_assert!(self.is_copy(), "reserve on a cache that is not a copy target");
        debug_assert!(size % WORD_SIZE == 0);
        let mut start = self.alloc;
        if line != 0 && size <= line {
            let offset = start.as_usize() & (line - 1);
            if offset != 0 && offset + size > line {
                let aligned = start.align_up(line);
                if aligned.offset(size) <= self.top {
                    // SAFETY: the gap is inside our reservation and unused
                    unsafe { fill_hole(start, aligned) };
                    start = aligned;
                }
            }
        }
        if start.offset(size) > self.top {
            return None;
        }
        self.alloc = start.offset(size);
        self.check_invariant();
        Some(start)
    }

    /// Undo the reservation at `address` if it was the last one.
    pub fn retract(&mut self, address: Address, size: usize) -> bool {
        if address.offset(size) == self.alloc && address >= self.scan_current {
            self.alloc = address;
            true
        } else {
            false
        }
    }

    /// Anything left to scan in this cache.
    #[inline]
    pub fn has_scan_work(&self) -> bool {
        match self.mode {
            CacheMode::SplitArray(_) => true,
            CacheMode::Cleared => false,
            CacheMode::Copy | CacheMode::Scan => {
                self.suspended.is_some() || self.scan_current < self.alloc
            }
        }
    }

    /// Stop copying into this cache. Returns the unused tail.
    pub fn seal_for_scan(&mut self) -> Region {
        debug_assert!(self.is_copy());
        let remainder = Region::new(self.alloc, self.top);
        self.top = self.alloc;
        self.mode = CacheMode::Scan;
        self.check_invariant();
        remainder
    }

    /// Move the scan cursor past an object.
    #[inline]
    pub fn advance_scan(&mut self, to: Address) {
        debug_assert!(to >= self.scan_current);
        self.scan_current = to;
        self.check_invariant();
    }

    pub fn suspend(&mut self, scanner: ObjectScanner) {
        debug_assert!(self.suspended.is_none());
        self.suspended = Some(scanner);
    }

    pub fn take_suspended(&mut self) -> Option<ObjectScanner> {
        self.suspended.take()
    }

    /// Take the split scanner out of a split-array cache.
    pub fn take_split(&mut self) -> Option<ObjectScanner> {
        match std::mem::replace(&mut self.mode, CacheMode::Cleared) {
            CacheMode::SplitArray(scanner) => Some(scanner),
            other => {
                self.mode = other;
                None
            }
        }
    }

    /// Forget the memory; ready to go back to the free pool.
    pub fn clear(&mut self) {
        self.base = Address::NULL;
        self.alloc = Address::NULL;
        self.scan_current = Address::NULL;
        self.top = Address::NULL;
        self.mode = CacheMode::Cleared;
        self.suspended = None;
    }

    /// `base <= scan_current <= alloc <= top`.
    #[inline(always)]
    pub fn check_invariant(&self) {
        debug_assert!(
            self.base <= self.scan_current
                && self.scan_current <= self.alloc
                && self.alloc <= self.top,
            "cache invariant broken: {self:?}"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object::{ObjectWalker, WalkKind};

    fn create_test_cache(memory: &mut [u64]) -> CopyScanCache {
        let base = Address::from_ptr(memory.as_mut_ptr());
        let mut cache = CopyScanCache::default();
        cache.activate(
            CacheRole::Semispace,
            Region::new(base, base.offset(memory.len() * WORD_SIZE)),
        );
        cache
    }

    #[test]
    fn test_reserve_and_retract() {
        let mut memory = vec![0u64; 32];
        let mut cache = create_test_cache(&mut memory);
        let a = cache.reserve(64, 0).expect("fits");
        let b = cache.reserve(64, 0).expect("fits");
        assert_eq!(b, a.offset(64));
        assert!(!cache.retract(a, 64), "only the last reservation can be undone");
        assert!(cache.retract(b, 64));
        assert_eq!(cache.alloc(), a.offset(64));
        assert!(cache.reserve(256, 0).is_none());
        assert!(cache.has_scan_work());
    }

    #[test]
    fn test_hot_alignment_fills_the_gap() {
        let mut memory = vec![0u64; 64];
        let mut cache = create_test_cache(&mut memory);
        let line = 64;
        let to_line_end = line - (cache.base().as_usize() & (line - 1));
        // leave exactly 16 bytes before the next line boundary
        let first_size = if to_line_end >= 32 {
            to_line_end - 16
        } else {
            to_line_end + line - 16
        };
        let first = cache.reserve(first_size, 0).expect("fits");
        let hot = cache.reserve(32, line).expect("fits");
        assert!(hot.is_aligned(line), "object should start a new line");
        let gap_start = first.offset(first_size);
        assert_eq!(hot - gap_start, 16);
        // SAFETY: the gap was filled in reserve
        let entry = unsafe { ObjectWalker::new(gap_start, hot) }.next();
        assert_eq!(entry.map(|e| (e.kind, e.size)), Some((WalkKind::Hole, 16)));
    }

    #[test]
    fn test_seal_hands_back_remainder() {
        let mut memory = vec![0u64; 16];
        let mut cache = create_test_cache(&mut memory);
        let a = cache.reserve(32, 0).expect("fits");
        let remainder = cache.seal_for_scan();
        assert_eq!(remainder.base, a.offset(32));
        assert_eq!(cache.free_bytes(), 0);
        assert!(matches!(cache.mode(), CacheMode::Scan));
        cache.advance_scan(cache.alloc());
        assert!(!cache.has_scan_work());
        cache.clear();
        assert!(matches!(cache.mode(), CacheMode::Cleared));
    }
}
