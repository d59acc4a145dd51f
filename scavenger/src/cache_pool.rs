use std::sync::atomic::{AtomicUsize, Ordering};

use object::{WORD_SIZE, align_up};
use parking_lot::Mutex;

use crate::{cache::CopyScanCache, space::SubSpace};

/// Heap bytes charged for one carved cache header.
///
/// A carved header is still a Rust allocation. What is carved is its
/// footprint: the space hands out `CARVED_HEADER_SIZE` bytes that are left
/// behind as a dead hole, so running out of headers costs heap room the way
/// a header stored in the heap would, and the space stays walkable.
pub const CARVED_HEADER_SIZE: usize = align_up(size_of::<CopyScanCache>(), WORD_SIZE);

/// Free list of cache headers.
///
/// Grows under a resize lock up to `max`; past that, headers are carved
/// out of heap memory and only live until the end of the cycle.
#[derive(Debug)]
pub struct FreeCachePool {
    free: Mutex<Vec<Box<CopyScanCache>>>,
    resize: Mutex<()>,
    reserved: AtomicUsize,
    carved: AtomicUsize,
    increment: usize,
    max: usize,
}

impl FreeCachePool {
    pub fn new(initial: usize, increment: usize, max: usize) -> Self {
        let free = (0..initial)
            .map(|_| Box::new(CopyScanCache::new(false)))
            .collect();
        Self {
            free: Mutex::new(free),
            resize: Mutex::new(()),
            reserved: AtomicUsize::new(initial),
            carved: AtomicUsize::new(0),
            increment,
            max,
        }
    }

    /// Headers ever reserved by the pool itself.
    pub fn reserved(&self) -> usize {
        self.reserved.load(Ordering::Relaxed)
    }

    /// Heap-carved headers handed out this cycle.
    pub fn carved(&self) -> usize {
        self.carved.load(Ordering::Relaxed)
    }

    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }

    /// A cleared header from the free list, growing the pool if allowed.
    pub fn pop(&self) -> Option<Box<CopyScanCache>> {
        if let Some(cache) = self.free.lock().pop() {
            return Some(cache);
        }
        let _resize = self.resize.lock();
        // another thread may have grown the pool while we waited
        if let Some(cache) = self.free.lock().pop() {
            return Some(cache);
        }
        let reserved = self.reserved.load(Ordering::Relaxed);
        let grow = self.increment.min(self.max.saturating_sub(reserved));
        if grow == 0 {
            return None;
        }
        self.reserved.store(reserved + grow, Ordering::Relaxed);
        log::trace!("cache pool grown by {grow} to {}", reserved + grow);
        let mut free = self.free.lock();
        free.extend((1..grow).map(|_| Box::new(CopyScanCache::new(false))));
        Some(Box::new(CopyScanCache::new(false)))
    }

    /// Like [`pop`](Self::pop), but once the pool is exhausted pay for a
    /// header with memory from the first space in `spaces` that has room.
    ///
    /// Returns the header and whether it was carved.
    pub fn pop_or_carve(&self, spaces: &[&dyn SubSpace]) -> Option<(Box<CopyScanCache>, bool)> {
        if let Some(cache) = self.pop() {
            return Some((cache, false));
        }
        for space in spaces {
            if let Some(address) = space.collector_allocate(CARVED_HEADER_SIZE) {
                space.abandon_heap_chunk(address, address.offset(CARVED_HEADER_SIZE));
                self.carved.fetch_add(1, Ordering::Relaxed);
                return Some((Box::new(CopyScanCache::new(true)), true));
            }
        }
        None
    }

    pub fn push(&self, mut cache: Box<CopyScanCache>) {
        cache.clear();
        self.free.lock().push(cache);
    }

    /// Drop carved headers at the end of a cycle; their heap memory is
    /// reclaimed with the space it came from.
    pub fn release_carved(&self) {
        let mut free = self.free.lock();
        free.retain(|cache| !cache.is_heap_carved());
        self.carved.store(0, Ordering::Relaxed);
    }
}
