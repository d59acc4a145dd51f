//! Remembered set: tenured objects that may reference the nursery.
//!
//! Entries live in sublists behind one lock. GC threads append through a
//! thread-local [`RememberedSetFragment`] that is flushed when full, so the
//! lock is taken once per fragment rather than once per object.
//!
//! When the set would grow past its capacity it overflows: the lists are
//! dropped and every tenured object carrying the remembered bit is treated
//! as remembered until a later rebuild walks tenure space.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use object::Address;
use parking_lot::Mutex;

use crate::object_model::ObjectModel;

/// Low bit of an entry: object no longer needs remembering.
const DEFERRED_REMOVAL_TAG: u64 = 0b1;

/// One remembered object, possibly tagged for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct RememberedEntry(u64);

impl RememberedEntry {
    #[inline(always)]
    pub fn new(object: Address) -> Self {
        Self(object.as_usize() as u64)
    }

    #[inline(always)]
    pub fn object(self) -> Address {
        Address::from_usize((self.0 & !DEFERRED_REMOVAL_TAG) as usize)
    }

    #[inline(always)]
    pub fn is_tagged(self) -> bool {
        self.0 & DEFERRED_REMOVAL_TAG != 0
    }

    #[inline(always)]
    pub fn tag(&mut self) {
        self.0 |= DEFERRED_REMOVAL_TAG;
    }
}

pub type Sublist = Vec<RememberedEntry>;

/// Thread-local append buffer.
#[derive(Debug)]
pub struct RememberedSetFragment {
    entries: Sublist,
    capacity: usize,
}

impl RememberedSetFragment {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug)]
pub struct RememberedSet {
    sublists: Mutex<Vec<Sublist>>,
    /// Sublists handed out for the current parallel pass.
    pass: Mutex<Vec<Sublist>>,
    entries: AtomicUsize,
    max_entries: usize,
    overflowed: AtomicBool,
}

impl RememberedSet {
    pub fn new(max_entries: usize) -> Self {
        Self {
            sublists: Mutex::new(Vec::new()),
            pass: Mutex::new(Vec::new()),
            entries: AtomicUsize::new(0),
            max_entries,
            overflowed: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn is_overflowed(&self) -> bool {
        self.overflowed.load(Ordering::Acquire)
    }

    /// Entries currently recorded, tagged ones included.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record `object` if this call set its remembered bit.
    ///
    /// Returns `true` if the set overflowed because of this call.
    pub fn remember(
        &self,
        model: &dyn ObjectModel,
        fragment: &mut RememberedSetFragment,
        object: Address,
    ) -> bool {
        if !model.set_remembered(object) || self.is_overflowed() {
            return false;
        }
        fragment.entries.push(RememberedEntry::new(object));
        if fragment.entries.len() >= fragment.capacity {
            return self.flush(fragment);
        }
        false
    }

    /// Move the fragment's entries into the shared set.
    ///
    /// Returns `true` if the set overflowed because of this flush.
    pub fn flush(&self, fragment: &mut RememberedSetFragment) -> bool {
        if fragment.entries.is_empty() {
            return false;
        }
        let full = std::mem::replace(&mut fragment.entries, Vec::with_capacity(fragment.capacity));
        self.add_sublist(full)
    }

    /// Remember `object` from a mutator write barrier.
    pub fn add_direct(&self, model: &dyn ObjectModel, object: Address) -> bool {
        if !model.set_remembered(object) || self.is_overflowed() {
            return false;
        }
        self.add_sublist(vec![RememberedEntry::new(object)])
    }

    fn add_sublist(&self, list: Sublist) -> bool {
        let mut sublists = self.sublists.lock();
        if self.is_overflowed() {
            return false;
        }
        let count = self.entries.load(Ordering::Relaxed) + list.len();
        if count > self.max_entries {
            self.overflow_locked(&mut sublists);
            return true;
        }
        self.entries.store(count, Ordering::Relaxed);
        sublists.push(list);
        false
    }

    fn overflow_locked(&self, sublists: &mut Vec<Sublist>) {
        log::warn!(
            "remembered set overflowed at {} entries",
            self.entries.load(Ordering::Relaxed)
        );
        sublists.clear();
        self.entries.store(0, Ordering::Relaxed);
        self.overflowed.store(true, Ordering::Release);
    }

    /// Drop every entry and leave overflow. Remembered bits are untouched.
    pub fn clear(&self) {
        let mut sublists = self.sublists.lock();
        sublists.clear();
        self.pass.lock().clear();
        self.entries.store(0, Ordering::Relaxed);
        self.overflowed.store(false, Ordering::Release);
    }

    // ── Parallel passes ────────────────────────────────────────────

    /// Hand every sublist out for a pass over the set.
    pub fn begin_pass(&self) {
        let mut sublists = self.sublists.lock();
        let mut pass = self.pass.lock();
        debug_assert!(pass.is_empty(), "previous pass not finished");
        pass.append(&mut sublists);
    }

    pub fn next_sublist(&self) -> Option<Sublist> {
        self.pass.lock().pop()
    }

    /// Give back a sublist taken with [`next_sublist`](Self::next_sublist).
    /// Dropped if the set overflowed meanwhile.
    pub fn return_sublist(&self, list: Sublist) {
        let mut sublists = self.sublists.lock();
        if !self.is_overflowed() {
            sublists.push(list);
        }
    }

    /// Remove tagged entries. Single threaded, after a pass.
    pub fn compact(&self) -> usize {
        let mut sublists = self.sublists.lock();
        let mut removed = 0;
        for list in sublists.iter_mut() {
            let before = list.len();
            list.retain(|entry| !entry.is_tagged());
            removed += before - list.len();
        }
        sublists.retain(|list| !list.is_empty());
        let count = sublists.iter().map(Vec::len).sum();
        self.entries.store(count, Ordering::Relaxed);
        removed
    }

    /// Drop entries matching `remove`, for bookkeeping outside a pass.
    pub fn remove_where(&self, mut remove: impl FnMut(Address) -> bool) -> usize {
        let mut sublists = self.sublists.lock();
        let mut removed = 0;
        for list in sublists.iter_mut() {
            let before = list.len();
            list.retain(|entry| !remove(entry.object()));
            removed += before - list.len();
        }
        let count = sublists.iter().map(Vec::len).sum();
        self.entries.store(count, Ordering::Relaxed);
        removed
    }

    /// Snapshot of the remembered objects, untagged ones only.
    pub fn objects(&self) -> Vec<Address> {
        self.sublists
            .lock()
            .iter()
            .flatten()
            .filter(|entry| !entry.is_tagged())
            .map(|entry| entry.object())
            .collect()
    }

    pub fn contains(&self, object: Address) -> bool {
        self.sublists
            .lock()
            .iter()
            .flatten()
            .any(|entry| !entry.is_tagged() && entry.object() == object)
    }
}
