//! Work queue of caches with pending scan work, plus termination detection.
//!
//! Threads that find no work wait on the monitor. Once every active thread
//! waits and nothing is queued, the last one bumps `done_index` and wakes
//! everybody; a thread compares the index it saw when it started against
//! the current one to tell "scan finished" from "new work arrived".

use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use parking_lot::{Condvar, Mutex};

use crate::cache::CopyScanCache;

/// Result of [`ScanQueue::wait_for_work`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Something was queued; try popping again.
    Retry,
    /// Every thread ran out of work; the scan phase is over.
    Done,
    /// An outside request asked the scan to stop early.
    Yield,
}

/// Hooks consulted while a thread waits.
pub struct WaitPolicy<'a> {
    /// Upper bound on a single wait; `None` waits until notified.
    pub timeout: Option<Duration>,
    pub should_yield: &'a dyn Fn() -> bool,
    /// Work held outside the queue (mutator caches in concurrent mode).
    /// Returning `true` keeps the phase alive.
    pub external_work: &'a dyn Fn() -> bool,
}

fn never() -> bool {
    false
}

impl WaitPolicy<'static> {
    /// Stop-the-world scanning: nothing outside the GC threads can add work.
    pub fn exclusive() -> Self {
        Self {
            timeout: None,
            should_yield: &never,
            external_work: &never,
        }
    }
}

#[derive(Debug)]
struct Monitor {
    waiting: usize,
    done_index: u64,
    active_threads: usize,
}

#[derive(Debug)]
pub struct ScanQueue {
    sublists: Box<[Mutex<Vec<Box<CopyScanCache>>>]>,
    cached_entries: AtomicUsize,
    waiting: AtomicUsize,
    monitor: Mutex<Monitor>,
    cvar: Condvar,
}

impl ScanQueue {
    pub fn new(sublists: usize) -> Self {
        Self {
            sublists: (0..sublists.max(1)).map(|_| Mutex::new(Vec::new())).collect(),
            cached_entries: AtomicUsize::new(0),
            waiting: AtomicUsize::new(0),
            monitor: Mutex::new(Monitor {
                waiting: 0,
                done_index: 0,
                active_threads: 0,
            }),
            cvar: Condvar::new(),
        }
    }

    /// Prepare for a scan phase run by `threads` threads. Returns the
    /// current done index.
    pub fn reset(&self, threads: usize) -> u64 {
        let mut monitor = self.monitor.lock();
        debug_assert_eq!(monitor.waiting, 0);
        monitor.active_threads = threads;
        monitor.done_index
    }

    pub fn done_index(&self) -> u64 {
        self.monitor.lock().done_index
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.cached_entries.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Threads currently blocked for work.
    #[inline]
    pub fn waiting_count(&self) -> usize {
        self.waiting.load(Ordering::Relaxed)
    }

    pub fn non_empty_sublists(&self) -> usize {
        self.sublists.iter().filter(|list| !list.lock().is_empty()).count()
    }

    pub fn push(&self, cache: Box<CopyScanCache>, hint: usize) {
        debug_assert!(cache.has_scan_work(), "pushed a cache without scan work");
        debug_assert!(!cache.is_copy(), "copy caches must be sealed before queueing");
        self.sublists[hint % self.sublists.len()].lock().push(cache);
        self.cached_entries.fetch_add(1, Ordering::SeqCst);
        if self.waiting.load(Ordering::SeqCst) > 0 {
            let _monitor = self.monitor.lock();
            self.cvar.notify_one();
        }
    }

    /// Take a cache, starting at the sublist for `hint` and stealing from
    /// the others.
    pub fn pop(&self, hint: usize) -> Option<Box<CopyScanCache>> {
        if self.cached_entries.load(Ordering::SeqCst) == 0 {
            return None;
        }
        let count = self.sublists.len();
        for i in 0..count {
            if let Some(cache) = self.sublists[(hint + i) % count].lock().pop() {
                self.cached_entries.fetch_sub(1, Ordering::SeqCst);
                return Some(cache);
            }
        }
        None
    }

    /// Block until work shows up, the phase ends, or `policy` asks to yield.
    ///
    /// `observed_done` is the done index the caller last saw and is updated
    /// when the phase ends.
    pub fn wait_for_work(&self, observed_done: &mut u64, policy: &WaitPolicy<'_>) -> WaitOutcome {
        let mut monitor = self.monitor.lock();
        if monitor.done_index != *observed_done {
            *observed_done = monitor.done_index;
            return WaitOutcome::Done;
        }
        monitor.waiting += 1;
        self.waiting.store(monitor.waiting, Ordering::SeqCst);

        loop {
            if self.cached_entries.load(Ordering::SeqCst) > 0 {
                monitor.waiting -= 1;
                self.waiting.store(monitor.waiting, Ordering::SeqCst);
                return WaitOutcome::Retry;
            }
            if (policy.should_yield)() {
                monitor.waiting -= 1;
                self.waiting.store(monitor.waiting, Ordering::SeqCst);
                self.cvar.notify_all();
                return WaitOutcome::Yield;
            }
            if monitor.waiting == monitor.active_threads && !(policy.external_work)() {
                monitor.done_index += 1;
                monitor.waiting = 0;
                self.waiting.store(0, Ordering::SeqCst);
                *observed_done = monitor.done_index;
                self.cvar.notify_all();
                return WaitOutcome::Done;
            }

            match policy.timeout {
                Some(timeout) => {
                    self.cvar.wait_for(&mut monitor, timeout);
                }
                None => self.cvar.wait(&mut monitor),
            }

            if monitor.done_index != *observed_done {
                *observed_done = monitor.done_index;
                return WaitOutcome::Done;
            }
        }
    }

    /// Wake every waiter so it re-checks its policy.
    pub fn notify_all(&self) {
        let _monitor = self.monitor.lock();
        self.cvar.notify_all();
    }

    /// Empty every sublist.
    pub fn drain(&self) -> Vec<Box<CopyScanCache>> {
        let mut drained = Vec::new();
        for list in self.sublists.iter() {
            drained.append(&mut list.lock());
        }
        self.cached_entries.fetch_sub(drained.len(), Ordering::SeqCst);
        drained
    }
}
