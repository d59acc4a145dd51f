//! Copy/scan progress sampling used to size copy caches.
//!
//! Worker threads fold `(scanned, copied, waiting)` samples into one packed
//! accumulator. Every [`THREAD_UPDATES_PER_MAJOR_UPDATE`] samples the thread
//! that completes the batch latches it; the latched value yields a scaling
//! factor in `[0, 1]` that shrinks copy caches when threads stall or most
//! scanned slots lead to copies.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

const SAMPLE_COUNT_BITS: u32 = 6;
const SAMPLE_SLOTS_BITS: u32 = 16;
const SAMPLE_WAITS_BITS: u32 = 64 - 2 * SAMPLE_SLOTS_BITS - SAMPLE_COUNT_BITS;

pub const THREAD_UPDATES_PER_MAJOR_UPDATE: u64 = 32;
pub const SLOTS_SCANNED_PER_THREAD_UPDATE: u64 = 512;
pub const UPDATE_HISTORY_SIZE: usize = 16;

const SCANNED_SHIFT: u32 = SAMPLE_COUNT_BITS;
const COPIED_SHIFT: u32 = SCANNED_SHIFT + SAMPLE_SLOTS_BITS;
const WAITS_SHIFT: u32 = COPIED_SHIFT + SAMPLE_SLOTS_BITS;

const UPDATE_MASK: u64 = (1 << SAMPLE_COUNT_BITS) - 1;
const SCANNED_MASK: u64 = ((1 << SAMPLE_SLOTS_BITS) - 1) << SCANNED_SHIFT;
const COPIED_MASK: u64 = ((1 << SAMPLE_SLOTS_BITS) - 1) << COPIED_SHIFT;

const SCANNED_OVERFLOW: u64 = 1 << (SCANNED_SHIFT + SAMPLE_SLOTS_BITS - 1);
const COPIED_OVERFLOW: u64 = 1 << (COPIED_SHIFT + SAMPLE_SLOTS_BITS - 1);
const WAITS_OVERFLOW: u64 = 1 << (WAITS_SHIFT + SAMPLE_WAITS_BITS - 1);
const COUNTER_OVERFLOW: u64 = WAITS_OVERFLOW | COPIED_OVERFLOW | SCANNED_OVERFLOW;

#[inline(always)]
fn sample(scanned: u64, copied: u64, waits: u64) -> u64 {
    1 | (scanned << SCANNED_SHIFT) | (copied << COPIED_SHIFT) | (waits << WAITS_SHIFT)
}

#[inline(always)]
fn waits(samples: u64) -> u64 {
    samples >> WAITS_SHIFT
}

#[inline(always)]
fn copied(samples: u64) -> u64 {
    (samples & COPIED_MASK) >> COPIED_SHIFT
}

#[inline(always)]
fn scanned(samples: u64) -> u64 {
    (samples & SCANNED_MASK) >> SCANNED_SHIFT
}

#[inline(always)]
fn updates(samples: u64) -> u64 {
    samples & UPDATE_MASK
}

/// One folded batch of major updates.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UpdateHistory {
    pub waits: u64,
    pub copied: u64,
    pub scanned: u64,
    pub updates: u64,
    /// Sum of active thread counts over the folded updates.
    pub threads: u64,
    /// Non-empty scan queue sublists seen at the last update.
    pub lists: u64,
    /// Caches queued at the last update.
    pub caches: u64,
}

#[derive(Debug)]
struct History {
    table: [UpdateHistory; UPDATE_HISTORY_SIZE],
    index: usize,
    folding_factor: u64,
}

#[derive(Debug)]
pub struct CopyScanRatio {
    accumulating: AtomicU64,
    accumulated: AtomicU64,
    thread_count: AtomicUsize,
    scaling_update_count: AtomicUsize,
    overflow_count: AtomicUsize,
    history: Mutex<History>,
}

impl Default for CopyScanRatio {
    fn default() -> Self {
        Self::new()
    }
}

impl CopyScanRatio {
    pub fn new() -> Self {
        Self {
            accumulating: AtomicU64::new(0),
            accumulated: AtomicU64::new(0),
            thread_count: AtomicUsize::new(0),
            scaling_update_count: AtomicUsize::new(0),
            overflow_count: AtomicUsize::new(0),
            history: Mutex::new(History {
                table: [UpdateHistory::default(); UPDATE_HISTORY_SIZE],
                index: 0,
                folding_factor: 1,
            }),
        }
    }

    /// Start a new cycle. Latched samples survive unless `reset_history`.
    pub fn reset(&self, threads: usize, reset_history: bool) {
        self.accumulating.store(0, Ordering::Relaxed);
        self.thread_count.store(threads, Ordering::Relaxed);
        if reset_history {
            self.accumulated.store(0, Ordering::Relaxed);
            self.scaling_update_count.store(0, Ordering::Relaxed);
            self.overflow_count.store(0, Ordering::Relaxed);
            let mut history = self.history.lock();
            history.table = [UpdateHistory::default(); UPDATE_HISTORY_SIZE];
            history.index = 0;
            history.folding_factor = 1;
        }
    }

    /// Fold a thread sample in once `scanned` reaches the per-thread update
    /// size. Resets the caller's counters when consumed.
    ///
    /// Returns `true` if this thread latched a major update.
    pub fn update(
        &self,
        slots_scanned: &mut u64,
        slots_copied: &mut u64,
        waiting: u64,
        queued_lists: usize,
        queued_caches: usize,
    ) -> bool {
        if *slots_scanned < SLOTS_SCANNED_PER_THREAD_UPDATE {
            return false;
        }
        let mut scanned_count = *slots_scanned;
        let mut copied_count = (*slots_copied).min(scanned_count);
        *slots_scanned = 0;
        *slots_copied = 0;
        // long array segments can push the counts past the slot fields
        while (SLOTS_SCANNED_PER_THREAD_UPDATE << 1) < scanned_count {
            scanned_count >>= 1;
            copied_count >>= 1;
        }

        let result = self.add_thread_update(sample(scanned_count, copied_count, waiting));
        if updates(result) != THREAD_UPDATES_PER_MAJOR_UPDATE {
            return false;
        }
        if result & COUNTER_OVERFLOW != 0 {
            self.overflow_count.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        self.accumulated.store(result, Ordering::Release);
        self.scaling_update_count.fetch_add(1, Ordering::Relaxed);
        self.record(result, queued_lists as u64, queued_caches as u64);
        true
    }

    fn add_thread_update(&self, update: u64) -> u64 {
        let mut current = self.accumulating.load(Ordering::Relaxed);
        loop {
            let next = current + update;
            let reached = updates(next) >= THREAD_UPDATES_PER_MAJOR_UPDATE;
            let stored = if reached { 0 } else { next };
            match self.accumulating.compare_exchange_weak(
                current,
                stored,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(updated) => current = updated,
            }
        }
    }

    fn record(&self, samples: u64, lists: u64, caches: u64) {
        let threads = self.thread_count.load(Ordering::Relaxed) as u64;
        let mut history = self.history.lock();
        let index = history.index;
        let folding = history.folding_factor;
        let entry = &mut history.table[index];
        entry.waits += waits(samples);
        entry.copied += copied(samples);
        entry.scanned += scanned(samples);
        entry.updates += updates(samples);
        entry.threads += threads;
        entry.lists = lists;
        entry.caches = caches;

        if entry.updates >= folding * THREAD_UPDATES_PER_MAJOR_UPDATE {
            if index + 1 < UPDATE_HISTORY_SIZE {
                history.index += 1;
            } else {
                // table full: fold pairs together and double the factor
                let table = history.table;
                for i in 0..UPDATE_HISTORY_SIZE / 2 {
                    let (a, b) = (table[2 * i], table[2 * i + 1]);
                    history.table[i] = UpdateHistory {
                        waits: a.waits + b.waits,
                        copied: a.copied + b.copied,
                        scanned: a.scanned + b.scanned,
                        updates: a.updates + b.updates,
                        threads: a.threads + b.threads,
                        lists: b.lists,
                        caches: b.caches,
                    };
                }
                for slot in &mut history.table[UPDATE_HISTORY_SIZE / 2..] {
                    *slot = UpdateHistory::default();
                }
                history.index = UPDATE_HISTORY_SIZE / 2;
                history.folding_factor <<= 1;
            }
        }
    }

    /// Factor in `[0, 1]` from the most recent major update, or `None`
    /// before the first one.
    pub fn scaling_factor(&self) -> Option<f64> {
        let samples = self.accumulated.load(Ordering::Acquire);
        if updates(samples) == 0 {
            return None;
        }
        Some(scaling_factor(
            self.thread_count.load(Ordering::Relaxed) as u64,
            waits(samples),
            copied(samples),
            scanned(samples),
            updates(samples),
        ))
    }

    pub fn scaling_update_count(&self) -> usize {
        self.scaling_update_count.load(Ordering::Relaxed)
    }

    pub fn overflow_count(&self) -> usize {
        self.overflow_count.load(Ordering::Relaxed)
    }

    /// Filled history records, oldest first.
    pub fn history(&self) -> Vec<UpdateHistory> {
        let history = self.history.lock();
        history
            .table
            .iter()
            .copied()
            .filter(|entry| entry.updates > 0)
            .collect()
    }
}

fn scaling_factor(threads: u64, waits: u64, copied: u64, scanned: u64, updates: u64) -> f64 {
    if copied > scanned || updates == 0 {
        return 1.0;
    }
    let round_up = |n: u64| n.div_ceil(THREAD_UPDATES_PER_MAJOR_UPDATE) * THREAD_UPDATES_PER_MAJOR_UPDATE;
    let copy_count = round_up(copied);
    let scan_count = round_up(scanned);
    let copy_scan_ratio = if scan_count > 0 {
        copy_count as f64 / scan_count as f64
    } else {
        1.0
    };
    let run_ratio = if threads > 0 {
        let average_waits = (waits + updates - 1) / updates;
        threads.saturating_sub(average_waits) as f64 / threads as f64
    } else {
        1.0
    };
    run_ratio * copy_scan_ratio
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_samples_are_not_folded() {
        let ratio = CopyScanRatio::new();
        ratio.reset(1, true);
        let (mut scanned, mut copied) = (100, 50);
        assert!(!ratio.update(&mut scanned, &mut copied, 0, 0, 0));
        assert_eq!(scanned, 100, "sample below threshold must be kept");
        assert_eq!(ratio.scaling_factor(), None);
    }

    #[test]
    fn test_major_update_after_batch() {
        let ratio = CopyScanRatio::new();
        ratio.reset(2, true);
        let mut latched = 0;
        for _ in 0..THREAD_UPDATES_PER_MAJOR_UPDATE {
            let (mut scanned, mut copied) = (SLOTS_SCANNED_PER_THREAD_UPDATE, 256);
            if ratio.update(&mut scanned, &mut copied, 0, 1, 1) {
                latched += 1;
            }
            assert_eq!(scanned, 0);
        }
        assert_eq!(latched, 1, "exactly one thread latches a batch");
        let factor = ratio.scaling_factor().expect("latched");
        assert!((factor - 0.5).abs() < 0.01, "copy/scan of 1/2, got {factor}");
        assert_eq!(ratio.history().len(), 1);
    }

    #[test]
    fn test_waiting_threads_lower_the_factor() {
        assert_eq!(scaling_factor(4, 0, 100, 100, 32), 1.0);
        let stalled = scaling_factor(4, 2 * 32, 100, 100, 32);
        assert!((stalled - 0.5).abs() < 1e-9, "two of four stalled, got {stalled}");
    }
}
