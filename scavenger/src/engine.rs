//! The scavenger: cycle setup, worker dispatch, remembered-set pruning and
//! percolation. Copying lives in `copy.rs`, scanning in `scan.rs`, the
//! failure path in `backout.rs` and the concurrent phases in
//! `concurrent.rs`.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicUsize, Ordering};

use object::{
    Address, ForwardState, Header, ObjectShape, Value, WalkKind,
};
use parking_lot::{Mutex, RwLock};

use crate::{
    ScavengeError, ScavengerSettings, SenseBarrier,
    cache_pool::FreeCachePool,
    concurrent::{ConcurrentPhase, ConcurrentState},
    copy_scan_ratio::CopyScanRatio,
    dispatcher::{Dispatcher, ThreadPoolDispatcher},
    events::{EventListener, ScavengerEvent},
    heap::Heap,
    object_model::{ObjectModel, ScanReason, StandardObjectModel},
    remembered_set::{RememberedSet, RememberedSetFragment},
    roots::{RootBuffer, RootProvider},
    scan_queue::{ScanQueue, WaitPolicy},
    space::{BumpSpace, SubSpace},
    stats::{FlipHistoryRow, GcHistory, ScavengerStats},
    tenure::{adjust_adaptive_age, calculate_tenure_mask, tenure_age},
    worker::WorkerContext,
};

/// Why a scavenge was skipped in favour of a global collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PercolateReason {
    /// The last cycle failed to tenure at least `failed_tenure_threshold` bytes.
    FailedTenure,
    /// The last concurrent cycle left objects pinned in the nursery.
    AbortedScavenge,
    /// Tenure space has less room than a cycle tenures on average.
    InsufficientTenureSpace,
    RememberedSetOverflow,
    MaxScavenges,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectOutcome {
    Scavenged,
    /// A copy reservation failed and the heap was rolled back.
    BackedOut,
    /// A concurrent cycle finished with objects pinned in place.
    Aborted,
    /// Nothing was collected; the caller should run a global collection
    /// and then call [`Scavenger::global_collection_complete`].
    Percolated(PercolateReason),
}

/// Back-out flag: raised by any thread, acted on by one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum BackOutState {
    Cleared = 0,
    Raised = 1,
    Started = 2,
}

/// Shared per-cycle state, reset at the start of every cycle.
#[derive(Debug)]
pub(crate) struct CycleState {
    pub(crate) tenure_mask: AtomicU32,
    pub(crate) evacuate_index: AtomicUsize,
    pub(crate) tenure_mark: AtomicUsize,
    pub(crate) backout: AtomicU8,
    /// Slots are updated with CAS and copies race mutators.
    pub(crate) concurrent: AtomicBool,
    /// Some object had to be self-forwarded.
    pub(crate) aborted: AtomicBool,
    /// One thread walks tenure space when the remembered set overflowed.
    pub(crate) overflow_walk_claimed: AtomicBool,
    pub(crate) initial_free: AtomicUsize,
    pub(crate) gc_count: AtomicUsize,
}

impl CycleState {
    fn new() -> Self {
        Self {
            tenure_mask: AtomicU32::new(0),
            evacuate_index: AtomicUsize::new(0),
            tenure_mark: AtomicUsize::new(0),
            backout: AtomicU8::new(BackOutState::Cleared as u8),
            concurrent: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            overflow_walk_claimed: AtomicBool::new(false),
            initial_free: AtomicUsize::new(0),
            gc_count: AtomicUsize::new(0),
        }
    }
}

#[derive(Debug, Default)]
struct PercolateState {
    failed_tenure: bool,
    aborted_scavenge: bool,
    scavenges_since_global: u32,
}

/// Generational copying collector for the nursery of a [`Heap`].
pub struct Scavenger<M: ObjectModel = StandardObjectModel> {
    pub(crate) settings: ScavengerSettings,
    pub(crate) heap: Heap,
    pub(crate) model: M,
    pub(crate) remembered_set: RememberedSet,
    pub(crate) cache_pool: FreeCachePool,
    pub(crate) scan_queue: ScanQueue,
    pub(crate) barrier: SenseBarrier,
    pub(crate) dispatcher: Box<dyn Dispatcher>,
    pub(crate) copy_scan_ratio: CopyScanRatio,
    pub(crate) cycle: CycleState,
    pub(crate) contexts: Box<[Mutex<WorkerContext>]>,
    pub(crate) increment_stats: Mutex<(ScavengerStats, FlipHistoryRow)>,
    cycle_stats: Mutex<ScavengerStats>,
    history: Mutex<GcHistory>,
    adaptive_age: AtomicU8,
    percolate: Mutex<PercolateState>,
    listeners: RwLock<Vec<Box<dyn EventListener>>>,
    /// Held for every stop-the-world increment.
    pub(crate) collecting: Mutex<()>,
    pub(crate) concurrent: ConcurrentState,
}

impl Scavenger<StandardObjectModel> {
    /// A scavenger over the standard object layout.
    pub fn with_settings(settings: ScavengerSettings) -> Result<Self, ScavengeError> {
        Self::new(settings, StandardObjectModel::default())
    }
}

impl<M: ObjectModel> Scavenger<M> {
    pub fn new(settings: ScavengerSettings, model: M) -> Result<Self, ScavengeError> {
        let threads = max_threads(&settings);
        Self::with_dispatcher(settings, model, Box::new(ThreadPoolDispatcher::new(threads)))
    }

    pub fn with_dispatcher(
        settings: ScavengerSettings,
        model: M,
        dispatcher: Box<dyn Dispatcher>,
    ) -> Result<Self, ScavengeError> {
        let heap = Heap::new(&settings)?;
        let threads = max_threads(&settings);
        let contexts = (0..threads)
            .map(|id| Mutex::new(WorkerContext::new(id, settings.remembered_set_fragment_size)))
            .collect();
        log::debug!(
            "scavenger ready: {} worker threads, {:?} ordering, concurrent: {}",
            settings.worker_threads,
            settings.scan_ordering,
            settings.concurrent.enabled
        );
        Ok(Self {
            remembered_set: RememberedSet::new(settings.remembered_set_max_entries),
            cache_pool: FreeCachePool::new(
                settings.cache_pool_initial,
                settings.cache_pool_increment,
                settings.cache_pool_max,
            ),
            scan_queue: ScanQueue::new(threads),
            barrier: SenseBarrier::new(),
            dispatcher,
            copy_scan_ratio: CopyScanRatio::new(),
            cycle: CycleState::new(),
            contexts,
            increment_stats: Mutex::new((ScavengerStats::default(), FlipHistoryRow::default())),
            cycle_stats: Mutex::new(ScavengerStats::default()),
            history: Mutex::new(GcHistory::default()),
            adaptive_age: AtomicU8::new(settings.tenure.adaptive_age),
            percolate: Mutex::new(PercolateState::default()),
            listeners: RwLock::new(Vec::new()),
            collecting: Mutex::new(()),
            concurrent: ConcurrentState::new(),
            heap,
            model,
            settings,
        })
    }

    // ── Accessors ──────────────────────────────────────────────────

    #[inline(always)]
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    #[inline(always)]
    pub fn model(&self) -> &M {
        &self.model
    }

    #[inline(always)]
    pub fn settings(&self) -> &ScavengerSettings {
        &self.settings
    }

    #[inline(always)]
    pub fn remembered_set(&self) -> &RememberedSet {
        &self.remembered_set
    }

    /// Totals of the last (or current) cycle.
    pub fn last_cycle_stats(&self) -> ScavengerStats {
        self.cycle_stats.lock().clone()
    }

    pub fn history(&self) -> GcHistory {
        self.history.lock().clone()
    }

    pub fn tenure_mask(&self) -> u32 {
        self.cycle.tenure_mask.load(Ordering::Relaxed)
    }

    pub fn add_listener(&self, listener: Box<dyn EventListener>) {
        self.listeners.write().push(listener);
    }

    pub(crate) fn emit(&self, event: ScavengerEvent<'_>) {
        for listener in self.listeners.read().iter() {
            listener.on_event(&event);
        }
    }

    /// Allocate in the nursery.
    pub fn allocate(&self, shape: ObjectShape) -> Option<Address> {
        self.heap.allocate(shape)
    }

    /// Record that tenured `source` now holds `value`.
    pub fn write_barrier(&self, source: Address, value: Value) {
        let Some(target) = value.address() else {
            return;
        };
        if self.heap.is_in_tenure(source)
            && self.heap.is_in_nursery(target)
            && self.remembered_set.add_direct(&self.model, source)
        {
            self.emit(ScavengerEvent::RememberedSetOverflow);
        }
    }

    // ── Spaces of the running cycle ────────────────────────────────

    #[inline(always)]
    pub(crate) fn evacuate_space(&self) -> &BumpSpace {
        self.heap
            .semispace(self.cycle.evacuate_index.load(Ordering::Relaxed))
    }

    #[inline(always)]
    pub(crate) fn survivor_space(&self) -> &BumpSpace {
        self.heap
            .semispace(1 - self.cycle.evacuate_index.load(Ordering::Relaxed))
    }

    #[inline(always)]
    pub(crate) fn is_in_evacuate(&self, address: Address) -> bool {
        self.evacuate_space().contains(address)
    }

    #[inline(always)]
    pub(crate) fn tenure_mark(&self) -> Address {
        Address::from_usize(self.cycle.tenure_mark.load(Ordering::Relaxed))
    }

    #[inline(always)]
    pub(crate) fn is_concurrent_cycle(&self) -> bool {
        self.cycle.concurrent.load(Ordering::Relaxed)
    }

    // ── Stop-the-world cycle ───────────────────────────────────────

    /// Run one synchronous scavenge, or percolate.
    pub fn scavenge(&self, roots: &mut dyn RootProvider) -> Result<CollectOutcome, ScavengeError> {
        let phase = self.concurrent.phase();
        if phase != ConcurrentPhase::Idle {
            return Err(ScavengeError::InvalidPhase(phase));
        }
        let Some(_collecting) = self.collecting.try_lock() else {
            return Err(ScavengeError::Busy);
        };
        if let Some(reason) = self.percolate_reason() {
            self.percolate(reason);
            return Ok(CollectOutcome::Percolated(reason));
        }
        Ok(self.main_thread_garbage_collect(roots))
    }

    fn main_thread_garbage_collect(&self, roots: &mut dyn RootProvider) -> CollectOutcome {
        let threads = self.stw_threads();
        self.setup_cycle(false, threads);
        self.emit(ScavengerEvent::IncrementStart {
            phase: ConcurrentPhase::Idle,
        });

        let buffer = RootBuffer::collect(roots);
        let observed = self.scan_queue.reset(threads);
        if !self.remembered_set.is_overflowed() {
            self.remembered_set.begin_pass();
        }
        self.emit(ScavengerEvent::ScavengeStart {
            threads,
            tenure_mask: self.tenure_mask(),
        });
        self.dispatcher.run(threads, &|id| {
            self.work_thread_garbage_collect(id, threads, observed, &buffer)
        });
        buffer.write_back(roots);

        let backed_out = self.is_backout_raised();
        let stats = self.finish_increment(!backed_out);
        self.emit(ScavengerEvent::ScavengeEnd { stats: &stats });
        self.emit(ScavengerEvent::IncrementEnd {
            phase: ConcurrentPhase::Idle,
            stats: &stats,
        });
        let outcome = if backed_out {
            self.emit(ScavengerEvent::BackOut { stats: &stats });
            CollectOutcome::BackedOut
        } else {
            let evacuate = self.evacuate_space();
            self.heap.flip_allocate();
            evacuate.reset();
            CollectOutcome::Scavenged
        };
        self.finish_cycle(outcome)
    }

    /// Body of one GC worker for a stop-the-world scavenge.
    pub(crate) fn work_thread_garbage_collect(
        &self,
        id: usize,
        threads: usize,
        observed_done: u64,
        roots: &RootBuffer,
    ) {
        let mut ctx = self.contexts[id].lock();
        ctx.begin_increment(observed_done, false);

        self.scavenge_roots(&mut ctx, roots);
        self.scavenge_remembered_set(&mut ctx);
        // roots complete everywhere before general scanning
        self.barrier.wait(threads);

        self.complete_scan(&mut ctx, &WaitPolicy::exclusive());
        self.release_copy_caches(&mut ctx);
        self.flush_remembered(&mut ctx);

        if self.barrier.wait(threads) {
            if self.is_backout_raised() {
                self.back_out(&mut ctx, roots);
            } else {
                self.process_clearable_references();
                if !self.remembered_set.is_overflowed() {
                    self.remembered_set.begin_pass();
                }
            }
        }
        self.barrier.wait(threads);

        if !self.is_backout_raised() {
            self.prune_remembered_sublists(&mut ctx);
            if self.barrier.wait(threads) {
                self.finish_remembered_set_prune();
            }
        }
        self.merge_worker_stats(&mut ctx);
    }

    pub(crate) fn scavenge_roots(&self, ctx: &mut WorkerContext, roots: &RootBuffer) {
        while let Some(chunk) = roots.claim() {
            for slot in chunk {
                self.copy_and_forward(ctx, slot);
            }
        }
    }

    pub(crate) fn flush_remembered(&self, ctx: &mut WorkerContext) {
        if self.remembered_set.flush(&mut ctx.fragment) {
            self.note_remembered_set_overflow(ctx);
        }
    }

    pub(crate) fn note_remembered_set_overflow(&self, ctx: &mut WorkerContext) {
        ctx.stats.caused_remembered_set_overflow = true;
        self.emit(ScavengerEvent::RememberedSetOverflow);
    }

    pub(crate) fn merge_worker_stats(&self, ctx: &mut WorkerContext) {
        ctx.stats.remembered_set_overflow = self.remembered_set.is_overflowed();
        let mut increment = self.increment_stats.lock();
        increment.0.merge(&ctx.stats);
        increment.1.merge(&ctx.flip_row);
        ctx.stats = ScavengerStats::default();
        ctx.flip_row = FlipHistoryRow::default();
    }

    /// Workers for a stop-the-world increment, as the dispatcher
    /// recommends, never more than `worker_threads`.
    pub(crate) fn stw_threads(&self) -> usize {
        let limit = self.settings.worker_threads;
        self.dispatcher.recommended_threads(limit).clamp(1, limit)
    }

    /// Reset shared state for a new cycle.
    pub(crate) fn setup_cycle(&self, concurrent: bool, threads: usize) {
        let gc_count = {
            let mut history = self.history.lock();
            history.gc_count += 1;
            history.flip_history.rotate();
            let mask = calculate_tenure_mask(
                &self.settings.tenure,
                self.adaptive_age.load(Ordering::Relaxed),
                &history.flip_history,
            );
            history.tenure_mask = mask;
            history.tenure_age = tenure_age(mask);
            self.cycle.tenure_mask.store(mask, Ordering::Relaxed);
            history.gc_count
        };
        debug_assert_eq!(
            self.heap.other_space().used(),
            0,
            "survivor space must be empty when a cycle starts"
        );
        self.cycle.gc_count.store(gc_count, Ordering::Relaxed);
        self.cycle
            .evacuate_index
            .store(self.heap.allocate_index(), Ordering::Relaxed);
        self.cycle
            .tenure_mark
            .store(self.heap.tenure().mark().as_usize(), Ordering::Relaxed);
        self.cycle
            .backout
            .store(BackOutState::Cleared as u8, Ordering::Release);
        self.cycle.concurrent.store(concurrent, Ordering::Release);
        self.cycle.aborted.store(false, Ordering::Relaxed);
        self.cycle
            .overflow_walk_claimed
            .store(false, Ordering::Relaxed);
        self.cycle
            .initial_free
            .store(self.heap.nursery_free_bytes(), Ordering::Relaxed);
        *self.cycle_stats.lock() = ScavengerStats::default();
        *self.increment_stats.lock() = Default::default();
        self.copy_scan_ratio.reset(threads, false);

        log::debug!(
            "cycle #{gc_count}: evacuating {} KB, tenure mask {:#06x}",
            self.evacuate_space().used() / 1024,
            self.tenure_mask()
        );
        self.emit(ScavengerEvent::CycleStart {
            gc_count,
            concurrent,
        });
    }

    /// Fold the increment totals into the cycle. The flip row only counts
    /// when the copies survive.
    pub(crate) fn finish_increment(&self, keep_flip_history: bool) -> ScavengerStats {
        let (stats, flip_row) = std::mem::take(&mut *self.increment_stats.lock());
        if keep_flip_history {
            self.history.lock().flip_history.current_mut().merge(&flip_row);
        }
        self.cycle_stats.lock().merge(&stats);
        stats
    }

    pub(crate) fn finish_cycle(&self, outcome: CollectOutcome) -> CollectOutcome {
        let stats = self.cycle_stats.lock().clone();
        let gc_count = self.cycle.gc_count.load(Ordering::Relaxed);
        {
            let mut history = self.history.lock();
            match outcome {
                CollectOutcome::Scavenged | CollectOutcome::Aborted => {
                    history.record_cycle(
                        self.cycle.initial_free.load(Ordering::Relaxed),
                        stats.tenure_bytes,
                    );
                    history.tilt_ratio =
                        self.heap.allocate_space().used() * 100 / self.settings.semispace_size();
                }
                CollectOutcome::BackedOut => {
                    history.backout_count += 1;
                    history.flip_history.clear_current();
                }
                CollectOutcome::Percolated(_) => {}
            }
        }
        if outcome == CollectOutcome::Scavenged && self.settings.tenure.adaptive {
            let age = self.adaptive_age.load(Ordering::Relaxed);
            let next = adjust_adaptive_age(
                &self.settings.tenure,
                age,
                self.settings.semispace_size(),
                stats.flip_bytes,
            );
            if next != age {
                log::debug!("adaptive tenure age {age} -> {next}");
                self.adaptive_age.store(next, Ordering::Relaxed);
            }
        }
        {
            let mut percolate = self.percolate.lock();
            percolate.scavenges_since_global += 1;
            if stats.failed_tenure_bytes >= self.settings.failed_tenure_threshold
                && stats.failed_tenure_bytes > 0
            {
                percolate.failed_tenure = true;
            }
            if outcome == CollectOutcome::Aborted {
                percolate.aborted_scavenge = true;
            }
        }
        self.cycle.concurrent.store(false, Ordering::Release);
        self.cache_pool.release_carved();
        self.emit(ScavengerEvent::CycleEnd {
            gc_count,
            outcome,
            stats: &stats,
        });
        outcome
    }

    /// Let the model drop or update weak referents. Evacuate objects that
    /// were not copied are dead.
    pub(crate) fn process_clearable_references(&self) {
        self.model.process_clearable_references(&|object| {
            if !self.is_in_evacuate(object) {
                return Some(object);
            }
            // SAFETY: the model passes evacuate object starts
            match unsafe { Header::at(object) }.forward_state() {
                ForwardState::Forwarded(copy) => Some(copy),
                ForwardState::SelfForwarded(_) => Some(object),
                _ => None,
            }
        });
    }

    // ── Percolation ────────────────────────────────────────────────

    pub(crate) fn percolate_reason(&self) -> Option<PercolateReason> {
        let percolate = self.percolate.lock();
        if percolate.failed_tenure {
            return Some(PercolateReason::FailedTenure);
        }
        if percolate.aborted_scavenge {
            return Some(PercolateReason::AbortedScavenge);
        }
        if self.settings.percolate_on_overflow && self.remembered_set.is_overflowed() {
            return Some(PercolateReason::RememberedSetOverflow);
        }
        let max = self.settings.max_scavenges_before_global;
        if max > 0 && percolate.scavenges_since_global >= max {
            return Some(PercolateReason::MaxScavenges);
        }
        let average = self.history.lock().avg_tenure_bytes;
        if average > 0 && self.heap.tenure().free_bytes() < average {
            return Some(PercolateReason::InsufficientTenureSpace);
        }
        None
    }

    pub(crate) fn percolate(&self, reason: PercolateReason) {
        self.history.lock().percolate_count += 1;
        self.emit(ScavengerEvent::Percolate { reason });
    }

    /// The caller's global collector finished.
    ///
    /// After an aborted concurrent cycle the global collector must have
    /// moved every live object out of the nursery's non-allocate
    /// semispace; it is emptied here.
    pub fn global_collection_complete(&self) {
        let aborted = {
            let mut percolate = self.percolate.lock();
            let aborted = percolate.aborted_scavenge;
            *percolate = PercolateState::default();
            aborted
        };
        if aborted {
            self.heap.other_space().reset();
        }
        if self.remembered_set.is_overflowed() {
            self.rebuild_remembered_set();
        }
        log::debug!("global collection complete, percolation state cleared");
    }

    // ── Remembered set ─────────────────────────────────────────────

    /// Scan every remembered object, or walk tenure space if the set
    /// overflowed.
    pub(crate) fn scavenge_remembered_set(&self, ctx: &mut WorkerContext) {
        if self.remembered_set.is_overflowed() {
            if !self.cycle.overflow_walk_claimed.swap(true, Ordering::AcqRel) {
                self.scavenge_overflowed_tenure(ctx);
            }
            return;
        }
        while let Some(list) = self.remembered_set.next_sublist() {
            for entry in list.iter().filter(|entry| !entry.is_tagged()) {
                self.scavenge_remembered_object(ctx, entry.object());
            }
            self.remembered_set.return_sublist(list);
        }
    }

    fn scavenge_overflowed_tenure(&self, ctx: &mut WorkerContext) {
        let mark = self.tenure_mark();
        // SAFETY: tenure below the mark was filled before this cycle and
        // is parsable; copies only land above it
        let walker = unsafe { object::ObjectWalker::new(self.heap.tenure().base(), mark) };
        for entry in walker {
            if matches!(entry.kind, WalkKind::Object(ForwardState::NotForwarded(_)))
                && self.model.is_remembered(entry.address)
            {
                self.scavenge_remembered_object(ctx, entry.address);
            }
        }
    }

    fn scavenge_remembered_object(&self, ctx: &mut WorkerContext, object: Address) {
        // SAFETY: remembered objects are live tenured objects
        let Some(class) = unsafe { Header::at(object) }.class_word() else {
            debug_assert!(false, "remembered object {object} is forwarded");
            return;
        };
        let scanner = self.model.scanner(object, class, ScanReason::Scavenge);
        self.scan_object_slots(ctx, scanner, None);
        if self.model.has_indirect_object_referents(object) {
            self.model.visit_indirect_referents(object, &mut |slot| {
                self.copy_and_forward(ctx, slot);
            });
        }
    }

    /// Whether tenured `object` still refers to the nursery.
    pub(crate) fn should_remember(&self, object: Address) -> bool {
        // SAFETY: callers pass live tenured objects
        let Some(class) = unsafe { Header::at(object) }.class_word() else {
            return false;
        };
        let refers_to_nursery = |value: Value| {
            value
                .address()
                .is_some_and(|target| self.heap.is_in_nursery(target))
        };
        let mut remember = self
            .model
            .scanner(object, class, ScanReason::ShouldRemember)
            .any(|slot| refers_to_nursery(slot.load()));
        if !remember && self.model.has_indirect_object_referents(object) {
            self.model.visit_indirect_referents(object, &mut |slot| {
                remember |= refers_to_nursery(slot.load());
            });
        }
        remember
    }

    /// Tag entries that no longer refer to the nursery.
    pub(crate) fn prune_remembered_sublists(&self, ctx: &mut WorkerContext) {
        while let Some(mut list) = self.remembered_set.next_sublist() {
            for entry in list.iter_mut().filter(|entry| !entry.is_tagged()) {
                let object = entry.object();
                if !self.should_remember(object) {
                    self.model.clear_remembered(object);
                    entry.tag();
                    ctx.stats.remembered_objects_pruned += 1;
                }
            }
            self.remembered_set.return_sublist(list);
        }
    }

    pub(crate) fn finish_remembered_set_prune(&self) {
        if self.remembered_set.is_overflowed() {
            self.rebuild_remembered_set();
        } else {
            let removed = self.remembered_set.compact();
            log::trace!(
                "remembered set pruned: {removed} removed, {} left",
                self.remembered_set.len()
            );
        }
    }

    /// Rebuild a precise set by walking all of tenure space.
    pub(crate) fn rebuild_remembered_set(&self) {
        self.remembered_set.clear();
        let mut fragment = RememberedSetFragment::new(self.settings.remembered_set_fragment_size);
        // SAFETY: called between increments, with every cache retired
        for entry in unsafe { self.heap.tenure().walk() } {
            if !matches!(entry.kind, WalkKind::Object(ForwardState::NotForwarded(_))) {
                continue;
            }
            self.model.clear_remembered(entry.address);
            if self.should_remember(entry.address) {
                self.remembered_set
                    .remember(&self.model, &mut fragment, entry.address);
            }
        }
        self.remembered_set.flush(&mut fragment);
        log::debug!(
            "remembered set rebuilt from tenure space: {} entries (overflowed: {})",
            self.remembered_set.len(),
            self.remembered_set.is_overflowed()
        );
    }
}

fn max_threads(settings: &ScavengerSettings) -> usize {
    let background = if settings.concurrent.enabled {
        settings.concurrent.background_threads
    } else {
        0
    };
    settings.worker_threads.max(background).max(1)
}

impl<M: ObjectModel> std::fmt::Debug for Scavenger<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scavenger")
            .field("heap", &self.heap)
            .field("phase", &self.concurrent.phase())
            .field("remembered", &self.remembered_set.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use object::{HeaderFlags, identity_hash};

    use super::*;
    use crate::{
        OS_PAGE_SIZE, ScanOrdering, SettingsError, TenureSettings,
        test_graph::{Rng, build_graph, fingerprint, plain_load, ref_at, set_ref, slot_of},
    };

    fn small_settings() -> ScavengerSettings {
        ScavengerSettings {
            nursery_size: 256 * 1024,
            tenure_size: 256 * 1024,
            worker_threads: 1,
            min_cache_size: 1024,
            max_cache_size: 8 * 1024,
            tenure: TenureSettings::fixed(10),
            ..ScavengerSettings::default()
        }
    }

    fn age_of(object: Address) -> u8 {
        unsafe { Header::at(object) }.age()
    }

    #[test]
    fn test_survivors_age_in_the_nursery() {
        let scavenger = Scavenger::with_settings(small_settings()).unwrap();
        let a = scavenger.allocate(ObjectShape::slots(1, 0)).unwrap();
        let b = scavenger.allocate(ObjectShape::bytes(8)).unwrap();
        set_ref(a, 0, b);
        let _garbage = scavenger.allocate(ObjectShape::array(32)).unwrap();
        let mut roots = vec![Value::reference(a)];

        assert_eq!(scavenger.scavenge(&mut roots).unwrap(), CollectOutcome::Scavenged);
        let a1 = roots[0].address().unwrap();
        let b1 = ref_at(a1, 0).unwrap();
        assert_ne!(a1, a);
        assert!(scavenger.heap().allocate_space().contains(a1));
        assert!(scavenger.heap().allocate_space().contains(b1));
        assert_eq!((age_of(a1), age_of(b1)), (1, 1));
        assert_eq!(scavenger.heap().other_space().used(), 0);

        let stats = scavenger.last_cycle_stats();
        assert_eq!(stats.flip_count, 2);
        assert_eq!(
            stats.flip_bytes,
            ObjectShape::slots(1, 0).size() + ObjectShape::bytes(8).size()
        );

        assert_eq!(scavenger.scavenge(&mut roots).unwrap(), CollectOutcome::Scavenged);
        let a2 = roots[0].address().unwrap();
        assert_eq!(age_of(a2), 2);
        assert_eq!(age_of(ref_at(a2, 0).unwrap()), 2);
        assert_eq!(scavenger.history().gc_count, 2);
    }

    #[test]
    fn test_fixed_age_tenures_on_second_cycle() {
        let settings = ScavengerSettings {
            tenure: TenureSettings::fixed(1),
            ..small_settings()
        };
        let scavenger = Scavenger::with_settings(settings).unwrap();
        let a = scavenger.allocate(ObjectShape::slots(1, 0)).unwrap();
        let b = scavenger.allocate(ObjectShape::bytes(8)).unwrap();
        set_ref(a, 0, b);
        let mut roots = vec![Value::reference(a)];

        scavenger.scavenge(&mut roots).unwrap();
        let a1 = roots[0].address().unwrap();
        assert!(scavenger.heap().is_in_nursery(a1));
        assert_eq!(scavenger.last_cycle_stats().tenure_count, 0);

        scavenger.scavenge(&mut roots).unwrap();
        let a2 = roots[0].address().unwrap();
        let b2 = ref_at(a2, 0).unwrap();
        assert!(scavenger.heap().is_in_tenure(a2));
        assert!(scavenger.heap().is_in_tenure(b2));
        assert_eq!(age_of(a2), 0);
        assert_eq!(scavenger.history().tenure_age, 1);
        assert_eq!(scavenger.last_cycle_stats().tenure_count, 2);
        // nothing tenured refers to the nursery
        assert!(scavenger.remembered_set().is_empty());
    }

    #[test]
    fn test_tenured_copy_with_young_referent_is_remembered() {
        let settings = ScavengerSettings {
            tenure: TenureSettings::fixed(1),
            ..small_settings()
        };
        let scavenger = Scavenger::with_settings(settings).unwrap();
        let a = scavenger.allocate(ObjectShape::slots(2, 0)).unwrap();
        let mut roots = vec![Value::reference(a)];
        scavenger.scavenge(&mut roots).unwrap();

        let a1 = roots[0].address().unwrap();
        let young = scavenger.allocate(ObjectShape::slots(1, 0)).unwrap();
        slot_of(young, 0).store(Value::from_i64(7));
        set_ref(a1, 1, young);
        scavenger.scavenge(&mut roots).unwrap();

        let a2 = roots[0].address().unwrap();
        let young2 = ref_at(a2, 1).unwrap();
        assert!(scavenger.heap().is_in_tenure(a2));
        assert!(scavenger.heap().allocate_space().contains(young2));
        assert_eq!(slot_of(young2, 0).load().as_i64(), Some(7));
        assert!(scavenger.remembered_set().contains(a2));
        assert!(scavenger.model().is_remembered(a2));
    }

    #[test]
    fn test_remembered_object_keeps_referent_alive_until_pruned() {
        let scavenger = Scavenger::with_settings(small_settings()).unwrap();
        let old = scavenger
            .heap()
            .allocate_tenured(ObjectShape::slots(1, 0))
            .unwrap();
        let young = scavenger.allocate(ObjectShape::slots(1, 0)).unwrap();
        slot_of(young, 0).store(Value::from_i64(42));
        set_ref(old, 0, young);
        scavenger.write_barrier(old, Value::reference(young));
        assert!(scavenger.remembered_set().contains(old));

        let mut roots: Vec<Value> = Vec::new();
        scavenger.scavenge(&mut roots).unwrap();
        let moved = ref_at(old, 0).unwrap();
        assert_ne!(moved, young);
        assert!(scavenger.heap().allocate_space().contains(moved));
        assert_eq!(slot_of(moved, 0).load().as_i64(), Some(42));
        assert!(scavenger.remembered_set().contains(old));

        slot_of(old, 0).store(Value::ZERO);
        scavenger.scavenge(&mut roots).unwrap();
        assert_eq!(scavenger.last_cycle_stats().remembered_objects_pruned, 1);
        assert!(scavenger.remembered_set().is_empty());
        assert!(!unsafe { Header::at(old) }.has_flag(HeaderFlags::REMEMBERED));
        assert_eq!(scavenger.last_cycle_stats().flip_count, 0);
    }

    #[test]
    fn test_tenuring_the_referent_unremembers_the_referrer() {
        let settings = ScavengerSettings {
            tenure: TenureSettings::fixed(1),
            ..small_settings()
        };
        let scavenger = Scavenger::with_settings(settings).unwrap();
        let old = scavenger
            .heap()
            .allocate_tenured(ObjectShape::slots(1, 0))
            .unwrap();
        let young = scavenger.allocate(ObjectShape::slots(1, 0)).unwrap();
        slot_of(young, 0).store(Value::from_i64(5));
        set_ref(old, 0, young);
        scavenger.write_barrier(old, Value::reference(young));

        let mut roots: Vec<Value> = Vec::new();
        scavenger.scavenge(&mut roots).unwrap();
        let flipped = ref_at(old, 0).unwrap();
        assert!(scavenger.heap().allocate_space().contains(flipped));
        assert!(scavenger.remembered_set().contains(old));
        assert!(unsafe { Header::at(old) }.has_flag(HeaderFlags::REMEMBERED));

        scavenger.scavenge(&mut roots).unwrap();
        let tenured = ref_at(old, 0).unwrap();
        assert!(scavenger.heap().is_in_tenure(tenured));
        assert_eq!(slot_of(tenured, 0).load().as_i64(), Some(5));
        assert_eq!(scavenger.last_cycle_stats().tenure_count, 1);
        assert!(!unsafe { Header::at(old) }.has_flag(HeaderFlags::REMEMBERED));
        assert!(scavenger.remembered_set().is_empty());
    }

    #[test]
    fn test_write_barrier_ignores_young_sources_and_immediates() {
        let scavenger = Scavenger::with_settings(small_settings()).unwrap();
        let old = scavenger
            .heap()
            .allocate_tenured(ObjectShape::slots(1, 0))
            .unwrap();
        let other_old = scavenger
            .heap()
            .allocate_tenured(ObjectShape::slots(1, 0))
            .unwrap();
        let young = scavenger.allocate(ObjectShape::slots(1, 0)).unwrap();

        scavenger.write_barrier(young, Value::reference(young));
        scavenger.write_barrier(old, Value::from_i64(3));
        scavenger.write_barrier(old, Value::reference(other_old));
        assert!(scavenger.remembered_set().is_empty());

        scavenger.write_barrier(old, Value::reference(young));
        scavenger.write_barrier(old, Value::reference(young));
        assert_eq!(scavenger.remembered_set().len(), 1);
    }

    fn tenured_referrers(scavenger: &Scavenger, count: usize) -> Vec<Address> {
        (0..count)
            .map(|i| {
                let old = scavenger
                    .heap()
                    .allocate_tenured(ObjectShape::slots(1, 0))
                    .unwrap();
                let young = scavenger.allocate(ObjectShape::slots(1, 0)).unwrap();
                slot_of(young, 0).store(Value::from_i64(i as i64));
                set_ref(old, 0, young);
                scavenger.write_barrier(old, Value::reference(young));
                old
            })
            .collect()
    }

    #[test]
    fn test_overflowed_remembered_set_walks_tenure_and_recovers() {
        let settings = ScavengerSettings {
            remembered_set_max_entries: 2,
            ..small_settings()
        };
        let scavenger = Scavenger::with_settings(settings).unwrap();
        let referrers = tenured_referrers(&scavenger, 3);
        assert!(scavenger.remembered_set().is_overflowed());

        let mut roots: Vec<Value> = Vec::new();
        assert_eq!(scavenger.scavenge(&mut roots).unwrap(), CollectOutcome::Scavenged);
        for (i, &old) in referrers.iter().enumerate() {
            let young = ref_at(old, 0).unwrap();
            assert!(scavenger.heap().allocate_space().contains(young));
            assert_eq!(slot_of(young, 0).load().as_i64(), Some(i as i64));
        }
        assert!(scavenger.remembered_set().is_overflowed());
        assert!(scavenger.last_cycle_stats().remembered_set_overflow);

        slot_of(referrers[0], 0).store(Value::ZERO);
        slot_of(referrers[1], 0).store(Value::ZERO);
        scavenger.scavenge(&mut roots).unwrap();
        assert!(!scavenger.remembered_set().is_overflowed());
        assert_eq!(scavenger.remembered_set().objects(), vec![referrers[2]]);
        assert!(!scavenger.model().is_remembered(referrers[0]));
        assert!(scavenger.heap().allocate_space().contains(ref_at(referrers[2], 0).unwrap()));
    }

    #[test]
    fn test_remembered_set_overflow_percolates_when_configured() {
        let settings = ScavengerSettings {
            remembered_set_max_entries: 2,
            percolate_on_overflow: true,
            ..small_settings()
        };
        let scavenger = Scavenger::with_settings(settings).unwrap();
        let referrers = tenured_referrers(&scavenger, 3);

        let mut roots: Vec<Value> = Vec::new();
        assert_eq!(
            scavenger.scavenge(&mut roots).unwrap(),
            CollectOutcome::Percolated(PercolateReason::RememberedSetOverflow)
        );
        assert_eq!(scavenger.history().percolate_count, 1);
        assert_eq!(scavenger.history().gc_count, 0);

        slot_of(referrers[0], 0).store(Value::ZERO);
        scavenger.global_collection_complete();
        assert!(!scavenger.remembered_set().is_overflowed());
        assert_eq!(scavenger.remembered_set().len(), 2);
        assert_eq!(scavenger.scavenge(&mut roots).unwrap(), CollectOutcome::Scavenged);
    }

    #[test]
    fn test_percolates_after_max_scavenges() {
        let settings = ScavengerSettings {
            max_scavenges_before_global: 2,
            ..small_settings()
        };
        let scavenger = Scavenger::with_settings(settings).unwrap();
        let mut roots: Vec<Value> = Vec::new();
        assert_eq!(scavenger.scavenge(&mut roots).unwrap(), CollectOutcome::Scavenged);
        assert_eq!(scavenger.scavenge(&mut roots).unwrap(), CollectOutcome::Scavenged);
        assert_eq!(
            scavenger.scavenge(&mut roots).unwrap(),
            CollectOutcome::Percolated(PercolateReason::MaxScavenges)
        );
        scavenger.global_collection_complete();
        assert_eq!(scavenger.scavenge(&mut roots).unwrap(), CollectOutcome::Scavenged);
    }

    #[test]
    fn test_failed_tenure_falls_back_to_survivor_then_percolates() {
        let settings = ScavengerSettings {
            tenure_size: OS_PAGE_SIZE,
            tenure: TenureSettings::fixed(0),
            failed_tenure_threshold: 8,
            ..small_settings()
        };
        let scavenger = Scavenger::with_settings(settings).unwrap();
        let filler = ObjectShape::bytes(OS_PAGE_SIZE - object::HEADER_SIZE);
        scavenger.heap().allocate_tenured(filler).unwrap();
        assert_eq!(scavenger.heap().tenure().free_bytes(), 0);

        let a = scavenger.allocate(ObjectShape::slots(1, 0)).unwrap();
        let mut roots = vec![Value::reference(a)];
        assert_eq!(scavenger.scavenge(&mut roots).unwrap(), CollectOutcome::Scavenged);
        let stats = scavenger.last_cycle_stats();
        assert_eq!(stats.failed_tenure_count, 1);
        assert_eq!(stats.tenure_count, 0);
        assert_eq!(stats.flip_count, 1);
        assert!(scavenger.heap().allocate_space().contains(roots[0].address().unwrap()));

        assert_eq!(
            scavenger.scavenge(&mut roots).unwrap(),
            CollectOutcome::Percolated(PercolateReason::FailedTenure)
        );
        scavenger.global_collection_complete();
        assert_eq!(scavenger.percolate_reason(), None);
    }

    #[test]
    fn test_back_out_restores_heap_exactly() {
        let settings = ScavengerSettings {
            nursery_size: 2 * OS_PAGE_SIZE,
            tenure_size: OS_PAGE_SIZE,
            min_cache_size: 512,
            max_cache_size: OS_PAGE_SIZE,
            tlh_threshold: 2048,
            hot_field_alignment: 0,
            ..small_settings()
        };
        let scavenger = Scavenger::with_settings(settings).unwrap();
        let filler = ObjectShape::bytes(OS_PAGE_SIZE - object::HEADER_SIZE);
        scavenger.heap().allocate_tenured(filler).unwrap();

        // hashed objects grow by a word when copied, so four of them no
        // longer fit into a semispace they filled exactly
        let shape = ObjectShape::bytes(OS_PAGE_SIZE / 4 - object::HEADER_SIZE);
        let objects: Vec<Address> = (0..4)
            .map(|_| {
                let object = scavenger.allocate(shape).unwrap();
                unsafe { identity_hash(object) };
                object
            })
            .collect();
        let space = scavenger.heap().allocate_space();
        assert_eq!(space.used(), OS_PAGE_SIZE);
        let snapshot = unsafe {
            std::slice::from_raw_parts(space.base().as_ptr::<u8>(), space.used()).to_vec()
        };

        let mut roots: Vec<Value> = objects.iter().copied().map(Value::reference).collect();
        let before = roots.clone();
        assert_eq!(scavenger.scavenge(&mut roots).unwrap(), CollectOutcome::BackedOut);

        let after = unsafe { std::slice::from_raw_parts(space.base().as_ptr::<u8>(), space.used()) };
        assert!(after == snapshot.as_slice(), "evacuate space changed");
        assert_eq!(roots, before);
        assert_eq!(scavenger.heap().other_space().used(), 0);
        assert_eq!(scavenger.heap().tenure().free_bytes(), 0);
        assert!(scavenger.last_cycle_stats().backout);
        assert_eq!(scavenger.history().backout_count, 1);
        for &object in &objects {
            assert!(matches!(
                unsafe { Header::at(object) }.forward_state(),
                ForwardState::NotForwarded(_)
            ));
        }
    }

    #[test]
    fn test_back_out_points_remembered_slots_at_originals() {
        let settings = ScavengerSettings {
            nursery_size: 2 * OS_PAGE_SIZE,
            tenure_size: OS_PAGE_SIZE,
            min_cache_size: 512,
            max_cache_size: OS_PAGE_SIZE,
            tlh_threshold: 2048,
            hot_field_alignment: 0,
            ..small_settings()
        };
        let scavenger = Scavenger::with_settings(settings).unwrap();
        let referrer_shape = ObjectShape::slots(1, 0);
        let filler = ObjectShape::bytes(OS_PAGE_SIZE - object::HEADER_SIZE - referrer_shape.size());
        scavenger.heap().allocate_tenured(filler).unwrap();
        let old = scavenger.heap().allocate_tenured(referrer_shape).unwrap();
        assert_eq!(scavenger.heap().tenure().free_bytes(), 0);

        let shape = ObjectShape::bytes(OS_PAGE_SIZE / 4 - object::HEADER_SIZE);
        let objects: Vec<Address> = (0..4)
            .map(|_| {
                let object = scavenger.allocate(shape).unwrap();
                unsafe { identity_hash(object) };
                object
            })
            .collect();
        set_ref(old, 0, objects[0]);
        scavenger.write_barrier(old, Value::reference(objects[0]));
        assert!(scavenger.remembered_set().contains(old));

        let mut roots: Vec<Value> = objects[1..].iter().copied().map(Value::reference).collect();
        let before = roots.clone();
        assert_eq!(scavenger.scavenge(&mut roots).unwrap(), CollectOutcome::BackedOut);

        assert_eq!(ref_at(old, 0), Some(objects[0]));
        assert_eq!(roots, before);
        assert!(scavenger.remembered_set().contains(old));
        assert!(unsafe { Header::at(old) }.has_flag(HeaderFlags::REMEMBERED));
        assert_eq!(scavenger.heap().other_space().used(), 0);
        for &object in &objects {
            assert!(matches!(
                unsafe { Header::at(object) }.forward_state(),
                ForwardState::NotForwarded(_)
            ));
        }
    }

    #[test]
    fn test_exhausted_cache_pool_copies_without_caches() {
        let settings = ScavengerSettings {
            nursery_size: 2 * OS_PAGE_SIZE,
            tenure_size: OS_PAGE_SIZE,
            min_cache_size: OS_PAGE_SIZE,
            max_cache_size: OS_PAGE_SIZE,
            cache_pool_initial: 1,
            cache_pool_increment: 1,
            cache_pool_max: 1,
            hot_field_alignment: 0,
            ..small_settings()
        };
        let scavenger = Scavenger::with_settings(settings).unwrap();
        let filler = ObjectShape::bytes(OS_PAGE_SIZE - object::HEADER_SIZE);
        scavenger.heap().allocate_tenured(filler).unwrap();
        // the only header stays out of reach and the first TLH takes the
        // whole survivor space, so no header can be carved either
        let held = scavenger.cache_pool.pop().unwrap();

        let a = scavenger.allocate(ObjectShape::slots(1, 0)).unwrap();
        let b = scavenger.allocate(ObjectShape::slots(1, 0)).unwrap();
        slot_of(b, 0).store(Value::from_i64(9));
        set_ref(a, 0, b);
        let mut roots = vec![Value::reference(a)];
        assert_eq!(scavenger.scavenge(&mut roots).unwrap(), CollectOutcome::Scavenged);

        let a1 = roots[0].address().unwrap();
        let b1 = ref_at(a1, 0).unwrap();
        assert!(scavenger.heap().allocate_space().contains(a1));
        assert!(scavenger.heap().allocate_space().contains(b1));
        assert_eq!(slot_of(b1, 0).load().as_i64(), Some(9));
        let stats = scavenger.last_cycle_stats();
        assert_eq!(stats.flip_count, 2);
        assert_eq!(stats.failed_flip_count, 0);
        assert!(stats.scan_cache_overflow >= 2);
        assert!(!stats.backout);
        scavenger.cache_pool.push(held);
    }

    #[test]
    fn test_large_array_is_copied_standalone_and_split() {
        let settings = ScavengerSettings {
            tlh_threshold: 4096,
            ..small_settings()
        };
        let scavenger = Scavenger::with_settings(settings).unwrap();
        let array = scavenger.allocate(ObjectShape::array(3000)).unwrap();
        for index in (0..3000).step_by(100) {
            let element = scavenger.allocate(ObjectShape::slots(1, 0)).unwrap();
            slot_of(element, 0).store(Value::from_i64(index as i64));
            set_ref(array, index, element);
        }
        let mut roots = vec![Value::reference(array)];
        scavenger.scavenge(&mut roots).unwrap();

        let moved = roots[0].address().unwrap();
        assert!(scavenger.heap().allocate_space().contains(moved));
        for index in (0..3000).step_by(100) {
            let element = ref_at(moved, index).unwrap();
            assert!(scavenger.heap().allocate_space().contains(element));
            assert_eq!(slot_of(element, 0).load().as_i64(), Some(index as i64));
        }
        let stats = scavenger.last_cycle_stats();
        assert_eq!(stats.flip_count, 31);
        assert!(stats.array_split_count > 0);
        assert_eq!(stats.slots_scanned, 3000 + 30);
    }

    struct Recorder(Arc<Mutex<Vec<&'static str>>>);

    impl EventListener for Recorder {
        fn on_event(&self, event: &ScavengerEvent<'_>) {
            let name = match event {
                ScavengerEvent::CycleStart { .. } => "cycle-start",
                ScavengerEvent::CycleEnd { .. } => "cycle-end",
                ScavengerEvent::IncrementStart { .. } => "increment-start",
                ScavengerEvent::IncrementEnd { .. } => "increment-end",
                ScavengerEvent::ScavengeStart { .. } => "scavenge-start",
                ScavengerEvent::ScavengeEnd { .. } => "scavenge-end",
                ScavengerEvent::Percolate { .. } => "percolate",
                ScavengerEvent::RememberedSetOverflow => "overflow",
                ScavengerEvent::BackOut { .. } => "back-out",
            };
            self.0.lock().push(name);
        }
    }

    #[test]
    fn test_events_bracket_a_cycle() {
        let settings = ScavengerSettings {
            max_scavenges_before_global: 1,
            ..small_settings()
        };
        let scavenger = Scavenger::with_settings(settings).unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));
        scavenger.add_listener(Box::new(Recorder(events.clone())));

        let mut roots: Vec<Value> = Vec::new();
        scavenger.scavenge(&mut roots).unwrap();
        scavenger.scavenge(&mut roots).unwrap();
        assert_eq!(
            *events.lock(),
            [
                "cycle-start",
                "increment-start",
                "scavenge-start",
                "scavenge-end",
                "increment-end",
                "cycle-end",
                "percolate",
            ]
        );
    }

    /// Runs workers inline and recommends `recommend` threads.
    struct FixedDispatcher {
        recommend: usize,
        dispatched: Arc<Mutex<Vec<usize>>>,
    }

    impl Dispatcher for FixedDispatcher {
        fn run(&self, threads: usize, task: &(dyn Fn(usize) + Sync)) {
            self.dispatched.lock().push(threads);
            ThreadPoolDispatcher::new(threads).run(threads, task);
        }

        fn recommended_threads(&self, limit: usize) -> usize {
            self.recommend.min(limit)
        }
    }

    #[test]
    fn test_dispatcher_recommendation_sizes_the_cycle() {
        let settings = ScavengerSettings {
            worker_threads: 4,
            ..small_settings()
        };
        let dispatched = Arc::new(Mutex::new(Vec::new()));
        let scavenger = Scavenger::with_dispatcher(
            settings,
            StandardObjectModel::default(),
            Box::new(FixedDispatcher {
                recommend: 2,
                dispatched: dispatched.clone(),
            }),
        )
        .unwrap();
        let a = scavenger.allocate(ObjectShape::slots(1, 0)).unwrap();
        let mut roots = vec![Value::reference(a)];
        assert_eq!(scavenger.scavenge(&mut roots).unwrap(), CollectOutcome::Scavenged);
        assert_eq!(*dispatched.lock(), [2]);
        assert!(scavenger.heap().allocate_space().contains(roots[0].address().unwrap()));
    }

    #[test]
    fn test_invalid_settings_are_rejected() {
        let settings = ScavengerSettings {
            min_cache_size: 100,
            ..small_settings()
        };
        assert!(matches!(
            Scavenger::with_settings(settings),
            Err(ScavengeError::Settings(SettingsError::WordAlignment("min_cache_size")))
        ));
    }

    /// Several cycles over a random graph with mutations in between.
    fn run_random_graph(ordering: ScanOrdering, model: StandardObjectModel, seed: u64) {
        let settings = ScavengerSettings {
            nursery_size: 1024 * 1024,
            tenure_size: 4 * 1024 * 1024,
            worker_threads: 4,
            scan_ordering: ordering,
            min_cache_size: 1024,
            max_cache_size: 16 * 1024,
            array_split_minimum: 16,
            array_split_maximum: 64,
            tenure: TenureSettings::fixed(2),
            ..ScavengerSettings::default()
        };
        let scavenger = Scavenger::new(settings, model).unwrap();
        let mut rng = Rng::new(seed);
        let mut roots = build_graph(scavenger.heap(), &mut rng, 3000, 100, 300, 50);
        let mut next_id = 100_000i64;
        let mut tenured = 0;

        for cycle in 0..6 {
            // garbage, and fresh objects hung off existing ones
            for _ in 0..500 {
                scavenger.allocate(ObjectShape::slots(3, 0)).unwrap();
            }
            for _ in 0..200 {
                let parent = roots[rng.below(roots.len())].address().unwrap();
                let child = scavenger.allocate(ObjectShape::slots(3, 0)).unwrap();
                slot_of(child, 0).store(Value::from_i64(next_id));
                next_id += 1;
                if let Some(grandchild) = ref_at(parent, 2) {
                    set_ref(child, 1, grandchild);
                }
                set_ref(parent, 1, child);
                scavenger.write_barrier(parent, Value::reference(child));
            }

            let (expected, _) = fingerprint(&roots, &plain_load);
            let outcome = scavenger.scavenge(&mut roots).unwrap();
            assert_eq!(outcome, CollectOutcome::Scavenged, "cycle {cycle}");
            let (actual, reachable) = fingerprint(&roots, &plain_load);
            assert_eq!(actual, expected, "graph changed in cycle {cycle}");

            let heap = scavenger.heap();
            assert_eq!(heap.other_space().used(), 0);
            for address in reachable {
                assert!(
                    heap.allocate_space().contains(address) || heap.is_in_tenure(address),
                    "{address} left behind in cycle {cycle}"
                );
            }
            let stats = scavenger.last_cycle_stats();
            if cycle == 0 {
                assert!(stats.array_split_count > 0);
            }
            tenured += stats.tenure_count;
        }
        assert!(tenured > 0);
    }

    #[test]
    fn test_random_graph_hierarchical() {
        run_random_graph(ScanOrdering::Hierarchical, StandardObjectModel::default(), 7);
    }

    #[test]
    fn test_random_graph_breadth_first() {
        run_random_graph(ScanOrdering::BreadthFirst, StandardObjectModel::default(), 11);
    }

    #[test]
    fn test_random_graph_with_hot_fields() {
        run_random_graph(
            ScanOrdering::Hierarchical,
            StandardObjectModel::with_hot_slots(&[1, 2]),
            13,
        );
    }
}
