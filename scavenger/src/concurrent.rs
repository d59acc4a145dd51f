//! Concurrent scavenging.
//!
//! A concurrent cycle runs as a short stop-the-world start (roots and
//! remembered set), a background scan while mutators keep running, and a
//! short stop-the-world completion. Mutators see only copies during the
//! scan: every reference they load from the heap goes through a read
//! barrier that copies the referent first.
//!
//! Objects that cannot be copied in this mode are pinned in place by
//! self-forwarding. Such a cycle completes as aborted and the next request
//! percolates to a global collection.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering},
};

use object::{Address, ForwardState, ObjectShape, Slot, Value, WalkKind};
use parking_lot::Mutex;

use crate::{
    CollectOutcome, PercolateReason, ScavengeError,
    engine::Scavenger,
    events::ScavengerEvent,
    object_model::{ObjectModel, ScanReason, StandardObjectModel},
    roots::{RootBuffer, RootProvider},
    scan::ScanEnd,
    scan_queue::WaitPolicy,
    worker::WorkerContext,
};

/// Where a concurrent cycle stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConcurrentPhase {
    Idle = 0,
    Init = 1,
    Roots = 2,
    Scan = 3,
    Complete = 4,
}

impl ConcurrentPhase {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Init,
            2 => Self::Roots,
            3 => Self::Scan,
            4 => Self::Complete,
            _ => Self::Idle,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcurrentStart {
    /// Roots are copied; mutators may resume and the background scan can
    /// run.
    Started,
    Percolated(PercolateReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanProgress {
    /// No scan work is left; call [`Scavenger::concurrent_complete`].
    Completed,
    /// Stopped on request; call again to continue.
    Yielded,
}

/// Mutator ids start here so they never collide with worker ids.
const MUTATOR_ID_BASE: usize = 1 << 16;

pub(crate) struct MutatorShared {
    context: Mutex<WorkerContext>,
    /// Holds copy caches with unscanned objects.
    holds_work: AtomicBool,
}

pub(crate) struct ConcurrentState {
    phase: AtomicU8,
    yield_requested: AtomicBool,
    /// Background threads want mutators to publish their caches.
    flush_requested: AtomicBool,
    mutators: Mutex<Vec<Arc<MutatorShared>>>,
    next_mutator: AtomicUsize,
}

impl ConcurrentState {
    pub(crate) fn new() -> Self {
        Self {
            phase: AtomicU8::new(ConcurrentPhase::Idle as u8),
            yield_requested: AtomicBool::new(false),
            flush_requested: AtomicBool::new(false),
            mutators: Mutex::new(Vec::new()),
            next_mutator: AtomicUsize::new(MUTATOR_ID_BASE),
        }
    }

    #[inline(always)]
    pub(crate) fn phase(&self) -> ConcurrentPhase {
        ConcurrentPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn set_phase(&self, phase: ConcurrentPhase) {
        log::trace!("concurrent phase -> {phase:?}");
        self.phase.store(phase as u8, Ordering::Release);
    }

    fn enter(&self, from: ConcurrentPhase, to: ConcurrentPhase) -> Result<(), ScavengeError> {
        self.phase
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|actual| ScavengeError::InvalidPhase(ConcurrentPhase::from_u8(actual)))
    }
}

impl<M: ObjectModel> Scavenger<M> {
    pub fn concurrent_phase(&self) -> ConcurrentPhase {
        self.concurrent.phase()
    }

    /// Whether mutators must run the read barrier. Stays on until the
    /// cycle completes, since mutators may run between the end of the
    /// background scan and the completing increment.
    #[inline(always)]
    pub fn is_concurrent_scan_active(&self) -> bool {
        matches!(
            self.concurrent.phase(),
            ConcurrentPhase::Scan | ConcurrentPhase::Complete
        )
    }

    fn ensure_concurrent_enabled(&self) -> Result<(), ScavengeError> {
        if self.settings.concurrent.enabled {
            Ok(())
        } else {
            Err(ScavengeError::ConcurrentDisabled)
        }
    }

    /// Start a concurrent cycle: initialise, then copy the roots and the
    /// remembered set with mutators stopped.
    pub fn concurrent_start(
        &self,
        roots: &mut dyn RootProvider,
    ) -> Result<ConcurrentStart, ScavengeError> {
        self.ensure_concurrent_enabled()?;
        let Some(_collecting) = self.collecting.try_lock() else {
            return Err(ScavengeError::Busy);
        };
        self.concurrent
            .enter(ConcurrentPhase::Idle, ConcurrentPhase::Init)?;
        if let Some(reason) = self.percolate_reason() {
            self.concurrent.set_phase(ConcurrentPhase::Idle);
            self.percolate(reason);
            return Ok(ConcurrentStart::Percolated(reason));
        }
        self.scavenge_init();
        self.scavenge_roots_increment(roots);
        Ok(ConcurrentStart::Started)
    }

    fn scavenge_init(&self) {
        self.setup_cycle(true, self.stw_threads());
        self.concurrent.yield_requested.store(false, Ordering::Relaxed);
        self.concurrent.flush_requested.store(false, Ordering::Relaxed);
        for mutator in self.concurrent.mutators.lock().iter() {
            let mut ctx = mutator.context.lock();
            ctx.begin_increment(0, true);
            mutator.holds_work.store(false, Ordering::Relaxed);
        }
    }

    fn scavenge_roots_increment(&self, roots: &mut dyn RootProvider) {
        self.concurrent.set_phase(ConcurrentPhase::Roots);
        self.emit(ScavengerEvent::IncrementStart {
            phase: ConcurrentPhase::Roots,
        });
        let threads = self.stw_threads();
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
            let mut ctx = self.contexts[id].lock();
            ctx.begin_increment(observed, true);
            self.scavenge_roots(&mut ctx, &buffer);
            self.scavenge_remembered_set(&mut ctx);
            self.flush_caches(&mut ctx);
            self.flush_remembered(&mut ctx);
            self.merge_worker_stats(&mut ctx);
        });
        // mutators allocate into the survivor space from here on
        self.heap.flip_allocate();
        buffer.write_back(roots);

        let stats = self.finish_increment(true);
        self.concurrent.set_phase(ConcurrentPhase::Scan);
        self.emit(ScavengerEvent::IncrementEnd {
            phase: ConcurrentPhase::Roots,
            stats: &stats,
        });
    }

    /// Run the background scan on `background_threads` threads, with
    /// mutators running.
    pub fn main_thread_concurrent_collect(&self) -> Result<ScanProgress, ScavengeError> {
        match self.concurrent.phase() {
            ConcurrentPhase::Scan => {}
            ConcurrentPhase::Complete => return Ok(ScanProgress::Completed),
            phase => return Err(ScavengeError::InvalidPhase(phase)),
        }
        self.emit(ScavengerEvent::IncrementStart {
            phase: ConcurrentPhase::Scan,
        });
        let background = self.settings.concurrent.background_threads;
        let threads = self.dispatcher.recommended_threads(background).clamp(1, background);
        let observed = self.scan_queue.reset(threads);
        let yielded = AtomicBool::new(false);
        let should_yield = || self.concurrent.yield_requested.load(Ordering::Acquire);
        let external_work = || self.mutators_hold_work();
        self.dispatcher.run(threads, &|id| {
            let policy = WaitPolicy {
                timeout: Some(self.settings.concurrent.queue_wait),
                should_yield: &should_yield,
                external_work: &external_work,
            };
            let mut ctx = self.contexts[id].lock();
            ctx.begin_increment(observed, false);
            if self.complete_scan(&mut ctx, &policy) == ScanEnd::Yielded {
                yielded.store(true, Ordering::Relaxed);
            }
            self.flush_caches(&mut ctx);
            self.flush_remembered(&mut ctx);
            self.merge_worker_stats(&mut ctx);
        });

        let stats = self.finish_increment(true);
        self.emit(ScavengerEvent::IncrementEnd {
            phase: ConcurrentPhase::Scan,
            stats: &stats,
        });
        if yielded.load(Ordering::Relaxed) {
            self.concurrent
                .yield_requested
                .store(false, Ordering::Release);
            log::debug!("concurrent scan yielded with {} caches queued", self.scan_queue.len());
            return Ok(ScanProgress::Yielded);
        }
        self.concurrent.set_phase(ConcurrentPhase::Complete);
        Ok(ScanProgress::Completed)
    }

    /// Ask the background scan to stop at the next opportunity.
    pub fn request_yield(&self) {
        self.concurrent
            .yield_requested
            .store(true, Ordering::Release);
        self.scan_queue.notify_all();
    }

    /// Mutators holding scan work keep the background phase alive, and
    /// are asked to flush at their next safepoint.
    fn mutators_hold_work(&self) -> bool {
        let holds = self
            .concurrent
            .mutators
            .lock()
            .iter()
            .any(|mutator| mutator.holds_work.load(Ordering::Acquire));
        if holds {
            self.concurrent
                .flush_requested
                .store(true, Ordering::Release);
        }
        holds
    }

    /// Finish the cycle with mutators stopped: drain mutator caches, rescan
    /// the roots, finish scanning and prune the remembered set.
    pub fn concurrent_complete(
        &self,
        roots: &mut dyn RootProvider,
    ) -> Result<CollectOutcome, ScavengeError> {
        let Some(_collecting) = self.collecting.try_lock() else {
            return Err(ScavengeError::Busy);
        };
        self.concurrent
            .enter(ConcurrentPhase::Scan, ConcurrentPhase::Complete)
            .or_else(|_| {
                self.concurrent
                    .enter(ConcurrentPhase::Complete, ConcurrentPhase::Complete)
            })?;
        self.emit(ScavengerEvent::IncrementStart {
            phase: ConcurrentPhase::Complete,
        });

        for mutator in self.concurrent.mutators.lock().iter() {
            let mut ctx = mutator.context.lock();
            self.flush_caches(&mut ctx);
            self.flush_remembered(&mut ctx);
            self.merge_worker_stats(&mut ctx);
            mutator.holds_work.store(false, Ordering::Release);
        }
        self.concurrent
            .flush_requested
            .store(false, Ordering::Relaxed);

        let threads = self.stw_threads();
        let buffer = RootBuffer::collect(roots);
        let observed = self.scan_queue.reset(threads);
        self.dispatcher.run(threads, &|id| {
            let mut ctx = self.contexts[id].lock();
            ctx.begin_increment(observed, false);
            self.scavenge_roots(&mut ctx, &buffer);
            self.barrier.wait(threads);

            self.complete_scan(&mut ctx, &WaitPolicy::exclusive());
            self.release_copy_caches(&mut ctx);
            self.flush_remembered(&mut ctx);

            if self.barrier.wait(threads) {
                self.process_clearable_references();
                if self.cycle.aborted.load(Ordering::Acquire) {
                    self.fix_self_forwarded_objects();
                }
                if !self.remembered_set.is_overflowed() {
                    self.remembered_set.begin_pass();
                }
            }
            self.barrier.wait(threads);

            self.prune_remembered_sublists(&mut ctx);
            if self.barrier.wait(threads) {
                self.finish_remembered_set_prune();
            }
            self.merge_worker_stats(&mut ctx);
        });
        buffer.write_back(roots);

        let stats = self.finish_increment(true);
        self.emit(ScavengerEvent::ScavengeEnd { stats: &stats });
        self.emit(ScavengerEvent::IncrementEnd {
            phase: ConcurrentPhase::Complete,
            stats: &stats,
        });
        let outcome = if self.cycle.aborted.load(Ordering::Acquire) {
            log::warn!(
                "concurrent scavenge #{} aborted: objects pinned in the nursery",
                self.cycle.gc_count.load(Ordering::Relaxed)
            );
            CollectOutcome::Aborted
        } else {
            self.evacuate_space().reset();
            CollectOutcome::Scavenged
        };
        self.concurrent.set_phase(ConcurrentPhase::Idle);
        Ok(self.finish_cycle(outcome))
    }

    /// Point slots of pinned objects at the copies of their referents and
    /// clear the pin.
    fn fix_self_forwarded_objects(&self) {
        let mut fixed = 0usize;
        // SAFETY: mutators are stopped; evacuate space holds originals
        // and holes only
        for entry in unsafe { self.evacuate_space().walk() } {
            let WalkKind::Object(ForwardState::SelfForwarded(class)) = entry.kind else {
                continue;
            };
            for slot in self.model.scanner(entry.address, class, ScanReason::Fixup) {
                let Some(target) = slot.load().address() else {
                    continue;
                };
                if !self.is_in_evacuate(target) {
                    continue;
                }
                // SAFETY: target is an evacuate object start
                if let ForwardState::Forwarded(copy) =
                    unsafe { object::Header::at(target) }.forward_state()
                {
                    slot.store(Value::reference(copy));
                }
            }
            // SAFETY: as above
            unsafe { object::Header::at(entry.address) }
                .forwarding()
                .restore(class);
            fixed += 1;
        }
        log::debug!("fixed up {fixed} pinned objects");
    }

    /// Register a mutator thread. Mutators must keep every heap reference
    /// they hold across a stop-the-world increment in the root provider.
    pub fn attach_mutator(&self) -> Mutator<'_, M> {
        let id = self.concurrent.next_mutator.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(MutatorShared {
            context: Mutex::new(WorkerContext::new(
                id,
                self.settings.remembered_set_fragment_size,
            )),
            holds_work: AtomicBool::new(false),
        });
        {
            let mut ctx = shared.context.lock();
            ctx.share_retired = true;
        }
        self.concurrent.mutators.lock().push(Arc::clone(&shared));
        log::trace!("mutator {id} attached");
        Mutator {
            scavenger: self,
            shared,
        }
    }
}

/// Handle through which a mutator thread reads and writes the heap.
pub struct Mutator<'a, M: ObjectModel = StandardObjectModel> {
    scavenger: &'a Scavenger<M>,
    shared: Arc<MutatorShared>,
}

impl<M: ObjectModel> Mutator<'_, M> {
    pub fn allocate(&self, shape: ObjectShape) -> Option<Address> {
        self.scavenger.allocate(shape)
    }

    /// Read a reference slot. During a concurrent scan the referent is
    /// copied out of evacuate space first.
    pub fn load(&self, slot: Slot) -> Value {
        loop {
            let value = slot.load();
            if !self.scavenger.is_concurrent_scan_active() {
                return value;
            }
            let Some(object) = value.address() else {
                return value;
            };
            if !self.scavenger.is_in_evacuate(object) {
                return value;
            }
            let forwarded = {
                let mut ctx = self.shared.context.lock();
                let copied = ctx.stats.slots_copied;
                let forwarded = self.scavenger.forward_or_copy(&mut ctx, object, 0);
                if ctx.stats.slots_copied != copied {
                    ctx.stats.read_barrier_copies += 1;
                }
                if ctx.has_unshared_work() {
                    self.shared.holds_work.store(true, Ordering::Release);
                }
                forwarded
            };
            if forwarded == object {
                return value;
            }
            let updated = Value::reference(forwarded);
            if slot.compare_exchange(value, updated).is_ok() {
                return updated;
            }
        }
    }

    /// Store `value` into `slot` of `object`, with the generational write
    /// barrier.
    pub fn store(&self, object: Address, slot: Slot, value: Value) {
        slot.store(value);
        self.scavenger.write_barrier(object, value);
    }

    /// Publish cached copies and pending remembered objects.
    pub fn release_caches(&self) {
        let mut ctx = self.shared.context.lock();
        self.scavenger.flush_caches(&mut ctx);
        self.scavenger.flush_remembered(&mut ctx);
        self.scavenger.merge_worker_stats(&mut ctx);
        self.shared.holds_work.store(false, Ordering::Release);
    }

    /// Cooperate with the background scan.
    pub fn safepoint(&self) {
        if self.shared.holds_work.load(Ordering::Acquire)
            && self
                .scavenger
                .concurrent
                .flush_requested
                .load(Ordering::Acquire)
        {
            self.release_caches();
        }
    }
}

impl<M: ObjectModel> Drop for Mutator<'_, M> {
    fn drop(&mut self) {
        self.release_caches();
        self.scavenger
            .concurrent
            .mutators
            .lock()
            .retain(|mutator| !Arc::ptr_eq(mutator, &self.shared));
    }
}
