//! Scan loop.
//!
//! A thread scans copied objects until every thread runs dry. Work comes
//! from its own copy caches (scanned in place), a single deferred cache,
//! and the shared scan queue. Hierarchical ordering prefers the copy caches
//! so children land next to their parents; breadth-first drains the queue
//! first.

use std::sync::atomic::{AtomicU64, Ordering};

use object::{Address, ForwardState};

use crate::{
    ScanOrdering,
    cache::{CacheRole, CopyScanCache},
    copy_scan_ratio::SLOTS_SCANNED_PER_THREAD_UPDATE,
    engine::Scavenger,
    object_model::{ObjectModel, ObjectScanner, ScanReason},
    scan_queue::{WaitOutcome, WaitPolicy},
    worker::WorkerContext,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScanEnd {
    /// Every thread ran out of work.
    Done,
    /// Asked to stop early; local work must be flushed to the queue.
    Yielded,
}

enum ScanTarget {
    /// Scan a copy cache in place while still copying into it.
    Copy(CacheRole),
    Owned(Box<CopyScanCache>),
}

/// Where the object being scanned came from, for aliasing decisions.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ScanSource {
    /// Unscanned bytes left in the source cache.
    backlog: usize,
    copy_role: Option<CacheRole>,
}

/// Forwarding state of the object at `object` without assuming a full
/// header is present.
#[inline]
fn forward_state_at(object: Address) -> ForwardState {
    // SAFETY: callers walk word-aligned object starts in mapped memory
    let word = unsafe { &*object.as_ptr::<AtomicU64>() };
    ForwardState::decode(word.load(Ordering::Acquire))
}

impl<M: ObjectModel> Scavenger<M> {
    /// Scan until every thread is out of work, or the policy asks for a
    /// yield.
    pub(crate) fn complete_scan(&self, ctx: &mut WorkerContext, policy: &WaitPolicy<'_>) -> ScanEnd {
        loop {
            if (policy.should_yield)() {
                return ScanEnd::Yielded;
            }
            if let Some(target) = self.next_scan_target(ctx) {
                self.scan_target(ctx, target);
                continue;
            }
            ctx.stats.scan_waits += 1;
            match self.scan_queue.wait_for_work(&mut ctx.observed_done, policy) {
                WaitOutcome::Retry => {}
                WaitOutcome::Done => return ScanEnd::Done,
                WaitOutcome::Yield => return ScanEnd::Yielded,
            }
        }
    }

    fn next_scan_target(&self, ctx: &mut WorkerContext) -> Option<ScanTarget> {
        if self.is_backout_raised() {
            // nothing gets scanned once a back-out is pending
            if let Some(cache) = ctx.deferred.take() {
                self.cache_pool.push(cache);
            }
            return self.scan_queue.pop(ctx.id).map(ScanTarget::Owned);
        }
        if self.scan_queue.waiting_count() > 0 {
            self.share_local_work(ctx);
        }
        match self.settings.scan_ordering {
            ScanOrdering::Hierarchical => self
                .local_copy_target(ctx)
                .or_else(|| ctx.deferred.take().map(ScanTarget::Owned))
                .or_else(|| self.scan_queue.pop(ctx.id).map(ScanTarget::Owned)),
            ScanOrdering::BreadthFirst => ctx
                .deferred
                .take()
                .map(ScanTarget::Owned)
                .or_else(|| self.scan_queue.pop(ctx.id).map(ScanTarget::Owned))
                .or_else(|| self.local_copy_target(ctx)),
        }
    }

    /// The copy cache that took the last copy goes first.
    fn local_copy_target(&self, ctx: &WorkerContext) -> Option<ScanTarget> {
        let preferred = ctx.last_copy.unwrap_or(CacheRole::Semispace);
        let other = match preferred {
            CacheRole::Semispace => CacheRole::Tenurespace,
            CacheRole::Tenurespace => CacheRole::Semispace,
        };
        [preferred, other]
            .into_iter()
            .find(|&role| ctx.copy_cache(role).is_some_and(CopyScanCache::has_scan_work))
            .map(ScanTarget::Copy)
    }

    /// Publish private scan work while other threads are idle.
    fn share_local_work(&self, ctx: &mut WorkerContext) {
        if let Some(cache) = ctx.deferred.take() {
            self.scan_queue.push(cache, ctx.id);
        }
        let share = std::mem::replace(&mut ctx.share_retired, true);
        for role in [CacheRole::Semispace, CacheRole::Tenurespace] {
            if ctx.copy_cache(role).is_some_and(CopyScanCache::has_scan_work) {
                self.retire_copy_cache(ctx, role);
            }
        }
        ctx.share_retired = share;
    }

    fn scan_target(&self, ctx: &mut WorkerContext, target: ScanTarget) {
        match target {
            ScanTarget::Owned(cache) if self.is_backout_raised() => self.cache_pool.push(cache),
            ScanTarget::Owned(cache) => self.scan_owned_cache(ctx, cache),
            ScanTarget::Copy(role) => self.scan_copy_cache(ctx, role),
        }
    }

    fn scan_owned_cache(&self, ctx: &mut WorkerContext, mut cache: Box<CopyScanCache>) {
        if let Some(scanner) = cache.take_split() {
            self.scan_object_slots(ctx, scanner, None);
            self.cache_pool.push(cache);
            return;
        }
        if let Some(scanner) = cache.take_suspended() {
            let source = ScanSource {
                backlog: cache.scan_backlog(),
                copy_role: None,
            };
            if let Some(rest) = self.scan_object_slots(ctx, scanner, Some(source)) {
                cache.suspend(rest);
                self.defer(ctx, cache);
                return;
            }
        }
        while cache.scan_current() < cache.alloc() {
            let object = cache.scan_current();
            let size = self.model.object_size(object);
            let source = ScanSource {
                backlog: cache.scan_backlog(),
                copy_role: None,
            };
            cache.advance_scan(object.offset(size));
            let Some(scanner) = self.scanner_for_scan(ctx, object) else {
                continue;
            };
            if let Some(rest) = self.scan_object_slots(ctx, scanner, Some(source)) {
                cache.suspend(rest);
                self.defer(ctx, cache);
                return;
            }
        }
        self.cache_pool.push(cache);
    }

    /// Scan a copy cache in place. The copy cache may be retired under us
    /// by copies made while scanning; the epoch tells.
    fn scan_copy_cache(&self, ctx: &mut WorkerContext, role: CacheRole) {
        let epoch = ctx.copy_epoch(role);
        let suspended = ctx.copy_cache_mut(role).and_then(CopyScanCache::take_suspended);
        if let Some(scanner) = suspended {
            let source = ScanSource {
                backlog: ctx.copy_cache(role).map_or(0, CopyScanCache::scan_backlog),
                copy_role: Some(role),
            };
            if let Some(rest) = self.scan_object_slots(ctx, scanner, Some(source)) {
                self.suspend_copy_scan(ctx, role, epoch, rest);
                return;
            }
        }
        loop {
            if ctx.copy_epoch(role) != epoch {
                return;
            }
            let Some(cache) = ctx.copy_cache_mut(role) else {
                return;
            };
            let object = cache.scan_current();
            if object >= cache.alloc() {
                return;
            }
            let source = ScanSource {
                backlog: cache.scan_backlog(),
                copy_role: Some(role),
            };
            // the object is ours once the cursor moves past it
            cache.advance_scan(object.offset(self.model.object_size(object)));
            if let Some(scanner) = self.scanner_for_scan(ctx, object)
                && let Some(rest) = self.scan_object_slots(ctx, scanner, Some(source))
            {
                self.suspend_copy_scan(ctx, role, epoch, rest);
                return;
            }
            if self.scan_queue.waiting_count() > 0 {
                return;
            }
        }
    }

    fn suspend_copy_scan(
        &self,
        ctx: &mut WorkerContext,
        role: CacheRole,
        epoch: u64,
        scanner: ObjectScanner,
    ) {
        if ctx.copy_epoch(role) == epoch
            && let Some(cache) = ctx.copy_cache_mut(role)
        {
            cache.suspend(scanner);
            return;
        }
        // the cache was retired mid-object; carry the scanner on its own
        match self.cache_pool.pop_or_carve(&[self.survivor_space(), self.heap.tenure()]) {
            Some((mut cache, carved)) => {
                if carved {
                    ctx.stats.scan_cache_overflow += 1;
                }
                cache.activate_split(scanner);
                self.defer(ctx, cache);
            }
            None => {
                self.scan_object_slots(ctx, scanner, None);
            }
        }
    }

    fn defer(&self, ctx: &mut WorkerContext, cache: Box<CopyScanCache>) {
        if ctx.deferred.is_none() && !ctx.share_retired {
            ctx.deferred = Some(cache);
        } else {
            self.scan_queue.push(cache, ctx.id);
        }
    }

    /// Scanner for a walked object, `None` for holes, stale originals and
    /// leaves.
    fn scanner_for_scan(&self, ctx: &mut WorkerContext, object: Address) -> Option<ObjectScanner> {
        let class = match forward_state_at(object) {
            ForwardState::NotForwarded(class) | ForwardState::SelfForwarded(class) => class,
            _ => return None,
        };
        if class.object_type().is_hole() {
            return None;
        }
        let scanner = self.model.scanner(object, class, ScanReason::Scavenge);
        if scanner.is_leaf() {
            ctx.stats.objects_scanned += 1;
            return None;
        }
        Some(scanner)
    }

    /// Copy-and-forward every slot under `scanner`.
    ///
    /// With a `source`, hierarchical scanning may stop early to follow the
    /// last copy; the unfinished scanner is returned.
    pub(crate) fn scan_object_slots(
        &self,
        ctx: &mut WorkerContext,
        mut scanner: ObjectScanner,
        source: Option<ScanSource>,
    ) -> Option<ObjectScanner> {
        let object = scanner.object();
        let tenured = self.heap.is_in_tenure(object);
        if scanner.is_indexable() && scanner.is_fresh() {
            self.split_array(ctx, &mut scanner);
        }
        let source = source.filter(|_| self.settings.scan_ordering == ScanOrdering::Hierarchical);

        let mut refers_to_nursery = false;
        while let Some(slot) = scanner.next() {
            ctx.stats.slots_scanned += 1;
            ctx.ratio_scanned += 1;
            ctx.last_copy = None;
            refers_to_nursery |= self.copy_and_forward(ctx, slot);

            if let Some(source) = source
                && scanner.remaining() > 0
                && let Some(to) = ctx.last_copy
                && self.should_alias(ctx, to, source)
            {
                ctx.stats.alias_to_copy_cache_count += 1;
                if tenured && refers_to_nursery {
                    self.remember(ctx, object);
                }
                return Some(scanner);
            }
        }
        if tenured && refers_to_nursery {
            self.remember(ctx, object);
        }
        ctx.stats.objects_scanned += 1;
        self.update_copy_scan_ratio(ctx);
        None
    }

    /// Follow a fresh copy into its copy cache when that cache has the
    /// smaller scan backlog.
    fn should_alias(&self, ctx: &WorkerContext, to: CacheRole, source: ScanSource) -> bool {
        if self.scan_queue.waiting_count() > self.settings.alias_threshold {
            return false;
        }
        if source.copy_role == Some(to) {
            return false;
        }
        ctx.copy_cache(to)
            .is_some_and(|cache| cache.scan_backlog() < source.backlog)
    }

    /// Queue all but the first chunk of a large array.
    fn split_array(&self, ctx: &mut WorkerContext, scanner: &mut ObjectScanner) {
        let waiting = self.scan_queue.waiting_count();
        let chunk = self
            .settings
            .array_split_minimum
            .max(self.settings.array_split_maximum / (waiting + 1));
        if scanner.remaining() <= chunk {
            return;
        }
        let Some((mut cache, carved)) = self
            .cache_pool
            .pop_or_carve(&[self.survivor_space(), self.heap.tenure()])
        else {
            return;
        };
        if carved {
            ctx.stats.scan_cache_overflow += 1;
        }
        let Some(tail) = scanner.split_tail(scanner.cursor() + chunk) else {
            self.cache_pool.push(cache);
            return;
        };
        ctx.stats.array_split_count += 1;
        ctx.stats.array_split_amount += tail.remaining();
        cache.activate_split(tail);
        self.scan_queue.push(cache, ctx.id);
    }

    fn remember(&self, ctx: &mut WorkerContext, object: Address) {
        if self
            .remembered_set
            .remember(&self.model, &mut ctx.fragment, object)
        {
            self.note_remembered_set_overflow(ctx);
        }
    }

    fn update_copy_scan_ratio(&self, ctx: &mut WorkerContext) {
        if ctx.ratio_scanned < SLOTS_SCANNED_PER_THREAD_UPDATE {
            return;
        }
        self.copy_scan_ratio.update(
            &mut ctx.ratio_scanned,
            &mut ctx.ratio_copied,
            self.scan_queue.waiting_count() as u64,
            self.scan_queue.non_empty_sublists(),
            self.scan_queue.len(),
        );
    }
}
