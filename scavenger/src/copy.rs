//! Copy-and-forward.
//!
//! Survivors go to the survivor semispace, or to tenure space once old
//! enough. Each thread bumps copies out of its own copy cache per
//! destination; copies larger than the TLH threshold get a cache of their
//! own.

use std::sync::atomic::Ordering;

use object::{AGE_MAX, Address, ClassWord, ForwardState, Slot, Value, WORD_SIZE, fill_hole};

use crate::{
    cache::{CacheRole, CopyScanCache},
    engine::{BackOutState, Scavenger},
    forwarding::{ForwardedHeader, init_section_counter},
    object_model::{CopyDetails, ObjectModel, ScanReason},
    space::{BumpSpace, Region, SubSpace},
    stats::FLIP_HISTORY_AGES,
    tenure::should_tenure,
    worker::WorkerContext,
};

/// Memory reserved for one copy.
struct Reservation {
    role: CacheRole,
    address: Address,
    backing: Backing,
}

/// What accounts for the scan work of a reserved copy.
enum Backing {
    /// The thread's copy cache for the role.
    CopyCache,
    /// A cache of its own, for copies above the TLH threshold.
    Standalone(Box<CopyScanCache>),
    /// No cache header was left; the copy is scanned where it lands.
    Uncached,
}

impl<M: ObjectModel> Scavenger<M> {
    /// Forward the referent of `slot` and update the slot.
    ///
    /// Returns whether the slot refers to the nursery afterwards.
    pub(crate) fn copy_and_forward(&self, ctx: &mut WorkerContext, slot: Slot) -> bool {
        self.copy_and_forward_at_depth(ctx, slot, 0)
    }

    fn copy_and_forward_at_depth(&self, ctx: &mut WorkerContext, slot: Slot, depth: usize) -> bool {
        loop {
            let value = slot.load();
            let Some(object) = value.address() else {
                return false;
            };
            if !self.is_in_evacuate(object) {
                return self.heap.is_in_nursery(object);
            }
            let forwarded = self.forward_or_copy(ctx, object, depth);
            if forwarded != object {
                let updated = Value::reference(forwarded);
                if self.is_concurrent_cycle() {
                    // a mutator store wins over our update
                    if slot.compare_exchange(value, updated).is_err() {
                        continue;
                    }
                } else {
                    slot.store(updated);
                }
            }
            return self.heap.is_in_nursery(forwarded);
        }
    }

    /// Address of the live copy of evacuate-space `object`, copying it if
    /// nobody has yet.
    pub(crate) fn forward_or_copy(
        &self,
        ctx: &mut WorkerContext,
        object: Address,
        depth: usize,
    ) -> Address {
        // SAFETY: evacuate objects stay mapped and parsable for the cycle
        let mut header = unsafe { ForwardedHeader::new(object) };
        match header.state() {
            ForwardState::Forwarded(dest) => dest,
            ForwardState::BeingCopied(dest) => {
                header.copy_or_wait(dest, self.settings.concurrent.copy_section_size)
            }
            ForwardState::SelfForwarded(_) => object,
            ForwardState::NotForwarded(class) => self.copy(ctx, &mut header, class, depth),
            ForwardState::ReverseForwarded(_) => {
                debug_assert!(false, "reverse-forwarded {object} reached during a scavenge");
                object
            }
        }
    }

    fn copy(
        &self,
        ctx: &mut WorkerContext,
        header: &mut ForwardedHeader<'_>,
        class: ClassWord,
        depth: usize,
    ) -> Address {
        let object = header.object();
        if self.is_backout_raised() {
            return object;
        }
        let age = self.model.preserved_age(header.header());
        let details = self.model.calculate_object_details_for_copy(object, class);
        let tenure_first = should_tenure(self.cycle.tenure_mask.load(Ordering::Relaxed), age);

        let Some(reservation) = self.reserve_for_copy(ctx, tenure_first, details.reserve_size)
        else {
            return self.copy_failed(ctx, header, class, &details);
        };
        let (role, dest) = (reservation.role, reservation.address);
        let new_age = match role {
            CacheRole::Tenurespace => 0,
            CacheRole::Semispace => (age + 1).min(AGE_MAX),
        };

        if !self.install_copy(header, class, dest, &details, new_age) {
            self.discard_reservation(ctx, reservation, details.reserve_size);
            return self.winner_of(header);
        }

        let size = details.reserve_size;
        let column = (age as usize + 1).min(FLIP_HISTORY_AGES - 1);
        match role {
            CacheRole::Semispace => {
                ctx.stats.flip_count += 1;
                ctx.stats.flip_bytes += size;
                ctx.flip_row.flip_bytes[column] += size;
            }
            CacheRole::Tenurespace => {
                ctx.stats.tenure_count += 1;
                ctx.stats.tenure_bytes += size;
                ctx.flip_row.tenure_bytes[column] += size;
            }
        }
        ctx.stats.slots_copied += 1;
        ctx.ratio_copied += 1;

        match reservation.backing {
            Backing::CopyCache => ctx.last_copy = Some(role),
            Backing::Standalone(cache) => self.publish_standalone(ctx, cache, dest, class),
            Backing::Uncached => self.scan_in_place(ctx, dest, class, size, role),
        }

        if depth < self.settings.hot_field_depth {
            for index in details.hot_fields.iter() {
                // SAFETY: hot fields index slots of the finished copy
                let slot = unsafe { object::slot(dest, index) };
                ctx.stats.hot_field_copies += 1;
                self.copy_and_forward_at_depth(ctx, slot, depth + 1);
            }
        }
        dest
    }

    /// Publish the copy at `dest`. Returns `false` if another thread won.
    fn install_copy(
        &self,
        header: &mut ForwardedHeader<'_>,
        class: ClassWord,
        dest: Address,
        details: &CopyDetails,
        age: u8,
    ) -> bool {
        let object = header.object();
        let copy_size = details.copy_size;
        if !self.is_concurrent_cycle() {
            if !header.set_forwarded_object(class, dest) {
                return false;
            }
            // SAFETY: dest is our reservation of at least copy_size bytes
            unsafe { copy_bytes(object, dest, copy_size) };
            self.model
                .fixup_forwarded_object(object, dest, class, details, age);
            return true;
        }

        let section = self.settings.concurrent.copy_section_size;
        if copy_size < self.settings.concurrent.concurrent_copy_threshold {
            // duplicate first; the forwarding CAS publishes a finished copy
            // SAFETY: as above
            unsafe { copy_bytes(object, dest, copy_size) };
            self.model
                .fixup_forwarded_object(object, dest, class, details, age);
            return header.set_forwarded_object(class, dest);
        }

        init_section_counter(dest, copy_size);
        if !header.set_forwarded_object_with_being_copied_hint(class, dest) {
            return false;
        }
        header.copy_or_wait_winner(dest, copy_size, section);
        self.model
            .fixup_forwarded_object(object, dest, class, details, age);
        header.complete_copy(dest);
        true
    }

    /// Where `object` went after losing the forwarding race.
    fn winner_of(&self, header: &mut ForwardedHeader<'_>) -> Address {
        match header.refresh() {
            ForwardState::Forwarded(dest) => dest,
            ForwardState::BeingCopied(dest) => {
                header.copy_or_wait(dest, self.settings.concurrent.copy_section_size)
            }
            _ => header.object(),
        }
    }

    /// Neither destination had room.
    fn copy_failed(
        &self,
        ctx: &mut WorkerContext,
        header: &mut ForwardedHeader<'_>,
        class: ClassWord,
        details: &CopyDetails,
    ) -> Address {
        let object = header.object();
        if !self.is_concurrent_cycle() {
            self.raise_back_out();
            return object;
        }
        // mutators may already hold the original; pin it in place
        if !header.set_self_forwarded_object(class) {
            return self.winner_of(header);
        }
        ctx.stats.self_forwarded_count += 1;
        ctx.stats.self_forwarded_bytes += details.copy_size;
        self.cycle.aborted.store(true, Ordering::Release);
        self.scan_in_place(ctx, object, class, details.copy_size, CacheRole::Semispace);
        object
    }

    /// Queue an object for scanning where it lies, or scan it right away
    /// when no cache header is left.
    fn scan_in_place(
        &self,
        ctx: &mut WorkerContext,
        object: Address,
        class: ClassWord,
        size: usize,
        role: CacheRole,
    ) {
        match self.cache_pool.pop_or_carve(&self.carve_spaces()) {
            Some((mut cache, carved)) => {
                if carved {
                    ctx.stats.scan_cache_overflow += 1;
                }
                cache.activate(role, Region::new(object, object.offset(size)));
                cache.reserve(size, 0);
                cache.seal_for_scan();
                self.scan_queue.push(cache, ctx.id);
            }
            None => {
                let scanner = self.model.scanner(object, class, ScanReason::Scavenge);
                self.scan_object_slots(ctx, scanner, None);
            }
        }
    }

    // ── Reservations ───────────────────────────────────────────────

    fn reserve_for_copy(
        &self,
        ctx: &mut WorkerContext,
        tenure_first: bool,
        size: usize,
    ) -> Option<Reservation> {
        let order = if tenure_first {
            [CacheRole::Tenurespace, CacheRole::Semispace]
        } else {
            [CacheRole::Semispace, CacheRole::Tenurespace]
        };
        for role in order {
            if let Some(reservation) = self.reserve_memory(ctx, role, size) {
                return Some(reservation);
            }
            match role {
                CacheRole::Semispace => {
                    ctx.stats.failed_flip_count += 1;
                    ctx.stats.failed_flip_bytes += size;
                }
                CacheRole::Tenurespace => {
                    ctx.stats.failed_tenure_count += 1;
                    ctx.stats.failed_tenure_bytes += size;
                    ctx.stats.failed_tenure_largest = ctx.stats.failed_tenure_largest.max(size);
                }
            }
        }
        None
    }

    fn reserve_memory(
        &self,
        ctx: &mut WorkerContext,
        role: CacheRole,
        size: usize,
    ) -> Option<Reservation> {
        if size > self.settings.tlh_threshold {
            return self.reserve_standalone(ctx, role, size);
        }
        let line = self.settings.hot_field_alignment;
        if let Some(address) = ctx.copy_cache_mut(role).and_then(|cache| cache.reserve(size, line))
        {
            return Some(Reservation {
                role,
                address,
                backing: Backing::CopyCache,
            });
        }
        self.retire_copy_cache(ctx, role);

        let region = self.take_tlh(ctx, role, size)?;
        let Some((mut cache, carved)) = self.cache_pool.pop_or_carve(&self.carve_spaces()) else {
            return Some(self.reserve_uncached(ctx, role, region, size));
        };
        if carved {
            ctx.stats.scan_cache_overflow += 1;
        }
        ctx.stats.cache_alloc_count += 1;
        cache.activate(role, region);
        ctx.set_copy_cache(role, cache);
        let address = ctx.copy_cache_mut(role)?.reserve(size, line)?;
        Some(Reservation {
            role,
            address,
            backing: Backing::CopyCache,
        })
    }

    /// Take `size` bytes off the front of `region` without a cache header,
    /// keeping the rest as the role's remainder.
    fn reserve_uncached(
        &self,
        ctx: &mut WorkerContext,
        role: CacheRole,
        region: Region,
        size: usize,
    ) -> Reservation {
        ctx.stats.scan_cache_overflow += 1;
        let address = region.base;
        let rest = Region::new(address.offset(size), region.top);
        if !rest.is_empty() {
            let previous = std::mem::replace(ctx.remainder_mut(role), rest);
            if !previous.is_empty() {
                self.abandon_remainder(ctx, role, previous);
            }
        }
        log::trace!("cache pool exhausted, copying {size} bytes without a cache");
        Reservation {
            role,
            address,
            backing: Backing::Uncached,
        }
    }

    /// A copy above the TLH threshold, allocated exactly.
    fn reserve_standalone(
        &self,
        ctx: &mut WorkerContext,
        role: CacheRole,
        size: usize,
    ) -> Option<Reservation> {
        let space = self.space_for(role);
        let address = space.collector_allocate(size)?;
        let Some((mut cache, carved)) = self.cache_pool.pop_or_carve(&self.carve_spaces()) else {
            ctx.stats.scan_cache_overflow += 1;
            return Some(Reservation {
                role,
                address,
                backing: Backing::Uncached,
            });
        };
        if carved {
            ctx.stats.scan_cache_overflow += 1;
        }
        ctx.stats.cache_alloc_count += 1;
        cache.activate(role, Region::new(address, address.offset(size)));
        cache.reserve(size, 0);
        Some(Reservation {
            role,
            address,
            backing: Backing::Standalone(cache),
        })
    }

    /// Hand a finished standalone copy to the scanners.
    fn publish_standalone(
        &self,
        ctx: &mut WorkerContext,
        mut cache: Box<CopyScanCache>,
        dest: Address,
        class: ClassWord,
    ) {
        cache.seal_for_scan();
        if self
            .model
            .scanner(dest, class, ScanReason::Scavenge)
            .is_leaf()
        {
            self.cache_pool.push(cache);
        } else {
            self.scan_queue.push(cache, ctx.id);
        }
    }

    fn discard_reservation(&self, ctx: &mut WorkerContext, reservation: Reservation, size: usize) {
        let Reservation {
            role,
            address,
            backing,
        } = reservation;
        let top = address.offset(size);
        match backing {
            Backing::Standalone(cache) => {
                self.space_for(role).abandon_heap_chunk(address, top);
                self.cache_pool.push(cache);
            }
            Backing::Uncached => self.space_for(role).abandon_heap_chunk(address, top),
            Backing::CopyCache => {
                let retracted = ctx
                    .copy_cache_mut(role)
                    .is_some_and(|cache| cache.retract(address, size));
                if retracted {
                    return;
                }
                // SAFETY: the loser's reservation is never published
                unsafe { fill_hole(address, top) };
            }
        }
        self.count_discard(ctx, role, size);
    }

    /// A fresh TLH of at least `size` bytes, from the kept remainder if it
    /// fits.
    fn take_tlh(&self, ctx: &mut WorkerContext, role: CacheRole, size: usize) -> Option<Region> {
        let remainder = std::mem::replace(ctx.remainder_mut(role), Region::empty());
        if remainder.size() >= size {
            return Some(remainder);
        }
        if !remainder.is_empty() {
            self.abandon_remainder(ctx, role, remainder);
        }
        let preferred = self.calculate_optimum_copy_scan_cache_size().max(size);
        self.space_for(role).collector_allocate_tlh(size, preferred)
    }

    /// Seal the copy cache for `role` and pass its scan work on.
    pub(crate) fn retire_copy_cache(&self, ctx: &mut WorkerContext, role: CacheRole) {
        let Some(mut cache) = ctx.take_copy_cache(role) else {
            return;
        };
        let remainder = cache.seal_for_scan();
        let threshold = match role {
            CacheRole::Semispace => self.settings.survivor_discard_threshold,
            CacheRole::Tenurespace => self.settings.tenure_discard_threshold,
        };
        if !remainder.is_empty() && remainder.size() >= threshold {
            let previous = std::mem::replace(ctx.remainder_mut(role), remainder);
            if !previous.is_empty() {
                self.abandon_remainder(ctx, role, previous);
            }
            match role {
                CacheRole::Semispace => ctx.stats.survivor_tlh_remainder_count += 1,
                CacheRole::Tenurespace => ctx.stats.tenure_tlh_remainder_count += 1,
            }
        } else if !remainder.is_empty() {
            self.abandon_remainder(ctx, role, remainder);
        }
        self.retire_scan_work(ctx, cache);
    }

    /// Route a cache that stopped being a copy target.
    pub(crate) fn retire_scan_work(&self, ctx: &mut WorkerContext, cache: Box<CopyScanCache>) {
        if !cache.has_scan_work() || self.is_backout_raised() {
            self.cache_pool.push(cache);
        } else if ctx.share_retired || ctx.deferred.is_some() {
            self.scan_queue.push(cache, ctx.id);
        } else {
            ctx.deferred = Some(cache);
        }
    }

    /// Retire both copy caches and give back kept remainders.
    pub(crate) fn release_copy_caches(&self, ctx: &mut WorkerContext) {
        for role in [CacheRole::Semispace, CacheRole::Tenurespace] {
            self.retire_copy_cache(ctx, role);
            let remainder = std::mem::replace(ctx.remainder_mut(role), Region::empty());
            if !remainder.is_empty() {
                self.abandon_remainder(ctx, role, remainder);
            }
        }
        if let Some(cache) = ctx.deferred.take() {
            self.retire_scan_work(ctx, cache);
        }
    }

    /// Release everything a context holds, queueing any scan work for
    /// other threads.
    pub(crate) fn flush_caches(&self, ctx: &mut WorkerContext) {
        let share = std::mem::replace(&mut ctx.share_retired, true);
        self.release_copy_caches(ctx);
        ctx.share_retired = share;
    }

    fn abandon_remainder(&self, ctx: &mut WorkerContext, role: CacheRole, region: Region) {
        self.space_for(role).abandon_heap_chunk(region.base, region.top);
        self.count_discard(ctx, role, region.size());
    }

    fn count_discard(&self, ctx: &mut WorkerContext, role: CacheRole, bytes: usize) {
        match role {
            CacheRole::Semispace => ctx.stats.flip_discard_bytes += bytes,
            CacheRole::Tenurespace => ctx.stats.tenure_discard_bytes += bytes,
        }
    }

    #[inline]
    fn space_for(&self, role: CacheRole) -> &BumpSpace {
        match role {
            CacheRole::Semispace => self.survivor_space(),
            CacheRole::Tenurespace => self.heap.tenure(),
        }
    }

    /// Spaces that may donate memory for cache headers.
    fn carve_spaces(&self) -> [&dyn SubSpace; 2] {
        [self.survivor_space(), self.heap.tenure()]
    }

    /// TLH size for the next copy cache, scaled by how busy the scan
    /// queue has been.
    pub fn calculate_optimum_copy_scan_cache_size(&self) -> usize {
        let (min, max) = (self.settings.min_cache_size, self.settings.max_cache_size);
        match self.copy_scan_ratio.scaling_factor() {
            Some(factor) => {
                let scaled = (max as f64 * factor) as usize;
                (scaled & !(WORD_SIZE - 1)).clamp(min, max)
            }
            None => max,
        }
    }

    // ── Back-out flag ──────────────────────────────────────────────

    /// Ask every thread to stop copying. Returns `true` for the thread
    /// that raised it.
    pub(crate) fn raise_back_out(&self) -> bool {
        let raised = self
            .cycle
            .backout
            .compare_exchange(
                BackOutState::Cleared as u8,
                BackOutState::Raised as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if raised {
            log::debug!("copy failed in a stop-the-world scavenge, backing out");
        }
        raised
    }

    #[inline(always)]
    pub(crate) fn is_backout_raised(&self) -> bool {
        self.cycle.backout.load(Ordering::Acquire) != BackOutState::Cleared as u8
    }
}

/// # Safety
///
/// Both ranges must be valid for `size` bytes and must not overlap.
#[inline]
unsafe fn copy_bytes(from: Address, to: Address, size: usize) {
    // SAFETY: per caller
    unsafe { std::ptr::copy_nonoverlapping(from.as_ptr::<u8>(), to.as_mut_ptr::<u8>(), size) };
}
