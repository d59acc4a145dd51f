//! Thread-local collector state.
//!
//! One `WorkerContext` per GC worker, created with the scavenger and reused
//! for every increment; mutators in concurrent mode own one each.

use crate::{
    cache::{CacheRole, CopyScanCache},
    remembered_set::RememberedSetFragment,
    space::Region,
    stats::{FlipHistoryRow, ScavengerStats},
};

#[inline(always)]
pub(crate) fn role_index(role: CacheRole) -> usize {
    match role {
        CacheRole::Semispace => 0,
        CacheRole::Tenurespace => 1,
    }
}

#[derive(Debug)]
pub struct WorkerContext {
    pub(crate) id: usize,
    /// Active copy destinations, indexed by [`role_index`].
    pub(crate) copy_caches: [Option<Box<CopyScanCache>>; 2],
    /// Bumped whenever a copy cache is replaced, so a scan aliased to the
    /// old one notices.
    pub(crate) copy_epochs: [u64; 2],
    /// Leftover TLH tails kept for the next reservation.
    pub(crate) remainders: [Region; 2],
    /// One cache of scan work kept back from the queue for locality.
    pub(crate) deferred: Option<Box<CopyScanCache>>,
    /// Copy cache that received the last copied object.
    pub(crate) last_copy: Option<CacheRole>,
    pub(crate) fragment: RememberedSetFragment,
    pub(crate) stats: ScavengerStats,
    pub(crate) flip_row: FlipHistoryRow,
    pub(crate) ratio_scanned: u64,
    pub(crate) ratio_copied: u64,
    pub(crate) observed_done: u64,
    /// Retired copy caches go straight to the scan queue instead of the
    /// deferred slot (mutators, and workers leaving a phase early).
    pub(crate) share_retired: bool,
}

impl WorkerContext {
    pub fn new(id: usize, fragment_size: usize) -> Self {
        Self {
            id,
            copy_caches: [None, None],
            copy_epochs: [0, 0],
            remainders: [Region::empty(), Region::empty()],
            deferred: None,
            last_copy: None,
            fragment: RememberedSetFragment::new(fragment_size),
            stats: ScavengerStats::default(),
            flip_row: FlipHistoryRow::default(),
            ratio_scanned: 0,
            ratio_copied: 0,
            observed_done: 0,
            share_retired: false,
        }
    }

    #[inline(always)]
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn stats(&self) -> &ScavengerStats {
        &self.stats
    }

    /// Clear per-increment counters.
    pub(crate) fn begin_increment(&mut self, observed_done: u64, share_retired: bool) {
        debug_assert!(self.deferred.is_none(), "deferred scan work leaked across increments");
        self.stats = ScavengerStats::default();
        self.flip_row = FlipHistoryRow::default();
        self.ratio_scanned = 0;
        self.ratio_copied = 0;
        self.observed_done = observed_done;
        self.last_copy = None;
        self.share_retired = share_retired;
    }

    #[inline]
    pub(crate) fn copy_cache(&self, role: CacheRole) -> Option<&CopyScanCache> {
        self.copy_caches[role_index(role)].as_deref()
    }

    #[inline]
    pub(crate) fn copy_cache_mut(&mut self, role: CacheRole) -> Option<&mut CopyScanCache> {
        self.copy_caches[role_index(role)].as_deref_mut()
    }

    pub(crate) fn take_copy_cache(&mut self, role: CacheRole) -> Option<Box<CopyScanCache>> {
        let index = role_index(role);
        let cache = self.copy_caches[index].take();
        if cache.is_some() {
            self.copy_epochs[index] += 1;
        }
        cache
    }

    pub(crate) fn set_copy_cache(&mut self, role: CacheRole, cache: Box<CopyScanCache>) {
        debug_assert!(cache.is_copy());
        let index = role_index(role);
        debug_assert!(self.copy_caches[index].is_none());
        self.copy_caches[index] = Some(cache);
        self.copy_epochs[index] += 1;
    }

    #[inline]
    pub(crate) fn copy_epoch(&self, role: CacheRole) -> u64 {
        self.copy_epochs[role_index(role)]
    }

    #[inline]
    pub(crate) fn remainder_mut(&mut self, role: CacheRole) -> &mut Region {
        &mut self.remainders[role_index(role)]
    }

    /// Whether this context holds scan work nobody else can see.
    pub fn has_unshared_work(&self) -> bool {
        self.deferred.is_some()
            || self
                .copy_caches
                .iter()
                .flatten()
                .any(|cache| cache.has_scan_work())
    }
}
