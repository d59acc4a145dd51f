use crate::{CollectOutcome, ConcurrentPhase, PercolateReason, ScavengerStats};

/// Transition points of the collector, for telemetry.
#[derive(Debug, Clone, Copy)]
pub enum ScavengerEvent<'a> {
    CycleStart {
        gc_count: usize,
        concurrent: bool,
    },
    CycleEnd {
        gc_count: usize,
        outcome: CollectOutcome,
        stats: &'a ScavengerStats,
    },
    /// A stop-the-world increment begins.
    IncrementStart { phase: ConcurrentPhase },
    IncrementEnd {
        phase: ConcurrentPhase,
        stats: &'a ScavengerStats,
    },
    /// Worker threads are dispatched.
    ScavengeStart { threads: usize, tenure_mask: u32 },
    ScavengeEnd { stats: &'a ScavengerStats },
    Percolate { reason: PercolateReason },
    RememberedSetOverflow,
    BackOut { stats: &'a ScavengerStats },
}

pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &ScavengerEvent<'_>);
}

/// Reports events through the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogListener;

impl EventListener for LogListener {
    fn on_event(&self, event: &ScavengerEvent<'_>) {
        match *event {
            ScavengerEvent::CycleStart {
                gc_count,
                concurrent,
            } => {
                log::debug!("scavenge #{gc_count} start (concurrent: {concurrent})");
            }
            ScavengerEvent::CycleEnd {
                gc_count,
                outcome,
                stats,
            } => {
                log::info!(
                    "scavenge #{gc_count} {outcome:?}: flipped {} objects / {} KB, tenured {} objects / {} KB",
                    stats.flip_count,
                    stats.flip_bytes / 1024,
                    stats.tenure_count,
                    stats.tenure_bytes / 1024
                );
            }
            ScavengerEvent::IncrementStart { phase } => {
                log::debug!("increment start ({phase:?})");
            }
            ScavengerEvent::IncrementEnd { phase, stats } => {
                log::debug!(
                    "increment end ({phase:?}): {} slots scanned, {} objects copied",
                    stats.slots_scanned,
                    stats.flip_count + stats.tenure_count
                );
            }
            ScavengerEvent::ScavengeStart {
                threads,
                tenure_mask,
            } => {
                log::debug!("dispatching {threads} workers, tenure mask {tenure_mask:#06x}");
            }
            ScavengerEvent::ScavengeEnd { stats } => {
                log::trace!(
                    "workers done: {} waits, {} aliases, {} array splits",
                    stats.scan_waits,
                    stats.alias_to_copy_cache_count,
                    stats.array_split_count
                );
            }
            ScavengerEvent::Percolate { reason } => {
                log::warn!("percolating to a global collection: {reason:?}");
            }
            ScavengerEvent::RememberedSetOverflow => {
                log::warn!("remembered set overflow, tenure space will be walked");
            }
            ScavengerEvent::BackOut { stats } => {
                log::warn!(
                    "scavenge backed out: failed flip {} B, failed tenure {} B",
                    stats.failed_flip_bytes,
                    stats.failed_tenure_bytes
                );
            }
        }
    }
}
