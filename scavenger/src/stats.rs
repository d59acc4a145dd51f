use object::AGE_MAX;

/// Rows in the flip history; row 0 is the cycle in progress.
pub const FLIP_HISTORY_SIZE: usize = 16;
/// Columns: new age after a survived scavenge, `0..=AGE_MAX + 1`.
pub const FLIP_HISTORY_AGES: usize = AGE_MAX as usize + 2;

const INITIAL_FREE_HISTORY_WEIGHT: f64 = 0.8;
const TENURE_BYTES_HISTORY_WEIGHT: f64 = 0.8;

/// Counters gathered by one worker during one increment.
///
/// Workers own their copy and fold it into the shared totals once per
/// increment with [`ScavengerStats::merge`].
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ScavengerStats {
    pub flip_count: usize,
    pub flip_bytes: usize,
    pub tenure_count: usize,
    pub tenure_bytes: usize,
    pub failed_flip_count: usize,
    pub failed_flip_bytes: usize,
    pub failed_tenure_count: usize,
    pub failed_tenure_bytes: usize,
    pub failed_tenure_largest: usize,
    pub flip_discard_bytes: usize,
    pub tenure_discard_bytes: usize,
    pub survivor_tlh_remainder_count: usize,
    pub tenure_tlh_remainder_count: usize,
    pub remembered_set_overflow: bool,
    /// This increment pushed the remembered set into overflow.
    pub caused_remembered_set_overflow: bool,
    pub scan_cache_overflow: usize,
    pub cache_alloc_count: usize,
    pub backout: bool,
    pub alias_to_copy_cache_count: usize,
    pub array_split_count: usize,
    pub array_split_amount: usize,
    pub slots_scanned: usize,
    pub slots_copied: usize,
    pub objects_scanned: usize,
    pub scan_waits: usize,
    pub hot_field_copies: usize,
    pub self_forwarded_count: usize,
    pub self_forwarded_bytes: usize,
    pub read_barrier_copies: usize,
    pub remembered_objects_pruned: usize,
}

impl ScavengerStats {
    pub fn merge(&mut self, other: &ScavengerStats) {
        self.flip_count += other.flip_count;
        self.flip_bytes += other.flip_bytes;
        self.tenure_count += other.tenure_count;
        self.tenure_bytes += other.tenure_bytes;
        self.failed_flip_count += other.failed_flip_count;
        self.failed_flip_bytes += other.failed_flip_bytes;
        self.failed_tenure_count += other.failed_tenure_count;
        self.failed_tenure_bytes += other.failed_tenure_bytes;
        self.failed_tenure_largest = self.failed_tenure_largest.max(other.failed_tenure_largest);
        self.flip_discard_bytes += other.flip_discard_bytes;
        self.tenure_discard_bytes += other.tenure_discard_bytes;
        self.survivor_tlh_remainder_count += other.survivor_tlh_remainder_count;
        self.tenure_tlh_remainder_count += other.tenure_tlh_remainder_count;
        self.remembered_set_overflow |= other.remembered_set_overflow;
        self.caused_remembered_set_overflow |= other.caused_remembered_set_overflow;
        self.scan_cache_overflow += other.scan_cache_overflow;
        self.cache_alloc_count += other.cache_alloc_count;
        self.backout |= other.backout;
        self.alias_to_copy_cache_count += other.alias_to_copy_cache_count;
        self.array_split_count += other.array_split_count;
        self.array_split_amount += other.array_split_amount;
        self.slots_scanned += other.slots_scanned;
        self.slots_copied += other.slots_copied;
        self.objects_scanned += other.objects_scanned;
        self.scan_waits += other.scan_waits;
        self.hot_field_copies += other.hot_field_copies;
        self.self_forwarded_count += other.self_forwarded_count;
        self.self_forwarded_bytes += other.self_forwarded_bytes;
        self.read_barrier_copies += other.read_barrier_copies;
        self.remembered_objects_pruned += other.remembered_objects_pruned;
    }

    #[inline]
    pub fn copied_bytes(&self) -> usize {
        self.flip_bytes + self.tenure_bytes
    }
}

/// Per-age flip and tenure bytes of one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlipHistoryRow {
    pub flip_bytes: [usize; FLIP_HISTORY_AGES],
    pub tenure_bytes: [usize; FLIP_HISTORY_AGES],
}

impl Default for FlipHistoryRow {
    fn default() -> Self {
        Self {
            flip_bytes: [0; FLIP_HISTORY_AGES],
            tenure_bytes: [0; FLIP_HISTORY_AGES],
        }
    }
}

impl FlipHistoryRow {
    pub fn merge(&mut self, other: &FlipHistoryRow) {
        for age in 0..FLIP_HISTORY_AGES {
            self.flip_bytes[age] += other.flip_bytes[age];
            self.tenure_bytes[age] += other.tenure_bytes[age];
        }
    }
}

/// Survival history across the last [`FLIP_HISTORY_SIZE`] cycles.
#[derive(Debug, Clone)]
pub struct FlipHistory {
    rows: [FlipHistoryRow; FLIP_HISTORY_SIZE],
}

impl Default for FlipHistory {
    fn default() -> Self {
        Self {
            rows: [FlipHistoryRow::default(); FLIP_HISTORY_SIZE],
        }
    }
}

impl FlipHistory {
    /// Shift every row one cycle older and clear row 0.
    pub fn rotate(&mut self) {
        self.rows.copy_within(0..FLIP_HISTORY_SIZE - 1, 1);
        self.rows[0] = FlipHistoryRow::default();
    }

    #[inline]
    pub fn row(&self, lookback: usize) -> &FlipHistoryRow {
        &self.rows[lookback]
    }

    #[inline]
    pub fn current_mut(&mut self) -> &mut FlipHistoryRow {
        &mut self.rows[0]
    }

    /// Drop the current row, used when a cycle is backed out.
    pub fn clear_current(&mut self) {
        self.rows[0] = FlipHistoryRow::default();
    }
}

/// Long-lived collector history.
#[derive(Debug, Clone, Default)]
pub struct GcHistory {
    pub gc_count: usize,
    pub backout_count: usize,
    pub percolate_count: usize,
    pub avg_initial_free: usize,
    pub avg_tenure_bytes: usize,
    /// Tenure age in effect for the last cycle (lowest age in the mask).
    pub tenure_age: u8,
    pub tenure_mask: u32,
    /// Survivor share of the nursery, in percent.
    pub tilt_ratio: usize,
    pub flip_history: FlipHistory,
}

impl GcHistory {
    /// Fold a successful cycle into the running averages.
    pub fn record_cycle(&mut self, initial_free: usize, tenure_bytes: usize) {
        if self.gc_count > 1 {
            self.avg_initial_free =
                weighted_average(self.avg_initial_free, initial_free, INITIAL_FREE_HISTORY_WEIGHT);
            self.avg_tenure_bytes =
                weighted_average(self.avg_tenure_bytes, tenure_bytes, TENURE_BYTES_HISTORY_WEIGHT);
        } else {
            self.avg_initial_free = initial_free;
            self.avg_tenure_bytes = tenure_bytes;
        }
    }
}

#[inline]
fn weighted_average(current: usize, new: usize, weight: f64) -> usize {
    (current as f64 * weight + new as f64 * (1.0 - weight)).round() as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_sums_and_keeps_largest() {
        let mut total = ScavengerStats {
            flip_count: 1,
            failed_tenure_largest: 64,
            ..ScavengerStats::default()
        };
        total.merge(&ScavengerStats {
            flip_count: 2,
            failed_tenure_largest: 32,
            backout: true,
            ..ScavengerStats::default()
        });
        assert_eq!(total.flip_count, 3);
        assert_eq!(total.failed_tenure_largest, 64);
        assert!(total.backout);
    }

    #[test]
    fn test_flip_history_rotates() {
        let mut history = FlipHistory::default();
        history.current_mut().flip_bytes[1] = 100;
        history.rotate();
        assert_eq!(history.row(0).flip_bytes[1], 0);
        assert_eq!(history.row(1).flip_bytes[1], 100);
        for _ in 0..FLIP_HISTORY_SIZE {
            history.rotate();
        }
        assert_eq!(history.row(FLIP_HISTORY_SIZE - 1).flip_bytes[1], 0);
    }

    #[test]
    fn test_running_averages() {
        let mut history = GcHistory {
            gc_count: 1,
            ..GcHistory::default()
        };
        history.record_cycle(1000, 100);
        assert_eq!(history.avg_tenure_bytes, 100);
        history.gc_count = 2;
        history.record_cycle(1000, 600);
        assert_eq!(history.avg_tenure_bytes, 200);
        assert_eq!(history.avg_initial_free, 1000);
    }
}
