use std::time::Duration;

use object::{AGE_MAX, WORD_SIZE};

use crate::{OS_PAGE_SIZE, SettingsError};

/// Order in which copied objects are scanned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOrdering {
    /// Drain whole caches in copy order.
    BreadthFirst,
    /// Follow freshly copied children first by switching to the copy cache
    /// that received them.
    Hierarchical,
}

/// Which tenure-age strategies contribute to the tenure mask.
#[derive(Debug, Clone, Copy)]
pub struct TenureSettings {
    pub fixed: bool,
    /// Age used by the fixed strategy.
    pub fixed_age: u8,
    pub adaptive: bool,
    /// Starting age of the adaptive strategy; adjusted after each cycle.
    pub adaptive_age: u8,
    /// Percent of the nursery consumed below which the adaptive age rises.
    pub ratio_low: usize,
    /// Percent of the nursery consumed above which the adaptive age falls.
    pub ratio_high: usize,
    pub lookback: bool,
    pub history: bool,
    /// Minimum survival rate (0.0 - 1.0) for the lookback/history strategies.
    pub survival_threshold: f64,
}

impl Default for TenureSettings {
    fn default() -> Self {
        Self {
            fixed: false,
            fixed_age: 10,
            adaptive: true,
            adaptive_age: 10,
            ratio_low: 10,
            ratio_high: 30,
            lookback: false,
            history: false,
            survival_threshold: 0.99,
        }
    }
}

impl TenureSettings {
    /// Tenure everything of `age` and older, nothing else.
    pub fn fixed(age: u8) -> Self {
        Self {
            fixed: true,
            fixed_age: age,
            adaptive: false,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConcurrentSettings {
    pub enabled: bool,
    /// Worker threads used by the background scan phase.
    pub background_threads: usize,
    /// Timed wait on the scan queue while mutators may still hold work.
    pub queue_wait: Duration,
    /// Section size for cooperative copies of large objects.
    pub copy_section_size: usize,
    /// Objects at least this large are copied reserve-then-copy instead of
    /// duplicate-then-race.
    pub concurrent_copy_threshold: usize,
}

impl Default for ConcurrentSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            background_threads: 1,
            queue_wait: Duration::from_millis(1),
            copy_section_size: 4 * 1024,
            concurrent_copy_threshold: 16 * 1024,
        }
    }
}

/// Configuration for the nursery collector.
#[derive(Debug, Clone)]
pub struct ScavengerSettings {
    /// Bytes of nursery, split evenly into two semispaces.
    /// Must be a multiple of two OS pages.
    pub nursery_size: usize,
    /// Bytes of tenure space. Must be a multiple of the OS page size.
    pub tenure_size: usize,
    /// GC threads per stop-the-world increment.
    pub worker_threads: usize,
    pub scan_ordering: ScanOrdering,
    /// Smallest TLH requested for a copy cache.
    pub min_cache_size: usize,
    /// Largest TLH requested for a copy cache.
    pub max_cache_size: usize,
    /// Objects above this size are allocated individually instead of
    /// inside a copy cache.
    pub tlh_threshold: usize,
    /// Survivor TLH remainders below this are abandoned instead of reused.
    pub survivor_discard_threshold: usize,
    /// Tenure TLH remainders below this are abandoned instead of reused.
    pub tenure_discard_threshold: usize,
    /// Cache headers reserved up front.
    pub cache_pool_initial: usize,
    /// Headers added per resize of the free cache pool.
    pub cache_pool_increment: usize,
    /// Upper bound on reserved headers before heap carving kicks in.
    pub cache_pool_max: usize,
    /// Smallest chunk (elements) split off a large array.
    pub array_split_minimum: usize,
    /// Chunk (elements) split off a large array when no thread is idle.
    pub array_split_maximum: usize,
    /// Aliasing to a copy cache is allowed while at most this many
    /// threads wait for work.
    pub alias_threshold: usize,
    /// Depth bound of hot field copying; 0 disables it.
    pub hot_field_depth: usize,
    /// Cache line used to keep small hot objects from straddling lines;
    /// 0 disables the bias.
    pub hot_field_alignment: usize,
    pub tenure: TenureSettings,
    /// Remembered set entries buffered per thread before a flush.
    pub remembered_set_fragment_size: usize,
    /// Remembered set capacity; exceeding it switches to overflow.
    pub remembered_set_max_entries: usize,
    /// Percolate to a global collection while the remembered set overflows.
    pub percolate_on_overflow: bool,
    /// Failed tenure bytes in one cycle that force a global collection next.
    pub failed_tenure_threshold: usize,
    /// Scavenges between global collections; 0 means unlimited.
    pub max_scavenges_before_global: u32,
    pub concurrent: ConcurrentSettings,
}

impl Default for ScavengerSettings {
    fn default() -> Self {
        Self {
            nursery_size: 4 * 1024 * 1024,  // 4 MB
            tenure_size: 16 * 1024 * 1024,  // 16 MB
            worker_threads: num_cpus::get().clamp(1, 8),
            scan_ordering: ScanOrdering::Hierarchical,
            min_cache_size: 8 * 1024,      // 8 KB
            max_cache_size: 128 * 1024,    // 128 KB
            tlh_threshold: 16 * 1024,      // 16 KB
            survivor_discard_threshold: 256,
            tenure_discard_threshold: 256,
            cache_pool_initial: 64,
            cache_pool_increment: 32,
            cache_pool_max: 1024,
            array_split_minimum: 64,
            array_split_maximum: 1024,
            alias_threshold: 0,
            hot_field_depth: 3,
            hot_field_alignment: 64,
            tenure: TenureSettings::default(),
            remembered_set_fragment_size: 32,
            remembered_set_max_entries: 65_536,
            percolate_on_overflow: false,
            failed_tenure_threshold: 1024 * 1024, // 1 MB
            max_scavenges_before_global: 0,
            concurrent: ConcurrentSettings::default(),
        }
    }
}

impl ScavengerSettings {
    #[inline]
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.nursery_size == 0 {
            return Err(SettingsError::Zero("nursery_size"));
        }
        if self.tenure_size == 0 {
            return Err(SettingsError::Zero("tenure_size"));
        }
        if self.nursery_size % (2 * OS_PAGE_SIZE) != 0 {
            return Err(SettingsError::PageAlignment("nursery_size / 2"));
        }
        if self.tenure_size % (OS_PAGE_SIZE) != 0 {
            return Err(SettingsError::PageAlignment("tenure_size"));
        }
        if self.worker_threads == 0 {
            return Err(SettingsError::Zero("worker_threads"));
        }
        if self.min_cache_size == 0 {
            return Err(SettingsError::Zero("min_cache_size"));
        }
        for (name, value) in [
            ("min_cache_size", self.min_cache_size),
            ("max_cache_size", self.max_cache_size),
            ("tlh_threshold", self.tlh_threshold),
            ("survivor_discard_threshold", self.survivor_discard_threshold),
            ("tenure_discard_threshold", self.tenure_discard_threshold),
            ("concurrent.copy_section_size", self.concurrent.copy_section_size),
        ] {
            if value % WORD_SIZE != 0 {
                return Err(SettingsError::WordAlignment(name));
            }
        }
        if self.min_cache_size > self.max_cache_size {
            return Err(SettingsError::Ordering {
                lower: "min_cache_size",
                upper: "max_cache_size",
            });
        }
        if self.cache_pool_initial == 0 || self.cache_pool_increment == 0 {
            return Err(SettingsError::Zero("cache_pool_initial / cache_pool_increment"));
        }
        if self.cache_pool_initial > self.cache_pool_max {
            return Err(SettingsError::Ordering {
                lower: "cache_pool_initial",
                upper: "cache_pool_max",
            });
        }
        if self.array_split_minimum == 0 {
            return Err(SettingsError::Zero("array_split_minimum"));
        }
        if self.array_split_minimum > self.array_split_maximum {
            return Err(SettingsError::Ordering {
                lower: "array_split_minimum",
                upper: "array_split_maximum",
            });
        }
        if self.hot_field_alignment != 0 && !self.hot_field_alignment.is_power_of_two() {
            return Err(SettingsError::Range("hot_field_alignment"));
        }
        if self.remembered_set_fragment_size == 0 {
            return Err(SettingsError::Zero("remembered_set_fragment_size"));
        }
        if self.tenure.fixed_age > AGE_MAX || self.tenure.adaptive_age > AGE_MAX {
            return Err(SettingsError::Range("tenure age"));
        }
        if self.tenure.ratio_low > self.tenure.ratio_high || self.tenure.ratio_high > 100 {
            return Err(SettingsError::Range("tenure ratio"));
        }
        if !(0.0..=1.0).contains(&self.tenure.survival_threshold) {
            return Err(SettingsError::Range("tenure.survival_threshold"));
        }
        if self.concurrent.enabled && self.concurrent.background_threads == 0 {
            return Err(SettingsError::Zero("concurrent.background_threads"));
        }
        if self.concurrent.copy_section_size == 0 {
            return Err(SettingsError::Zero("concurrent.copy_section_size"));
        }
        Ok(())
    }

    /// Bytes in one semispace.
    #[inline(always)]
    pub fn semispace_size(&self) -> usize {
        self.nursery_size / 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings_are_valid() {
        assert_eq!(ScavengerSettings::default().validate(), Ok(()));
    }

    #[test]
    fn test_rejects_unaligned_nursery() {
        let settings = ScavengerSettings {
            nursery_size: OS_PAGE_SIZE,
            ..ScavengerSettings::default()
        };
        assert_eq!(
            settings.validate(),
            Err(SettingsError::PageAlignment("nursery_size / 2"))
        );
    }

    #[test]
    fn test_rejects_inverted_cache_bounds() {
        let settings = ScavengerSettings {
            min_cache_size: 64 * 1024,
            max_cache_size: 8 * 1024,
            ..ScavengerSettings::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::Ordering { .. })
        ));
    }

    #[test]
    fn test_rejects_tenure_age_above_max() {
        let settings = ScavengerSettings {
            tenure: TenureSettings::fixed(AGE_MAX + 1),
            ..ScavengerSettings::default()
        };
        assert_eq!(settings.validate(), Err(SettingsError::Range("tenure age")));
    }
}
