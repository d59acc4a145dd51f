//! Per-age tenure decisions.
//!
//! The mask has one bit per age; objects whose age bit is set are copied
//! to tenure space first and the survivor semispace second.

use object::AGE_MAX;

use crate::{
    TenureSettings,
    stats::{FLIP_HISTORY_AGES, FLIP_HISTORY_SIZE, FlipHistory},
};

pub type TenureMask = u32;

#[inline(always)]
pub fn should_tenure(mask: TenureMask, age: u8) -> bool {
    mask & (1 << age) != 0
}

/// Recompute the mask from every enabled strategy. Objects at [`AGE_MAX`]
/// always tenure.
pub fn calculate_tenure_mask(
    settings: &TenureSettings,
    adaptive_age: u8,
    history: &FlipHistory,
) -> TenureMask {
    let mut mask = 1 << AGE_MAX;
    if settings.fixed {
        mask |= mask_using_fixed(settings.fixed_age);
    }
    if settings.adaptive {
        mask |= mask_using_fixed(adaptive_age);
    }
    if settings.lookback {
        mask |= mask_using_lookback(history, settings.survival_threshold);
    }
    if settings.history {
        mask |= mask_using_history(history, settings.survival_threshold);
    }
    mask
}

pub fn mask_using_fixed(tenure_age: u8) -> TenureMask {
    debug_assert!(tenure_age <= AGE_MAX);
    (tenure_age..=AGE_MAX).fold(0, |mask, age| mask | (1 << age))
}

fn initial_generation_size(history: &FlipHistory, lookback: usize) -> usize {
    let row = history.row(lookback);
    row.flip_bytes[1] + row.tenure_bytes[1]
}

/// Tenure an age once it has survived at `minimum_survival_rate` for as
/// many cycles as its generation size asks for. Small generations need a
/// longer record.
pub fn mask_using_lookback(history: &FlipHistory, minimum_survival_rate: f64) -> TenureMask {
    let sizes: Vec<f64> = (1..FLIP_HISTORY_SIZE)
        .map(|index| initial_generation_size(history, index))
        .filter(|&size| size > 0)
        .map(|size| size as f64)
        .collect();
    let (average, deviation) = if sizes.is_empty() {
        (0.0, 0.0)
    } else {
        let count = sizes.len() as f64;
        let average = sizes.iter().sum::<f64>() / count;
        let squares: f64 = sizes.iter().map(|size| (size - average).powi(2)).sum();
        (average, (squares / count).sqrt())
    };
    let normalized = (average - deviation).max(0.0) as usize;

    let mut mask = 0;
    for age in 0..FLIP_HISTORY_AGES {
        let current_generation = history.row(1).flip_bytes[age];
        let maximum_lookback = FLIP_HISTORY_SIZE - 1;
        let mut required_lookback = 1;
        let mut minimum_bytes = normalized;
        while required_lookback < maximum_lookback && current_generation < minimum_bytes {
            required_lookback += 1;
            minimum_bytes /= 2;
        }

        // too young to have enough history
        let mut tenure = required_lookback < age;
        let mut lookback = 1;
        while tenure && lookback <= required_lookback {
            let current_index = age - lookback + 1;
            let previous_index = age - lookback;
            let row = history.row(lookback);
            let current_flip = row.flip_bytes[current_index];
            let current_total = current_flip + row.tenure_bytes[current_index];
            let previous_flip = history.row(lookback + 1).flip_bytes[previous_index];
            if previous_flip != 0
                && (current_flip == 0
                    || (current_total as f64 / previous_flip as f64) < minimum_survival_rate)
            {
                tenure = false;
            }
            lookback += 1;
        }
        if tenure {
            mask |= 1 << age;
        }
    }
    mask
}

/// Tenure an age if, across the whole history, its bytes survived into the
/// next age at `minimum_survival_rate` or better.
pub fn mask_using_history(history: &FlipHistory, minimum_survival_rate: f64) -> TenureMask {
    let mut mask = 0;
    for age in 0..AGE_MAX as usize {
        let survives = (1..FLIP_HISTORY_SIZE - 1).all(|lookback| {
            let current = history.row(lookback + 1).flip_bytes[age];
            let next = history.row(lookback);
            let next_bytes = next.flip_bytes[age + 1] + next.tenure_bytes[age + 1];
            current != 0 && (next_bytes as f64 / current as f64) >= minimum_survival_rate
        });
        if survives {
            mask |= 1 << age;
        }
    }
    mask
}

/// Move the adaptive age after a successful cycle: up when little of the
/// nursery was consumed, down when much of it was.
pub fn adjust_adaptive_age(
    settings: &TenureSettings,
    age: u8,
    nursery_size: usize,
    consumed: usize,
) -> u8 {
    let scale = nursery_size / 100;
    if consumed < settings.ratio_low * scale && age < AGE_MAX {
        age + 1
    } else if consumed > settings.ratio_high * scale && age > 1 {
        age - 1
    } else {
        age
    }
}

/// Lowest age that tenures under `mask`.
pub fn tenure_age(mask: TenureMask) -> u8 {
    (mask.trailing_zeros() as u8).min(AGE_MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_always_tenures_max_age() {
        let settings = TenureSettings {
            fixed: false,
            adaptive: false,
            ..TenureSettings::default()
        };
        let mask = calculate_tenure_mask(&settings, 5, &FlipHistory::default());
        assert_eq!(mask, 1 << AGE_MAX);
        assert!(should_tenure(mask, AGE_MAX));
        assert!(!should_tenure(mask, 0));
    }

    #[test]
    fn test_fixed_mask_covers_age_and_older() {
        let mask = mask_using_fixed(3);
        assert!(!should_tenure(mask, 2));
        assert!(should_tenure(mask, 3));
        assert!(should_tenure(mask, AGE_MAX));
        assert_eq!(tenure_age(mask), 3);
    }

    #[test]
    fn test_history_tenures_ages_that_always_survive() {
        let mut history = FlipHistory::default();
        // every cycle: 100 bytes at each age, all of it surviving
        for _ in 0..FLIP_HISTORY_SIZE {
            history.rotate();
            let row = history.current_mut();
            for age in 0..FLIP_HISTORY_AGES {
                row.flip_bytes[age] = 100;
            }
        }
        history.rotate();
        let mask = mask_using_history(&history, 0.99);
        assert!(should_tenure(mask, 0));
        assert!(should_tenure(mask, AGE_MAX - 1));

        // age 2 objects start dying
        history.current_mut().flip_bytes[3] = 10;
        history.rotate();
        let mask = mask_using_history(&history, 0.99);
        assert!(!should_tenure(mask, 2), "age 2 no longer survives");
    }

    #[test]
    fn test_lookback_needs_history() {
        let history = FlipHistory::default();
        let mask = mask_using_lookback(&history, 0.99);
        assert!(!should_tenure(mask, 0), "age 0 can never satisfy a lookback");
        assert!(!should_tenure(mask, 1));
    }

    #[test]
    fn test_adaptive_age_moves_with_consumption() {
        let settings = TenureSettings::default();
        assert_eq!(adjust_adaptive_age(&settings, 10, 10_000, 500), 11);
        assert_eq!(adjust_adaptive_age(&settings, 10, 10_000, 5_000), 9);
        assert_eq!(adjust_adaptive_age(&settings, 10, 10_000, 2_000), 10);
        assert_eq!(adjust_adaptive_age(&settings, AGE_MAX, 10_000, 0), AGE_MAX);
    }
}
