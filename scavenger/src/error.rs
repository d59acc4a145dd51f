use thiserror::Error;

use crate::ConcurrentPhase;

/// Rejected tunables, reported by [`ScavengerSettings::validate`](crate::ScavengerSettings::validate).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SettingsError {
    #[error("{0} must be > 0")]
    Zero(&'static str),
    #[error("{0} must be a multiple of the OS page size")]
    PageAlignment(&'static str),
    #[error("{0} must be a multiple of the word size")]
    WordAlignment(&'static str),
    #[error("{lower} must not exceed {upper}")]
    Ordering {
        lower: &'static str,
        upper: &'static str,
    },
    #[error("{0} is out of range")]
    Range(&'static str),
}

#[derive(Debug, Error)]
pub enum ScavengeError {
    #[error("invalid scavenger settings: {0}")]
    Settings(#[from] SettingsError),
    #[error("failed to map {0} bytes of heap memory")]
    MapFailed(usize),
    #[error("concurrent scavenging is disabled")]
    ConcurrentDisabled,
    #[error("operation not valid in concurrent phase {0:?}")]
    InvalidPhase(ConcurrentPhase),
    #[error("a collection is already in progress")]
    Busy,
}
