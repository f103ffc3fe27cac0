//! The error taxonomy described in the design: a small tagged sum so that
//! retry back-off, per-category thresholds, and the decision to restart all
//! key off a single discriminant (`DaemonError::category`).

use std::collections::HashMap;

/// Coarse bucket an error falls into. Distinct from the `DaemonError`
/// variants themselves so that wrapped foreign errors (`io::Error`,
/// `nix::Error`) can still be filed under a meaningful category.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ErrorCategory {
    Validation,
    Clean,
    Transient,
    Identity,
    Corruption,
    Died,
    Fatal,
}

#[derive(thiserror::Error, Debug)]
pub enum DaemonError {
    #[error("invalid configuration: {0}")]
    Validation(String),

    #[error("clean abort: {0}")]
    Clean(String),

    #[error("transient ipc error: {0}")]
    Transient(String),

    #[error("ipc identity lost: {0}")]
    Identity(String),

    #[error("ipc payload corruption: {0}")]
    Corruption(String),

    #[error("call {0} died: worker exited before returning")]
    Died(u64),

    #[error("fatal: {0}")]
    Fatal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("posix error: {0}")]
    Errno(#[from] nix::errno::Errno),
}

impl DaemonError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            DaemonError::Validation(_) => ErrorCategory::Validation,
            DaemonError::Clean(_) => ErrorCategory::Clean,
            DaemonError::Transient(_) => ErrorCategory::Transient,
            DaemonError::Identity(_) => ErrorCategory::Identity,
            DaemonError::Corruption(_) => ErrorCategory::Corruption,
            DaemonError::Died(_) => ErrorCategory::Died,
            DaemonError::Fatal(_) => ErrorCategory::Fatal,
            // Raw OS/IO failures surfacing through the transport are treated
            // as transient until a caller's retry budget says otherwise.
            DaemonError::Io(_) => ErrorCategory::Transient,
            DaemonError::Errno(_) => ErrorCategory::Transient,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self.category(), ErrorCategory::Fatal | ErrorCategory::Validation)
    }
}

/// Per-category error counters. A mediator keeps one of these per worker
/// alias; exceeding a category's bound is fatal for that mediator only.
#[derive(Debug, Default)]
pub struct ErrorCounters {
    counts: HashMap<ErrorCategory, u32>,
}

impl ErrorCounters {
    pub fn new() -> Self {
        Default::default()
    }

    /// Records one occurrence of `category`, returning `true` if `bound` has
    /// now been exceeded.
    pub fn record(&mut self, category: ErrorCategory, bound: u32) -> bool {
        let entry = self.counts.entry(category).or_insert(0);
        *entry += 1;
        *entry > bound
    }

    pub fn get(&self, category: ErrorCategory) -> u32 {
        *self.counts.get(&category).unwrap_or(&0)
    }

    pub fn reset(&mut self, category: ErrorCategory) {
        self.counts.insert(category, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_exceeded_only_past_bound() {
        let mut counters = ErrorCounters::new();
        assert!(!counters.record(ErrorCategory::Transient, 2));
        assert!(!counters.record(ErrorCategory::Transient, 2));
        assert!(counters.record(ErrorCategory::Transient, 2));
        assert_eq!(counters.get(ErrorCategory::Transient), 3);
    }

    #[test]
    fn categories_are_independent() {
        let mut counters = ErrorCounters::new();
        counters.record(ErrorCategory::Died, 1);
        assert_eq!(counters.get(ErrorCategory::Corruption), 0);
    }

    #[test]
    fn reset_clears_only_that_category() {
        let mut counters = ErrorCounters::new();
        counters.record(ErrorCategory::Identity, 5);
        counters.record(ErrorCategory::Fatal, 5);
        counters.reset(ErrorCategory::Identity);
        assert_eq!(counters.get(ErrorCategory::Identity), 0);
        assert_eq!(counters.get(ErrorCategory::Fatal), 1);
    }
}
