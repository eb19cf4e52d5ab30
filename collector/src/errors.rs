//! Anomaly counters and recoverable profiler errors

use std::fmt;

use thiserror::Error;

/// Categorized anomaly counts accumulated while processing one capture.
///
/// Counters only ever grow during a capture and are reset when a new capture
/// is configured. None of these abort processing; every anomaly is counted,
/// logged at most at a rate-limited warning level, and skipped over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ErrorCounts {
    /// Records whose interval fell outside the capture window
    pub out_of_range: u64,

    /// Runtime API calls filtered by the blocklist (a tally, not an anomaly)
    pub blocklisted_runtime: u64,

    /// External-correlation records carrying an unrecognized channel tag
    pub invalid_external_correlation: u64,

    /// Correlated runtime/GPU record pairs with inverted timestamps, plus
    /// any third record seen for an already-paired correlation id
    pub cpu_gpu_out_of_order: u64,

    /// Raw records with a kind outside the closed tag set
    pub unexpected_records: u64,

    /// Set when the backend reported an unrecoverable early stop
    pub backend_stopped_early: bool,
}

impl ErrorCounts {
    /// Total count of real anomalies. Blocklisted runtime calls are filtered
    /// by design and excluded here.
    pub fn anomalies(&self) -> u64 {
        self.out_of_range
            + self.invalid_external_correlation
            + self.cpu_gpu_out_of_order
            + self.unexpected_records
            + u64::from(self.backend_stopped_early)
    }
}

impl fmt::Display for ErrorCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "out-of-range = {}, blocklisted runtime = {}, invalid ext correlations = {}, \
             cpu/gpu out-of-order = {}, unexpected records = {}, backend stopped early = {}",
            self.out_of_range,
            self.blocklisted_runtime,
            self.invalid_external_correlation,
            self.cpu_gpu_out_of_order,
            self.unexpected_records,
            self.backend_stopped_early,
        )
    }
}

/// Recoverable errors returned from the profiler's public entry points.
///
/// None of these change profiler state; the caller may retry.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProfilerError {
    #[error("profiler already busy with an active capture")]
    AlreadyActive,

    #[error("start timestamp is {0}ms in the past")]
    StartInPast(i64),

    #[error("insufficient time for warmup: {available_ms}ms available, {required_ms}ms required")]
    InsufficientWarmup { available_ms: i64, required_ms: i64 },
}
