//! Trace span types

use serde::{Deserialize, Serialize};

use crate::types::activity::Timestamp;

/// A named time interval covering one logical unit of work: one CPU trace
/// instance for one iteration, or its paired GPU-side extent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceSpan {
    /// Start timestamp in nanoseconds since epoch; 0 means not yet observed
    pub start_time: Timestamp,

    /// End timestamp in nanoseconds since epoch
    pub end_time: Timestamp,

    /// Number of operations covered by the span
    pub op_count: i64,

    /// Iteration index, assigned per span name in arrival order
    pub iteration: i64,

    /// Span name as reported by the application
    pub name: String,

    /// Display prefix ("GPU: " for device-side spans)
    pub prefix: String,
}

impl TraceSpan {
    pub fn new(op_count: i64, iteration: i64, name: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            start_time: 0,
            end_time: 0,
            op_count,
            iteration,
            name: name.into(),
            prefix: prefix.into(),
        }
    }

    /// Widen the span to cover [start, end). Never shrinks; a zero start time
    /// is treated as unset.
    pub fn extend(&mut self, start: Timestamp, end: Timestamp) {
        if start < self.start_time || self.start_time == 0 {
            self.start_time = start;
        }
        self.end_time = self.end_time.max(end);
    }
}

/// A CPU span and its paired GPU span, keyed by (name, iteration)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanPair {
    pub cpu: TraceSpan,
    pub gpu: TraceSpan,
}
