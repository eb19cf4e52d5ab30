//! Activity record definitions
//!
//! These types represent the converted trace activities assembled by the
//! collector core and handed to output sinks. Raw vendor records are defined
//! separately in the collector's backend interface.

use serde::{Deserialize, Serialize};

use crate::types::span::TraceSpan;

/// Timestamp in nanoseconds since UNIX epoch
pub type Timestamp = i64;

/// Device identifier (GPU ordinal, or pid for CPU-side records)
pub type DeviceId = i64;

/// Resource identifier (stream id, or tid for CPU-side records)
pub type ResourceId = i64;

/// Backend-assigned correlation identifier linking a host-side call to its
/// resulting device-side record
pub type CorrelationId = u64;

/// The kind of a converted trace activity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActivityKind {
    /// Client-side operation from an instrumented application
    CpuOp,
    /// Runtime API call on the host
    RuntimeApi,
    /// Driver API call on the host (kernel launches only)
    DriverApi,
    /// Kernel execution on a device
    Kernel,
    /// Device memory copy
    Memcpy,
    /// Device memory set
    Memset,
    /// Profiling overhead reported by the backend
    Overhead,
    /// Device/stream synchronization
    Synchronization,
    /// Synthetic span aggregating GPU work under a user annotation
    GpuUserAnnotation,
    /// Range-profiling capture; kernels may carry zero timestamps
    ProfilerRange,
}

/// Stable reference to an activity owned by the collector's buffer store.
///
/// References stay valid for the lifetime of one capture; they are indices
/// rather than pointers so linked activities can be resolved without
/// self-referential ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActivityRef {
    /// Activity inside a transferred CPU trace buffer
    Cpu { buffer: usize, index: usize },
    /// Converted GPU/runtime record in the arena
    Gpu { index: usize },
}

/// One converted trace activity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub kind: ActivityKind,

    /// Start timestamp in nanoseconds since epoch
    pub timestamp: Timestamp,

    /// Duration in nanoseconds; negative means the activity never finished
    pub duration: i64,

    /// Device ordinal, or pid for CPU-side activities
    pub device: DeviceId,

    /// Stream id, or tid for CPU-side activities
    pub resource: ResourceId,

    /// Backend correlation id; 0 when not correlated
    pub correlation: CorrelationId,

    /// Linked counterpart activity (CPU op for a GPU record, or vice versa)
    pub linked: Option<ActivityRef>,

    /// Display name (kernel name, API name, user annotation)
    pub name: String,

    /// Free-form key/value metadata attached to the activity
    #[serde(default)]
    pub metadata: Vec<(String, String)>,
}

impl ActivityRecord {
    pub fn new(kind: ActivityKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            timestamp: 0,
            duration: 0,
            device: 0,
            resource: 0,
            correlation: 0,
            linked: None,
            name: name.into(),
            metadata: Vec::new(),
        }
    }

    /// End timestamp in nanoseconds since epoch
    pub fn end_time(&self) -> Timestamp {
        self.timestamp + self.duration
    }

    pub fn add_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.push((key.into(), value.into()));
    }
}

/// A buffer of CPU-side activities transferred by the instrumented
/// application, covering one iteration of one named trace span.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpuTraceBuffer {
    /// The CPU span covering the buffer's activities
    pub span: TraceSpan,

    /// Number of GPU operations the application expects to be launched from
    /// this span
    pub gpu_op_count: i64,

    /// The activities themselves, in recording order
    pub activities: Vec<ActivityRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_end_time() {
        let mut act = ActivityRecord::new(ActivityKind::Kernel, "k");
        act.timestamp = 100;
        act.duration = 30;
        assert_eq!(act.end_time(), 130);
    }

    #[test]
    fn test_metadata_append() {
        let mut act = ActivityRecord::new(ActivityKind::CpuOp, "op");
        act.add_metadata("finished", "false");
        assert_eq!(act.metadata.len(), 1);
        assert_eq!(act.metadata[0].0, "finished");
    }
}
