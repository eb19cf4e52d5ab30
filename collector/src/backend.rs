//! Vendor tracing backend interface
//!
//! The backend (a CUPTI/ROCTracer-equivalent) delivers raw activity records
//! through a drain interface and exposes enable/disable/clear/flush of
//! collection plus a "stopped early" status flag. Record kinds form a small
//! closed tag set; anything else lands in the unexpected-record bucket.

use std::collections::HashSet;

use gputrace_shared::types::activity::{ActivityKind, CorrelationId, Timestamp};

use crate::correlation::CorrelationChannel;

/// Host-side API call record (runtime or driver)
#[derive(Debug, Clone)]
pub struct RawApiRecord {
    pub name: String,
    pub correlation: CorrelationId,
    pub begin_ns: Timestamp,
    pub end_ns: Timestamp,
    pub thread_id: i64,
}

/// Device-side record: kernel, memcpy or memset
#[derive(Debug, Clone)]
pub struct RawGpuRecord {
    pub name: String,
    pub device: i64,
    pub context: u32,
    pub stream: i64,
    pub correlation: CorrelationId,
    pub begin_ns: Timestamp,
    pub end_ns: Timestamp,
}

/// Category of profiling overhead reported by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverheadKind {
    /// Extra collection buffer allocated by the backend
    Resource,
    BufferFlush,
    Instrumentation,
    Unknown,
}

impl OverheadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverheadKind::Resource => "resource",
            OverheadKind::BufferFlush => "buffer_flush",
            OverheadKind::Instrumentation => "instrumentation",
            OverheadKind::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RawOverheadRecord {
    pub kind: OverheadKind,
    pub begin_ns: Timestamp,
    pub end_ns: Timestamp,
}

/// Kind of a synchronization record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncKind {
    /// Host blocked on an event (cudaEventSynchronize-style)
    EventSynchronize,
    /// A stream was told to wait on an event recorded elsewhere
    StreamWaitEvent,
    /// Stream-wide barrier
    StreamSynchronize,
    /// Context-wide barrier
    ContextSynchronize,
}

impl SyncKind {
    /// Wait-event syncs are extremely frequent; their emission is deferred
    /// until the stream is known to have carried real GPU work.
    pub fn is_wait_event(&self) -> bool {
        matches!(self, SyncKind::StreamWaitEvent)
    }

    /// Whether the sync refers to a recorded event, so the source stream and
    /// correlation can be resolved through the event side table.
    pub fn uses_event(&self) -> bool {
        matches!(self, SyncKind::EventSynchronize | SyncKind::StreamWaitEvent)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncKind::EventSynchronize => "event sync",
            SyncKind::StreamWaitEvent => "stream wait event",
            SyncKind::StreamSynchronize => "stream sync",
            SyncKind::ContextSynchronize => "context sync",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RawSyncRecord {
    pub kind: SyncKind,
    pub correlation: CorrelationId,
    /// Stream the sync ran on; -1 for context-wide syncs
    pub stream: i64,
    pub event: u32,
    pub context: u32,
    pub begin_ns: Timestamp,
    pub end_ns: Timestamp,
}

/// Event-record marker: an event was recorded on a stream
#[derive(Debug, Clone)]
pub struct RawEventRecord {
    pub correlation: CorrelationId,
    pub event: u32,
    pub stream: i64,
    pub context: u32,
}

/// Raw activity record as delivered by the vendor backend.
///
/// The tag set is closed; unknown tags are carried through so the core can
/// count them rather than lose them.
#[derive(Debug, Clone)]
pub enum RawRecord {
    Runtime(RawApiRecord),
    Driver(RawApiRecord),
    Kernel(RawGpuRecord),
    Memcpy(RawGpuRecord),
    Memset(RawGpuRecord),
    Overhead(RawOverheadRecord),
    Synchronization(RawSyncRecord),
    Event(RawEventRecord),
    ExternalCorrelation {
        /// Raw channel tag: 0 = default, 1 = user, anything else is invalid
        channel_tag: u32,
        correlation: CorrelationId,
        external: CorrelationId,
    },
    Unknown {
        tag: u32,
    },
}

/// One drained buffer of raw records
#[derive(Debug, Clone, Default)]
pub struct RawRecordBuffer {
    pub records: Vec<RawRecord>,
}

impl RawRecordBuffer {
    pub fn new(records: Vec<RawRecord>) -> Self {
        Self { records }
    }
}

/// Runtime API calls that are very frequent and not very interesting.
/// Filtered out to reduce trace size; tallied but not treated as anomalies.
const BLOCKLISTED_RUNTIME_APIS: &[&str] = &[
    "cudaGetDevice",
    "cudaSetDevice",
    "cudaGetLastError",
    "cudaEventCreate",
    "cudaEventCreateWithFlags",
    "cudaEventDestroy",
];

pub fn is_blocklisted_runtime_api(name: &str) -> bool {
    BLOCKLISTED_RUNTIME_APIS.contains(&name)
}

/// Driver-level kernel launch entry points. Driver records are only kept for
/// these; other driver calls are dropped without counting.
const KERNEL_LAUNCH_APIS: &[&str] = &[
    "cuLaunchKernel",
    "cuLaunchKernelEx",
    "cuLaunchCooperativeKernel",
];

pub fn is_kernel_launch_api(name: &str) -> bool {
    KERNEL_LAUNCH_APIS.contains(&name)
}

/// Interface to the vendor tracing backend.
///
/// Calls that mutate device/driver state are never issued concurrently with
/// buffer draining for the same capture; the runloop driver guarantees this.
pub trait TraceBackend: Send {
    /// Cap the backend's collection buffer size for the next capture
    fn set_max_buffer_size(&mut self, bytes: usize);

    /// Begin collecting the given activity kinds
    fn enable_activities(&mut self, kinds: &HashSet<ActivityKind>, per_thread_buffers: bool);

    /// Stop collecting the given activity kinds
    fn disable_activities(&mut self, kinds: &HashSet<ActivityKind>);

    /// Discard all pending records
    fn clear_activities(&mut self);

    /// Flush pending records into drainable buffers
    fn flush_activities(&mut self);

    /// Block until all devices are idle. Issued before toggling collection.
    fn synchronize_devices(&mut self);

    /// Release per-capture backend state
    fn teardown(&mut self);

    /// Whether the backend stopped collection on its own (e.g. buffer limit)
    fn stopped_early(&self) -> bool;

    /// Drain all completed record buffers
    fn take_buffers(&mut self) -> Vec<RawRecordBuffer>;

    fn push_correlation_id(&mut self, id: CorrelationId, channel: CorrelationChannel);

    fn pop_correlation_id(&mut self, channel: CorrelationChannel);

    /// Backend/runtime/driver version strings, propagated into trace metadata
    fn version_metadata(&self) -> Vec<(String, String)> {
        Vec::new()
    }
}
