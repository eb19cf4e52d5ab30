//! Capture configuration snapshot and the derived capture window

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::error;

use gputrace_shared::types::activity::{ActivityKind, Timestamp};
use gputrace_shared::utils::time::{ms_to_ns, ns_to_ms};

use crate::errors::ProfilerError;

/// Read-only configuration snapshot for one capture.
///
/// The core clones the snapshot at `configure` time and never mutates it.
/// Parsing configuration files and registering options is out of scope here;
/// callers construct this directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceConfig {
    /// Activity kinds to collect and forward to the sink
    pub activity_kinds: HashSet<ActivityKind>,

    /// Requested capture start, nanoseconds since epoch (time-driven mode)
    pub request_timestamp: Timestamp,

    /// Collection duration in milliseconds (time-driven mode)
    pub duration_ms: i64,

    /// Warmup duration in milliseconds (time-driven mode)
    pub warmup_ms: i64,

    /// When set, progress is measured by the application's iteration counter
    /// instead of wall-clock time
    pub start_iteration: Option<i64>,

    /// Number of iterations to collect (iteration-driven mode)
    pub run_iterations: i64,

    /// Ask the backend for per-thread collection buffers
    pub per_thread_buffers: bool,

    /// Cap on the backend's collection buffer, in bytes
    pub max_gpu_buffer_bytes: usize,

    /// Collect wait-event synchronization records at all
    pub sync_wait_events: bool,

    /// Caller-supplied trace identifier, recorded into trace metadata
    pub trace_id: String,

    /// Free-form metadata; an allow-listed subset is propagated to the sink
    pub metadata: HashMap<String, String>,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            activity_kinds: [
                ActivityKind::CpuOp,
                ActivityKind::RuntimeApi,
                ActivityKind::Kernel,
                ActivityKind::Memcpy,
                ActivityKind::Memset,
                ActivityKind::Overhead,
                ActivityKind::Synchronization,
                ActivityKind::GpuUserAnnotation,
            ]
            .into_iter()
            .collect(),
            request_timestamp: 0,
            duration_ms: 500,
            warmup_ms: 5,
            start_iteration: None,
            run_iterations: 1,
            per_thread_buffers: false,
            max_gpu_buffer_bytes: 128 * 1024 * 1024,
            sync_wait_events: true,
            trace_id: String::new(),
            metadata: HashMap::new(),
        }
    }
}

impl TraceConfig {
    pub fn selected(&self, kind: ActivityKind) -> bool {
        self.activity_kinds.contains(&kind)
    }
}

/// Time/iteration window derived once from a configuration snapshot.
///
/// Immutable for the life of the capture. Progress is measured either by
/// wall-clock time or by an externally reported iteration counter, never
/// both: each predicate call is live in exactly one of the two modes,
/// depending on whether a valid (>= 0) iteration was supplied.
#[derive(Debug, Clone)]
pub struct CaptureWindow {
    activity_kinds: HashSet<ActivityKind>,
    start_time: Timestamp,
    duration_ns: i64,
    warmup_ns: i64,
    by_iteration: bool,
    start_iteration: i64,
    end_iteration: i64,
    end_time: Timestamp,
    per_thread_buffers: bool,
}

impl CaptureWindow {
    pub fn new(config: &TraceConfig) -> Self {
        let by_iteration = config.start_iteration.is_some();
        let start_iteration = config.start_iteration.unwrap_or(0);
        let (end_iteration, end_time) = if by_iteration {
            (start_iteration + config.run_iterations, 0)
        } else {
            (
                i64::MAX,
                config.request_timestamp + ms_to_ns(config.duration_ms),
            )
        };
        Self {
            activity_kinds: config.activity_kinds.clone(),
            start_time: config.request_timestamp,
            duration_ns: ms_to_ns(config.duration_ms),
            warmup_ns: ms_to_ns(config.warmup_ms),
            by_iteration,
            start_iteration,
            end_iteration,
            end_time,
            per_thread_buffers: config.per_thread_buffers,
        }
    }

    /// Whether a capture can still start at `now`. Iteration-driven profiles
    /// can always start; time-driven profiles need the start time to be in
    /// the future by at least the warmup duration.
    pub fn can_start(&self, now: Timestamp) -> Result<(), ProfilerError> {
        if self.by_iteration {
            return Ok(());
        }
        if self.start_time < now {
            let late_ms = ns_to_ms(now - self.start_time);
            error!(
                late_ms,
                "not starting tracing, start timestamp is in the past"
            );
            return Err(ProfilerError::StartInPast(late_ms));
        }
        if self.start_time - now < self.warmup_ns {
            let available_ms = ns_to_ms(self.start_time - now);
            let required_ms = ns_to_ms(self.warmup_ns);
            error!(
                available_ms,
                required_ms, "not starting tracing, insufficient time for warmup"
            );
            return Err(ProfilerError::InsufficientWarmup {
                available_ms,
                required_ms,
            });
        }
        Ok(())
    }

    /// Whether warmup has completed. Time-driven semantics apply only when no
    /// valid iteration is supplied; iteration semantics only when one is.
    /// Mixed signals are treated as "not done".
    pub fn is_warmup_done(&self, now: Timestamp, current_iteration: i64) -> bool {
        if !self.by_iteration && current_iteration < 0 {
            return now >= self.start_time;
        }
        if self.by_iteration && current_iteration >= 0 {
            return current_iteration >= self.start_iteration;
        }
        false
    }

    /// Whether collection has completed; symmetric to [`Self::is_warmup_done`]
    pub fn is_collection_done(&self, now: Timestamp, current_iteration: i64) -> bool {
        if !self.by_iteration && current_iteration < 0 {
            return now >= self.end_time;
        }
        if self.by_iteration && current_iteration >= 0 {
            return current_iteration >= self.end_iteration;
        }
        false
    }

    pub fn activity_kinds(&self) -> &HashSet<ActivityKind> {
        &self.activity_kinds
    }

    pub fn selected(&self, kind: ActivityKind) -> bool {
        self.activity_kinds.contains(&kind)
    }

    pub fn by_iteration(&self) -> bool {
        self.by_iteration
    }

    pub fn start_time(&self) -> Timestamp {
        self.start_time
    }

    pub fn end_time(&self) -> Timestamp {
        self.end_time
    }

    pub fn start_iteration(&self) -> i64 {
        self.start_iteration
    }

    pub fn end_iteration(&self) -> i64 {
        self.end_iteration
    }

    pub fn duration_ms(&self) -> i64 {
        ns_to_ms(self.duration_ns)
    }

    pub fn per_thread_buffers(&self) -> bool {
        self.per_thread_buffers
    }
}
