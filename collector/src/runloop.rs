//! Capture runloop state machine and trace assembly
//!
//! `ActivityProfiler` owns exactly one capture's worth of mutable state at a
//! time and sequences warmup, collection, backend and child-session start/
//! stop, off-thread trace finalization, and reset. A foreground polling actor
//! drives transitions through `perform_run_loop_step`; an application may
//! additionally drive a subset of transitions through the same entry point by
//! passing its iteration counter.
//!
//! Locking is two-layer: public entry points acquire the main lock and call
//! unlocked internals taking `&mut Inner`. A second lock guards only the
//! short-lived "collecting" flag, and a third guards the single-slot handle
//! of the background collect task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use gputrace_shared::types::activity::{
    ActivityKind, ActivityRecord, ActivityRef, CorrelationId, CpuTraceBuffer, DeviceId,
    ResourceId, Timestamp,
};
use gputrace_shared::types::metadata::{DeviceInfo, OverheadInfo, ResourceInfo};
use gputrace_shared::utils::time::{ms_to_ns, ns_to_ms};

use crate::backend::{
    is_blocklisted_runtime_api, is_kernel_launch_api, OverheadKind, RawApiRecord, RawGpuRecord,
    RawOverheadRecord, RawRecord, RawSyncRecord, TraceBackend,
};
use crate::buffers::TraceBufferStore;
use crate::config::{CaptureWindow, TraceConfig};
use crate::correlation::{CorrelationChannel, CorrelationIndex};
use crate::errors::{ErrorCounts, ProfilerError};
use crate::hook::InstrumentationHook;
use crate::session::{ChildProfiler, ChildSessionRegistry};
use crate::sink::TraceSink;
use crate::spans::SpanTracker;
use crate::sync::{DeferredLogEntry, DeferredSyncQueue};

/// Free-form config metadata keys propagated to the sink at trace start
const METADATA_ALLOW_LIST: &[&str] = &[
    "with_stack",
    "with_modules",
    "record_shapes",
    "profile_memory",
];

/// Highest GPU ordinal given a default device track
const MAX_GPU_ID: i64 = 15;

/// Sort offset placing GPU tracks below all process tracks
const GPU_SORT_OFFSET: i64 = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunloopState {
    WaitForRequest,
    Warmup,
    CollectTrace,
    ProcessTrace,
    CollectMemorySnapshot,
}

/// Single-slot handle for the background collect task
enum TaskSlot {
    Idle,
    Running(thread::JoinHandle<()>),
}

impl TaskSlot {
    fn is_running(&self) -> bool {
        matches!(self, TaskSlot::Running(_))
    }

    fn join(&mut self) {
        if let TaskSlot::Running(handle) = std::mem::replace(self, TaskSlot::Idle) {
            if handle.join().is_err() {
                error!("background collect task panicked");
            }
        }
    }
}

/// All state guarded by the main lock
struct Inner {
    state: RunloopState,
    backend: Box<dyn TraceBackend>,
    sink: Box<dyn TraceSink>,
    hook: Option<Box<dyn InstrumentationHook>>,
    profilers: Vec<Box<dyn ChildProfiler>>,

    // Per-capture state, cleared on reset
    config: Option<TraceConfig>,
    window: Option<CaptureWindow>,
    buffers: TraceBufferStore,
    correlation: CorrelationIndex,
    spans: SpanTracker,
    deferred: DeferredSyncQueue,
    sessions: ChildSessionRegistry,
    counters: ErrorCounts,
    completed_counts: ErrorCounts,
    capture_start: Timestamp,
    capture_end: Timestamp,
    iteration_counts: HashMap<String, i64>,
    resource_info: HashMap<(DeviceId, ResourceId), ResourceInfo>,
    trace_metadata: HashMap<String, String>,
    version_metadata: Vec<(String, String)>,
    resource_overhead_count: u64,
    cpu_activity_present: bool,
    gpu_activity_present: bool,
}

impl Inner {
    fn window_selected(&self, kind: ActivityKind) -> bool {
        self.window.as_ref().map_or(false, |w| w.selected(kind))
    }

    fn sync_wait_events_enabled(&self) -> bool {
        self.config.as_ref().map_or(true, |c| c.sync_wait_events)
    }

    fn record_stream(&mut self, device: DeviceId, stream: ResourceId, postfix: &str) {
        let name = if postfix.is_empty() {
            format!("stream {stream}")
        } else {
            format!("stream {stream} {postfix}")
        };
        self.resource_info
            .entry((device, stream))
            .or_insert_with(|| ResourceInfo::new(device, stream, name));
    }

    fn record_thread_info(&mut self, tid: ResourceId, device: DeviceId) {
        self.resource_info
            .entry((device, tid))
            .or_insert_with(|| ResourceInfo::new(device, tid, format!("thread {tid}")));
    }
}

/// State shared with the background collect task
struct Shared {
    inner: Mutex<Inner>,
    /// Guards only the observability flag, so readers do not contend with
    /// the main lock during a long finalization
    collecting: Mutex<bool>,
    /// Idempotence flag for dynamic collection toggling
    toggle_enabled: AtomicBool,
}

impl Shared {
    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stop collection and move to ProcessTrace. Runs on the background task
    /// for step-driven completions, or on the polling actor otherwise.
    fn collect_trace(&self, now: Timestamp) {
        let mut inner = self.lock_inner();
        if let Some(hook) = inner.hook.as_mut() {
            hook.stop();
        }
        if inner.backend.stopped_early() {
            inner.counters.backend_stopped_early = true;
            error!("collection stopped early by backend");
        }
        self.toggle_enabled.store(false, Ordering::SeqCst);
        stop_trace(&mut inner, now);
    }
}

pub struct ActivityProfiler {
    shared: Arc<Shared>,
    collect_task: Mutex<TaskSlot>,
}

impl ActivityProfiler {
    pub fn new(backend: Box<dyn TraceBackend>, sink: Box<dyn TraceSink>) -> Self {
        let version_metadata = backend.version_metadata();
        for (key, value) in &version_metadata {
            info!(key = %key, value = %value, "backend version");
        }
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: RunloopState::WaitForRequest,
                    backend,
                    sink,
                    hook: None,
                    profilers: Vec::new(),
                    config: None,
                    window: None,
                    buffers: TraceBufferStore::default(),
                    correlation: CorrelationIndex::default(),
                    spans: SpanTracker::default(),
                    deferred: DeferredSyncQueue::default(),
                    sessions: ChildSessionRegistry::default(),
                    counters: ErrorCounts::default(),
                    completed_counts: ErrorCounts::default(),
                    capture_start: 0,
                    capture_end: 0,
                    iteration_counts: HashMap::new(),
                    resource_info: HashMap::new(),
                    trace_metadata: HashMap::new(),
                    version_metadata,
                    resource_overhead_count: 0,
                    cpu_activity_present: false,
                    gpu_activity_present: false,
                }),
                collecting: Mutex::new(false),
                toggle_enabled: AtomicBool::new(false),
            }),
            collect_task: Mutex::new(TaskSlot::Idle),
        }
    }

    /// Install the single optional instrumentation endpoint
    pub fn set_instrumentation_hook(&self, hook: Box<dyn InstrumentationHook>) {
        self.shared.lock_inner().hook = Some(hook);
    }

    pub fn register_child_profiler(&self, profiler: Box<dyn ChildProfiler>) {
        self.shared.lock_inner().profilers.push(profiler);
    }

    pub fn is_active(&self) -> bool {
        self.shared.lock_inner().state != RunloopState::WaitForRequest
    }

    pub fn current_state(&self) -> RunloopState {
        self.shared.lock_inner().state
    }

    /// Anomaly counts of the capture currently being processed
    pub fn error_counts(&self) -> ErrorCounts {
        self.shared.lock_inner().counters
    }

    /// Final anomaly tally of the most recently completed capture
    pub fn last_capture_error_counts(&self) -> ErrorCounts {
        self.shared.lock_inner().completed_counts
    }

    /// Whether the polling actor is inside synchronous trace collection
    pub fn is_collecting(&self) -> bool {
        *self
            .shared
            .collecting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_collecting(&self, value: bool) {
        *self
            .shared
            .collecting
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = value;
    }

    fn lock_task(&self) -> MutexGuard<'_, TaskSlot> {
        self.collect_task.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Join the background collect task if one is outstanding
    pub fn ensure_collect_trace_done(&self) {
        self.lock_task().join();
    }

    /// Arm a new capture. Rejected while a capture is active or when the
    /// derived window can no longer start; neither changes any state.
    pub fn configure(&self, config: TraceConfig, now: Timestamp) -> Result<(), ProfilerError> {
        let mut inner = self.shared.lock_inner();
        if inner.state != RunloopState::WaitForRequest {
            warn!("profiler already busy, rejecting configure request");
            return Err(ProfilerError::AlreadyActive);
        }
        let window = CaptureWindow::new(&config);
        window.can_start(now)?;

        // Start from a clean slate
        reset(&mut inner);

        if inner.hook.is_none() {
            if window.by_iteration() {
                info!(iterations = config.run_iterations, "gpu-only tracing");
            } else {
                info!(duration_ms = config.duration_ms, "gpu-only tracing");
            }
        }

        info!(
            max_buffer_mb = config.max_gpu_buffer_bytes / 1024 / 1024,
            "enabling gpu tracing"
        );
        inner.backend.set_max_buffer_size(config.max_gpu_buffer_bytes);
        self.shared.toggle_enabled.store(true, Ordering::SeqCst);
        inner
            .backend
            .enable_activities(&config.activity_kinds, config.per_thread_buffers);

        configure_child_sessions(&mut inner, &config, &window);

        inner
            .correlation
            .set_range_profiling(config.selected(ActivityKind::ProfilerRange));
        if !config.trace_id.is_empty() {
            inner
                .trace_metadata
                .insert("trace_id".to_string(), config.trace_id.clone());
        }
        if let Some(hook) = inner.hook.as_mut() {
            hook.prepare(&config);
        }

        if window.by_iteration() {
            info!(
                start = window.start_iteration(),
                end = window.end_iteration(),
                "tracing bounded by iteration"
            );
        } else {
            info!(
                starts_in_ms = ns_to_ms(window.start_time() - now),
                ends_in_ms = ns_to_ms(window.end_time() - now),
                "tracing bounded by time"
            );
        }

        inner.capture_start = 0;
        inner.capture_end = 0;
        inner.config = Some(config);
        inner.window = Some(window);
        inner.state = RunloopState::Warmup;
        Ok(())
    }

    /// Advance the state machine. Returns the next wakeup time, clamped to
    /// the window's start or end boundary so polling never overshoots a
    /// boundary by more than one tick. A non-negative `current_iteration`
    /// marks the call as coming from the application's step API.
    pub fn perform_run_loop_step(
        &self,
        now: Timestamp,
        next_wakeup: Timestamp,
        current_iteration: i64,
    ) -> Timestamp {
        let state = self.shared.lock_inner().state;
        match state {
            RunloopState::WaitForRequest => next_wakeup,
            RunloopState::CollectMemorySnapshot => {
                warn!("run loop step during memory snapshot, skipping");
                next_wakeup
            }
            RunloopState::Warmup => self.step_warmup(now, next_wakeup, current_iteration),
            RunloopState::CollectTrace => self.step_collect(now, next_wakeup, current_iteration),
            RunloopState::ProcessTrace => self.step_process(next_wakeup, current_iteration),
        }
    }

    fn step_warmup(&self, now: Timestamp, next_wakeup: Timestamp, current_iteration: i64) -> Timestamp {
        let mut inner = self.shared.lock_inner();
        if inner.state != RunloopState::Warmup {
            return next_wakeup;
        }
        let Some(window) = inner.window.clone() else {
            return next_wakeup;
        };

        // Flushing can take a while, so avoid doing it close to the start
        if current_iteration < 0 && (window.by_iteration() || next_wakeup < window.start_time()) {
            inner.backend.clear_activities();
        }

        if inner.backend.stopped_early() {
            inner.counters.backend_stopped_early = true;
            error!("warmup stopped by backend");
            stop_trace(&mut inner, now);
            reset(&mut inner);
            debug!("Warmup -> WaitForRequest");
            return next_wakeup;
        }

        if window.is_warmup_done(now, current_iteration) {
            if !window.by_iteration() && now > window.start_time() + ms_to_ns(10) {
                info!(
                    late_ms = ns_to_ms(now - window.start_time()),
                    "tracing started late"
                );
            } else {
                info!("tracing started");
            }
            start_trace(&mut inner, now);
            if !window.by_iteration() && next_wakeup > window.end_time() {
                return window.end_time();
            }
        } else if !window.by_iteration() && next_wakeup > window.start_time() {
            return window.start_time();
        }
        next_wakeup
    }

    fn step_collect(&self, now: Timestamp, next_wakeup: Timestamp, current_iteration: i64) -> Timestamp {
        let (collection_done, stopped_early, window) = {
            let inner = self.shared.lock_inner();
            if inner.state != RunloopState::CollectTrace {
                return next_wakeup;
            }
            let Some(window) = inner.window.clone() else {
                return next_wakeup;
            };
            (
                window.is_collection_done(now, current_iteration),
                inner.backend.stopped_early(),
                window,
            )
        };

        if collection_done || stopped_early {
            info!("tracing complete");
            if current_iteration >= 0 {
                // Called from the application's step API; finalization must
                // not block that caller. At most one background task may be
                // in flight, and it must not overlap a synchronous
                // collection already running on the polling actor.
                let mut slot = self.lock_task();
                if !slot.is_running() && !self.is_collecting() {
                    let shared = Arc::clone(&self.shared);
                    match thread::Builder::new()
                        .name("gputrace-collect".to_string())
                        .spawn(move || shared.collect_trace(now))
                    {
                        Ok(handle) => *slot = TaskSlot::Running(handle),
                        Err(e) => error!(error = %e, "failed to spawn collect task"),
                    }
                }
                return next_wakeup;
            }
            self.set_collecting(true);
            self.shared.collect_trace(now);
            self.set_collecting(false);
        } else if !window.by_iteration()
            && now < window.end_time()
            && window.end_time() < next_wakeup
        {
            return window.end_time();
        }
        next_wakeup
    }

    fn step_process(&self, next_wakeup: Timestamp, current_iteration: i64) -> Timestamp {
        // Never advance from the application's step API; finalization must
        // not race that caller.
        if current_iteration >= 0 {
            return next_wakeup;
        }
        self.ensure_collect_trace_done();
        let mut inner = self.shared.lock_inner();
        if inner.state != RunloopState::ProcessTrace {
            return next_wakeup;
        }
        process_trace(&mut inner);
        reset(&mut inner);
        debug!("ProcessTrace -> WaitForRequest");
        next_wakeup
    }

    /// Receive a CPU trace buffer from the instrumented application.
    /// Discarded unless a capture is collecting or processing.
    pub fn transfer_cpu_trace(&self, mut buffer: CpuTraceBuffer) {
        let mut inner = self.shared.lock_inner();
        if inner.state != RunloopState::CollectTrace && inner.state != RunloopState::ProcessTrace {
            debug!(
                span = %buffer.span.name,
                "trace collection not in progress, discarding span"
            );
            return;
        }
        let count = inner
            .iteration_counts
            .entry(buffer.span.name.clone())
            .or_insert(0);
        buffer.span.iteration = *count;
        *count += 1;
        debug!(
            span = %buffer.span.name,
            iteration = buffer.span.iteration,
            activities = buffer.activities.len(),
            gpu_ops = buffer.gpu_op_count,
            "received cpu trace"
        );
        inner.buffers.add_cpu_buffer(buffer);
    }

    pub fn push_correlation_id(&self, id: CorrelationId) {
        let mut inner = self.shared.lock_inner();
        let Inner { backend, sessions, .. } = &mut *inner;
        backend.push_correlation_id(id, CorrelationChannel::Default);
        sessions.push_correlation_id(id);
    }

    pub fn pop_correlation_id(&self) {
        let mut inner = self.shared.lock_inner();
        let Inner { backend, sessions, .. } = &mut *inner;
        backend.pop_correlation_id(CorrelationChannel::Default);
        sessions.pop_correlation_id();
    }

    pub fn push_user_correlation_id(&self, id: CorrelationId) {
        let mut inner = self.shared.lock_inner();
        let Inner { backend, sessions, .. } = &mut *inner;
        backend.push_correlation_id(id, CorrelationChannel::User);
        sessions.push_user_correlation_id(id);
    }

    pub fn pop_user_correlation_id(&self) {
        let mut inner = self.shared.lock_inner();
        let Inner { backend, sessions, .. } = &mut *inner;
        backend.pop_correlation_id(CorrelationChannel::User);
        sessions.pop_user_correlation_id();
    }

    /// Dynamically enable or disable live collection, independent of the
    /// state machine. Idempotent; toggling flushes pending buffers first.
    pub fn toggle_collection_dynamic(&self, enable: bool) {
        if self.shared.toggle_enabled.swap(enable, Ordering::SeqCst) == enable {
            return;
        }
        let mut inner = self.shared.lock_inner();
        let Some(window) = inner.window.clone() else {
            warn!("collection toggle requested with no active capture");
            return;
        };
        inner.backend.synchronize_devices();
        inner.backend.flush_activities();
        if enable {
            inner
                .backend
                .enable_activities(window.activity_kinds(), window.per_thread_buffers());
        } else {
            inner.backend.disable_activities(window.activity_kinds());
        }
        inner.sessions.toggle_all(enable);
    }

    /// Run a fixed-duration synchronous memory-snapshot capture through the
    /// instrumentation hook. Orthogonal to the activity-trace states.
    pub fn perform_memory_loop(&self, path: &str, duration_ms: u64) {
        let has_hook = {
            let mut inner = self.shared.lock_inner();
            inner.state = RunloopState::CollectMemorySnapshot;
            match inner.hook.as_mut() {
                Some(hook) => {
                    hook.start_memory_profile();
                    true
                }
                None => false,
            }
        };
        if !has_hook {
            self.shared.lock_inner().state = RunloopState::WaitForRequest;
            return;
        }
        info!(duration_ms, "running memory profiling");
        thread::sleep(Duration::from_millis(duration_ms));

        let mut inner = self.shared.lock_inner();
        if let Some(hook) = inner.hook.as_mut() {
            info!(path, "exporting memory profiling results");
            hook.export_memory_profile(path);
            hook.stop_memory_profile();
        }
        info!("finalizing memory trace");
        inner.sink.finalize_memory_trace(path);
        inner.state = RunloopState::WaitForRequest;
    }
}

impl Drop for ActivityProfiler {
    fn drop(&mut self) {
        // The task borrows shared capture state; join before teardown
        self.lock_task().join();
    }
}

fn process_id() -> i64 {
    std::process::id() as i64
}

fn process_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "unknown".to_string())
}

fn configure_child_sessions(inner: &mut Inner, config: &TraceConfig, window: &CaptureWindow) {
    let start_time_ms = ns_to_ms(window.start_time());
    let Inner { profilers, sessions, .. } = inner;
    for profiler in profilers.iter_mut() {
        debug!(profiler = profiler.name(), "evaluating child profiler");
        match profiler.configure(start_time_ms, window.duration_ms(), window.activity_kinds(), config)
        {
            Ok(Some(session)) => {
                info!(
                    profiler = profiler.name(),
                    duration_ms = window.duration_ms(),
                    "running child profiler"
                );
                sessions.add(session);
            }
            Ok(None) => info!(profiler = profiler.name(), "not running child profiler"),
            Err(e) => warn!(
                profiler = profiler.name(),
                error = %e,
                "child profiler configure failed"
            ),
        }
    }
}

fn start_trace(inner: &mut Inner, now: Timestamp) {
    inner.capture_start = now;
    debug!("Warmup -> CollectTrace");
    inner.sessions.start_all();
    if let Some(hook) = inner.hook.as_mut() {
        hook.start();
    }
    inner.state = RunloopState::CollectTrace;
}

fn stop_trace(inner: &mut Inner, now: Timestamp) {
    inner.capture_end = now;
    if let Some(window) = &inner.window {
        inner.backend.disable_activities(window.activity_kinds());
    }
    match inner.state {
        RunloopState::CollectTrace => debug!("CollectTrace -> ProcessTrace"),
        state => warn!(?state, "stop trace called in unexpected state"),
    }
    inner.sessions.stop_all();
    inner.state = RunloopState::ProcessTrace;
}

fn reset(inner: &mut Inner) {
    inner.backend.clear_activities();
    inner.backend.teardown();
    inner.correlation = CorrelationIndex::default();
    inner.spans = SpanTracker::default();
    inner.deferred = DeferredSyncQueue::default();
    inner.buffers = TraceBufferStore::default();
    inner.trace_metadata.clear();
    inner.iteration_counts.clear();
    inner.resource_info.clear();
    inner.sessions.clear();
    inner.resource_overhead_count = 0;
    inner.cpu_activity_present = false;
    inner.gpu_activity_present = false;
    inner.counters = ErrorCounts::default();
    inner.config = None;
    inner.window = None;
    inner.state = RunloopState::WaitForRequest;
}

/// Trace assembly: the ProcessTrace body
fn process_trace(inner: &mut Inner) {
    info!(cpu_buffers = inner.buffers.cpu.len(), "processing trace");
    debug!(
        start = inner.capture_start,
        end = inner.capture_end,
        "capture window"
    );
    inner.cpu_activity_present = false;
    inner.gpu_activity_present = false;

    emit_trace_start(inner);
    process_cpu_buffers(inner);
    process_gpu_buffers(inner);
    if !inner.gpu_activity_present {
        warn!("gpu trace is empty");
    }
    flush_deferred(inner);
    process_child_sessions(inner);
    if !inner.cpu_activity_present && !inner.gpu_activity_present {
        warn!("trace is empty, nothing to output");
    }

    info!(counts = %inner.counters, "record counts");
    inner.completed_counts = inner.counters;
    finalize_trace(inner);
}

fn emit_trace_start(inner: &mut Inner) {
    let mut metadata = inner.trace_metadata.clone();
    if let Some(config) = &inner.config {
        for (key, value) in &config.metadata {
            if METADATA_ALLOW_LIST.contains(&key.as_str()) {
                metadata.insert(key.clone(), value.clone());
            }
        }
    }
    for (key, value) in &inner.version_metadata {
        metadata.insert(key.clone(), value.clone());
    }
    let mut device_properties: Vec<String> = Vec::new();
    for session in inner.sessions.iter() {
        let props = session.device_properties();
        if !props.is_empty() && !device_properties.contains(&props) {
            device_properties.push(props);
        }
        for (key, value) in session.metadata() {
            metadata.insert(key, value);
        }
    }
    inner.trace_metadata = metadata.clone();
    inner
        .sink
        .handle_trace_start(&metadata, &device_properties.join(","));
}

fn process_cpu_buffers(inner: &mut Inner) {
    let pid = process_id();
    for b in 0..inner.buffers.cpu.len() {
        let (span, gpu_op_count, count) = {
            let buf = &inner.buffers.cpu[b];
            (buf.span.clone(), buf.gpu_op_count, buf.activities.len())
        };
        debug!(
            span = %span.name,
            iteration = span.iteration,
            records = count,
            "processing cpu buffer"
        );
        if count == 0 {
            warn!(span = %span.name, "cpu trace is empty");
            continue;
        }
        inner.cpu_activity_present = true;
        let key = inner.spans.record_trace_span(span, gpu_op_count);
        let mut warned_pid = false;
        for i in 0..count {
            let capture_end = inner.capture_end;
            {
                let act = &mut inner.buffers.cpu[b].activities[i];
                // Activities the application never closed are clamped to the
                // window end and tagged
                if act.duration < 0 {
                    act.duration = capture_end - act.timestamp;
                    act.add_metadata("finished", "false");
                }
            }
            let (selected, correlation, device) = {
                let act = &inner.buffers.cpu[b].activities[i];
                (inner.window_selected(act.kind), act.correlation, act.device)
            };
            if selected {
                let act = &inner.buffers.cpu[b].activities[i];
                inner.sink.handle_activity(act);
            }
            inner.spans.link_cpu_op(correlation, &key);
            inner
                .correlation
                .register_activity(correlation, ActivityRef::Cpu { buffer: b, index: i });
            if device == 0 {
                if !warned_pid {
                    warn!("cpu activity with pid 0, overriding with process pid");
                    warned_pid = true;
                }
                inner.buffers.cpu[b].activities[i].device = pid;
            }
            let (tid, device) = {
                let act = &inner.buffers.cpu[b].activities[i];
                (act.resource, act.device)
            };
            inner.record_thread_info(tid, device);
        }
        if let Some(cpu_span) = inner.spans.cpu_span(&key) {
            inner.sink.handle_trace_span(cpu_span);
        }
    }
}

fn process_gpu_buffers(inner: &mut Inner) {
    debug!("retrieving gpu activity buffers");
    let drained = inner.backend.take_buffers();
    let start = inner.buffers.gpu.len();
    inner.buffers.gpu.extend(drained);

    let mut record_count = 0usize;
    for bi in start..inner.buffers.gpu.len() {
        for ri in 0..inner.buffers.gpu[bi].records.len() {
            let record = inner.buffers.gpu[bi].records[ri].clone();
            handle_raw_record(inner, record);
            record_count += 1;
        }
    }
    info!(records = record_count, "processed gpu records");
    if inner.resource_overhead_count > 0 {
        info!(
            buffers = inner.resource_overhead_count,
            "backend allocated extra collection buffers"
        );
    }
}

fn handle_raw_record(inner: &mut Inner, record: RawRecord) {
    match record {
        RawRecord::ExternalCorrelation {
            channel_tag,
            correlation,
            external,
        } => {
            inner.correlation.record_external_correlation(
                channel_tag,
                correlation,
                external,
                &mut inner.counters,
            );
        }
        RawRecord::Runtime(api) => handle_api_record(inner, api, false),
        RawRecord::Driver(api) => {
            // Only kernel launches are interesting at the driver level
            if is_kernel_launch_api(&api.name) {
                handle_api_record(inner, api, true);
            }
        }
        RawRecord::Kernel(gpu) => {
            inner.deferred.record_context_device(gpu.context, gpu.device);
            handle_gpu_record(inner, gpu, ActivityKind::Kernel);
        }
        RawRecord::Memcpy(gpu) => handle_gpu_record(inner, gpu, ActivityKind::Memcpy),
        RawRecord::Memset(gpu) => handle_gpu_record(inner, gpu, ActivityKind::Memset),
        RawRecord::Overhead(overhead) => handle_overhead_record(inner, overhead),
        RawRecord::Synchronization(sync) => handle_sync_record(inner, sync),
        RawRecord::Event(event) => {
            debug!(
                correlation = event.correlation,
                event = event.event,
                stream = event.stream,
                context = event.context,
                "event record"
            );
            inner
                .deferred
                .record_event(event.context, event.event, event.stream, event.correlation);
        }
        RawRecord::Unknown { tag } => {
            warn!(tag, "unexpected activity record kind");
            inner.counters.unexpected_records += 1;
        }
    }
}

fn handle_api_record(inner: &mut Inner, api: RawApiRecord, driver: bool) {
    if !driver && is_blocklisted_runtime_api(&api.name) {
        inner.counters.blocklisted_runtime += 1;
        return;
    }
    debug!(
        correlation = api.correlation,
        name = %api.name,
        tid = api.thread_id,
        "api record"
    );
    let pid = process_id();
    let thread = match inner.resource_info.get(&(pid, api.thread_id)) {
        Some(info) => info.sort_index,
        None => api.thread_id,
    };
    let linked = inner
        .correlation
        .linked_activity(api.correlation, CorrelationChannel::Default);
    let kind = if driver {
        ActivityKind::DriverApi
    } else {
        ActivityKind::RuntimeApi
    };
    let mut act = ActivityRecord::new(kind, api.name);
    act.timestamp = api.begin_ns;
    act.duration = api.end_ns - api.begin_ns;
    act.device = pid;
    act.resource = thread;
    act.correlation = api.correlation;
    act.linked = linked;
    let r = inner.buffers.add_converted(act);

    inner
        .correlation
        .check_timestamp_order(r, &inner.buffers, &mut inner.counters);
    let Some(act) = inner.buffers.get(r) else {
        return;
    };
    if inner.correlation.out_of_range(
        act,
        inner.capture_start,
        inner.capture_end,
        &mut inner.counters,
    ) {
        return;
    }
    inner.sink.handle_activity(act);
    inner.gpu_activity_present = true;
}

fn handle_gpu_record(inner: &mut Inner, gpu: RawGpuRecord, kind: ActivityKind) {
    let linked = inner
        .correlation
        .linked_activity(gpu.correlation, CorrelationChannel::Default);
    let mut act = ActivityRecord::new(kind, gpu.name.clone());
    act.timestamp = gpu.begin_ns;
    act.duration = gpu.end_ns - gpu.begin_ns;
    act.device = gpu.device;
    act.resource = gpu.stream;
    act.correlation = gpu.correlation;
    act.linked = linked;
    let r = inner.buffers.add_converted(act);

    {
        let Some(act) = inner.buffers.get(r) else {
            return;
        };
        if inner.correlation.out_of_range(
            act,
            inner.capture_start,
            inner.capture_end,
            &mut inner.counters,
        ) {
            return;
        }
    }
    inner
        .correlation
        .check_timestamp_order(r, &inner.buffers, &mut inner.counters);
    debug!(correlation = gpu.correlation, name = %gpu.name, "gpu record");
    inner.record_stream(gpu.device, gpu.stream, "");
    inner.deferred.mark_stream_active(gpu.device, gpu.stream);
    if let Some(act) = inner.buffers.get(r) {
        inner.sink.handle_activity(act);
    }
    inner.gpu_activity_present = true;

    // Widen the span pair owning the linked CPU op
    match linked.and_then(|l| inner.buffers.get(l)).map(|c| c.correlation) {
        Some(cpu_correlation) => {
            inner
                .spans
                .update_gpu_span(cpu_correlation, gpu.begin_ns, gpu.end_ns)
        }
        None => debug!(correlation = gpu.correlation, "missing linked activity"),
    }

    // Aggregate under the user annotation, when one is correlated
    if inner.window_selected(ActivityKind::GpuUserAnnotation) {
        if let Some(cpu_ref) = inner
            .correlation
            .linked_activity(gpu.correlation, CorrelationChannel::User)
        {
            let cpu_op = inner.buffers.get(cpu_ref).cloned();
            let gpu_act = inner.buffers.get(r).cloned();
            if let (Some(cpu_op), Some(gpu_act)) = (cpu_op, gpu_act) {
                inner.record_stream(gpu.device, gpu.stream, "context");
                inner.spans.insert_or_extend_user_event(&cpu_op, &gpu_act);
            }
        }
    }
}

fn handle_overhead_record(inner: &mut Inner, overhead: RawOverheadRecord) {
    debug!(kind = overhead.kind.as_str(), "overhead record");
    if overhead.kind == OverheadKind::Resource {
        inner.resource_overhead_count += 1;
    }
    let mut act = ActivityRecord::new(
        ActivityKind::Overhead,
        format!("overhead ({})", overhead.kind.as_str()),
    );
    act.timestamp = overhead.begin_ns;
    act.duration = overhead.end_ns - overhead.begin_ns;
    act.device = -1;
    act.resource = -1;
    let r = inner.buffers.add_converted(act);
    let Some(act) = inner.buffers.get(r) else {
        return;
    };
    if inner.correlation.out_of_range(
        act,
        inner.capture_start,
        inner.capture_end,
        &mut inner.counters,
    ) {
        return;
    }
    inner.sink.handle_activity(act);
    inner.gpu_activity_present = true;
}

fn handle_sync_record(inner: &mut Inner, sync: RawSyncRecord) {
    debug!(
        kind = sync.kind.as_str(),
        correlation = sync.correlation,
        stream = sync.stream,
        event = sync.event,
        context = sync.context,
        "sync record"
    );
    let wait_event = sync.kind.is_wait_event();
    if wait_event && !inner.sync_wait_events_enabled() {
        return;
    }
    let device = inner.deferred.device_for_context(sync.context);
    let source = if sync.kind.uses_event() {
        inner.deferred.wait_event_info(sync.context, sync.event)
    } else {
        None
    };
    let linked = inner
        .correlation
        .linked_activity(sync.correlation, CorrelationChannel::Default);
    let mut act = ActivityRecord::new(ActivityKind::Synchronization, sync.kind.as_str());
    act.timestamp = sync.begin_ns;
    act.duration = sync.end_ns - sync.begin_ns;
    act.device = device;
    act.resource = sync.stream;
    act.correlation = sync.correlation;
    act.linked = linked;
    if let Some(info) = source {
        act.add_metadata("wait_on_stream", info.stream.to_string());
        act.add_metadata("wait_on_correlation", info.correlation.to_string());
    }
    let r = inner.buffers.add_converted(act);
    let entry = DeferredLogEntry {
        device,
        stream: sync.stream,
        activity: r,
    };
    if wait_event {
        // Only emitted later if the stream turns out to carry real GPU work
        inner.deferred.defer(entry);
    } else {
        emit_sync_entry(inner, entry);
    }
}

fn emit_sync_entry(inner: &mut Inner, entry: DeferredLogEntry) {
    {
        let Some(act) = inner.buffers.get(entry.activity) else {
            return;
        };
        if inner.correlation.out_of_range(
            act,
            inner.capture_start,
            inner.capture_end,
            &mut inner.counters,
        ) {
            return;
        }
    }
    if entry.stream != -1 {
        inner.record_stream(entry.device, entry.stream, "");
    } else {
        debug!(device = entry.device, "context-wide sync");
    }
    debug!(
        device = entry.device,
        stream = entry.stream,
        "logging sync event"
    );
    if let Some(act) = inner.buffers.get(entry.activity) {
        inner.sink.handle_activity(act);
    }
    inner.gpu_activity_present = true;
}

fn flush_deferred(inner: &mut Inner) {
    let eligible = inner.deferred.drain_eligible();
    for entry in eligible {
        emit_sync_entry(inner, entry);
    }
}

fn process_child_sessions(inner: &mut Inner) {
    let Inner {
        sessions,
        sink,
        correlation,
        buffers,
        capture_start,
        capture_end,
        ..
    } = inner;
    let resolve = |correlation_id: CorrelationId| -> Option<ActivityRecord> {
        correlation
            .activity(correlation_id)
            .and_then(|r| buffers.get(r))
            .cloned()
    };
    for session in sessions.iter_mut() {
        info!("processing child profiler trace");
        session.process_trace(sink.as_mut(), &resolve, *capture_start, *capture_end);
    }
}

fn finalize_trace(inner: &mut Inner) {
    for (name, count) in &inner.iteration_counts {
        info!(span = %name, spans = *count, "cpu trace recorded");
    }
    inner.iteration_counts.clear();

    let start = inner.capture_start;

    {
        let Inner { sink, resource_info, .. } = inner;
        for info in resource_info.values() {
            sink.handle_resource_info(info, start);
        }
    }

    let mut use_default_device_info = true;
    {
        let Inner { sink, sessions, .. } = inner;
        for session in sessions.iter() {
            if let Some(device_info) = session.device_info() {
                use_default_device_info = false;
                sink.handle_device_info(&device_info, start);
            }
            for info in session.resource_infos() {
                sink.handle_resource_info(&info, start);
            }
        }
    }

    let pid = process_id();
    let name = process_name();
    if !name.is_empty() {
        inner
            .sink
            .handle_device_info(&DeviceInfo::new(pid, pid, name.clone(), "CPU"), start);
        if inner.gpu_activity_present && use_default_device_info {
            // GPU tracks sort below every process track
            for gpu in 0..=MAX_GPU_ID {
                inner.sink.handle_device_info(
                    &DeviceInfo::new(gpu, gpu + GPU_SORT_OFFSET, name.clone(), format!("GPU {gpu}")),
                    start,
                );
            }
        }
    }

    {
        let Inner { sink, spans, .. } = inner;
        for span in spans.gpu_spans() {
            if span.op_count > 0 {
                sink.handle_trace_span(span);
            }
        }
        sink.handle_overhead_info(&OverheadInfo::new("backend overhead"), start);
        for act in spans.user_annotation_spans() {
            sink.handle_activity(act);
        }
    }

    {
        let Inner { sessions, buffers, .. } = inner;
        for session in sessions.iter_mut() {
            if let Some(mut buffer) = session.take_trace_buffer() {
                if buffer.span.start_time == 0 {
                    buffer.span.start_time = start;
                }
                buffers.add_cpu_buffer(buffer);
            }
        }
    }

    let store = std::mem::take(&mut inner.buffers);
    let end = inner.capture_end;
    inner.sink.finalize_trace(store, end);
}
