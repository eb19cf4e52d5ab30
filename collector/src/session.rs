//! Child profiler plugins
//!
//! Zero or more child profilers may be registered with the driver. At
//! configure time each is offered the capture parameters and may return a
//! session; the driver then treats all sessions uniformly for lifecycle,
//! correlation-id push/pop, dynamic toggling and trace merging.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use tracing::info;

use gputrace_shared::types::activity::{
    ActivityKind, ActivityRecord, CorrelationId, CpuTraceBuffer, Timestamp,
};
use gputrace_shared::types::metadata::{DeviceInfo, ResourceInfo};

use crate::config::TraceConfig;
use crate::sink::TraceSink;

/// Resolves a correlation id to the registered CPU activity, used by child
/// sessions to link their records into the main trace
pub type ActivityResolver<'a> = &'a dyn Fn(CorrelationId) -> Option<ActivityRecord>;

/// One active capture's worth of a child profiler
pub trait ChildSession: Send {
    fn start(&mut self);

    fn stop(&mut self);

    fn push_correlation_id(&mut self, _id: CorrelationId) {}

    fn pop_correlation_id(&mut self) {}

    fn push_user_correlation_id(&mut self, _id: CorrelationId) {}

    fn pop_user_correlation_id(&mut self) {}

    /// Dynamic enable/disable of live collection. Sessions without the
    /// capability ignore this.
    fn toggle_collection(&mut self, _enable: bool) {}

    fn device_info(&self) -> Option<DeviceInfo> {
        None
    }

    fn resource_infos(&self) -> Vec<ResourceInfo> {
        Vec::new()
    }

    fn metadata(&self) -> HashMap<String, String> {
        HashMap::new()
    }

    /// Device-properties JSON; merged (deduplicated) into the trace header
    fn device_properties(&self) -> String {
        String::new()
    }

    /// Hand over the session's own CPU-side trace buffer, if it kept one
    fn take_trace_buffer(&mut self) -> Option<CpuTraceBuffer> {
        None
    }

    /// Emit the session's activities inside the capture window
    fn process_trace(
        &mut self,
        sink: &mut dyn TraceSink,
        resolve: ActivityResolver<'_>,
        window_start: Timestamp,
        window_end: Timestamp,
    );
}

/// A registered child profiler; produces at most one session per capture
pub trait ChildProfiler: Send {
    fn name(&self) -> &str;

    fn configure(
        &mut self,
        start_time_ms: i64,
        duration_ms: i64,
        activity_kinds: &HashSet<ActivityKind>,
        config: &TraceConfig,
    ) -> Result<Option<Box<dyn ChildSession>>>;
}

/// The sessions active for the current capture
#[derive(Default)]
pub struct ChildSessionRegistry {
    sessions: Vec<Box<dyn ChildSession>>,
}

impl ChildSessionRegistry {
    pub fn add(&mut self, session: Box<dyn ChildSession>) {
        self.sessions.push(session);
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn clear(&mut self) {
        self.sessions.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &Box<dyn ChildSession>> {
        self.sessions.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Box<dyn ChildSession>> {
        self.sessions.iter_mut()
    }

    pub fn start_all(&mut self) {
        for session in &mut self.sessions {
            info!("starting child profiler session");
            session.start();
        }
    }

    pub fn stop_all(&mut self) {
        for session in &mut self.sessions {
            info!("stopping child profiler session");
            session.stop();
        }
    }

    pub fn toggle_all(&mut self, enable: bool) {
        for session in &mut self.sessions {
            session.toggle_collection(enable);
        }
    }

    pub fn push_correlation_id(&mut self, id: CorrelationId) {
        for session in &mut self.sessions {
            session.push_correlation_id(id);
        }
    }

    pub fn pop_correlation_id(&mut self) {
        for session in &mut self.sessions {
            session.pop_correlation_id();
        }
    }

    pub fn push_user_correlation_id(&mut self, id: CorrelationId) {
        for session in &mut self.sessions {
            session.push_user_correlation_id(id);
        }
    }

    pub fn pop_user_correlation_id(&mut self) {
        for session in &mut self.sessions {
            session.pop_user_correlation_id();
        }
    }
}
