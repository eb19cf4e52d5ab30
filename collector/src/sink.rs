//! Output sink interface
//!
//! The sink receives one activity/span at a time during trace assembly, the
//! resource/device/overhead metadata at finalization, and finally ownership
//! of all buffered records. Serialization formats are out of scope; the
//! in-memory [`MemorySink`] is provided for tests and for embedders that
//! post-process the trace themselves.

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use gputrace_shared::types::activity::{ActivityRecord, Timestamp};
use gputrace_shared::types::metadata::{DeviceInfo, OverheadInfo, ResourceInfo};
use gputrace_shared::types::span::TraceSpan;

use crate::buffers::TraceBufferStore;

pub trait TraceSink: Send {
    /// Called once per capture, before any activity, with the merged trace
    /// metadata and the deduplicated device-properties JSON
    fn handle_trace_start(&mut self, metadata: &HashMap<String, String>, device_properties: &str);

    fn handle_activity(&mut self, activity: &ActivityRecord);

    fn handle_trace_span(&mut self, span: &TraceSpan);

    fn handle_resource_info(&mut self, info: &ResourceInfo, capture_start: Timestamp);

    fn handle_device_info(&mut self, info: &DeviceInfo, capture_start: Timestamp);

    fn handle_overhead_info(&mut self, info: &OverheadInfo, capture_start: Timestamp);

    /// Receive ownership of all buffered records; the capture is over
    fn finalize_trace(&mut self, buffers: TraceBufferStore, capture_end: Timestamp);

    /// Finalize a memory-snapshot capture exported to `path`
    fn finalize_memory_trace(&mut self, _path: &str) {}
}

/// Sink that retains everything it is handed, in arrival order.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub metadata: HashMap<String, String>,
    pub device_properties: String,
    pub activities: Vec<ActivityRecord>,
    pub spans: Vec<TraceSpan>,
    pub resources: Vec<ResourceInfo>,
    pub devices: Vec<DeviceInfo>,
    pub overheads: Vec<OverheadInfo>,
    pub finalized: Option<(TraceBufferStore, Timestamp)>,
    pub memory_trace_paths: Vec<String>,
}

/// JSON shape written by [`MemorySink::write_json`]
#[derive(Serialize)]
struct TraceJson<'a> {
    metadata: &'a HashMap<String, String>,
    activities: &'a [ActivityRecord],
    spans: &'a [TraceSpan],
    resources: &'a [ResourceInfo],
    devices: &'a [DeviceInfo],
    capture_end: Option<Timestamp>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn activity_names(&self) -> Vec<&str> {
        self.activities.iter().map(|a| a.name.as_str()).collect()
    }

    /// Dump the retained trace as JSON, mostly for debugging and tests
    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let doc = TraceJson {
            metadata: &self.metadata,
            activities: &self.activities,
            spans: &self.spans,
            resources: &self.resources,
            devices: &self.devices,
            capture_end: self.finalized.as_ref().map(|(_, end)| *end),
        };
        let mut file = std::fs::File::create(path.as_ref())
            .with_context(|| format!("failed to create {}", path.as_ref().display()))?;
        serde_json::to_writer_pretty(&mut file, &doc).context("failed to serialize trace")?;
        file.flush()?;
        Ok(())
    }
}

impl TraceSink for MemorySink {
    fn handle_trace_start(&mut self, metadata: &HashMap<String, String>, device_properties: &str) {
        self.metadata = metadata.clone();
        self.device_properties = device_properties.to_string();
    }

    fn handle_activity(&mut self, activity: &ActivityRecord) {
        self.activities.push(activity.clone());
    }

    fn handle_trace_span(&mut self, span: &TraceSpan) {
        self.spans.push(span.clone());
    }

    fn handle_resource_info(&mut self, info: &ResourceInfo, _capture_start: Timestamp) {
        self.resources.push(info.clone());
    }

    fn handle_device_info(&mut self, info: &DeviceInfo, _capture_start: Timestamp) {
        self.devices.push(info.clone());
    }

    fn handle_overhead_info(&mut self, info: &OverheadInfo, _capture_start: Timestamp) {
        self.overheads.push(info.clone());
    }

    fn finalize_trace(&mut self, buffers: TraceBufferStore, capture_end: Timestamp) {
        self.finalized = Some((buffers, capture_end));
    }

    fn finalize_memory_trace(&mut self, path: &str) {
        self.memory_trace_paths.push(path.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gputrace_shared::types::activity::ActivityKind;
    use tempfile::NamedTempFile;

    #[test]
    fn test_memory_sink_retains_in_order() {
        let mut sink = MemorySink::new();
        let mut a = ActivityRecord::new(ActivityKind::Kernel, "first");
        a.timestamp = 1;
        sink.handle_activity(&a);
        a.name = "second".into();
        sink.handle_activity(&a);
        assert_eq!(sink.activity_names(), vec!["first", "second"]);
    }

    #[test]
    fn test_write_json() -> Result<()> {
        let mut sink = MemorySink::new();
        sink.handle_activity(&ActivityRecord::new(ActivityKind::CpuOp, "op"));
        sink.finalize_trace(TraceBufferStore::default(), 1234);

        let file = NamedTempFile::new()?;
        sink.write_json(file.path())?;
        let text = std::fs::read_to_string(file.path())?;
        assert!(text.contains("\"op\""));
        assert!(text.contains("1234"));
        Ok(())
    }
}
