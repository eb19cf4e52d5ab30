//! Deferred emission of wait-event synchronization records
//!
//! Wait-event syncs are extremely frequent and carry no diagnostic value for
//! streams that never ran any real GPU work, so they are buffered until the
//! end of processing and emitted only for streams seen carrying non-sync
//! activity. The queue also owns two side tables the original design kept as
//! process-wide globals: the (context, event) -> recording stream/correlation
//! map and the context -> device map. Both live for exactly one capture.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use gputrace_shared::types::activity::{ActivityRef, CorrelationId, DeviceId, ResourceId};

/// The (stream, correlation) that most recently recorded an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitEventInfo {
    pub stream: i64,
    pub correlation: CorrelationId,
}

/// A wait-event sync held back until its stream is known to matter
#[derive(Debug, Clone, Copy)]
pub struct DeferredLogEntry {
    pub device: DeviceId,
    pub stream: ResourceId,
    pub activity: ActivityRef,
}

#[derive(Debug, Default)]
pub struct DeferredSyncQueue {
    queue: Vec<DeferredLogEntry>,

    /// (device, stream) pairs that carried at least one non-sync GPU activity
    seen_streams: HashSet<(DeviceId, ResourceId)>,

    /// (context, event) -> last recorder of that event
    wait_events: HashMap<(u32, u32), WaitEventInfo>,

    /// context -> device, learned from kernel records
    context_devices: HashMap<u32, DeviceId>,
}

impl DeferredSyncQueue {
    /// Note that real (non-sync) GPU work ran on this stream
    pub fn mark_stream_active(&mut self, device: DeviceId, stream: ResourceId) {
        self.seen_streams.insert((device, stream));
    }

    pub fn stream_active(&self, device: DeviceId, stream: ResourceId) -> bool {
        self.seen_streams.contains(&(device, stream))
    }

    /// Update which (stream, correlation) last recorded the event
    pub fn record_event(
        &mut self,
        context: u32,
        event: u32,
        stream: i64,
        correlation: CorrelationId,
    ) {
        self.wait_events
            .insert((context, event), WaitEventInfo { stream, correlation });
    }

    pub fn wait_event_info(&self, context: u32, event: u32) -> Option<WaitEventInfo> {
        self.wait_events.get(&(context, event)).copied()
    }

    /// Remember the device owning a context; first sighting wins
    pub fn record_context_device(&mut self, context: u32, device: DeviceId) {
        self.context_devices.entry(context).or_insert(device);
    }

    pub fn device_for_context(&self, context: u32) -> DeviceId {
        self.context_devices.get(&context).copied().unwrap_or(0)
    }

    /// Hold a wait-event sync back until flush time
    pub fn defer(&mut self, entry: DeferredLogEntry) {
        self.queue.push(entry);
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Drain the queue, returning the entries whose (device, stream) carried
    /// real GPU work during the capture. The rest are dropped with a debug
    /// note.
    pub fn drain_eligible(&mut self) -> Vec<DeferredLogEntry> {
        let mut eligible = Vec::new();
        for entry in self.queue.drain(..) {
            if self.seen_streams.contains(&(entry.device, entry.stream)) {
                eligible.push(entry);
            } else {
                debug!(
                    device = entry.device,
                    stream = entry.stream,
                    "skipping event sync, no kernels ran on stream"
                );
            }
        }
        eligible
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(device: DeviceId, stream: ResourceId) -> DeferredLogEntry {
        DeferredLogEntry {
            device,
            stream,
            activity: ActivityRef::Gpu { index: 0 },
        }
    }

    #[test]
    fn test_emitted_iff_stream_saw_gpu_work() {
        let mut queue = DeferredSyncQueue::default();
        queue.defer(entry(0, 1));
        queue.defer(entry(0, 2));
        queue.defer(entry(1, 1));
        queue.mark_stream_active(0, 1);

        let eligible = queue.drain_eligible();
        assert_eq!(eligible.len(), 1);
        assert_eq!((eligible[0].device, eligible[0].stream), (0, 1));
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn test_no_activity_drops_everything() {
        let mut queue = DeferredSyncQueue::default();
        queue.defer(entry(0, 1));
        assert!(queue.drain_eligible().is_empty());
    }

    #[test]
    fn test_many_activities_still_one_emission_per_entry() {
        let mut queue = DeferredSyncQueue::default();
        for _ in 0..5 {
            queue.mark_stream_active(0, 7);
        }
        queue.defer(entry(0, 7));
        assert_eq!(queue.drain_eligible().len(), 1);
    }

    #[test]
    fn test_wait_event_table_keeps_latest() {
        let mut queue = DeferredSyncQueue::default();
        queue.record_event(1, 10, 3, 100);
        queue.record_event(1, 10, 4, 101);
        assert_eq!(
            queue.wait_event_info(1, 10),
            Some(WaitEventInfo {
                stream: 4,
                correlation: 101
            })
        );
        assert_eq!(queue.wait_event_info(2, 10), None);
    }

    #[test]
    fn test_context_device_first_sighting_wins() {
        let mut queue = DeferredSyncQueue::default();
        queue.record_context_device(5, 2);
        queue.record_context_device(5, 3);
        assert_eq!(queue.device_for_context(5), 2);
        assert_eq!(queue.device_for_context(9), 0);
    }
}
