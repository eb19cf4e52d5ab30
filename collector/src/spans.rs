//! Paired CPU/GPU trace spans and user-annotation aggregation
//!
//! One span pair exists per (span name, iteration): the CPU span as reported
//! by the application, and a GPU span that widens as linked device activity
//! arrives. Separately, GPU work correlated to user annotations is aggregated
//! into one synthetic span per (device, stream, annotated CPU op).

use std::collections::HashMap;

use tracing::debug;

use gputrace_shared::types::activity::{
    ActivityKind, ActivityRecord, CorrelationId, DeviceId, ResourceId, Timestamp,
};
use gputrace_shared::types::span::{SpanPair, TraceSpan};

/// Key of a span pair inside the tracker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanKey {
    name: String,
    index: usize,
}

#[derive(Debug, Default)]
pub struct SpanTracker {
    /// Span pairs per name, in iteration order
    spans: HashMap<String, Vec<SpanPair>>,

    /// CPU op correlation id -> owning span pair
    by_correlation: HashMap<CorrelationId, SpanKey>,

    /// (device, stream) -> annotated CPU correlation id -> synthetic span
    user_events: HashMap<(DeviceId, ResourceId), HashMap<CorrelationId, ActivityRecord>>,
}

impl SpanTracker {
    /// Append a new span pair for the CPU span's (name, iteration). The GPU
    /// half starts empty and inherits the iteration and name with a "GPU: "
    /// display prefix.
    pub fn record_trace_span(&mut self, cpu_span: TraceSpan, gpu_op_count: i64) -> SpanKey {
        let name = cpu_span.name.clone();
        let gpu_span = TraceSpan::new(gpu_op_count, cpu_span.iteration, name.clone(), "GPU: ");
        let iterations = self.spans.entry(name.clone()).or_default();
        iterations.push(SpanPair {
            cpu: cpu_span,
            gpu: gpu_span,
        });
        SpanKey {
            name,
            index: iterations.len() - 1,
        }
    }

    /// Associate a CPU op's correlation id with its owning span pair
    pub fn link_cpu_op(&mut self, correlation: CorrelationId, key: &SpanKey) {
        self.by_correlation.insert(correlation, key.clone());
    }

    pub fn cpu_span(&self, key: &SpanKey) -> Option<&TraceSpan> {
        self.spans
            .get(&key.name)
            .and_then(|iters| iters.get(key.index))
            .map(|pair| &pair.cpu)
    }

    /// Widen the GPU span paired with the given CPU correlation id to cover
    /// [start, end). No-op when the correlation id is unknown.
    pub fn update_gpu_span(&mut self, cpu_correlation: CorrelationId, start: Timestamp, end: Timestamp) {
        let Some(key) = self.by_correlation.get(&cpu_correlation) else {
            debug!(cpu_correlation, "gpu activity with no owning span");
            return;
        };
        if let Some(pair) = self
            .spans
            .get_mut(&key.name)
            .and_then(|iters| iters.get_mut(key.index))
        {
            pair.gpu.extend(start, end);
        }
    }

    /// Create or widen the synthetic user-annotation span for the GPU
    /// record's (device, stream) and the annotated CPU op. The first record
    /// creates the span from the CPU op's name/correlation and the GPU
    /// record's bounds; later records only widen it.
    pub fn insert_or_extend_user_event(&mut self, cpu_op: &ActivityRecord, gpu_op: &ActivityRecord) {
        let per_stream = self
            .user_events
            .entry((gpu_op.device, gpu_op.resource))
            .or_default();
        let span = per_stream.entry(cpu_op.correlation).or_insert_with(|| {
            let mut act = ActivityRecord::new(ActivityKind::GpuUserAnnotation, cpu_op.name.clone());
            act.timestamp = gpu_op.timestamp;
            act.duration = gpu_op.duration;
            act.device = gpu_op.device;
            act.resource = gpu_op.resource;
            act.correlation = cpu_op.correlation;
            act
        });
        // Widen like a GPU span: start moves down, end moves up
        let end = span.end_time().max(gpu_op.end_time());
        if gpu_op.timestamp < span.timestamp || span.timestamp == 0 {
            span.timestamp = gpu_op.timestamp;
        }
        span.duration = end - span.timestamp;
    }

    /// All GPU spans, for end-of-capture emission
    pub fn gpu_spans(&self) -> impl Iterator<Item = &TraceSpan> {
        self.spans
            .values()
            .flat_map(|iters| iters.iter().map(|pair| &pair.gpu))
    }

    /// All aggregated user-annotation spans
    pub fn user_annotation_spans(&self) -> impl Iterator<Item = &ActivityRecord> {
        self.user_events.values().flat_map(|m| m.values())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu_span(name: &str, iteration: i64) -> TraceSpan {
        let mut span = TraceSpan::new(1, iteration, name, "");
        span.start_time = 100;
        span.end_time = 150;
        span
    }

    fn gpu_record(device: DeviceId, stream: ResourceId, ts: Timestamp, dur: i64) -> ActivityRecord {
        let mut act = ActivityRecord::new(ActivityKind::Kernel, "kernel");
        act.device = device;
        act.resource = stream;
        act.timestamp = ts;
        act.duration = dur;
        act
    }

    #[test]
    fn test_gpu_span_widens_in_any_order() {
        let bounds = [(140i64, 30i64), (120, 10), (200, 50)];
        let mut permutations: Vec<Vec<(i64, i64)>> = vec![
            bounds.to_vec(),
            vec![bounds[2], bounds[0], bounds[1]],
            vec![bounds[1], bounds[2], bounds[0]],
        ];
        let mut results = Vec::new();
        for perm in permutations.drain(..) {
            let mut tracker = SpanTracker::default();
            let key = tracker.record_trace_span(cpu_span("fwd", 0), 3);
            tracker.link_cpu_op(42, &key);
            for (ts, dur) in perm {
                tracker.update_gpu_span(42, ts, ts + dur);
            }
            let gpu: Vec<_> = tracker.gpu_spans().collect();
            results.push((gpu[0].start_time, gpu[0].end_time));
        }
        assert!(results.iter().all(|&r| r == (120, 250)));
    }

    #[test]
    fn test_unknown_correlation_is_noop() {
        let mut tracker = SpanTracker::default();
        let key = tracker.record_trace_span(cpu_span("fwd", 0), 1);
        tracker.link_cpu_op(42, &key);
        tracker.update_gpu_span(999, 100, 200);
        let gpu: Vec<_> = tracker.gpu_spans().collect();
        assert_eq!(gpu[0].start_time, 0);
        assert_eq!(gpu[0].end_time, 0);
    }

    #[test]
    fn test_same_name_spans_distinguished_by_iteration() {
        let mut tracker = SpanTracker::default();
        let k0 = tracker.record_trace_span(cpu_span("fwd", 0), 1);
        let k1 = tracker.record_trace_span(cpu_span("fwd", 1), 1);
        assert_ne!(k0, k1);
        tracker.link_cpu_op(1, &k0);
        tracker.link_cpu_op(2, &k1);
        tracker.update_gpu_span(2, 300, 400);
        let pair1 = &tracker.spans["fwd"][1];
        assert_eq!(pair1.gpu.start_time, 300);
        let pair0 = &tracker.spans["fwd"][0];
        assert_eq!(pair0.gpu.start_time, 0);
    }

    #[test]
    fn test_user_annotation_one_span_per_stream_and_op() {
        let mut tracker = SpanTracker::default();
        let mut cpu_op = ActivityRecord::new(ActivityKind::CpuOp, "annotate");
        cpu_op.correlation = 7;

        tracker.insert_or_extend_user_event(&cpu_op, &gpu_record(0, 1, 140, 30));
        tracker.insert_or_extend_user_event(&cpu_op, &gpu_record(0, 1, 120, 10));
        tracker.insert_or_extend_user_event(&cpu_op, &gpu_record(0, 2, 500, 10));

        let spans: Vec<_> = tracker.user_annotation_spans().collect();
        assert_eq!(spans.len(), 2);
        let stream1 = spans.iter().find(|s| s.resource == 1).unwrap();
        assert_eq!(stream1.timestamp, 120);
        assert_eq!(stream1.end_time(), 170);
        assert_eq!(stream1.name, "annotate");
        assert_eq!(stream1.correlation, 7);
    }
}
