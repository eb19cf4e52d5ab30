//! Correlation identifier maps and CPU/GPU cross-checks
//!
//! Correlation ids are backend-assigned values linking one host-side call to
//! at most one device-side record. External correlation ids arrive on two
//! independent channels (default and user) and route a correlation id to the
//! application-level activity it belongs to.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use tracing::{debug, warn};

use gputrace_shared::types::activity::{
    ActivityKind, ActivityRecord, ActivityRef, CorrelationId, Timestamp,
};

use crate::buffers::TraceBufferStore;
use crate::errors::ErrorCounts;

/// Timestamp-inversion warnings are capped per capture to keep logs sane
const MAX_ORDER_WARNINGS: u32 = 10;

/// External-correlation channel. Channels never share entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CorrelationChannel {
    Default,
    User,
}

impl CorrelationChannel {
    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            0 => Some(CorrelationChannel::Default),
            1 => Some(CorrelationChannel::User),
            _ => None,
        }
    }
}

/// Tracks the first-seen record per correlation id for the timestamp-order
/// cross-check. `complete` flips once the paired record arrives; any further
/// arrival for the same id is a counted anomaly.
#[derive(Debug, Clone, Copy)]
struct OrderSlot {
    first: ActivityRef,
    complete: bool,
}

#[derive(Debug, Default)]
pub struct CorrelationIndex {
    /// Default channel: correlation id -> external id
    default_map: HashMap<CorrelationId, CorrelationId>,

    /// User channel: correlation id -> external id
    user_map: HashMap<CorrelationId, CorrelationId>,

    /// Registered activities by their own correlation id (CPU ops only)
    activities: HashMap<CorrelationId, ActivityRef>,

    /// Order cross-check state per correlation id
    correlated: HashMap<CorrelationId, OrderSlot>,

    /// Range-profiling captures may carry zero-timestamp kernel sentinels
    range_profiling_active: bool,

    order_warnings: u32,
}

impl CorrelationIndex {
    pub fn set_range_profiling(&mut self, active: bool) {
        self.range_profiling_active = active;
    }

    /// Insert an external-correlation mapping. Unrecognized channel tags are
    /// counted as invalid and otherwise ignored.
    pub fn record_external_correlation(
        &mut self,
        channel_tag: u32,
        correlation: CorrelationId,
        external: CorrelationId,
        counters: &mut ErrorCounts,
    ) {
        match CorrelationChannel::from_tag(channel_tag) {
            Some(CorrelationChannel::Default) => {
                self.default_map.insert(correlation, external);
            }
            Some(CorrelationChannel::User) => {
                self.user_map.insert(correlation, external);
            }
            None => {
                warn!(channel_tag, correlation, "invalid external correlation channel");
                counters.invalid_external_correlation += 1;
            }
        }
    }

    /// Register an activity under its own correlation id so later records can
    /// link back to it
    pub fn register_activity(&mut self, correlation: CorrelationId, r: ActivityRef) {
        self.activities.insert(correlation, r);
    }

    /// Look up a registered activity by correlation id
    pub fn activity(&self, correlation: CorrelationId) -> Option<ActivityRef> {
        self.activities.get(&correlation).copied()
    }

    /// Resolve the activity linked to `correlation` through the given
    /// channel's external id, if both hops resolve
    pub fn linked_activity(
        &self,
        correlation: CorrelationId,
        channel: CorrelationChannel,
    ) -> Option<ActivityRef> {
        let map = match channel {
            CorrelationChannel::Default => &self.default_map,
            CorrelationChannel::User => &self.user_map,
        };
        map.get(&correlation)
            .and_then(|external| self.activities.get(external))
            .copied()
    }

    /// Cross-check that the host-side runtime record of a correlated pair was
    /// not timestamped after its GPU record.
    ///
    /// The backend does not guarantee which of the pair arrives first, so the
    /// first sight of a correlation id is remembered and the roles are
    /// resolved on second sight. A GPU record with a zero timestamp (range
    /// profiling sentinel) is exempt. A third record for an already complete
    /// pair is counted as an ordering anomaly.
    pub fn check_timestamp_order(
        &mut self,
        r: ActivityRef,
        store: &TraceBufferStore,
        counters: &mut ErrorCounts,
    ) {
        let Some(act) = store.get(r) else {
            return;
        };
        let slot = match self.correlated.entry(act.correlation) {
            Entry::Vacant(e) => {
                e.insert(OrderSlot {
                    first: r,
                    complete: false,
                });
                return;
            }
            Entry::Occupied(e) => e.into_mut(),
        };
        if slot.complete {
            // More than two records share this correlation id; do not guess
            // which pair was intended.
            counters.cpu_gpu_out_of_order += 1;
            self.warn_out_of_order(act, "extra record for correlated pair");
            return;
        }
        slot.complete = true;
        let Some(first) = store.get(slot.first) else {
            return;
        };
        // Resolve which side is the host-side runtime call, independent of
        // arrival order.
        let (runtime, gpu) = if matches!(first.kind, ActivityKind::RuntimeApi | ActivityKind::DriverApi)
        {
            (first, act)
        } else {
            (act, first)
        };
        if gpu.timestamp == 0 {
            return;
        }
        if runtime.timestamp > gpu.timestamp {
            counters.cpu_gpu_out_of_order += 1;
            self.warn_out_of_order(gpu, "gpu op timestamp precedes runtime timestamp");
        }
    }

    fn warn_out_of_order(&mut self, act: &ActivityRecord, msg: &'static str) {
        if self.order_warnings < MAX_ORDER_WARNINGS {
            self.order_warnings += 1;
            warn!(
                name = %act.name,
                correlation = act.correlation,
                device = act.device,
                stream = act.resource,
                "{msg}"
            );
        }
    }

    /// Whether the record's [timestamp, timestamp+duration) interval falls
    /// outside [window_start, window_end). Zero-timestamp records are always
    /// in range while range profiling is active.
    pub fn out_of_range(
        &self,
        act: &ActivityRecord,
        window_start: Timestamp,
        window_end: Timestamp,
        counters: &mut ErrorCounts,
    ) -> bool {
        let out_of_range = act.timestamp < window_start || act.end_time() > window_end;
        let zero_ts = self.range_profiling_active && act.timestamp == 0;
        let excluded = !zero_ts && out_of_range;
        if excluded {
            debug!(
                name = %act.name,
                timestamp = act.timestamp,
                end = act.end_time(),
                window_start,
                window_end,
                "activity outside of capture window"
            );
            counters.out_of_range += 1;
        }
        excluded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gputrace_shared::types::activity::ActivityKind;

    fn record(kind: ActivityKind, correlation: CorrelationId, ts: Timestamp, dur: i64) -> ActivityRecord {
        let mut act = ActivityRecord::new(kind, "act");
        act.correlation = correlation;
        act.timestamp = ts;
        act.duration = dur;
        act
    }

    fn store_with(records: Vec<ActivityRecord>) -> (TraceBufferStore, Vec<ActivityRef>) {
        let mut store = TraceBufferStore::default();
        let refs = records.into_iter().map(|r| store.add_converted(r)).collect();
        (store, refs)
    }

    #[test]
    fn test_channels_are_independent() {
        let mut index = CorrelationIndex::default();
        let mut counters = ErrorCounts::default();
        let (mut store, _) = store_with(vec![]);
        let cpu = store.add_converted(record(ActivityKind::CpuOp, 100, 0, 0));
        index.register_activity(100, cpu);
        index.record_external_correlation(0, 7, 100, &mut counters);

        assert_eq!(
            index.linked_activity(7, CorrelationChannel::Default),
            Some(cpu)
        );
        assert_eq!(index.linked_activity(7, CorrelationChannel::User), None);
        assert_eq!(counters.invalid_external_correlation, 0);
    }

    #[test]
    fn test_invalid_channel_tag_is_counted() {
        let mut index = CorrelationIndex::default();
        let mut counters = ErrorCounts::default();
        index.record_external_correlation(2, 7, 100, &mut counters);
        assert_eq!(counters.invalid_external_correlation, 1);
        assert_eq!(index.linked_activity(7, CorrelationChannel::Default), None);
    }

    #[test]
    fn test_order_check_same_verdict_either_arrival_order() {
        // Runtime at t=200 issued the kernel that "ran" at t=100: inverted.
        let runtime = record(ActivityKind::RuntimeApi, 9, 200, 5);
        let kernel = record(ActivityKind::Kernel, 9, 100, 30);

        for (a, b) in [(runtime.clone(), kernel.clone()), (kernel, runtime)] {
            let mut index = CorrelationIndex::default();
            let mut counters = ErrorCounts::default();
            let (store, refs) = store_with(vec![a, b]);
            index.check_timestamp_order(refs[0], &store, &mut counters);
            index.check_timestamp_order(refs[1], &store, &mut counters);
            assert_eq!(counters.cpu_gpu_out_of_order, 1);
        }
    }

    #[test]
    fn test_order_check_in_order_pair_is_clean() {
        let runtime = record(ActivityKind::RuntimeApi, 9, 100, 5);
        let kernel = record(ActivityKind::Kernel, 9, 140, 30);
        let mut index = CorrelationIndex::default();
        let mut counters = ErrorCounts::default();
        let (store, refs) = store_with(vec![runtime, kernel]);
        index.check_timestamp_order(refs[0], &store, &mut counters);
        index.check_timestamp_order(refs[1], &store, &mut counters);
        assert_eq!(counters.cpu_gpu_out_of_order, 0);
    }

    #[test]
    fn test_order_check_zero_gpu_timestamp_exempt() {
        let runtime = record(ActivityKind::RuntimeApi, 9, 200, 5);
        let kernel = record(ActivityKind::Kernel, 9, 0, 0);
        let mut index = CorrelationIndex::default();
        let mut counters = ErrorCounts::default();
        let (store, refs) = store_with(vec![kernel, runtime]);
        index.check_timestamp_order(refs[0], &store, &mut counters);
        index.check_timestamp_order(refs[1], &store, &mut counters);
        assert_eq!(counters.cpu_gpu_out_of_order, 0);
    }

    #[test]
    fn test_third_record_is_counted_anomaly() {
        let runtime = record(ActivityKind::RuntimeApi, 9, 100, 5);
        let kernel = record(ActivityKind::Kernel, 9, 140, 30);
        let extra = record(ActivityKind::Kernel, 9, 150, 10);
        let mut index = CorrelationIndex::default();
        let mut counters = ErrorCounts::default();
        let (store, refs) = store_with(vec![runtime, kernel, extra]);
        for r in refs {
            index.check_timestamp_order(r, &store, &mut counters);
        }
        assert_eq!(counters.cpu_gpu_out_of_order, 1);
    }

    #[test]
    fn test_out_of_range() {
        let index = CorrelationIndex::default();
        let mut counters = ErrorCounts::default();
        let inside = record(ActivityKind::Kernel, 1, 100, 50);
        let straddles = record(ActivityKind::Kernel, 2, 900, 200);
        assert!(!index.out_of_range(&inside, 0, 1000, &mut counters));
        assert!(index.out_of_range(&straddles, 0, 1000, &mut counters));
        assert_eq!(counters.out_of_range, 1);
    }

    #[test]
    fn test_zero_ts_in_range_only_while_range_profiling() {
        let mut counters = ErrorCounts::default();
        let zero_ts = record(ActivityKind::Kernel, 1, 0, 0);

        let mut index = CorrelationIndex::default();
        index.set_range_profiling(true);
        assert!(!index.out_of_range(&zero_ts, 100, 1000, &mut counters));

        index.set_range_profiling(false);
        assert!(index.out_of_range(&zero_ts, 100, 1000, &mut counters));
    }
}
