//! Per-capture activity buffer ownership
//!
//! `TraceBufferStore` owns every activity for the lifetime of one capture:
//! the transferred CPU trace buffers, the drained raw GPU buffers, and an
//! arena of converted records. All other components refer to activities
//! through [`ActivityRef`] indices, which stay stable until reset.

use gputrace_shared::types::activity::{ActivityRecord, ActivityRef, CpuTraceBuffer};

use crate::backend::RawRecordBuffer;

#[derive(Debug, Default)]
pub struct TraceBufferStore {
    /// CPU trace buffers in transfer order
    pub cpu: Vec<CpuTraceBuffer>,

    /// Raw GPU buffers drained from the backend, kept for the final handoff
    pub gpu: Vec<RawRecordBuffer>,

    /// Arena of records converted from raw GPU/runtime records
    converted: Vec<ActivityRecord>,
}

impl TraceBufferStore {
    pub fn add_cpu_buffer(&mut self, buffer: CpuTraceBuffer) -> usize {
        self.cpu.push(buffer);
        self.cpu.len() - 1
    }

    /// Store a converted record and return a stable reference to it
    pub fn add_converted(&mut self, record: ActivityRecord) -> ActivityRef {
        self.converted.push(record);
        ActivityRef::Gpu {
            index: self.converted.len() - 1,
        }
    }

    pub fn get(&self, r: ActivityRef) -> Option<&ActivityRecord> {
        match r {
            ActivityRef::Cpu { buffer, index } => {
                self.cpu.get(buffer).and_then(|b| b.activities.get(index))
            }
            ActivityRef::Gpu { index } => self.converted.get(index),
        }
    }

    pub fn get_mut(&mut self, r: ActivityRef) -> Option<&mut ActivityRecord> {
        match r {
            ActivityRef::Cpu { buffer, index } => self
                .cpu
                .get_mut(buffer)
                .and_then(|b| b.activities.get_mut(index)),
            ActivityRef::Gpu { index } => self.converted.get_mut(index),
        }
    }

    pub fn converted(&self) -> &[ActivityRecord] {
        &self.converted
    }

    pub fn cpu_activity_count(&self) -> usize {
        self.cpu.iter().map(|b| b.activities.len()).sum()
    }
}
