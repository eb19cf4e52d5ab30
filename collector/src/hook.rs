//! External instrumentation hook
//!
//! A single optional endpoint notified at prepare/start/stop boundaries of an
//! activity capture, and driven synchronously through a memory-snapshot
//! capture. Owned by the profiler instance rather than registered globally,
//! so independent captures (and tests) cannot cross-contaminate.

use crate::config::TraceConfig;

pub trait InstrumentationHook: Send {
    /// The capture was configured; warmup is about to begin
    fn prepare(&mut self, config: &TraceConfig);

    /// Warmup finished; collection is live
    fn start(&mut self);

    /// Collection stopped
    fn stop(&mut self);

    fn start_memory_profile(&mut self);

    fn export_memory_profile(&mut self, path: &str);

    fn stop_memory_profile(&mut self);
}
