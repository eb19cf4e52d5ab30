//! Control core of a GPU/CPU activity trace collector
//!
//! This crate drives a time- or iteration-bounded capture window, ingests
//! asynchronously delivered activity records from a vendor tracing backend,
//! correlates CPU-side operations with GPU-side kernels/copies/syncs, counts
//! anomalies, and hands a consistent trace to an output sink.
//!
//! The vendor backend, the output sink, child profilers and the optional
//! instrumentation hook are collaborators specified only at their interface
//! boundary; see [`backend`], [`sink`], [`session`] and [`hook`].

pub mod backend;
pub mod buffers;
pub mod config;
pub mod correlation;
pub mod errors;
pub mod hook;
pub mod runloop;
pub mod session;
pub mod sink;
pub mod spans;
pub mod sync;

pub use backend::{RawRecord, RawRecordBuffer, TraceBackend};
pub use config::{CaptureWindow, TraceConfig};
pub use errors::{ErrorCounts, ProfilerError};
pub use runloop::{ActivityProfiler, RunloopState};
pub use sink::{MemorySink, TraceSink};
