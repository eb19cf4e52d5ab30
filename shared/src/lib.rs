//! Shared types and utilities for gputrace
//!
//! This crate contains the common trace data structures and utilities used by
//! the collector core and by output sinks.

pub mod types;
pub mod utils;

// Re-export commonly used types
pub use types::{activity::*, metadata::*, span::*};
