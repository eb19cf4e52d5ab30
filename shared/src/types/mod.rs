//! Trace data type definitions

pub mod activity;
pub mod metadata;
pub mod span;
