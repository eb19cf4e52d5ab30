//! Resource, device and overhead metadata emitted alongside the trace

use serde::{Deserialize, Serialize};

use crate::types::activity::{DeviceId, ResourceId};

/// A thread or stream within a device/process track
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceInfo {
    /// Owning device (gpu ordinal) or process id
    pub device: DeviceId,

    /// Thread or stream id
    pub id: ResourceId,

    /// Ordering hint for trace viewers
    pub sort_index: i64,

    /// Display name
    pub name: String,
}

impl ResourceInfo {
    pub fn new(device: DeviceId, id: ResourceId, name: impl Into<String>) -> Self {
        Self {
            device,
            id,
            sort_index: id,
            name: name.into(),
        }
    }
}

/// A device or process track
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: DeviceId,

    /// Ordering hint; GPU tracks sort below all process tracks
    pub sort_index: i64,

    /// Process or device name
    pub name: String,

    /// Track label ("CPU", "GPU 0", ...)
    pub label: String,
}

impl DeviceInfo {
    pub fn new(id: DeviceId, sort_index: i64, name: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id,
            sort_index,
            name: name.into(),
            label: label.into(),
        }
    }
}

/// Named overhead category reported at finalization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverheadInfo {
    pub name: String,
}

impl OverheadInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}
