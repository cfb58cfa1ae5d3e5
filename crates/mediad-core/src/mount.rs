//! Mount state types.

use serde::{Deserialize, Serialize};

/// Where and how a device is currently mounted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountInfo {
    pub mount_point: String,
    pub options: String,
}

impl MountInfo {
    pub fn new(mount_point: impl Into<String>, options: impl Into<String>) -> Self {
        Self {
            mount_point: mount_point.into(),
            options: options.into(),
        }
    }
}

/// One row of the live system mount table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountEntry {
    /// Mount source (device node path)
    pub device: String,
    pub mount_point: String,
    pub options: String,
}

impl MountEntry {
    pub fn new(
        device: impl Into<String>,
        mount_point: impl Into<String>,
        options: impl Into<String>,
    ) -> Self {
        Self {
            device: device.into(),
            mount_point: mount_point.into(),
            options: options.into(),
        }
    }

    /// Mount info half of the entry.
    pub fn info(&self) -> MountInfo {
        MountInfo::new(self.mount_point.clone(), self.options.clone())
    }
}
