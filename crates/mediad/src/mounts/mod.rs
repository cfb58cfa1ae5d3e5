//! Mounting: the orchestrator seam, the tree-aware mount service and the
//! mount table watcher.

#[cfg(target_os = "linux")]
pub mod linux;
mod service;
pub mod watcher;

pub use service::MountService;

use std::path::PathBuf;

use thiserror::Error;

use mediad_core::{ErrorCode, MountEntry};

/// A fully resolved mount request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRequest {
    pub device: String,
    pub mount_point: PathBuf,
    pub filesystem: String,
    pub options: Vec<String>,
}

impl MountRequest {
    /// Options as the comma-separated string reported to clients.
    pub fn options_string(&self) -> String {
        self.options.join(",")
    }
}

/// Failure reading the live mount table.
#[derive(Error, Debug)]
pub enum MountTableError {
    #[error("Failed to read mount table: {0}")]
    Read(#[source] std::io::Error),
}

/// Performs the privileged half of mounting.
///
/// Every failure is reported as a protocol [`ErrorCode`] so it can be sent to
/// the client unchanged.
pub trait MountOrchestrator: Send {
    fn mount(&mut self, request: &MountRequest) -> Result<(), ErrorCode>;

    fn unmount(&mut self, device: &str, mount_point: &str) -> Result<(), ErrorCode>;

    /// Detaches a whole device so it can be unplugged.
    fn poweroff(&mut self, device: &str) -> Result<(), ErrorCode>;

    /// Current system mounts of device nodes.
    fn current_mounts(&self) -> Result<Vec<MountEntry>, MountTableError>;
}
