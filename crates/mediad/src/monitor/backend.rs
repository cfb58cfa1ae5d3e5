//! Contract between the monitor worker and a platform device source.

use std::os::unix::io::RawFd;

use mediad_core::{DeviceAction, DeviceRecord};
use thiserror::Error;

/// One decoded platform event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendEvent {
    pub record: DeviceRecord,
    pub action: DeviceAction,
}

impl BackendEvent {
    pub fn new(record: DeviceRecord, action: DeviceAction) -> Self {
        Self { record, action }
    }
}

/// Unrecoverable backend failures.
///
/// Malformed events are not errors; backends skip them by returning
/// `Ok(None)` from [`PlatformBackend::next_event`].
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Failed to open event source: {0}")]
    Open(std::io::Error),

    #[error("Failed to enumerate devices: {0}")]
    Enumerate(std::io::Error),

    #[error("Event source read failed: {0}")]
    Read(std::io::Error),

    #[error("Event source closed")]
    Closed,
}

/// A source of removable-device facts.
///
/// `enumerate` runs once before the worker starts; afterwards the worker
/// waits for [`event_fd`](Self::event_fd) to become readable and calls
/// [`next_event`](Self::next_event), which must not block beyond reading the
/// data that made the descriptor ready.
pub trait PlatformBackend: Send + 'static {
    /// Current devices, roots before their partitions.
    fn enumerate(&mut self) -> Result<Vec<DeviceRecord>, BackendError>;

    /// Descriptor that becomes readable when an event is pending.
    fn event_fd(&self) -> RawFd;

    /// Reads one pending event.
    ///
    /// `Ok(None)` means the data was noise or malformed and was skipped.
    fn next_event(&mut self) -> Result<Option<BackendEvent>, BackendError>;
}
