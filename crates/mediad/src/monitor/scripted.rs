//! In-memory backend driven by the controlling side.
//!
//! Events travel over a channel; a socket pair provides the readable
//! descriptor the worker waits on, one byte per pushed event. Closing the
//! handle hangs up the socket, which the worker sees as a dead event source.

use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::mpsc;

use mediad_core::{DeviceAction, DeviceRecord};

use super::backend::{BackendError, BackendEvent, PlatformBackend};

/// Backend half, handed to the monitor.
pub struct ScriptedBackend {
    initial: Vec<DeviceRecord>,
    events: mpsc::Receiver<BackendEvent>,
    signal: UnixStream,
}

/// Controlling half.
pub struct ScriptedHandle {
    events: mpsc::Sender<BackendEvent>,
    signal: Option<UnixStream>,
}

impl ScriptedBackend {
    /// Creates a backend whose enumeration yields `initial`.
    pub fn new(initial: Vec<DeviceRecord>) -> io::Result<(Self, ScriptedHandle)> {
        let (tx, rx) = mpsc::channel();
        let (ours, theirs) = UnixStream::pair()?;
        Ok((
            Self {
                initial,
                events: rx,
                signal: theirs,
            },
            ScriptedHandle {
                events: tx,
                signal: Some(ours),
            },
        ))
    }
}

impl PlatformBackend for ScriptedBackend {
    fn enumerate(&mut self) -> Result<Vec<DeviceRecord>, BackendError> {
        Ok(std::mem::take(&mut self.initial))
    }

    fn event_fd(&self) -> RawFd {
        self.signal.as_raw_fd()
    }

    fn next_event(&mut self) -> Result<Option<BackendEvent>, BackendError> {
        let mut byte = [0u8; 1];
        match self.signal.read(&mut byte) {
            Ok(0) => Err(BackendError::Closed),
            Ok(_) => Ok(self.events.try_recv().ok()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(None),
            Err(e) => Err(BackendError::Read(e)),
        }
    }
}

impl ScriptedHandle {
    /// Queues one event for the worker.
    pub fn push(&self, record: DeviceRecord, action: DeviceAction) -> io::Result<()> {
        self.events
            .send(BackendEvent::new(record, action))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "backend dropped"))?;
        self.wake()
    }

    /// Wakes the worker without an event, like an unparseable message.
    pub fn push_noise(&self) -> io::Result<()> {
        self.wake()
    }

    fn wake(&self) -> io::Result<()> {
        match &self.signal {
            Some(stream) => {
                let mut writer: &UnixStream = stream;
                writer.write_all(&[1])
            }
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "handle closed")),
        }
    }

    /// Hangs up the event source. Already pushed events are still delivered.
    pub fn close(&mut self) {
        self.signal = None;
    }
}
