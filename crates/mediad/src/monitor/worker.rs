//! The device monitor worker thread.
//!
//! [`DeviceMonitor`] owns the backend until [`start`](DeviceMonitor::start)
//! hands it to a dedicated thread. That thread waits on the backend's event
//! descriptor and a control socket together, so [`stop`](DeviceMonitor::stop)
//! wakes it even while no device events arrive.

use std::collections::{BTreeMap, HashMap};
use std::io::{self, Write};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use mediad_core::{DeviceAction, DeviceKind, DeviceRecord};

use super::backend::{BackendError, BackendEvent, PlatformBackend};
use super::queue::{MonitorQueue, QueueItem};

/// Errors starting or controlling the monitor.
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Monitor already started")]
    AlreadyStarted,

    #[error("Failed to spawn monitor thread: {0}")]
    Spawn(io::Error),

    #[error("Failed to create control channel: {0}")]
    Control(io::Error),
}

// ============================================================================
// Shared State
// ============================================================================

/// What the worker remembers about an accepted device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct KnownDevice {
    kind: DeviceKind,
    parent: String,
}

/// Shadow knowledge plus the fan-out set.
#[derive(Debug, Default)]
pub(crate) struct SharedState {
    known: HashMap<String, KnownDevice>,
    pub(super) queues: BTreeMap<u64, mpsc::UnboundedSender<QueueItem>>,
    next_queue_id: u64,
}

impl SharedState {
    /// Decides whether an event changes what consumers know, updating the
    /// shadow if it does.
    fn accept(&mut self, record: &DeviceRecord, action: DeviceAction) -> bool {
        let path = record.path();

        match action {
            DeviceAction::Add | DeviceAction::Online => {
                if self.known.contains_key(path) {
                    return false;
                }
                if !record.is_root() {
                    // Only removable disks carry partitions.
                    let parent_is_disk = self
                        .known
                        .get(record.parent_path())
                        .is_some_and(|parent| parent.kind == DeviceKind::StatelessDevice);
                    if !parent_is_disk {
                        return false;
                    }
                }
                self.known.insert(
                    path.to_string(),
                    KnownDevice {
                        kind: record.kind(),
                        parent: record.parent_path().to_string(),
                    },
                );
                true
            }
            DeviceAction::Remove | DeviceAction::Offline => {
                let Some(removed) = self.known.remove(path) else {
                    return false;
                };
                if removed.kind != DeviceKind::Partition {
                    self.known.retain(|_, known| known.parent != path);
                }
                true
            }
            DeviceAction::Change => self
                .known
                .get(path)
                .is_some_and(|known| known.kind == record.kind()),
        }
    }

    fn fan_out(&self, record: Arc<DeviceRecord>, action: DeviceAction) {
        for sender in self.queues.values() {
            let _ = sender.send(QueueItem::Device {
                record: Arc::clone(&record),
                action,
            });
        }
    }

    fn broadcast_exit(&self) {
        for sender in self.queues.values() {
            let _ = sender.send(QueueItem::Exit);
        }
    }
}

/// Locks the shared state, recovering from poisoning.
pub(crate) fn lock(shared: &Mutex<SharedState>) -> MutexGuard<'_, SharedState> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Device Monitor
// ============================================================================

struct Worker {
    control: UnixStream,
    thread: JoinHandle<()>,
}

/// Owner of the backend, the worker thread and the queue registry.
pub struct DeviceMonitor {
    shared: Arc<Mutex<SharedState>>,
    backend: Option<Box<dyn PlatformBackend>>,
    worker: Option<Worker>,
}

impl DeviceMonitor {
    pub fn new(backend: impl PlatformBackend) -> Self {
        Self {
            shared: Arc::new(Mutex::new(SharedState::default())),
            backend: Some(Box::new(backend)),
            worker: None,
        }
    }

    /// Registers a new consumer queue.
    ///
    /// The queue receives every action accepted after this call.
    pub fn register(&self) -> MonitorQueue {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut state = lock(&self.shared);
        let id = state.next_queue_id;
        state.next_queue_id += 1;
        state.queues.insert(id, sender);
        debug!(queue = id, "Monitor queue registered");
        MonitorQueue::new(id, receiver, Arc::downgrade(&self.shared))
    }

    #[cfg(test)]
    fn queue_count(&self) -> usize {
        lock(&self.shared).queues.len()
    }

    #[cfg(test)]
    fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|worker| !worker.thread.is_finished())
    }

    /// Enumerates current devices and starts the worker thread.
    ///
    /// Returns the accepted snapshot, roots before partitions, for the
    /// caller to seed its tree with.
    pub fn start(&mut self) -> Result<Vec<Arc<DeviceRecord>>, MonitorError> {
        let mut backend = self.backend.take().ok_or(MonitorError::AlreadyStarted)?;

        let records = match backend.enumerate() {
            Ok(records) => records,
            Err(e) => {
                self.backend = Some(backend);
                return Err(e.into());
            }
        };

        let snapshot: Vec<Arc<DeviceRecord>> = {
            let mut state = lock(&self.shared);
            records
                .into_iter()
                .filter(|record| state.accept(record, DeviceAction::Add))
                .map(Arc::new)
                .collect()
        };

        let (control, control_rx) = UnixStream::pair().map_err(MonitorError::Control)?;
        let shared = Arc::clone(&self.shared);
        let thread = thread::Builder::new()
            .name("mediad-monitor".to_string())
            .spawn(move || run_worker(backend, shared, control_rx))
            .map_err(MonitorError::Spawn)?;

        self.worker = Some(Worker { control, thread });
        info!(devices = snapshot.len(), "Device monitor started");
        Ok(snapshot)
    }

    /// Signals the worker to exit and joins it.
    pub fn stop(&mut self) {
        let Some(mut worker) = self.worker.take() else {
            return;
        };

        if !worker.thread.is_finished() {
            if let Err(e) = worker.control.write_all(&[1]) {
                warn!(error = %e, "Failed to signal monitor thread");
            }
        }
        drop(worker.control);

        if worker.thread.join().is_err() {
            error!("Monitor thread panicked");
        }
        info!("Device monitor stopped");
    }
}

impl Drop for DeviceMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

// ============================================================================
// Worker Loop
// ============================================================================

fn run_worker(
    mut backend: Box<dyn PlatformBackend>,
    shared: Arc<Mutex<SharedState>>,
    control: UnixStream,
) {
    let mut fds = [
        libc::pollfd {
            fd: backend.event_fd(),
            events: libc::POLLIN,
            revents: 0,
        },
        libc::pollfd {
            fd: control.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        },
    ];

    loop {
        for fd in &mut fds {
            fd.revents = 0;
        }

        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            error!(error = %err, "Monitor wait failed");
            lock(&shared).broadcast_exit();
            return;
        }

        if fds[1].revents != 0 {
            debug!("Monitor thread stop requested");
            return;
        }

        let revents = fds[0].revents;
        if revents & (libc::POLLIN | libc::POLLHUP) != 0 {
            match backend.next_event() {
                Ok(Some(event)) => handle_event(&shared, event),
                Ok(None) => {}
                Err(e) => {
                    error!(error = %e, "Device event source failed");
                    lock(&shared).broadcast_exit();
                    return;
                }
            }
        } else if revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
            error!(revents, "Device event source in error state");
            lock(&shared).broadcast_exit();
            return;
        }
    }
}

fn handle_event(shared: &Mutex<SharedState>, event: BackendEvent) {
    let BackendEvent { record, action } = event;
    let mut state = lock(shared);

    if !state.accept(&record, action) {
        debug!(path = %record.path(), action = %action, "Ignoring redundant device event");
        return;
    }

    debug!(
        path = %record.path(),
        action = %action,
        queues = state.queues.len(),
        "Device event accepted"
    );
    state.fan_out(Arc::new(record), action);
}
