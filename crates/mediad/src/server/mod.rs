//! Unix socket event loop for the mediad daemon.
//!
//! The server:
//! - Listens on a Unix socket for client connections
//! - Feeds client bytes through the [`ClientRegistry`] framing into the
//!   [`ProtocolDispatcher`]
//! - Drains the [`MonitorQueue`] into the [`DeviceTree`] and broadcasts the
//!   resulting notifications
//! - Reconciles believed mount state with the system mount table
//! - Supports graceful shutdown via CancellationToken
//!
//! # Architecture
//!
//! ```text
//!  UnixListener        ClientEvent mpsc       MonitorQueue      MountTableWatcher
//!      │ accept()           │ Data/Closed          │ recv()            │ changed()
//!      ▼                    ▼                      ▼                   ▼
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                        DaemonServer::run (select!)                       │
//! │                                                                          │
//! │   ClientRegistry ──frames──▶ ProtocolDispatcher ──▶ DeviceTree           │
//! │        ▲                            │                   │                │
//! │        └──── replies / broadcast ◀──┴──── TreeEvents ◀──┘                │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Everything above runs on one task; only the per-client socket tasks and
//! the monitor thread live elsewhere, and both talk to the loop through
//! channels.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Client errors close that client only
//! - A fatal monitor error ends the loop with [`ServerError::MonitorExited`]

mod clients;
mod connection;
mod dispatch;

pub use clients::{ClientError, ClientId, ClientRegistry, Fed, FrameBuffer, FrameError};
pub use connection::{ClientEvent, Connection, OUTBOUND_QUEUE_LEN};
pub use dispatch::{Dispatch, ProtocolDispatcher};

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use mediad_core::DeviceAction;
use mediad_protocol::DaemonLine;

use crate::config::DaemonConfig;
use crate::monitor::{DeviceMonitor, MonitorError, MonitorQueue, QueueItem};
use crate::mounts::watcher::MountTableWatcher;
use crate::mounts::{MountOrchestrator, MountService};
use crate::tree::{DeviceTree, TreeEvent};

/// Pending reads from all clients before readers wait on the loop.
const CLIENT_EVENT_QUEUE_LEN: usize = 256;

/// Pause after a failed accept so a persistent error such as EMFILE does
/// not spin the loop.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// How the loop learns about mount table changes.
enum MountWatch {
    /// `/proc/self/mountinfo` priority events, polling as fallback
    System,
    Poll(Duration),
}

/// The daemon's event loop.
///
/// Owns the monitor and the dispatcher; the device tree and the client
/// registry are created inside [`run`](Self::run) and never leave it.
pub struct DaemonServer {
    /// Path to the Unix socket
    socket_path: PathBuf,

    monitor: DeviceMonitor,

    dispatcher: ProtocolDispatcher,

    mount_watch: MountWatch,

    /// Cancellation token for graceful shutdown
    cancel_token: CancellationToken,
}

impl DaemonServer {
    /// Creates a new daemon server.
    ///
    /// # Arguments
    ///
    /// * `config` - Socket path, mount directory, filesystem table
    /// * `monitor` - Device monitor, not yet started
    /// * `orchestrator` - Performs the actual mounts
    /// * `cancel_token` - Token for graceful shutdown
    pub fn new(
        config: &DaemonConfig,
        monitor: DeviceMonitor,
        orchestrator: impl MountOrchestrator + 'static,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            socket_path: config.socket_path.clone(),
            monitor,
            dispatcher: ProtocolDispatcher::new(
                MountService::new(config, orchestrator),
                config.enable_poweroff,
            ),
            mount_watch: MountWatch::System,
            cancel_token,
        }
    }

    /// Re-reads the mount table every `period` instead of watching it.
    #[must_use]
    pub fn with_mount_poll_interval(mut self, period: Duration) -> Self {
        self.mount_watch = MountWatch::Poll(period);
        self
    }

    /// Returns the socket path.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Runs the event loop.
    ///
    /// Binds the socket, starts the monitor and serves clients until the
    /// cancellation token fires (`Ok`) or the monitor dies (`Err`).
    pub async fn run(self) -> Result<(), ServerError> {
        let DaemonServer {
            socket_path,
            mut monitor,
            dispatcher,
            mount_watch,
            cancel_token,
        } = self;

        let listener = bind_socket(&socket_path)?;
        info!(socket = %socket_path.display(), "Daemon server listening");

        let mut queue = monitor.register();
        let snapshot = match monitor.start() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                remove_socket(&socket_path);
                return Err(e.into());
            }
        };

        let (events_tx, mut events_rx) = mpsc::channel(CLIENT_EVENT_QUEUE_LEN);
        let mut state = LoopState {
            tree: DeviceTree::new(),
            clients: ClientRegistry::new(events_tx),
            dispatcher,
        };
        for record in snapshot {
            state.tree.apply(record, DeviceAction::Add);
        }
        let _ = state.reconcile();
        info!(devices = state.tree.len(), "Device tree seeded");

        let mut watcher = match mount_watch {
            MountWatch::System => MountTableWatcher::open(),
            MountWatch::Poll(period) => MountTableWatcher::polling(period),
        };

        let result = loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    info!("Server shutdown requested");
                    break Ok(());
                }

                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => state.accept(stream),
                        Err(e) => accept_failed(&e).await,
                    }
                }

                Some(event) = events_rx.recv() => {
                    state.handle_client_event(event);
                }

                item = queue.recv() => {
                    if let Err(e) = state.handle_monitor_item(item, &mut queue) {
                        error!(error = %e, "Device monitoring failed");
                        break Err(e);
                    }
                }

                _ = watcher.changed() => {
                    let events = state.reconcile();
                    state.broadcast(&events);
                }
            }
        };

        // Cleanup
        state.clients.clear();
        drop(queue);
        monitor.stop();
        remove_socket(&socket_path);
        info!("Server cleanup complete");
        result
    }
}

/// State owned by the running loop.
struct LoopState {
    tree: DeviceTree,
    clients: ClientRegistry,
    dispatcher: ProtocolDispatcher,
}

impl LoopState {
    fn accept(&mut self, stream: UnixStream) {
        if let Err(e) = self.clients.accept(stream) {
            warn!(error = %e, "Rejected connection");
        }
    }

    fn handle_client_event(&mut self, event: ClientEvent) {
        match event {
            ClientEvent::Data { id, bytes } => self.handle_data(id, &bytes),
            ClientEvent::Closed { id } => {
                if self.clients.remove(id) {
                    debug!(client_id = %id, "Client disconnected");
                }
            }
        }
    }

    fn handle_data(&mut self, id: ClientId, bytes: &[u8]) {
        let fed = self.clients.feed(id, bytes);

        for frame in fed.frames {
            if !self.clients.contains(id) {
                return;
            }
            match self.dispatcher.dispatch(&mut self.tree, &frame) {
                Ok(dispatch) => {
                    self.broadcast(&dispatch.events);
                    self.reply(id, &dispatch.replies);
                }
                Err(e) => {
                    warn!(client_id = %id, error = %e, "Protocol violation, closing client");
                    self.clients.remove(id);
                    return;
                }
            }
        }

        if let Some(e) = fed.error {
            warn!(client_id = %id, error = %e, "Framing violation, closing client");
            self.clients.remove(id);
        }
    }

    fn reply(&mut self, id: ClientId, replies: &[DaemonLine]) {
        for line in replies {
            if let Err(e) = self.clients.send(id, &line.to_line().to_wire()) {
                debug!(client_id = %id, error = %e, "Failed to queue reply");
                self.clients.remove(id);
                return;
            }
        }
    }

    /// Applies `item` and everything else already queued, then reconciles
    /// and broadcasts the batch.
    fn handle_monitor_item(
        &mut self,
        item: Option<QueueItem>,
        queue: &mut MonitorQueue,
    ) -> Result<(), ServerError> {
        // `recv` yields nothing only once the monitor itself is gone.
        let Some(first) = item else {
            return Err(ServerError::MonitorExited);
        };

        let mut events = Vec::new();
        let mut next = Some(first);

        while let Some(item) = next {
            match item {
                QueueItem::Device { record, action } => {
                    debug!(path = %record.path(), action = %action, "Monitor action");
                    events.extend(self.tree.apply(record, action));
                }
                QueueItem::Exit => {
                    self.broadcast(&events);
                    return Err(ServerError::MonitorExited);
                }
            }
            next = queue.pop();
        }

        events.extend(self.reconcile());
        self.broadcast(&events);
        Ok(())
    }

    fn reconcile(&mut self) -> Vec<TreeEvent> {
        match self.dispatcher.mounts().current_mounts() {
            Ok(live) => self.tree.reconcile_mounts(&live),
            Err(e) => {
                warn!(error = %e, "Skipping mount reconciliation");
                Vec::new()
            }
        }
    }

    fn broadcast(&mut self, events: &[TreeEvent]) {
        for event in events {
            let line = DaemonLine::Notification(event.to_notification())
                .to_line()
                .to_wire();
            for id in self.clients.broadcast(&line) {
                self.clients.remove(id);
            }
        }
    }
}

fn bind_socket(socket_path: &Path) -> Result<UnixListener, ServerError> {
    let setup_error = |e: std::io::Error| ServerError::SocketSetup {
        path: socket_path.to_path_buf(),
        source: e,
    };

    // Remove existing socket file if present
    if socket_path.exists() {
        std::fs::remove_file(socket_path).map_err(setup_error)?;
    }

    // Create parent directory if needed
    if let Some(parent) = socket_path.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent).map_err(setup_error)?;
        }
    }

    UnixListener::bind(socket_path).map_err(setup_error)
}

fn remove_socket(socket_path: &Path) {
    if socket_path.exists() {
        if let Err(e) = std::fs::remove_file(socket_path) {
            warn!(
                socket = %socket_path.display(),
                error = %e,
                "Failed to remove socket file"
            );
        }
    }
}

/// Errors that end the event loop.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to setup socket at {path}: {source}")]
    SocketSetup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to start device monitor: {0}")]
    Monitor(#[from] MonitorError),

    #[error("Device monitor exited")]
    MonitorExited,
}

async fn accept_failed(e: &std::io::Error) {
    error!(error = %e, "Failed to accept connection");
    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
}
