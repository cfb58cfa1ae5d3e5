//! Connection to the mediad daemon.
//!
//! This module provides the [`Client`] which handles:
//! - Connection to the daemon via Unix socket
//! - One request at a time, each bounded by the configured timeout
//! - Buffering notifications that arrive while a request is in flight
//!
//! **Panic-Free Policy:** This module follows the project's panic-free guidelines.
//! No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, or `todo!()`.

use std::collections::VecDeque;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::time::timeout;
use tracing::debug;

use mediad_protocol::{parse_line, Command, DaemonLine, DeviceDescription, Line, Notification};

use crate::error::{ClientError, Result};

/// Default socket path, matching the daemon's default.
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/mediad.sock";

/// Environment variable overriding the socket path.
pub const SOCKET_ENV: &str = "MEDIAD_SOCKET";

/// Default bound for one request.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the daemon client.
///
/// # Example
///
/// ```rust
/// use mediad_client::ClientConfig;
/// use std::time::Duration;
///
/// let config = ClientConfig {
///     timeout: Duration::from_secs(2),
///     ..ClientConfig::new("/tmp/mediad.sock")
/// };
/// assert_eq!(config.socket_path.to_str(), Some("/tmp/mediad.sock"));
/// ```
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Path to the Unix socket where the daemon listens.
    pub socket_path: PathBuf,

    /// Upper bound for connecting and for each request.
    pub timeout: Duration,
}

impl ClientConfig {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl Default for ClientConfig {
    /// Uses `MEDIAD_SOCKET` if set, else the default socket path.
    fn default() -> Self {
        let socket_path = std::env::var_os(SOCKET_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_PATH));
        Self::new(socket_path)
    }
}

// ============================================================================
// Client
// ============================================================================

/// A connection to the daemon.
///
/// Requests are issued one at a time. The daemon sends device notifications
/// to every client at any moment, so lines that are not part of the current
/// answer are queued and handed out by [`next_notification`](Self::next_notification)
/// in arrival order.
///
/// After a [`ClientError::Timeout`] the connection is left mid-answer and
/// should be dropped.
pub struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    timeout: Duration,
    notifications: VecDeque<Notification>,
}

impl Client {
    /// Connects to the daemon.
    pub async fn connect(config: &ClientConfig) -> Result<Self> {
        let stream = timeout(config.timeout, UnixStream::connect(&config.socket_path))
            .await
            .map_err(|_| ClientError::Timeout(config.timeout))?
            .map_err(|source| ClientError::Connect {
                path: config.socket_path.clone(),
                source,
            })?;

        debug!(socket = %config.socket_path.display(), "Connected to daemon");
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
            timeout: config.timeout,
            notifications: VecDeque::new(),
        })
    }

    /// Every known device, each root followed by its partitions.
    pub async fn list_all(&mut self) -> Result<Vec<DeviceDescription>> {
        let body = self.request(Command::ListAllRemovableDevices).await?;
        devices(body)
    }

    /// The device at `path` and its partitions. `"/"` lists everything.
    pub async fn list_device(&mut self, path: &str) -> Result<Vec<DeviceDescription>> {
        let body = self
            .request(Command::ListRemovableDevice {
                path: path.to_string(),
            })
            .await?;
        devices(body)
    }

    /// Mounts `path`; `None` selects the filesystem's default options.
    pub async fn mount(&mut self, path: &str, options: Option<&str>) -> Result<()> {
        self.request(Command::Mount {
            path: path.to_string(),
            options: options.map(str::to_string),
        })
        .await
        .map(drop)
    }

    pub async fn unmount(&mut self, path: &str) -> Result<()> {
        self.request(Command::Unmount {
            path: path.to_string(),
        })
        .await
        .map(drop)
    }

    /// Detaches a whole device. Daemons with poweroff disabled close the
    /// connection instead of answering.
    pub async fn poweroff(&mut self, path: &str) -> Result<()> {
        self.request(Command::Poweroff {
            path: path.to_string(),
        })
        .await
        .map(drop)
    }

    pub async fn supported_filesystems(&mut self) -> Result<Vec<String>> {
        let body = self.request(Command::ListSupportedFilesystems).await?;
        body.into_iter()
            .find_map(|line| match line {
                DaemonLine::SupportedFilesystems(names) => Some(names),
                _ => None,
            })
            .ok_or_else(|| ClientError::Protocol("missing supported_filesystems".to_string()))
    }

    pub async fn supported_filesystem_options(&mut self, filesystem: &str) -> Result<Vec<String>> {
        let body = self
            .request(Command::ListSupportedFilesystemOptions {
                filesystem: filesystem.to_string(),
            })
            .await?;
        body.into_iter()
            .find_map(|line| match line {
                DaemonLine::SupportedFilesystemOptions(options) => Some(options),
                _ => None,
            })
            .ok_or_else(|| {
                ClientError::Protocol("missing supported_filesystem_options".to_string())
            })
    }

    /// Waits for the next notification. Not bounded by the timeout.
    pub async fn next_notification(&mut self) -> Result<Notification> {
        if let Some(notification) = self.notifications.pop_front() {
            return Ok(notification);
        }
        match self.read_line().await? {
            DaemonLine::Notification(notification) => Ok(notification),
            other => Err(ClientError::Protocol(format!(
                "unsolicited {}",
                other.to_line()
            ))),
        }
    }

    /// Notifications received but not yet taken.
    pub fn pending_notifications(&self) -> usize {
        self.notifications.len()
    }

    /// Sends `command` and collects its answer within the timeout.
    ///
    /// Returns the lines between `started` and `finished` for listings, and
    /// nothing for one-shot commands.
    async fn request(&mut self, command: Command) -> Result<Vec<DaemonLine>> {
        let limit = self.timeout;
        timeout(limit, self.exchange(&command))
            .await
            .map_err(|_| ClientError::Timeout(limit))?
    }

    async fn exchange(&mut self, command: &Command) -> Result<Vec<DaemonLine>> {
        let sent = command.to_line();
        let wire = sent.to_wire();
        self.writer
            .write_all(wire.as_bytes())
            .await
            .map_err(disconnected)?;

        let listing = is_listing(command);
        let mut started = false;
        let mut body = Vec::new();

        loop {
            match self.read_line().await? {
                DaemonLine::Notification(notification) => {
                    self.notifications.push_back(notification);
                }
                DaemonLine::Failed {
                    command: name,
                    args,
                    code,
                } if answers(&sent, &name, &args) => {
                    return Err(ClientError::Failed {
                        command: name,
                        code,
                    });
                }
                DaemonLine::Succeeded { command: name, args }
                    if !listing && answers(&sent, &name, &args) =>
                {
                    return Ok(body);
                }
                DaemonLine::Started { command: name, args }
                    if listing && !started && answers(&sent, &name, &args) =>
                {
                    started = true;
                }
                DaemonLine::Finished { command: name, args }
                    if started && answers(&sent, &name, &args) =>
                {
                    return Ok(body);
                }
                line if started => body.push(line),
                line => {
                    return Err(ClientError::Protocol(format!(
                        "unexpected {} while waiting for {}",
                        line.to_line(),
                        command.name()
                    )))
                }
            }
        }
    }

    async fn read_line(&mut self) -> Result<DaemonLine> {
        let mut buf = String::new();
        let n = self.reader.read_line(&mut buf).await.map_err(disconnected)?;
        if n == 0 || !buf.ends_with('\n') {
            return Err(ClientError::Disconnected);
        }
        let line = parse_line(buf.trim_end_matches('\n'))?;
        Ok(DaemonLine::try_from(line)?)
    }
}

fn is_listing(command: &Command) -> bool {
    matches!(
        command,
        Command::ListAllRemovableDevices
            | Command::ListRemovableDevice { .. }
            | Command::ListSupportedFilesystems
            | Command::ListSupportedFilesystemOptions { .. }
    )
}

/// Whether a response echo names the sent line with its exact arguments.
///
/// Compares against the line as written, since the daemon only ever sees
/// (and echoes) the formatted arguments.
fn answers(sent: &Line, name: &str, args: &[Option<String>]) -> bool {
    name == sent.name() && args == sent.args()
}

fn devices(body: Vec<DaemonLine>) -> Result<Vec<DeviceDescription>> {
    body.into_iter()
        .map(|line| match line {
            DaemonLine::Device(device) => Ok(device),
            other => Err(ClientError::Protocol(format!(
                "expected a device description, got {}",
                other.to_line()
            ))),
        })
        .collect()
}

fn disconnected(e: io::Error) -> ClientError {
    match e.kind() {
        io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::UnexpectedEof => ClientError::Disconnected,
        _ => ClientError::Io(e),
    }
}
