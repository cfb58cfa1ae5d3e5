//! Connected clients and their partially received commands.
//!
//! The registry is owned by the event loop. Each entry holds the client's
//! frame buffer and the outbound side of its connection; socket I/O itself
//! happens in the connection tasks.

use std::collections::BTreeMap;
use std::fmt;
use std::os::unix::io::{AsRawFd, RawFd};

use thiserror::Error;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tracing::debug;

use mediad_protocol::MAX_COMMAND_LENGTH;

use super::connection::{ClientEvent, Connection};

/// Identifier of one accepted connection. Never reused within a daemon run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientId(u64);

impl ClientId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// A client broke framing; the connection must be closed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("command exceeds {max} bytes without a newline")]
    Overflow { max: usize },

    #[error("command is not valid UTF-8")]
    InvalidUtf8,
}

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("socket fd {fd} is already registered")]
    Duplicate { fd: RawFd },

    #[error("unknown client {0}")]
    NotFound(ClientId),

    #[error("outbound queue of {0} is full")]
    QueueFull(ClientId),

    #[error("connection of {0} is closed")]
    Closed(ClientId),
}

/// Frames completed by one read, and the violation that ended it if any.
///
/// Frames that completed before a violation are still delivered.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Fed {
    pub frames: Vec<String>,
    pub error: Option<FrameError>,
}

/// Accumulates bytes until complete newline-terminated frames are present.
#[derive(Debug)]
pub struct FrameBuffer {
    buf: Vec<u8>,
    max: usize,
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new(MAX_COMMAND_LENGTH)
    }
}

impl FrameBuffer {
    pub fn new(max: usize) -> Self {
        Self {
            buf: Vec::new(),
            max,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Takes the next complete frame, without its newline.
    ///
    /// A frame whose content reaches the maximum length is an overflow no
    /// matter how the bytes were split across reads.
    pub fn next_frame(&mut self) -> Result<Option<String>, FrameError> {
        let Some(end) = self.buf.iter().position(|&b| b == b'\n') else {
            if self.buf.len() >= self.max {
                return Err(FrameError::Overflow { max: self.max });
            }
            return Ok(None);
        };
        if end >= self.max {
            return Err(FrameError::Overflow { max: self.max });
        }

        let mut frame: Vec<u8> = self.buf.drain(..=end).collect();
        frame.pop();
        String::from_utf8(frame)
            .map(Some)
            .map_err(|_| FrameError::InvalidUtf8)
    }

    /// Feeds `bytes` and returns every frame now complete, in order.
    pub fn feed(&mut self, bytes: &[u8]) -> Fed {
        self.push(bytes);
        let mut fed = Fed::default();
        loop {
            match self.next_frame() {
                Ok(Some(frame)) => fed.frames.push(frame),
                Ok(None) => break,
                Err(e) => {
                    fed.error = Some(e);
                    break;
                }
            }
        }
        fed
    }

    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

struct ClientEntry {
    fd: RawFd,
    frames: FrameBuffer,
    connection: Connection,
}

/// Every connected client, keyed by id in accept order.
pub struct ClientRegistry {
    clients: BTreeMap<ClientId, ClientEntry>,
    next_id: u64,
    events: mpsc::Sender<ClientEvent>,
}

impl ClientRegistry {
    /// Creates a registry whose connections report to `events`.
    pub fn new(events: mpsc::Sender<ClientEvent>) -> Self {
        Self {
            clients: BTreeMap::new(),
            next_id: 0,
            events,
        }
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.clients.contains_key(&id)
    }

    pub fn ids(&self) -> Vec<ClientId> {
        self.clients.keys().copied().collect()
    }

    /// Registers an accepted socket and starts its connection tasks.
    ///
    /// A socket whose fd is already registered is dropped, closing it.
    pub fn accept(&mut self, stream: UnixStream) -> Result<ClientId, ClientError> {
        let fd = stream.as_raw_fd();
        if self.clients.values().any(|entry| entry.fd == fd) {
            return Err(ClientError::Duplicate { fd });
        }

        let id = ClientId::new(self.next_id);
        self.next_id += 1;

        let connection = Connection::spawn(id, stream, self.events.clone());
        self.clients.insert(
            id,
            ClientEntry {
                fd,
                frames: FrameBuffer::default(),
                connection,
            },
        );
        debug!(client_id = %id, fd, clients = self.clients.len(), "Client connected");
        Ok(id)
    }

    /// Appends received bytes and returns the complete frames, in order.
    pub fn feed(&mut self, id: ClientId, bytes: &[u8]) -> Fed {
        match self.clients.get_mut(&id) {
            Some(entry) => entry.frames.feed(bytes),
            None => Fed::default(),
        }
    }

    /// Queues one line for `id`.
    pub fn send(&self, id: ClientId, line: &str) -> Result<(), ClientError> {
        let entry = self.clients.get(&id).ok_or(ClientError::NotFound(id))?;
        entry.connection.send(line.to_string())
    }

    /// Queues `line` for every client.
    ///
    /// Returns the clients whose queue rejected it; the caller removes them
    /// once the broadcast is complete.
    #[must_use]
    pub fn broadcast(&self, line: &str) -> Vec<ClientId> {
        let mut failed_clients = Vec::new();
        for (id, entry) in &self.clients {
            if let Err(e) = entry.connection.send(line.to_string()) {
                debug!(client_id = %id, error = %e, "Failed to queue broadcast");
                failed_clients.push(*id);
            }
        }
        failed_clients
    }

    /// Disconnects and forgets `id`. Unknown ids are ignored.
    pub fn remove(&mut self, id: ClientId) -> bool {
        match self.clients.remove(&id) {
            Some(entry) => {
                entry.connection.close();
                debug!(client_id = %id, clients = self.clients.len(), "Client removed");
                true
            }
            None => false,
        }
    }

    /// Disconnects every client.
    pub fn clear(&mut self) {
        let ids = self.ids();
        for id in ids {
            self.remove(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_buffer_splits_lines() {
        let mut frames = FrameBuffer::default();
        let out = frames.feed(b"unmount(\"/dev/sdb1\")\nlist_all_rem").frames;
        assert_eq!(out, vec!["unmount(\"/dev/sdb1\")".to_string()]);
        assert_eq!(frames.pending(), "list_all_rem".len());

        let out = frames.feed(b"ovable_devices()\n").frames;
        assert_eq!(out, vec!["list_all_removable_devices()".to_string()]);
        assert_eq!(frames.pending(), 0);
    }

    #[test]
    fn test_byte_by_byte_matches_all_at_once() {
        let input = b"list_all_removable_devices()\nmount(\"/dev/sdb1\", nil)\n\nunmount(\"/dev/sdb1\")\n";

        let mut whole = FrameBuffer::default();
        let expected = whole.feed(input).frames;

        let mut split = FrameBuffer::default();
        let mut got = Vec::new();
        for byte in input.iter() {
            got.extend(split.feed(std::slice::from_ref(byte)).frames);
        }

        assert_eq!(expected.len(), 4);
        assert_eq!(got, expected);
    }

    #[test]
    fn test_overflow_without_newline() {
        let mut frames = FrameBuffer::new(8);
        assert_eq!(frames.feed(b"1234567"), Fed::default());
        assert_eq!(frames.feed(b"8").error, Some(FrameError::Overflow { max: 8 }));
    }

    #[test]
    fn test_overflow_detected_in_single_read() {
        let mut frames = FrameBuffer::new(8);
        assert_eq!(
            frames.feed(b"123456789\n").error,
            Some(FrameError::Overflow { max: 8 })
        );

        let mut frames = FrameBuffer::new(8);
        assert_eq!(frames.feed(b"1234567\n").frames, vec!["1234567".to_string()]);
    }

    #[test]
    fn test_frames_before_overflow_match_split_reads() {
        let input = b"ok()\n0123456789";

        let mut whole = FrameBuffer::new(8);
        let fed = whole.feed(input);
        assert_eq!(fed.frames, vec!["ok()".to_string()]);
        assert!(fed.error.is_some());

        let mut split = FrameBuffer::new(8);
        let mut got = Vec::new();
        let mut overflowed = false;
        for byte in input.iter() {
            let fed = split.feed(std::slice::from_ref(byte));
            got.extend(fed.frames);
            if fed.error.is_some() {
                overflowed = true;
                break;
            }
        }
        assert_eq!(got, vec!["ok()".to_string()]);
        assert!(overflowed);
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let mut frames = FrameBuffer::default();
        assert_eq!(frames.feed(b"\xff\xfe()\n").error, Some(FrameError::InvalidUtf8));
    }

    #[tokio::test]
    async fn test_registry_accept_broadcast_remove() {
        let (events_tx, _events_rx) = mpsc::channel(16);
        let mut registry = ClientRegistry::new(events_tx);

        let (server_a, _peer_a) = UnixStream::pair().unwrap();
        let (server_b, _peer_b) = UnixStream::pair().unwrap();
        let a = registry.accept(server_a).unwrap();
        let b = registry.accept(server_b).unwrap();
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);

        assert!(registry.broadcast("removable_device_removed(\"/dev/sdb\")\n").is_empty());

        assert!(registry.remove(a));
        assert!(!registry.remove(a));
        assert!(!registry.contains(a));
        assert!(registry.contains(b));
        assert!(matches!(registry.send(a, "x\n"), Err(ClientError::NotFound(_))));

        registry.clear();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_feed_unknown_client_is_empty() {
        let (events_tx, _events_rx) = mpsc::channel(16);
        let mut registry = ClientRegistry::new(events_tx);
        assert_eq!(registry.feed(ClientId::new(42), b"x()\n"), Fed::default());
    }
}
