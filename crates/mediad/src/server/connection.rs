//! Per-client socket tasks.
//!
//! Each accepted socket is split into a reader task and a writer task. They
//! only move bytes: the reader forwards whatever arrives to the event loop as
//! [`ClientEvent`]s and the writer drains the client's outbound queue. All
//! framing and protocol state stays in the event loop.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Socket errors end the task and are reported as a close

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::debug;

use super::clients::{ClientError, ClientId};

/// Lines a client may have queued before it counts as a failed write.
pub const OUTBOUND_QUEUE_LEN: usize = 1024;

/// Bytes requested per socket read
const READ_CHUNK: usize = 1024;

/// Write timeout (10 seconds)
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// What a connection reports back to the event loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Data { id: ClientId, bytes: Vec<u8> },
    Closed { id: ClientId },
}

/// Handle to one client's socket tasks.
pub struct Connection {
    id: ClientId,
    outbound: mpsc::Sender<String>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Connection {
    /// Splits `stream` and spawns its reader and writer tasks.
    pub fn spawn(id: ClientId, stream: UnixStream, events: mpsc::Sender<ClientEvent>) -> Self {
        let (reader, writer) = stream.into_split();
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_LEN);

        let reader = tokio::spawn(read_loop(id, reader, events));
        let writer = tokio::spawn(write_loop(id, writer, outbound_rx));

        Self {
            id,
            outbound,
            reader,
            writer,
        }
    }

    /// Queues a line without waiting.
    pub fn send(&self, line: String) -> Result<(), ClientError> {
        self.outbound.try_send(line).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ClientError::QueueFull(self.id),
            mpsc::error::TrySendError::Closed(_) => ClientError::Closed(self.id),
        })
    }

    /// Closes the socket now. Lines still queued are discarded.
    pub fn close(self) {
        self.reader.abort();
        self.writer.abort();
    }
}

async fn read_loop(id: ClientId, mut reader: OwnedReadHalf, events: mpsc::Sender<ClientEvent>) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                debug!(client_id = %id, "Client sent EOF");
                break;
            }
            Ok(n) => {
                let bytes = buf.get(..n).unwrap_or_default().to_vec();
                if events.send(ClientEvent::Data { id, bytes }).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                debug!(client_id = %id, error = %e, "Client read failed");
                break;
            }
        }
    }
    let _ = events.send(ClientEvent::Closed { id }).await;
}

async fn write_loop(id: ClientId, writer: OwnedWriteHalf, mut outbound: mpsc::Receiver<String>) {
    let mut writer = BufWriter::new(writer);
    while let Some(line) = outbound.recv().await {
        let result = timeout(WRITE_TIMEOUT, async {
            writer.write_all(line.as_bytes()).await?;
            while let Ok(more) = outbound.try_recv() {
                writer.write_all(more.as_bytes()).await?;
            }
            writer.flush().await
        })
        .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(client_id = %id, error = %e, "Client write failed");
                return;
            }
            Err(_) => {
                debug!(client_id = %id, "Client write timed out");
                return;
            }
        }
    }
    let _ = writer.shutdown().await;
}
