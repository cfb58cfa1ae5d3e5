//! Error types for the mediad client.
//!
//! A request either fails locally (socket, timeout, unparseable reply) or is
//! answered by the daemon with `failed(...)`, which is surfaced as
//! [`ClientError::Failed`] carrying the daemon's error code unchanged.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use mediad_core::ErrorCode;
use mediad_protocol::{MessageError, ParseError};

/// Client errors.
#[derive(Error, Debug)]
pub enum ClientError {
    /// The daemon socket could not be reached.
    ///
    /// Usually the daemon is not running or the socket path is wrong.
    #[error("Failed to connect to daemon at {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The daemon closed the connection.
    ///
    /// The daemon closes clients that send malformed or unknown commands,
    /// and on shutdown. Reconnect to continue.
    #[error("Daemon closed the connection")]
    Disconnected,

    /// No complete answer within the configured timeout.
    #[error("No response from daemon within {0:?}")]
    Timeout(Duration),

    /// The daemon refused the request with an error code.
    #[error("{command} failed: {code}")]
    Failed { command: String, code: ErrorCode },

    /// A line from the daemon could not be parsed.
    #[error("Unparseable line from daemon: {0}")]
    Parse(#[from] ParseError),

    /// A parsed line did not have the expected shape.
    #[error("Unexpected message from daemon: {0}")]
    Message(#[from] MessageError),

    /// The daemon answered with something that does not belong to the request.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ClientError {
    /// The daemon's error code, if the request was refused.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            ClientError::Failed { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Result alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
