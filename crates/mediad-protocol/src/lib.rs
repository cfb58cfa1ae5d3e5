//! mediad Protocol - Wire protocol for daemon communication
//!
//! Every message in either direction is one newline-terminated line of the
//! form `name(arg, arg, ...)`, where each argument is either `nil` or a
//! double-quoted string. This crate provides:
//! - [`line`] - the generic line parser/formatter
//! - [`command`] - typed client → daemon commands
//! - [`message`] - typed daemon → client responses, device descriptions
//!   and notifications

pub mod command;
pub mod line;
pub mod message;

pub use command::{Command, CommandError};
pub use line::{parse_line, Line, ParseError};
pub use message::{DaemonLine, DeviceDescription, MessageError, Notification};

/// Maximum number of bytes a client may have buffered without a newline.
pub const MAX_COMMAND_LENGTH: usize = 4096;

/// Listing tag for device description lines.
pub const DEVICE_TAG: &str = "removable_device";
