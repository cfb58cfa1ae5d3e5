//! mediad Client - Library side of the mediad protocol
//!
//! Connects to the daemon's Unix socket, issues commands with a bounded wait
//! and collects the unsolicited device notifications the daemon sends to
//! every client.
//!
//! ```rust,ignore
//! use mediad_client::{Client, ClientConfig};
//!
//! let mut client = Client::connect(&ClientConfig::default()).await?;
//! for device in client.list_all().await? {
//!     println!("{} {}", device.path, device.kind);
//! }
//! client.mount("/dev/sdb1", None).await?;
//! ```
//!
//! **Panic-Free Policy:** No `.unwrap()`, `.expect()`, `panic!()`,
//! `unreachable!()`, or `todo!()` outside tests.

pub mod client;
pub mod error;

pub use client::{Client, ClientConfig, DEFAULT_TIMEOUT};
pub use error::{ClientError, Result};
