//! mediad Core - Shared types for removable media tracking
//!
//! This crate provides the domain types shared between the daemon
//! (`mediad`), the wire protocol and the client library.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod action;
pub mod device;
pub mod error;
pub mod mount;

// Re-exports for convenience
pub use action::DeviceAction;
pub use device::{DeviceKind, DeviceRecord, DeviceSubtype, Media, MediaState, ROOT_PATH};
pub use error::{DomainError, DomainResult, ErrorCode};
pub use mount::{MountEntry, MountInfo};
