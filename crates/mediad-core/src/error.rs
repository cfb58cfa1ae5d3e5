//! Domain-specific error types following panic-free policy.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur in domain operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Device node path is empty or not absolute
    #[error("Invalid device path: {path:?}")]
    InvalidPath { path: String },

    /// Partition names itself (or nothing) as its parent
    #[error("Invalid parent {parent:?} for partition {path}")]
    InvalidParent { path: String, parent: String },

    /// Invalid field value
    #[error("Invalid {field}: {value} (expected {expected})")]
    InvalidFieldValue {
        field: String,
        value: String,
        expected: String,
    },
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;

// ============================================================================
// Protocol Error Codes
// ============================================================================

/// The closed set of error codes reported to clients in `failed(...)` lines.
///
/// Codes are produced by the mount layer and surfaced verbatim; nothing in
/// the dispatcher derives one from another.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    #[error("generic_error")]
    GenericError,
    #[error("no_such_removable_device")]
    NoSuchRemovableDevice,
    #[error("fstype_not_recognized")]
    FstypeNotRecognized,
    #[error("unsupported_fstype")]
    UnsupportedFstype,
    #[error("device_already_mounted")]
    DeviceAlreadyMounted,
    #[error("device_not_mounted")]
    DeviceNotMounted,
    #[error("failed_parsing_mount_options")]
    FailedParsingMountOptions,
    #[error("mount_point_busy")]
    MountPointBusy,
    #[error("unknown")]
    Unknown,
}

impl ErrorCode {
    /// All codes, in wire order.
    pub const ALL: [ErrorCode; 9] = [
        ErrorCode::GenericError,
        ErrorCode::NoSuchRemovableDevice,
        ErrorCode::FstypeNotRecognized,
        ErrorCode::UnsupportedFstype,
        ErrorCode::DeviceAlreadyMounted,
        ErrorCode::DeviceNotMounted,
        ErrorCode::FailedParsingMountOptions,
        ErrorCode::MountPointBusy,
        ErrorCode::Unknown,
    ];

    /// Returns the wire representation of this code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::GenericError => "generic_error",
            ErrorCode::NoSuchRemovableDevice => "no_such_removable_device",
            ErrorCode::FstypeNotRecognized => "fstype_not_recognized",
            ErrorCode::UnsupportedFstype => "unsupported_fstype",
            ErrorCode::DeviceAlreadyMounted => "device_already_mounted",
            ErrorCode::DeviceNotMounted => "device_not_mounted",
            ErrorCode::FailedParsingMountOptions => "failed_parsing_mount_options",
            ErrorCode::MountPointBusy => "mount_point_busy",
            ErrorCode::Unknown => "unknown",
        }
    }
}

impl FromStr for ErrorCode {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ErrorCode::ALL
            .iter()
            .copied()
            .find(|code| code.as_str() == s)
            .ok_or_else(|| DomainError::InvalidFieldValue {
                field: "error_code".to_string(),
                value: s.to_string(),
                expected: "a known error code".to_string(),
            })
    }
}
