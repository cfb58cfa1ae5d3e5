//! Device records - one physical device or partition at a point in time.
//!
//! A `DeviceRecord` is built once by the monitor and then shared (behind an
//! `Arc`) between every consumer that receives it. Nothing mutates a record
//! after construction; a changed device is described by a new record for the
//! same path.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Parent path used by root-level devices.
pub const ROOT_PATH: &str = "/";

// ============================================================================
// Enumerations
// ============================================================================

/// Coarse classification of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Partition,
    /// Disk or SD card; always ready once present
    StatelessDevice,
    /// Optical drive; media may come and go
    StatefulDevice,
}

impl DeviceKind {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Partition => "partition",
            DeviceKind::StatelessDevice => "device",
            DeviceKind::StatefulDevice => "stateful_device",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "partition" => Some(DeviceKind::Partition),
            "device" => Some(DeviceKind::StatelessDevice),
            "stateful_device" => Some(DeviceKind::StatefulDevice),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hardware flavour of a root device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceSubtype {
    RemovableDisk,
    SdCard,
    Cdrom,
    Unknown,
}

impl DeviceSubtype {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceSubtype::RemovableDisk => "removable_disk",
            DeviceSubtype::SdCard => "sd_card",
            DeviceSubtype::Cdrom => "cdrom",
            DeviceSubtype::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "removable_disk" => Some(DeviceSubtype::RemovableDisk),
            "sd_card" => Some(DeviceSubtype::SdCard),
            "cdrom" => Some(DeviceSubtype::Cdrom),
            "unknown" => Some(DeviceSubtype::Unknown),
            _ => None,
        }
    }
}

/// Media state of a stateful device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaState {
    Unknown,
    /// No media inserted
    Empty,
    /// Blank media
    Clear,
    /// Media with data
    Ok,
}

impl MediaState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaState::Unknown => "unknown",
            MediaState::Empty => "empty",
            MediaState::Clear => "clear",
            MediaState::Ok => "ok",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unknown" => Some(MediaState::Unknown),
            "empty" => Some(MediaState::Empty),
            "clear" => Some(MediaState::Clear),
            "ok" => Some(MediaState::Ok),
            _ => None,
        }
    }
}

// ============================================================================
// Media Variant
// ============================================================================

/// Kind-specific payload of a record.
///
/// Fields that only make sense for some kinds live only in those variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Media {
    Stateless {
        subtype: DeviceSubtype,
    },
    Stateful {
        subtype: DeviceSubtype,
        state: MediaState,
        filesystem: Option<String>,
        label: Option<String>,
    },
    Partition {
        /// Device node of the owning disk
        parent: String,
        filesystem: Option<String>,
        label: Option<String>,
    },
}

impl Media {
    pub fn kind(&self) -> DeviceKind {
        match self {
            Media::Stateless { .. } => DeviceKind::StatelessDevice,
            Media::Stateful { .. } => DeviceKind::StatefulDevice,
            Media::Partition { .. } => DeviceKind::Partition,
        }
    }
}

// ============================================================================
// Device Record
// ============================================================================

/// One device or partition, immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    path: String,
    media: Media,
    /// Opaque backend tag (sysfs path on Linux)
    #[serde(skip_serializing_if = "Option::is_none")]
    platform_tag: Option<String>,
}

impl DeviceRecord {
    /// Builds a record, validating the path and parent linkage.
    ///
    /// Empty optional strings are normalised to `None` so that consumers
    /// only ever see meaningful values.
    pub fn new(path: impl Into<String>, media: Media) -> DomainResult<Self> {
        let path = path.into();
        if path.is_empty() || !path.starts_with('/') || path == ROOT_PATH {
            return Err(DomainError::InvalidPath { path });
        }

        let media = match media {
            Media::Partition {
                parent,
                filesystem,
                label,
            } => {
                if parent.is_empty() || parent == path || parent == ROOT_PATH {
                    return Err(DomainError::InvalidParent { path, parent });
                }
                Media::Partition {
                    parent,
                    filesystem: non_empty(filesystem),
                    label: non_empty(label),
                }
            }
            Media::Stateful {
                subtype,
                state,
                filesystem,
                label,
            } => Media::Stateful {
                subtype,
                state,
                filesystem: non_empty(filesystem),
                label: non_empty(label),
            },
            other => other,
        };

        Ok(Self {
            path,
            media,
            platform_tag: None,
        })
    }

    /// Shorthand for a disk or SD card record.
    pub fn stateless(path: impl Into<String>, subtype: DeviceSubtype) -> DomainResult<Self> {
        Self::new(path, Media::Stateless { subtype })
    }

    /// Shorthand for a partition record.
    pub fn partition(
        path: impl Into<String>,
        parent: impl Into<String>,
        filesystem: Option<String>,
        label: Option<String>,
    ) -> DomainResult<Self> {
        Self::new(
            path,
            Media::Partition {
                parent: parent.into(),
                filesystem,
                label,
            },
        )
    }

    /// Shorthand for an optical drive record.
    pub fn stateful(
        path: impl Into<String>,
        subtype: DeviceSubtype,
        state: MediaState,
        filesystem: Option<String>,
        label: Option<String>,
    ) -> DomainResult<Self> {
        Self::new(
            path,
            Media::Stateful {
                subtype,
                state,
                filesystem,
                label,
            },
        )
    }

    /// Attaches the backend's opaque tag.
    #[must_use]
    pub fn with_platform_tag(mut self, tag: impl Into<String>) -> Self {
        self.platform_tag = Some(tag.into());
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn media(&self) -> &Media {
        &self.media
    }

    pub fn kind(&self) -> DeviceKind {
        self.media.kind()
    }

    /// Owning disk for partitions, [`ROOT_PATH`] for everything else.
    pub fn parent_path(&self) -> &str {
        match &self.media {
            Media::Partition { parent, .. } => parent,
            _ => ROOT_PATH,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_path() == ROOT_PATH
    }

    pub fn subtype(&self) -> Option<DeviceSubtype> {
        match &self.media {
            Media::Stateless { subtype } | Media::Stateful { subtype, .. } => Some(*subtype),
            Media::Partition { .. } => None,
        }
    }

    pub fn state(&self) -> Option<MediaState> {
        match &self.media {
            Media::Stateful { state, .. } => Some(*state),
            _ => None,
        }
    }

    pub fn filesystem(&self) -> Option<&str> {
        match &self.media {
            Media::Stateful { filesystem, .. } | Media::Partition { filesystem, .. } => {
                filesystem.as_deref()
            }
            Media::Stateless { .. } => None,
        }
    }

    pub fn label(&self) -> Option<&str> {
        match &self.media {
            Media::Stateful { label, .. } | Media::Partition { label, .. } => label.as_deref(),
            Media::Stateless { .. } => None,
        }
    }

    pub fn platform_tag(&self) -> Option<&str> {
        self.platform_tag.as_deref()
    }

    /// Whether the record can carry mount state at all.
    ///
    /// Partitions always can; optical drives only while media with data is
    /// inserted; plain disks never (their partitions are mounted instead).
    pub fn is_mountable(&self) -> bool {
        match &self.media {
            Media::Partition { .. } => true,
            Media::Stateful { state, .. } => *state == MediaState::Ok,
            Media::Stateless { .. } => false,
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}
