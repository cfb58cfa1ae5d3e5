//! Device lifecycle actions produced by the monitor.

use serde::{Deserialize, Serialize};
use std::fmt;

/// What happened to a device, as reported by the platform event source.
///
/// `Add`/`Online` are handled identically by consumers (insert if absent),
/// as are `Remove`/`Offline` (remove if present).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceAction {
    Add,
    Online,
    Remove,
    Offline,
    Change,
}

impl DeviceAction {
    /// Parses a kernel/udev `ACTION` value. Unknown actions are noise.
    pub fn from_uevent(action: &str) -> Option<Self> {
        match action {
            "add" => Some(DeviceAction::Add),
            "online" => Some(DeviceAction::Online),
            "remove" => Some(DeviceAction::Remove),
            "offline" => Some(DeviceAction::Offline),
            "change" => Some(DeviceAction::Change),
            _ => None,
        }
    }

    /// Returns true for `Add` and `Online`.
    pub fn is_insert(&self) -> bool {
        matches!(self, DeviceAction::Add | DeviceAction::Online)
    }

    /// Returns true for `Remove` and `Offline`.
    pub fn is_removal(&self) -> bool {
        matches!(self, DeviceAction::Remove | DeviceAction::Offline)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceAction::Add => "add",
            DeviceAction::Online => "online",
            DeviceAction::Remove => "remove",
            DeviceAction::Offline => "offline",
            DeviceAction::Change => "change",
        }
    }
}

impl fmt::Display for DeviceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
