//! Daemon → client messages: responses, device descriptions, notifications.

use mediad_core::{
    DeviceKind, DeviceRecord, DeviceSubtype, ErrorCode, MediaState, MountInfo, ROOT_PATH,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::command::Command;
use crate::line::Line;
use crate::DEVICE_TAG;

pub const STARTED: &str = "started";
pub const FINISHED: &str = "finished";
pub const SUCCEEDED: &str = "succeeded";
pub const FAILED: &str = "failed";
pub const SUPPORTED_FILESYSTEMS: &str = "supported_filesystems";
pub const SUPPORTED_FILESYSTEM_OPTIONS: &str = "supported_filesystem_options";

pub const DEVICE_ADDED: &str = "removable_device_added";
pub const DEVICE_REMOVED: &str = "removable_device_removed";
pub const DEVICE_CHANGED: &str = "removable_device_changed";
pub const DEVICE_MOUNTED: &str = "removable_device_mounted";
pub const DEVICE_UNMOUNTED: &str = "removable_device_unmounted";

/// Errors converting a parsed line into a daemon message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("unknown message: {0}")]
    Unknown(String),

    #[error("malformed {message}: {reason}")]
    Malformed {
        message: String,
        reason: String,
    },
}

impl MessageError {
    fn malformed(message: &str, reason: impl Into<String>) -> Self {
        Self::Malformed {
            message: message.to_string(),
            reason: reason.into(),
        }
    }
}

// ============================================================================
// Device Description
// ============================================================================

/// Everything a client learns about one device from a description line.
///
/// Field sets on the wire depend on the kind:
///
/// ```text
/// stateless: (parent, path, "device", subtype)
/// stateful:  (parent, path, "stateful_device", subtype, state, fstype, label, mnt_point, mnt_opts)
/// partition: (parent, path, "partition", fstype, label, mnt_point, mnt_opts)
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescription {
    pub parent_path: String,
    pub path: String,
    pub kind: DeviceKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtype: Option<DeviceSubtype>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<MediaState>,
    pub filesystem: Option<String>,
    pub label: Option<String>,
    pub mount: Option<MountInfo>,
}

impl DeviceDescription {
    /// Describes a record together with its current mount state.
    pub fn from_record(record: &DeviceRecord, mount: Option<&MountInfo>) -> Self {
        Self {
            parent_path: record.parent_path().to_string(),
            path: record.path().to_string(),
            kind: record.kind(),
            subtype: record.subtype(),
            state: record.state(),
            filesystem: record.filesystem().map(str::to_string),
            label: record.label().map(str::to_string),
            mount: mount.cloned(),
        }
    }

    /// Wire arguments in kind-specific order.
    pub fn to_args(&self) -> Vec<Option<String>> {
        let mut args = vec![
            Some(self.parent_path.clone()),
            Some(self.path.clone()),
            Some(self.kind.as_str().to_string()),
        ];

        let subtype = self
            .subtype
            .unwrap_or(DeviceSubtype::Unknown)
            .as_str()
            .to_string();
        let mount_point = self.mount.as_ref().map(|m| m.mount_point.clone());
        let mount_options = self.mount.as_ref().map(|m| m.options.clone());

        match self.kind {
            DeviceKind::StatelessDevice => {
                args.push(Some(subtype));
            }
            DeviceKind::StatefulDevice => {
                args.push(Some(subtype));
                args.push(Some(
                    self.state.unwrap_or(MediaState::Unknown).as_str().to_string(),
                ));
                args.push(self.filesystem.clone());
                args.push(self.label.clone());
                args.push(mount_point);
                args.push(mount_options);
            }
            DeviceKind::Partition => {
                args.push(self.filesystem.clone());
                args.push(self.label.clone());
                args.push(mount_point);
                args.push(mount_options);
            }
        }

        args
    }

    /// Parses the arguments of a description line (listing or notification).
    pub fn from_args(message: &str, args: &[Option<String>]) -> Result<Self, MessageError> {
        let text = |index: usize, field: &str| -> Result<String, MessageError> {
            args.get(index)
                .cloned()
                .flatten()
                .ok_or_else(|| MessageError::malformed(message, format!("missing {field}")))
        };
        let optional = |index: usize| -> Option<String> { args.get(index).cloned().flatten() };

        let parent_path = text(0, "parent path")?;
        let path = text(1, "path")?;
        let kind_name = text(2, "kind")?;
        let kind = DeviceKind::parse(&kind_name)
            .ok_or_else(|| MessageError::malformed(message, format!("bad kind {kind_name:?}")))?;

        let expected = match kind {
            DeviceKind::StatelessDevice => 4,
            DeviceKind::StatefulDevice => 9,
            DeviceKind::Partition => 7,
        };
        if args.len() != expected {
            return Err(MessageError::malformed(
                message,
                format!("{kind} expects {expected} arguments, got {}", args.len()),
            ));
        }

        let mount_from = |point: usize| -> Option<MountInfo> {
            optional(point).map(|mount_point| {
                MountInfo::new(mount_point, optional(point + 1).unwrap_or_default())
            })
        };

        let description = match kind {
            DeviceKind::StatelessDevice => Self {
                parent_path,
                path,
                kind,
                subtype: Some(parse_subtype(message, &text(3, "subtype")?)?),
                state: None,
                filesystem: None,
                label: None,
                mount: None,
            },
            DeviceKind::StatefulDevice => {
                let state_name = text(4, "state")?;
                let state = MediaState::parse(&state_name).ok_or_else(|| {
                    MessageError::malformed(message, format!("bad state {state_name:?}"))
                })?;
                Self {
                    parent_path,
                    path,
                    kind,
                    subtype: Some(parse_subtype(message, &text(3, "subtype")?)?),
                    state: Some(state),
                    filesystem: optional(5),
                    label: optional(6),
                    mount: mount_from(7),
                }
            }
            DeviceKind::Partition => Self {
                parent_path,
                path,
                kind,
                subtype: None,
                state: None,
                filesystem: optional(3),
                label: optional(4),
                mount: mount_from(5),
            },
        };

        Ok(description)
    }

    pub fn to_line(&self, tag: &str) -> Line {
        Line::with_args(tag, self.to_args())
    }

    pub fn is_root(&self) -> bool {
        self.parent_path == ROOT_PATH
    }
}

fn parse_subtype(message: &str, value: &str) -> Result<DeviceSubtype, MessageError> {
    DeviceSubtype::parse(value)
        .ok_or_else(|| MessageError::malformed(message, format!("bad subtype {value:?}")))
}

// ============================================================================
// Notifications
// ============================================================================

/// Unsolicited messages sent to every connected client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    Added(DeviceDescription),
    Removed {
        path: String,
    },
    Changed(DeviceDescription),
    Mounted {
        path: String,
        mount_point: String,
        options: String,
    },
    Unmounted {
        path: String,
        mount_point: String,
    },
}

impl Notification {
    pub fn name(&self) -> &'static str {
        match self {
            Notification::Added(_) => DEVICE_ADDED,
            Notification::Removed { .. } => DEVICE_REMOVED,
            Notification::Changed(_) => DEVICE_CHANGED,
            Notification::Mounted { .. } => DEVICE_MOUNTED,
            Notification::Unmounted { .. } => DEVICE_UNMOUNTED,
        }
    }

    pub fn to_line(&self) -> Line {
        match self {
            Notification::Added(device) | Notification::Changed(device) => {
                device.to_line(self.name())
            }
            Notification::Removed { path } => Line::new(DEVICE_REMOVED).string(path.as_str()),
            Notification::Mounted {
                path,
                mount_point,
                options,
            } => Line::new(DEVICE_MOUNTED)
                .string(path.as_str())
                .string(mount_point.as_str())
                .string(options.as_str()),
            Notification::Unmounted { path, mount_point } => Line::new(DEVICE_UNMOUNTED)
                .string(path.as_str())
                .string(mount_point.as_str()),
        }
    }
}

// ============================================================================
// Daemon Lines
// ============================================================================

/// Any line the daemon may send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonLine {
    Started {
        command: String,
        args: Vec<Option<String>>,
    },
    Finished {
        command: String,
        args: Vec<Option<String>>,
    },
    Succeeded {
        command: String,
        args: Vec<Option<String>>,
    },
    Failed {
        command: String,
        args: Vec<Option<String>>,
        code: ErrorCode,
    },
    /// One entry of a device listing
    Device(DeviceDescription),
    SupportedFilesystems(Vec<String>),
    SupportedFilesystemOptions(Vec<String>),
    Notification(Notification),
}

impl DaemonLine {
    /// Begins a multi-line response to `command`.
    pub fn started(command: &Command) -> Self {
        Self::Started {
            command: command.name().to_string(),
            args: command.args(),
        }
    }

    /// Ends a multi-line response to `command`.
    pub fn finished(command: &Command) -> Self {
        Self::Finished {
            command: command.name().to_string(),
            args: command.args(),
        }
    }

    /// One-shot success for `command`.
    pub fn succeeded(command: &Command) -> Self {
        Self::Succeeded {
            command: command.name().to_string(),
            args: command.args(),
        }
    }

    /// Failure for `command` with the code produced by the operation.
    pub fn failed(command: &Command, code: ErrorCode) -> Self {
        Self::Failed {
            command: command.name().to_string(),
            args: command.args(),
            code,
        }
    }

    pub fn to_line(&self) -> Line {
        match self {
            DaemonLine::Started { command, args } => echo(STARTED, command, args),
            DaemonLine::Finished { command, args } => echo(FINISHED, command, args),
            DaemonLine::Succeeded { command, args } => echo(SUCCEEDED, command, args),
            DaemonLine::Failed {
                command,
                args,
                code,
            } => echo(FAILED, command, args).string(code.as_str()),
            DaemonLine::Device(device) => device.to_line(DEVICE_TAG),
            DaemonLine::SupportedFilesystems(items) => list_line(SUPPORTED_FILESYSTEMS, items),
            DaemonLine::SupportedFilesystemOptions(items) => {
                list_line(SUPPORTED_FILESYSTEM_OPTIONS, items)
            }
            DaemonLine::Notification(notification) => notification.to_line(),
        }
    }

    /// Name of the command this line answers, if it is a response.
    pub fn command(&self) -> Option<&str> {
        match self {
            DaemonLine::Started { command, .. }
            | DaemonLine::Finished { command, .. }
            | DaemonLine::Succeeded { command, .. }
            | DaemonLine::Failed { command, .. } => Some(command),
            _ => None,
        }
    }
}

fn echo(name: &str, command: &str, args: &[Option<String>]) -> Line {
    let mut all = Vec::with_capacity(args.len() + 1);
    all.push(Some(command.to_string()));
    all.extend(args.iter().cloned());
    Line::with_args(name, all)
}

fn list_line(name: &str, items: &[String]) -> Line {
    Line::with_args(name, items.iter().cloned().map(Some).collect())
}

impl TryFrom<Line> for DaemonLine {
    type Error = MessageError;

    fn try_from(line: Line) -> Result<Self, Self::Error> {
        let (name, args) = line.into_parts();

        let split_command = |args: Vec<Option<String>>| -> Result<(String, Vec<Option<String>>), MessageError> {
            let mut iter = args.into_iter();
            let command = iter
                .next()
                .flatten()
                .ok_or_else(|| MessageError::malformed(&name, "missing command name"))?;
            Ok((command, iter.collect()))
        };

        let strings = |args: Vec<Option<String>>| -> Result<Vec<String>, MessageError> {
            args.into_iter()
                .map(|a| a.ok_or_else(|| MessageError::malformed(&name, "nil list entry")))
                .collect()
        };

        match name.as_str() {
            STARTED => {
                let (command, args) = split_command(args)?;
                Ok(DaemonLine::Started { command, args })
            }
            FINISHED => {
                let (command, args) = split_command(args)?;
                Ok(DaemonLine::Finished { command, args })
            }
            SUCCEEDED => {
                let (command, args) = split_command(args)?;
                Ok(DaemonLine::Succeeded { command, args })
            }
            FAILED => {
                let (command, mut args) = split_command(args)?;
                let code = args
                    .pop()
                    .flatten()
                    .ok_or_else(|| MessageError::malformed(&name, "missing error code"))?;
                let code = code
                    .parse::<ErrorCode>()
                    .map_err(|e| MessageError::malformed(&name, e.to_string()))?;
                Ok(DaemonLine::Failed {
                    command,
                    args,
                    code,
                })
            }
            DEVICE_TAG => Ok(DaemonLine::Device(DeviceDescription::from_args(
                &name, &args,
            )?)),
            SUPPORTED_FILESYSTEMS => Ok(DaemonLine::SupportedFilesystems(strings(args)?)),
            SUPPORTED_FILESYSTEM_OPTIONS => {
                Ok(DaemonLine::SupportedFilesystemOptions(strings(args)?))
            }
            DEVICE_ADDED => Ok(DaemonLine::Notification(Notification::Added(
                DeviceDescription::from_args(&name, &args)?,
            ))),
            DEVICE_CHANGED => Ok(DaemonLine::Notification(Notification::Changed(
                DeviceDescription::from_args(&name, &args)?,
            ))),
            DEVICE_REMOVED => {
                let mut parts = strings(args)?.into_iter();
                match (parts.next(), parts.next()) {
                    (Some(path), None) => Ok(DaemonLine::Notification(Notification::Removed {
                        path,
                    })),
                    _ => Err(MessageError::malformed(&name, "expected one path")),
                }
            }
            DEVICE_MOUNTED => {
                let mut parts = strings(args)?.into_iter();
                match (parts.next(), parts.next(), parts.next(), parts.next()) {
                    (Some(path), Some(mount_point), Some(options), None) => {
                        Ok(DaemonLine::Notification(Notification::Mounted {
                            path,
                            mount_point,
                            options,
                        }))
                    }
                    _ => Err(MessageError::malformed(&name, "expected three arguments")),
                }
            }
            DEVICE_UNMOUNTED => {
                let mut parts = strings(args)?.into_iter();
                match (parts.next(), parts.next(), parts.next()) {
                    (Some(path), Some(mount_point), None) => {
                        Ok(DaemonLine::Notification(Notification::Unmounted {
                            path,
                            mount_point,
                        }))
                    }
                    _ => Err(MessageError::malformed(&name, "expected two arguments")),
                }
            }
            _ => Err(MessageError::Unknown(name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::line::parse_line;

    fn parse(s: &str) -> DaemonLine {
        DaemonLine::try_from(parse_line(s).unwrap()).unwrap()
    }

    #[test]
    fn test_list_all_response_lines() {
        let cmd = Command::ListAllRemovableDevices;
        assert_eq!(
            DaemonLine::started(&cmd).to_line().to_string(),
            "started(\"list_all_removable_devices\")"
        );
        assert_eq!(
            DaemonLine::finished(&cmd).to_line().to_string(),
            "finished(\"list_all_removable_devices\")"
        );
    }

    #[test]
    fn test_failed_mount_echoes_args() {
        let cmd = Command::Mount {
            path: "/dev/sdz1".to_string(),
            options: None,
        };
        assert_eq!(
            DaemonLine::failed(&cmd, ErrorCode::NoSuchRemovableDevice)
                .to_line()
                .to_string(),
            "failed(\"mount\", \"/dev/sdz1\", nil, \"no_such_removable_device\")"
        );
    }

    #[test]
    fn test_parse_failed_line() {
        match parse("failed(\"mount\", \"/dev/sdz1\", nil, \"no_such_removable_device\")") {
            DaemonLine::Failed {
                command,
                args,
                code,
            } => {
                assert_eq!(command, "mount");
                assert_eq!(args, vec![Some("/dev/sdz1".to_string()), None]);
                assert_eq!(code, ErrorCode::NoSuchRemovableDevice);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_stateless_description() {
        let record = DeviceRecord::stateless("/dev/sdb", DeviceSubtype::RemovableDisk).unwrap();
        let description = DeviceDescription::from_record(&record, None);
        assert_eq!(
            DaemonLine::Device(description.clone()).to_line().to_string(),
            "removable_device(\"/\", \"/dev/sdb\", \"device\", \"removable_disk\")"
        );
        assert_eq!(
            parse("removable_device(\"/\", \"/dev/sdb\", \"device\", \"removable_disk\")"),
            DaemonLine::Device(description)
        );
    }

    #[test]
    fn test_partition_description_with_mount() {
        let record = DeviceRecord::partition(
            "/dev/sdb1",
            "/dev/sdb",
            Some("vfat".to_string()),
            None,
        )
        .unwrap();
        let mount = MountInfo::new("/media/sdb1", "rw,nosuid");
        let description = DeviceDescription::from_record(&record, Some(&mount));
        let line = Notification::Added(description.clone()).to_line().to_string();
        assert_eq!(
            line,
            "removable_device_added(\"/dev/sdb\", \"/dev/sdb1\", \"partition\", \"vfat\", nil, \"/media/sdb1\", \"rw,nosuid\")"
        );
        assert_eq!(
            parse(&line),
            DaemonLine::Notification(Notification::Added(description))
        );
    }

    #[test]
    fn test_stateful_description() {
        let record = DeviceRecord::stateful(
            "/dev/sr0",
            DeviceSubtype::Cdrom,
            MediaState::Ok,
            Some("iso9660".to_string()),
            Some("DISC".to_string()),
        )
        .unwrap();
        let description = DeviceDescription::from_record(&record, None);
        let line = Notification::Changed(description.clone()).to_line().to_string();
        assert_eq!(
            line,
            "removable_device_changed(\"/\", \"/dev/sr0\", \"stateful_device\", \"cdrom\", \"ok\", \"iso9660\", \"DISC\", nil, nil)"
        );
        assert_eq!(
            parse(&line),
            DaemonLine::Notification(Notification::Changed(description))
        );
    }

    #[test]
    fn test_description_arity_checked() {
        let line = parse_line("removable_device(\"/\", \"/dev/sdb\", \"device\")").unwrap();
        assert!(matches!(
            DaemonLine::try_from(line),
            Err(MessageError::Malformed { .. })
        ));
    }

    #[test]
    fn test_mount_notifications() {
        let mounted = Notification::Mounted {
            path: "/dev/sdb1".to_string(),
            mount_point: "/media/STICK".to_string(),
            options: "rw".to_string(),
        };
        assert_eq!(
            mounted.to_line().to_string(),
            "removable_device_mounted(\"/dev/sdb1\", \"/media/STICK\", \"rw\")"
        );
        let unmounted = Notification::Unmounted {
            path: "/dev/sdb1".to_string(),
            mount_point: "/media/STICK".to_string(),
        };
        assert_eq!(
            parse(&unmounted.to_line().to_string()),
            DaemonLine::Notification(unmounted)
        );
        assert_eq!(
            parse("removable_device_removed(\"/dev/sdb1\")"),
            DaemonLine::Notification(Notification::Removed {
                path: "/dev/sdb1".to_string()
            })
        );
    }

    #[test]
    fn test_supported_lists() {
        let line = DaemonLine::SupportedFilesystems(vec!["vfat".to_string(), "ext4".to_string()]);
        assert_eq!(
            line.to_line().to_string(),
            "supported_filesystems(\"vfat\", \"ext4\")"
        );
        assert_eq!(parse(&line.to_line().to_string()), line);
    }

    #[test]
    fn test_unknown_message() {
        let line = parse_line("hello()").unwrap();
        assert_eq!(
            DaemonLine::try_from(line),
            Err(MessageError::Unknown("hello".to_string()))
        );
    }

    #[test]
    fn test_notification_json() {
        let n = Notification::Removed {
            path: "/dev/sdb".to_string(),
        };
        let json = serde_json::to_string(&n).unwrap();
        assert!(json.contains("\"event\":\"removed\""));
    }
}
