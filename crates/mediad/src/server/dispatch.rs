//! Command execution against the device tree and the mount service.

use tracing::debug;

use mediad_core::{ErrorCode, ROOT_PATH};
use mediad_protocol::{Command, CommandError, DaemonLine};

use crate::mounts::MountService;
use crate::tree::{DeviceTree, TreeEvent};

/// Result of one dispatched command.
///
/// `events` are broadcast to every client before `replies` are written to
/// the requester.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Dispatch {
    pub replies: Vec<DaemonLine>,
    pub events: Vec<TreeEvent>,
}

impl Dispatch {
    fn reply(line: DaemonLine) -> Self {
        Self {
            replies: vec![line],
            events: Vec::new(),
        }
    }
}

pub struct ProtocolDispatcher {
    mounts: MountService,
    enable_poweroff: bool,
}

impl ProtocolDispatcher {
    pub fn new(mounts: MountService, enable_poweroff: bool) -> Self {
        Self {
            mounts,
            enable_poweroff,
        }
    }

    pub fn mounts(&self) -> &MountService {
        &self.mounts
    }

    /// Parses and executes one frame.
    ///
    /// An error means the frame was a protocol violation and nothing may be
    /// written to the client.
    pub fn dispatch(&mut self, tree: &mut DeviceTree, frame: &str) -> Result<Dispatch, CommandError> {
        let command = Command::parse(frame)?;
        if matches!(command, Command::Poweroff { .. }) && !self.enable_poweroff {
            return Err(CommandError::Unknown(command.name().to_string()));
        }
        debug!(command = %command.name(), "Dispatching command");
        Ok(self.execute(tree, &command))
    }

    fn execute(&mut self, tree: &mut DeviceTree, command: &Command) -> Dispatch {
        match command {
            Command::ListAllRemovableDevices => list(tree, command, None),

            Command::ListRemovableDevice { path } if path == ROOT_PATH => list(tree, command, None),

            Command::ListRemovableDevice { path } => list(tree, command, Some(path.as_str())),

            Command::Mount { path, options } => {
                match self.mounts.mount(tree, path, options.as_deref()) {
                    Ok(event) => Dispatch {
                        replies: vec![DaemonLine::succeeded(command)],
                        events: vec![event],
                    },
                    Err(code) => Dispatch::reply(DaemonLine::failed(command, code)),
                }
            }

            Command::Unmount { path } => match self.mounts.unmount(tree, path) {
                Ok(event) => Dispatch {
                    replies: vec![DaemonLine::succeeded(command)],
                    events: vec![event],
                },
                Err(code) => Dispatch::reply(DaemonLine::failed(command, code)),
            },

            Command::ListSupportedFilesystems => Dispatch {
                replies: vec![
                    DaemonLine::started(command),
                    DaemonLine::SupportedFilesystems(self.mounts.supported_filesystems()),
                    DaemonLine::finished(command),
                ],
                events: Vec::new(),
            },

            Command::ListSupportedFilesystemOptions { filesystem } => {
                match self.mounts.filesystem_options(filesystem) {
                    Some(options) => Dispatch {
                        replies: vec![
                            DaemonLine::started(command),
                            DaemonLine::SupportedFilesystemOptions(options.to_vec()),
                            DaemonLine::finished(command),
                        ],
                        events: Vec::new(),
                    },
                    None => Dispatch::reply(DaemonLine::failed(
                        command,
                        ErrorCode::UnsupportedFstype,
                    )),
                }
            }

            Command::Poweroff { path } => match self.mounts.poweroff(tree, path) {
                Ok(()) => Dispatch::reply(DaemonLine::succeeded(command)),
                Err(code) => Dispatch::reply(DaemonLine::failed(command, code)),
            },
        }
    }
}

/// `started`, one description per node, `finished`; or a single `failed`.
fn list(tree: &DeviceTree, command: &Command, path: Option<&str>) -> Dispatch {
    let nodes = match path {
        None => tree.list_all(),
        Some(path) => match tree.find(path) {
            Some(nodes) => nodes,
            None => {
                return Dispatch::reply(DaemonLine::failed(
                    command,
                    ErrorCode::NoSuchRemovableDevice,
                ))
            }
        },
    };

    let mut replies = Vec::with_capacity(nodes.len() + 2);
    replies.push(DaemonLine::started(command));
    replies.extend(nodes.iter().map(|node| DaemonLine::Device(node.description())));
    replies.push(DaemonLine::finished(command));
    Dispatch {
        replies,
        events: Vec::new(),
    }
}
