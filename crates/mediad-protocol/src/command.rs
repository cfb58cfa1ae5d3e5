//! Client → daemon commands.

use thiserror::Error;

use crate::line::{parse_line, Line, ParseError};

pub const LIST_ALL_REMOVABLE_DEVICES: &str = "list_all_removable_devices";
pub const LIST_REMOVABLE_DEVICE: &str = "list_removable_device";
pub const MOUNT: &str = "mount";
pub const UNMOUNT: &str = "unmount";
pub const LIST_SUPPORTED_FILESYSTEMS: &str = "list_supported_filesystems";
pub const LIST_SUPPORTED_FILESYSTEM_OPTIONS: &str = "list_supported_filesystem_options";
pub const POWEROFF: &str = "poweroff";

/// A validated client command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    ListAllRemovableDevices,
    ListRemovableDevice { path: String },
    Mount { path: String, options: Option<String> },
    Unmount { path: String },
    ListSupportedFilesystems,
    ListSupportedFilesystemOptions { filesystem: String },
    Poweroff { path: String },
}

/// Why a line is not an acceptable command.
///
/// Every variant is a protocol violation; the daemon closes the connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("malformed command: {0}")]
    Parse(#[from] ParseError),

    #[error("unknown command: {0}")]
    Unknown(String),

    #[error("{command} expects {expected} argument(s), got {got}")]
    WrongArity {
        command: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("{command} argument {index} must not be nil")]
    NilArgument { command: &'static str, index: usize },
}

impl Command {
    /// Parses and validates one framed line.
    pub fn parse(input: &str) -> Result<Self, CommandError> {
        Self::try_from(parse_line(input)?)
    }

    /// Wire name of the command.
    pub fn name(&self) -> &'static str {
        match self {
            Command::ListAllRemovableDevices => LIST_ALL_REMOVABLE_DEVICES,
            Command::ListRemovableDevice { .. } => LIST_REMOVABLE_DEVICE,
            Command::Mount { .. } => MOUNT,
            Command::Unmount { .. } => UNMOUNT,
            Command::ListSupportedFilesystems => LIST_SUPPORTED_FILESYSTEMS,
            Command::ListSupportedFilesystemOptions { .. } => LIST_SUPPORTED_FILESYSTEM_OPTIONS,
            Command::Poweroff { .. } => POWEROFF,
        }
    }

    /// The command's arguments as they appear on the wire.
    ///
    /// Responses echo these after the command name.
    pub fn args(&self) -> Vec<Option<String>> {
        match self {
            Command::ListAllRemovableDevices | Command::ListSupportedFilesystems => Vec::new(),
            Command::ListRemovableDevice { path }
            | Command::Unmount { path }
            | Command::Poweroff { path } => vec![Some(path.clone())],
            Command::Mount { path, options } => vec![Some(path.clone()), options.clone()],
            Command::ListSupportedFilesystemOptions { filesystem } => {
                vec![Some(filesystem.clone())]
            }
        }
    }

    pub fn to_line(&self) -> Line {
        Line::with_args(self.name(), self.args())
    }
}

impl TryFrom<Line> for Command {
    type Error = CommandError;

    fn try_from(line: Line) -> Result<Self, Self::Error> {
        let (name, args) = line.into_parts();

        match name.as_str() {
            LIST_ALL_REMOVABLE_DEVICES => {
                expect_arity(LIST_ALL_REMOVABLE_DEVICES, &args, 0)?;
                Ok(Command::ListAllRemovableDevices)
            }
            LIST_REMOVABLE_DEVICE => {
                let path = single_string(LIST_REMOVABLE_DEVICE, args)?;
                Ok(Command::ListRemovableDevice { path })
            }
            MOUNT => {
                expect_arity(MOUNT, &args, 2)?;
                let mut args = args.into_iter();
                let path = args
                    .next()
                    .flatten()
                    .ok_or(CommandError::NilArgument { command: MOUNT, index: 0 })?;
                let options = args.next().flatten();
                Ok(Command::Mount { path, options })
            }
            UNMOUNT => {
                let path = single_string(UNMOUNT, args)?;
                Ok(Command::Unmount { path })
            }
            LIST_SUPPORTED_FILESYSTEMS => {
                expect_arity(LIST_SUPPORTED_FILESYSTEMS, &args, 0)?;
                Ok(Command::ListSupportedFilesystems)
            }
            LIST_SUPPORTED_FILESYSTEM_OPTIONS => {
                let filesystem = single_string(LIST_SUPPORTED_FILESYSTEM_OPTIONS, args)?;
                Ok(Command::ListSupportedFilesystemOptions { filesystem })
            }
            POWEROFF => {
                let path = single_string(POWEROFF, args)?;
                Ok(Command::Poweroff { path })
            }
            _ => Err(CommandError::Unknown(name)),
        }
    }
}

fn expect_arity(
    command: &'static str,
    args: &[Option<String>],
    expected: usize,
) -> Result<(), CommandError> {
    if args.len() != expected {
        return Err(CommandError::WrongArity {
            command,
            expected,
            got: args.len(),
        });
    }
    Ok(())
}

fn single_string(command: &'static str, args: Vec<Option<String>>) -> Result<String, CommandError> {
    expect_arity(command, &args, 1)?;
    args.into_iter()
        .next()
        .flatten()
        .ok_or(CommandError::NilArgument { command, index: 0 })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_all_commands() {
        assert_eq!(
            Command::parse("list_all_removable_devices()").unwrap(),
            Command::ListAllRemovableDevices
        );
        assert_eq!(
            Command::parse("list_removable_device(\"/\")").unwrap(),
            Command::ListRemovableDevice { path: "/".to_string() }
        );
        assert_eq!(
            Command::parse("mount(\"/dev/sdb1\", nil)").unwrap(),
            Command::Mount {
                path: "/dev/sdb1".to_string(),
                options: None
            }
        );
        assert_eq!(
            Command::parse("mount(\"/dev/sdb1\", \"ro,noexec\")").unwrap(),
            Command::Mount {
                path: "/dev/sdb1".to_string(),
                options: Some("ro,noexec".to_string())
            }
        );
        assert_eq!(
            Command::parse("unmount(\"/dev/sdb1\")").unwrap(),
            Command::Unmount { path: "/dev/sdb1".to_string() }
        );
        assert_eq!(
            Command::parse("list_supported_filesystems()").unwrap(),
            Command::ListSupportedFilesystems
        );
        assert_eq!(
            Command::parse("list_supported_filesystem_options(\"vfat\")").unwrap(),
            Command::ListSupportedFilesystemOptions {
                filesystem: "vfat".to_string()
            }
        );
        assert_eq!(
            Command::parse("poweroff(\"/dev/sdb\")").unwrap(),
            Command::Poweroff { path: "/dev/sdb".to_string() }
        );
    }

    #[test]
    fn test_wrong_arity_rejected() {
        assert!(matches!(
            Command::parse("mount(\"/dev/sdb1\")"),
            Err(CommandError::WrongArity { command: MOUNT, expected: 2, got: 1 })
        ));
        assert!(matches!(
            Command::parse("list_all_removable_devices(nil)"),
            Err(CommandError::WrongArity { .. })
        ));
        assert!(matches!(
            Command::parse("unmount()"),
            Err(CommandError::WrongArity { .. })
        ));
    }

    #[test]
    fn test_nil_where_string_required() {
        assert_eq!(
            Command::parse("unmount(nil)"),
            Err(CommandError::NilArgument { command: UNMOUNT, index: 0 })
        );
        assert_eq!(
            Command::parse("mount(nil, \"ro\")"),
            Err(CommandError::NilArgument { command: MOUNT, index: 0 })
        );
    }

    #[test]
    fn test_unknown_and_malformed() {
        assert_eq!(
            Command::parse("format(\"/dev/sda\")"),
            Err(CommandError::Unknown("format".to_string()))
        );
        assert!(matches!(
            Command::parse("mount(\"/dev/sdb1\", nil) junk"),
            Err(CommandError::Parse(ParseError::TrailingData(_)))
        ));
        assert!(matches!(
            Command::parse("unmount(\"/dev/sdb1)"),
            Err(CommandError::Parse(ParseError::UnterminatedString))
        ));
    }

    #[test]
    fn test_to_line_matches_wire_syntax() {
        let cmd = Command::Mount {
            path: "/dev/sdb1".to_string(),
            options: None,
        };
        assert_eq!(cmd.to_line().to_string(), "mount(\"/dev/sdb1\", nil)");
        assert_eq!(Command::parse(&cmd.to_line().to_string()).unwrap(), cmd);
    }
}
