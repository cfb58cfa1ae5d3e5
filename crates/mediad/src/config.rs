//! Daemon configuration.
//!
//! Loaded from an optional TOML file; every field has a default so an empty
//! (or missing) file yields a working daemon.
//!
//! ```toml
//! socket_path = "/var/run/mediad.sock"
//! mount_dir = "/media"
//! enable_poweroff = true
//!
//! [filesystems.vfat]
//! default_options = ["rw", "nosuid", "nodev", "flush"]
//! allowed_options = ["ro", "rw", "nosuid", "nodev", "noexec", "flush", "uid", "gid"]
//! ```

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default socket path
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/mediad.sock";

/// Default PID lock file
pub const DEFAULT_PID_FILE: &str = "/var/run/mediad.pid";

/// Directory under which mount points are created
pub const DEFAULT_MOUNT_DIR: &str = "/media";

/// Config file read when `--config` is not given (if it exists)
pub const DEFAULT_CONFIG_PATH: &str = "/etc/mediad.toml";

/// Environment variable overriding the socket path
pub const SOCKET_ENV: &str = "MEDIAD_SOCKET";

/// Errors loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {error}")]
    Read { path: PathBuf, error: std::io::Error },

    #[error("Invalid config {path}: {error}")]
    Parse { path: PathBuf, error: toml::de::Error },

    #[error("Filesystem {filesystem}: default option {option:?} is not in allowed_options")]
    DefaultNotAllowed { filesystem: String, option: String },
}

/// Mount options for one filesystem type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemConfig {
    /// Used when a client mounts with `nil` options
    #[serde(default)]
    pub default_options: Vec<String>,

    /// Option names a client may request (`key` of `key=value` options)
    #[serde(default)]
    pub allowed_options: Vec<String>,
}

impl FilesystemConfig {
    fn new(default_options: &[&str], allowed_options: &[&str]) -> Self {
        Self {
            default_options: default_options.iter().map(|s| s.to_string()).collect(),
            allowed_options: allowed_options.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Whether `option` (bare word or `key=value`) may be requested.
    pub fn allows(&self, option: &str) -> bool {
        let key = option.split_once('=').map_or(option, |(key, _)| key);
        self.allowed_options.iter().any(|allowed| allowed == key)
    }
}

/// Complete daemon configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub socket_path: PathBuf,
    pub pid_file: PathBuf,
    pub mount_dir: PathBuf,
    pub enable_poweroff: bool,
    pub filesystems: BTreeMap<String, FilesystemConfig>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            pid_file: PathBuf::from(DEFAULT_PID_FILE),
            mount_dir: PathBuf::from(DEFAULT_MOUNT_DIR),
            enable_poweroff: true,
            filesystems: default_filesystems(),
        }
    }
}

fn default_filesystems() -> BTreeMap<String, FilesystemConfig> {
    const COMMON: &[&str] = &[
        "ro", "rw", "nosuid", "nodev", "noexec", "sync", "dirsync", "noatime", "nodiratime",
        "relatime",
    ];
    fn with(common: &[&'static str], extra: &[&'static str]) -> Vec<&'static str> {
        common.iter().chain(extra).copied().collect()
    }

    let fat_like = with(COMMON, &["uid", "gid", "umask", "dmask", "fmask", "flush", "utf8", "iocharset"]);
    let ext = with(COMMON, &["acl", "noacl", "user_xattr", "nouser_xattr"]);
    let optical = with(COMMON, &["uid", "gid", "mode", "iocharset", "utf8"]);

    let mut map = BTreeMap::new();
    map.insert(
        "vfat".to_string(),
        FilesystemConfig::new(&["rw", "nosuid", "nodev", "flush"], &fat_like),
    );
    map.insert(
        "exfat".to_string(),
        FilesystemConfig::new(&["rw", "nosuid", "nodev"], &fat_like),
    );
    map.insert(
        "ntfs".to_string(),
        FilesystemConfig::new(&["rw", "nosuid", "nodev"], &fat_like),
    );
    for name in ["ext2", "ext3", "ext4"] {
        map.insert(
            name.to_string(),
            FilesystemConfig::new(&["rw", "nosuid", "nodev"], &ext),
        );
    }
    map.insert(
        "iso9660".to_string(),
        FilesystemConfig::new(&["ro", "nosuid", "nodev"], &optical),
    );
    map.insert(
        "udf".to_string(),
        FilesystemConfig::new(&["ro", "nosuid", "nodev"], &optical),
    );
    map
}

impl DaemonConfig {
    /// Parses a config from TOML text.
    pub fn from_toml(text: &str, path: &Path) -> Result<Self, ConfigError> {
        let config: DaemonConfig = toml::from_str(text).map_err(|error| ConfigError::Parse {
            path: path.to_path_buf(),
            error,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration.
    ///
    /// An explicit path must exist; without one, [`DEFAULT_CONFIG_PATH`] is
    /// read if present and defaults are used otherwise. The socket path
    /// environment override is applied last.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::read(path)?,
            None => {
                let default = Path::new(DEFAULT_CONFIG_PATH);
                if default.exists() {
                    Self::read(default)?
                } else {
                    Self::default()
                }
            }
        };

        if let Ok(socket) = env::var(SOCKET_ENV) {
            if !socket.is_empty() {
                config.socket_path = PathBuf::from(socket);
            }
        }

        Ok(config)
    }

    fn read(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|error| ConfigError::Read {
            path: path.to_path_buf(),
            error,
        })?;
        Self::from_toml(&text, path)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (name, fs) in &self.filesystems {
            if let Some(option) = fs.default_options.iter().find(|o| !fs.allows(o)) {
                return Err(ConfigError::DefaultNotAllowed {
                    filesystem: name.clone(),
                    option: option.clone(),
                });
            }
        }
        Ok(())
    }
}
