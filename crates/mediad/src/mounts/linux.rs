//! Linux mount orchestrator: `mount(2)`, `umount2(2)` and procfs.

use std::collections::HashMap;
use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use procfs::process::Process;
use tracing::{debug, warn};

use mediad_core::{ErrorCode, MountEntry};

use super::{MountOrchestrator, MountRequest, MountTableError};

const SYS_BLOCK: &str = "/sys/block";

/// Generic option words the kernel takes as flags rather than fs data.
const FLAG_OPTIONS: &[(&str, libc::c_ulong)] = &[
    ("ro", libc::MS_RDONLY),
    ("nosuid", libc::MS_NOSUID),
    ("nodev", libc::MS_NODEV),
    ("noexec", libc::MS_NOEXEC),
    ("sync", libc::MS_SYNCHRONOUS),
    ("dirsync", libc::MS_DIRSYNC),
    ("noatime", libc::MS_NOATIME),
    ("nodiratime", libc::MS_NODIRATIME),
    ("relatime", libc::MS_RELATIME),
];

/// Real system mounts.
#[derive(Debug, Clone)]
pub struct SystemMounts {
    sys_block: PathBuf,
}

impl Default for SystemMounts {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemMounts {
    pub fn new() -> Self {
        Self {
            sys_block: PathBuf::from(SYS_BLOCK),
        }
    }
}

/// Splits options into `mount(2)` flags and the filesystem data string.
fn translate_options(options: &[String]) -> (libc::c_ulong, String) {
    let mut flags: libc::c_ulong = 0;
    let mut data = Vec::new();

    for option in options {
        match FLAG_OPTIONS.iter().find(|(name, _)| name == option) {
            Some((_, flag)) => flags |= flag,
            None if option == "rw" => {}
            None => data.push(option.as_str()),
        }
    }

    (flags, data.join(","))
}

fn mount_errno_code(errno: Option<i32>) -> ErrorCode {
    match errno {
        Some(libc::EBUSY) => ErrorCode::MountPointBusy,
        Some(libc::ENODEV) => ErrorCode::UnsupportedFstype,
        _ => ErrorCode::GenericError,
    }
}

fn unmount_errno_code(errno: Option<i32>) -> ErrorCode {
    match errno {
        Some(libc::EBUSY) => ErrorCode::MountPointBusy,
        Some(libc::EINVAL) => ErrorCode::DeviceNotMounted,
        _ => ErrorCode::GenericError,
    }
}

fn c_path(path: &Path) -> Result<CString, ErrorCode> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| ErrorCode::GenericError)
}

fn c_str(value: &str) -> Result<CString, ErrorCode> {
    CString::new(value).map_err(|_| ErrorCode::GenericError)
}

fn format_options(options: &HashMap<String, Option<String>>) -> String {
    let mut words: Vec<String> = options
        .iter()
        .map(|(key, value)| match value {
            Some(value) => format!("{key}={value}"),
            None => key.clone(),
        })
        .collect();
    words.sort();
    words.join(",")
}

impl MountOrchestrator for SystemMounts {
    fn mount(&mut self, request: &MountRequest) -> Result<(), ErrorCode> {
        let (flags, data) = translate_options(&request.options);
        let source = c_str(&request.device)?;
        let target = c_path(&request.mount_point)?;
        let fstype = c_str(&request.filesystem)?;
        let data = c_str(&data)?;

        let rc = unsafe {
            libc::mount(
                source.as_ptr(),
                target.as_ptr(),
                fstype.as_ptr(),
                flags,
                data.as_ptr() as *const libc::c_void,
            )
        };
        if rc != 0 {
            let err = io::Error::last_os_error();
            warn!(device = %request.device, error = %err, "mount(2) failed");
            return Err(mount_errno_code(err.raw_os_error()));
        }
        Ok(())
    }

    fn unmount(&mut self, device: &str, mount_point: &str) -> Result<(), ErrorCode> {
        let target = c_str(mount_point)?;
        let rc = unsafe { libc::umount2(target.as_ptr(), 0) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            warn!(device = %device, mount_point = %mount_point, error = %err, "umount2(2) failed");
            return Err(unmount_errno_code(err.raw_os_error()));
        }
        Ok(())
    }

    fn poweroff(&mut self, device: &str) -> Result<(), ErrorCode> {
        let name = Path::new(device)
            .file_name()
            .ok_or(ErrorCode::NoSuchRemovableDevice)?;
        let delete = self.sys_block.join(name).join("device/delete");
        if !delete.exists() {
            return Err(ErrorCode::NoSuchRemovableDevice);
        }

        unsafe { libc::sync() };
        fs::write(&delete, b"1").map_err(|e| {
            warn!(device = %device, error = %e, "Failed to detach device");
            ErrorCode::GenericError
        })?;
        debug!(device = %device, "Device detached");
        Ok(())
    }

    fn current_mounts(&self) -> Result<Vec<MountEntry>, MountTableError> {
        let mounts = Process::myself()
            .and_then(|process| process.mountinfo())
            .map_err(|e| MountTableError::Read(io::Error::other(e)))?;

        Ok(mounts
            .into_iter()
            .filter_map(|mount| {
                let source = mount.mount_source?;
                if !source.starts_with("/dev/") {
                    return None;
                }
                Some(MountEntry::new(
                    source,
                    mount.mount_point.to_string_lossy(),
                    format_options(&mount.mount_options),
                ))
            })
            .collect())
    }
}
