//! Linux backend: sysfs enumeration plus udev events over netlink.
//!
//! udevd re-broadcasts processed kernel uevents on netlink multicast group 2.
//! Each datagram starts with a fixed `libudev` header followed by
//! NUL-separated `KEY=VALUE` properties.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};

use tracing::{debug, trace, warn};

use mediad_core::{DeviceAction, DeviceRecord, DeviceSubtype, MediaState};

use super::backend::{BackendError, BackendEvent, PlatformBackend};

/// Netlink multicast group udevd sends processed events to
const UDEV_MONITOR_GROUP: u32 = 2;

const UDEV_PREFIX: &[u8; 8] = b"libudev\0";
const UDEV_MAGIC: u32 = 0xfeed_cafe;
const UDEV_HEADER_LEN: usize = 40;

const RECV_BUFFER_SIZE: usize = 8192;

const DEFAULT_SYS_ROOT: &str = "/sys";
const DEFAULT_UDEV_DATA: &str = "/run/udev/data";

type Properties = HashMap<String, String>;

/// udev netlink event source.
pub struct UdevBackend {
    socket: OwnedFd,
    sys_root: PathBuf,
    udev_data: PathBuf,
    buffer: Vec<u8>,
}

impl UdevBackend {
    /// Opens the netlink socket and binds it to the udev group.
    pub fn open() -> Result<Self, BackendError> {
        let fd = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_DGRAM | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
                libc::NETLINK_KOBJECT_UEVENT,
            )
        };
        if fd < 0 {
            return Err(BackendError::Open(io::Error::last_os_error()));
        }
        let socket = unsafe { OwnedFd::from_raw_fd(fd) };

        let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        addr.nl_groups = UDEV_MONITOR_GROUP;

        let rc = unsafe {
            libc::bind(
                socket.as_raw_fd(),
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(BackendError::Open(io::Error::last_os_error()));
        }

        debug!("udev netlink monitor bound");
        Ok(Self {
            socket,
            sys_root: PathBuf::from(DEFAULT_SYS_ROOT),
            udev_data: PathBuf::from(DEFAULT_UDEV_DATA),
            buffer: vec![0; RECV_BUFFER_SIZE],
        })
    }
}

impl PlatformBackend for UdevBackend {
    fn enumerate(&mut self) -> Result<Vec<DeviceRecord>, BackendError> {
        enumerate_block_devices(&self.sys_root, &self.udev_data).map_err(BackendError::Enumerate)
    }

    fn event_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    fn next_event(&mut self) -> Result<Option<BackendEvent>, BackendError> {
        let n = unsafe {
            libc::recv(
                self.socket.as_raw_fd(),
                self.buffer.as_mut_ptr() as *mut libc::c_void,
                self.buffer.len(),
                libc::MSG_DONTWAIT,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EINTR) => Ok(None),
                Some(libc::ENOBUFS) => {
                    warn!("udev event buffer overrun, events were lost");
                    Ok(None)
                }
                _ => Err(BackendError::Read(err)),
            };
        }

        let len = usize::try_from(n).unwrap_or(0);
        let Some(data) = self.buffer.get(..len) else {
            return Ok(None);
        };
        let Some(properties) = parse_udev_message(data) else {
            trace!(len, "Skipping non-udev netlink message");
            return Ok(None);
        };

        Ok(event_from_properties(&properties, &self.sys_root))
    }
}

// ============================================================================
// Message Parsing
// ============================================================================

fn read_u32(data: &[u8], offset: usize) -> Option<[u8; 4]> {
    data.get(offset..offset + 4)?.try_into().ok()
}

/// Extracts the property map from a udev netlink datagram.
fn parse_udev_message(data: &[u8]) -> Option<Properties> {
    let header = data.get(..UDEV_HEADER_LEN)?;
    if header.get(..UDEV_PREFIX.len())? != UDEV_PREFIX {
        return None;
    }
    if u32::from_be_bytes(read_u32(header, 8)?) != UDEV_MAGIC {
        return None;
    }

    let offset = u32::from_ne_bytes(read_u32(header, 16)?) as usize;
    let length = u32::from_ne_bytes(read_u32(header, 20)?) as usize;
    let body = data.get(offset..offset.checked_add(length)?)?;

    Some(parse_properties(
        body.split(|b| *b == 0)
            .filter_map(|chunk| std::str::from_utf8(chunk).ok()),
    ))
}

fn parse_properties<'a>(lines: impl Iterator<Item = &'a str>) -> Properties {
    lines
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn event_from_properties(props: &Properties, sys_root: &Path) -> Option<BackendEvent> {
    let action = props.get("ACTION").and_then(|a| DeviceAction::from_uevent(a))?;

    let record = match classify(props, sys_root) {
        Some(record) => record,
        // Removal events may no longer carry enough to classify the disk;
        // the worker drops paths it never accepted.
        None if action.is_removal() && props.get("DEVTYPE").map(String::as_str) == Some("disk") => {
            let path = device_node(props)?;
            DeviceRecord::stateless(path, DeviceSubtype::Unknown).ok()?
        }
        None => return None,
    };

    Some(BackendEvent::new(record, action))
}

// ============================================================================
// Classification
// ============================================================================

fn device_node(props: &Properties) -> Option<String> {
    let name = props.get("DEVNAME")?;
    if name.is_empty() {
        None
    } else if name.starts_with('/') {
        Some(name.clone())
    } else {
        Some(format!("/dev/{name}"))
    }
}

fn flag(props: &Properties, key: &str) -> bool {
    props.get(key).map(String::as_str) == Some("1")
}

fn non_empty(props: &Properties, key: &str) -> Option<String> {
    props.get(key).filter(|v| !v.is_empty()).cloned()
}

fn sysfs_removable(sys_root: &Path, devpath: &str) -> bool {
    let file = sys_root.join(devpath.trim_start_matches('/')).join("removable");
    fs::read_to_string(file)
        .map(|s| s.trim() == "1")
        .unwrap_or(false)
}

/// Turns a property map into a record, or `None` for devices we ignore.
fn classify(props: &Properties, sys_root: &Path) -> Option<DeviceRecord> {
    if props.get("SUBSYSTEM").map(String::as_str) != Some("block") {
        return None;
    }
    let path = device_node(props)?;
    let devpath = props.get("DEVPATH")?.clone();
    let filesystem = non_empty(props, "ID_FS_TYPE");
    let label = non_empty(props, "ID_FS_LABEL");

    let record = match props.get("DEVTYPE").map(String::as_str) {
        Some("disk") if flag(props, "ID_CDROM") => {
            let state = if !flag(props, "ID_CDROM_MEDIA") {
                MediaState::Empty
            } else if props.get("ID_CDROM_MEDIA_STATE").map(String::as_str) == Some("blank") {
                MediaState::Clear
            } else if filesystem.is_some() {
                MediaState::Ok
            } else {
                MediaState::Unknown
            };
            DeviceRecord::stateful(path, DeviceSubtype::Cdrom, state, filesystem, label).ok()?
        }
        Some("disk") => {
            let name = path.rsplit('/').next().unwrap_or_default();
            let subtype = if flag(props, "ID_DRIVE_FLASH_SD") || name.starts_with("mmcblk") {
                DeviceSubtype::SdCard
            } else if props.get("ID_BUS").map(String::as_str) == Some("usb")
                || sysfs_removable(sys_root, &devpath)
            {
                DeviceSubtype::RemovableDisk
            } else {
                return None;
            };
            DeviceRecord::stateless(path, subtype).ok()?
        }
        Some("partition") => {
            let parent_name = Path::new(&devpath).parent()?.file_name()?.to_str()?;
            let parent = format!("/dev/{parent_name}");
            DeviceRecord::partition(path, parent, filesystem, label).ok()?
        }
        _ => return None,
    };

    Some(record.with_platform_tag(devpath))
}

// ============================================================================
// Enumeration
// ============================================================================

/// Walks `/sys/class/block`, merging each device's uevent file with its
/// udev database entry.
fn enumerate_block_devices(sys_root: &Path, udev_data: &Path) -> io::Result<Vec<DeviceRecord>> {
    let class_dir = sys_root.join("class/block");
    let canonical_root = fs::canonicalize(sys_root)?;

    let mut records = Vec::new();
    for entry in fs::read_dir(&class_dir)? {
        let entry = entry?;
        let Ok(real) = fs::canonicalize(entry.path()) else {
            continue;
        };
        let Ok(relative) = real.strip_prefix(&canonical_root) else {
            continue;
        };
        let devpath = format!("/{}", relative.display());

        let Ok(uevent) = fs::read_to_string(real.join("uevent")) else {
            continue;
        };
        let mut props = parse_properties(uevent.lines());
        props.insert("SUBSYSTEM".to_string(), "block".to_string());
        props.insert("DEVPATH".to_string(), devpath);

        if let (Some(major), Some(minor)) = (props.get("MAJOR"), props.get("MINOR")) {
            let db = udev_data.join(format!("b{major}:{minor}"));
            if let Ok(contents) = fs::read_to_string(db) {
                let extra = parse_properties(contents.lines().filter_map(|l| l.strip_prefix("E:")));
                props.extend(extra);
            }
        }

        if let Some(record) = classify(&props, sys_root) {
            records.push(record);
        }
    }

    // Roots first so partitions always find their parent.
    records.sort_by_key(|r| (!r.is_root(), r.path().to_string()));
    debug!(count = records.len(), "Enumerated block devices");
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mediad_core::DeviceKind;

    fn props(pairs: &[(&str, &str)]) -> Properties {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn udev_message(properties: &[&str]) -> Vec<u8> {
        let mut body = Vec::new();
        for p in properties {
            body.extend_from_slice(p.as_bytes());
            body.push(0);
        }
        let mut msg = Vec::new();
        msg.extend_from_slice(UDEV_PREFIX);
        msg.extend_from_slice(&UDEV_MAGIC.to_be_bytes());
        msg.extend_from_slice(&(UDEV_HEADER_LEN as u32).to_ne_bytes());
        msg.extend_from_slice(&(UDEV_HEADER_LEN as u32).to_ne_bytes());
        msg.extend_from_slice(&(body.len() as u32).to_ne_bytes());
        msg.extend_from_slice(&[0u8; 16]);
        msg.extend_from_slice(&body);
        msg
    }

    #[test]
    fn test_parse_udev_message() {
        let msg = udev_message(&["ACTION=add", "DEVNAME=/dev/sdb", "SUBSYSTEM=block"]);
        let parsed = parse_udev_message(&msg).unwrap();
        assert_eq!(parsed.get("ACTION").map(String::as_str), Some("add"));
        assert_eq!(parsed.get("DEVNAME").map(String::as_str), Some("/dev/sdb"));
    }

    #[test]
    fn test_reject_kernel_and_truncated_messages() {
        assert!(parse_udev_message(b"add@/devices/foo\0ACTION=add\0").is_none());
        let mut msg = udev_message(&["ACTION=add"]);
        msg.truncate(UDEV_HEADER_LEN + 2);
        assert!(parse_udev_message(&msg).is_none());
        let mut bad_magic = udev_message(&["ACTION=add"]);
        bad_magic[8] = 0;
        assert!(parse_udev_message(&bad_magic).is_none());
    }

    #[test]
    fn test_classify_usb_disk_and_partition() {
        let root = Path::new("/nonexistent");
        let disk = classify(
            &props(&[
                ("SUBSYSTEM", "block"),
                ("DEVTYPE", "disk"),
                ("DEVNAME", "/dev/sdb"),
                ("DEVPATH", "/devices/usb1/1-1/host6/block/sdb"),
                ("ID_BUS", "usb"),
            ]),
            root,
        )
        .unwrap();
        assert_eq!(disk.kind(), DeviceKind::StatelessDevice);
        assert_eq!(disk.subtype(), Some(DeviceSubtype::RemovableDisk));
        assert_eq!(disk.platform_tag(), Some("/devices/usb1/1-1/host6/block/sdb"));

        let part = classify(
            &props(&[
                ("SUBSYSTEM", "block"),
                ("DEVTYPE", "partition"),
                ("DEVNAME", "sdb1"),
                ("DEVPATH", "/devices/usb1/1-1/host6/block/sdb/sdb1"),
                ("ID_FS_TYPE", "vfat"),
                ("ID_FS_LABEL", "STICK"),
            ]),
            root,
        )
        .unwrap();
        assert_eq!(part.path(), "/dev/sdb1");
        assert_eq!(part.parent_path(), "/dev/sdb");
        assert_eq!(part.filesystem(), Some("vfat"));
        assert_eq!(part.label(), Some("STICK"));
    }

    #[test]
    fn test_classify_cdrom_states() {
        let root = Path::new("/nonexistent");
        let base = [
            ("SUBSYSTEM", "block"),
            ("DEVTYPE", "disk"),
            ("DEVNAME", "/dev/sr0"),
            ("DEVPATH", "/devices/ata2/block/sr0"),
            ("ID_CDROM", "1"),
        ];
        let empty = classify(&props(&base), root).unwrap();
        assert_eq!(empty.state(), Some(MediaState::Empty));

        let mut loaded = props(&base);
        loaded.insert("ID_CDROM_MEDIA".to_string(), "1".to_string());
        loaded.insert("ID_FS_TYPE".to_string(), "iso9660".to_string());
        let loaded = classify(&loaded, root).unwrap();
        assert_eq!(loaded.state(), Some(MediaState::Ok));
        assert!(loaded.is_mountable());

        let mut blank = props(&base);
        blank.insert("ID_CDROM_MEDIA".to_string(), "1".to_string());
        blank.insert("ID_CDROM_MEDIA_STATE".to_string(), "blank".to_string());
        assert_eq!(classify(&blank, root).unwrap().state(), Some(MediaState::Clear));
    }

    #[test]
    fn test_classify_ignores_fixed_disks_and_other_subsystems() {
        let root = Path::new("/nonexistent");
        assert!(classify(
            &props(&[
                ("SUBSYSTEM", "block"),
                ("DEVTYPE", "disk"),
                ("DEVNAME", "/dev/sda"),
                ("DEVPATH", "/devices/ata1/block/sda"),
                ("ID_BUS", "ata"),
            ]),
            root
        )
        .is_none());
        assert!(classify(&props(&[("SUBSYSTEM", "net"), ("DEVNAME", "eth0")]), root).is_none());
    }

    #[test]
    fn test_classify_sd_card() {
        let sd = classify(
            &props(&[
                ("SUBSYSTEM", "block"),
                ("DEVTYPE", "disk"),
                ("DEVNAME", "/dev/mmcblk0"),
                ("DEVPATH", "/devices/mmc0/block/mmcblk0"),
            ]),
            Path::new("/nonexistent"),
        )
        .unwrap();
        assert_eq!(sd.subtype(), Some(DeviceSubtype::SdCard));
    }

    #[test]
    fn test_removal_of_unclassifiable_disk_still_reported() {
        let event = event_from_properties(
            &props(&[
                ("ACTION", "remove"),
                ("SUBSYSTEM", "block"),
                ("DEVTYPE", "disk"),
                ("DEVNAME", "/dev/sdc"),
                ("DEVPATH", "/devices/pci0/block/sdc"),
            ]),
            Path::new("/nonexistent"),
        )
        .unwrap();
        assert_eq!(event.action, DeviceAction::Remove);
        assert_eq!(event.record.path(), "/dev/sdc");
    }

    #[test]
    fn test_unknown_action_skipped() {
        assert!(event_from_properties(
            &props(&[("ACTION", "bind"), ("SUBSYSTEM", "block"), ("DEVTYPE", "disk")]),
            Path::new("/nonexistent"),
        )
        .is_none());
    }

    #[test]
    fn test_enumerate_from_sysfs_tree() {
        let dir = tempfile::tempdir().unwrap();
        let sys = dir.path().join("sys");
        let data = dir.path().join("udev");
        let disk_dir = sys.join("devices/pci0/usb1/host6/block/sdb");
        let part_dir = disk_dir.join("sdb1");
        let fixed_dir = sys.join("devices/pci0/ata1/block/sda");
        fs::create_dir_all(&part_dir).unwrap();
        fs::create_dir_all(&fixed_dir).unwrap();
        fs::create_dir_all(sys.join("class/block")).unwrap();
        fs::create_dir_all(&data).unwrap();

        fs::write(disk_dir.join("uevent"), "MAJOR=8\nMINOR=16\nDEVNAME=sdb\nDEVTYPE=disk\n").unwrap();
        fs::write(disk_dir.join("removable"), "1\n").unwrap();
        fs::write(part_dir.join("uevent"), "MAJOR=8\nMINOR=17\nDEVNAME=sdb1\nDEVTYPE=partition\n")
            .unwrap();
        fs::write(fixed_dir.join("uevent"), "MAJOR=8\nMINOR=0\nDEVNAME=sda\nDEVTYPE=disk\n").unwrap();
        fs::write(fixed_dir.join("removable"), "0\n").unwrap();
        fs::write(data.join("b8:17"), "S:disk/by-label/STICK\nE:ID_FS_TYPE=vfat\nE:ID_FS_LABEL=STICK\n")
            .unwrap();

        std::os::unix::fs::symlink(&part_dir, sys.join("class/block/sdb1")).unwrap();
        std::os::unix::fs::symlink(&disk_dir, sys.join("class/block/sdb")).unwrap();
        std::os::unix::fs::symlink(&fixed_dir, sys.join("class/block/sda")).unwrap();

        let records = enumerate_block_devices(&sys, &data).unwrap();
        let paths: Vec<&str> = records.iter().map(|r| r.path()).collect();
        assert_eq!(paths, vec!["/dev/sdb", "/dev/sdb1"]);
        assert_eq!(records[1].filesystem(), Some("vfat"));
        assert_eq!(records[1].label(), Some("STICK"));
        assert_eq!(records[1].parent_path(), "/dev/sdb");
    }
}
