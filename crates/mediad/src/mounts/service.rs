//! Tree-aware mount/unmount/poweroff.
//!
//! Resolves a client request against the [`DeviceTree`] and the filesystem
//! table before handing it to the [`MountOrchestrator`]. On success the tree
//! is updated and the resulting event returned for broadcast.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use mediad_core::{DeviceKind, DeviceRecord, ErrorCode, MountEntry, MountInfo};

use super::{MountOrchestrator, MountRequest, MountTableError};
use crate::config::{DaemonConfig, FilesystemConfig};
use crate::tree::{DeviceTree, TreeEvent};

pub struct MountService {
    orchestrator: Box<dyn MountOrchestrator>,
    mount_dir: PathBuf,
    filesystems: BTreeMap<String, FilesystemConfig>,
}

impl MountService {
    pub fn new(config: &DaemonConfig, orchestrator: impl MountOrchestrator + 'static) -> Self {
        Self {
            orchestrator: Box::new(orchestrator),
            mount_dir: config.mount_dir.clone(),
            filesystems: config.filesystems.clone(),
        }
    }

    pub fn supported_filesystems(&self) -> Vec<String> {
        self.filesystems.keys().cloned().collect()
    }

    /// Options a client may request for `filesystem`, if it is supported.
    pub fn filesystem_options(&self, filesystem: &str) -> Option<&[String]> {
        self.filesystems
            .get(filesystem)
            .map(|fs| fs.allowed_options.as_slice())
    }

    pub fn current_mounts(&self) -> Result<Vec<MountEntry>, MountTableError> {
        self.orchestrator.current_mounts()
    }

    /// Mounts the device at `path` under the mount directory.
    pub fn mount(
        &mut self,
        tree: &mut DeviceTree,
        path: &str,
        options: Option<&str>,
    ) -> Result<TreeEvent, ErrorCode> {
        let node = tree.get(path).ok_or(ErrorCode::NoSuchRemovableDevice)?;
        let record = node.record();
        if !record.is_mountable() {
            return Err(ErrorCode::NoSuchRemovableDevice);
        }
        let filesystem = record
            .filesystem()
            .ok_or(ErrorCode::FstypeNotRecognized)?
            .to_string();
        let fs_config = self
            .filesystems
            .get(&filesystem)
            .ok_or(ErrorCode::UnsupportedFstype)?;
        if node.mount().is_some() {
            return Err(ErrorCode::DeviceAlreadyMounted);
        }
        let options = resolve_options(fs_config, options)?;

        let mount_point = self.choose_mount_point(tree, record);
        let created = !mount_point.exists();
        fs::create_dir_all(&mount_point).map_err(|e| {
            warn!(mount_point = %mount_point.display(), error = %e, "Failed to create mount point");
            ErrorCode::GenericError
        })?;

        let request = MountRequest {
            device: path.to_string(),
            mount_point,
            filesystem,
            options,
        };

        if let Err(code) = self.orchestrator.mount(&request) {
            info!(path = %path, code = %code, "Mount failed");
            if created {
                let _ = fs::remove_dir(&request.mount_point);
            }
            return Err(code);
        }

        let info = MountInfo::new(
            request.mount_point.to_string_lossy(),
            request.options_string(),
        );
        info!(
            path = %path,
            mount_point = %info.mount_point,
            options = %info.options,
            "Device mounted"
        );
        tree.set_mount_info(path, info).ok_or(ErrorCode::GenericError)
    }

    /// Unmounts the device at `path`.
    pub fn unmount(&mut self, tree: &mut DeviceTree, path: &str) -> Result<TreeEvent, ErrorCode> {
        let node = tree.get(path).ok_or(ErrorCode::NoSuchRemovableDevice)?;
        let mount_point = node
            .mount()
            .map(|m| m.mount_point.clone())
            .ok_or(ErrorCode::DeviceNotMounted)?;

        self.orchestrator.unmount(path, &mount_point)?;
        info!(path = %path, mount_point = %mount_point, "Device unmounted");

        let point = Path::new(&mount_point);
        if point.starts_with(&self.mount_dir) {
            if let Err(e) = fs::remove_dir(point) {
                debug!(mount_point = %mount_point, error = %e, "Mount point left in place");
            }
        }

        tree.clear_mount_info(path).ok_or(ErrorCode::GenericError)
    }

    /// Detaches a root disk once none of its partitions are mounted.
    pub fn poweroff(&mut self, tree: &DeviceTree, path: &str) -> Result<(), ErrorCode> {
        let node = tree.get(path).ok_or(ErrorCode::NoSuchRemovableDevice)?;
        if node.record().kind() != DeviceKind::StatelessDevice {
            return Err(ErrorCode::NoSuchRemovableDevice);
        }
        if node.children().iter().any(|child| child.mount().is_some()) {
            return Err(ErrorCode::DeviceAlreadyMounted);
        }

        self.orchestrator.poweroff(path)?;
        info!(path = %path, "Device powered off");
        Ok(())
    }

    /// `mount_dir/<label or device name>`, suffixed `_N` while taken.
    fn choose_mount_point(&self, tree: &DeviceTree, record: &DeviceRecord) -> PathBuf {
        let device_name = record.path().rsplit('/').next().unwrap_or_default();
        let base = match record.label().map(|l| l.replace('/', "_")) {
            Some(label) if !label.is_empty() && label != "." && label != ".." => label,
            _ => device_name.to_string(),
        };

        let mut candidate = self.mount_dir.join(&base);
        let mut suffix = 1;
        while mount_point_taken(tree, &candidate) {
            candidate = self.mount_dir.join(format!("{base}_{suffix}"));
            suffix += 1;
        }
        candidate
    }
}

fn mount_point_taken(tree: &DeviceTree, candidate: &Path) -> bool {
    let non_empty = fs::read_dir(candidate)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false);
    non_empty
        || tree
            .list_all()
            .iter()
            .filter_map(|node| node.mount())
            .any(|m| Path::new(&m.mount_point) == candidate)
}

/// Validates a client option string against the filesystem's whitelist.
///
/// `None` selects the filesystem defaults.
fn resolve_options(fs: &FilesystemConfig, options: Option<&str>) -> Result<Vec<String>, ErrorCode> {
    let Some(options) = options else {
        return Ok(fs.default_options.clone());
    };

    options
        .split(',')
        .map(|option| {
            if option.is_empty() || option.contains(char::is_whitespace) || !fs.allows(option) {
                Err(ErrorCode::FailedParsingMountOptions)
            } else {
                Ok(option.to_string())
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use mediad_core::{DeviceAction, DeviceSubtype, MediaState};

    #[derive(Default)]
    struct Log {
        mounts: Vec<MountRequest>,
        unmounts: Vec<(String, String)>,
        poweroffs: Vec<String>,
    }

    #[derive(Clone, Default)]
    struct FakeMounts {
        log: Arc<Mutex<Log>>,
        fail: Option<ErrorCode>,
    }

    impl MountOrchestrator for FakeMounts {
        fn mount(&mut self, request: &MountRequest) -> Result<(), ErrorCode> {
            if let Some(code) = self.fail {
                return Err(code);
            }
            self.log.lock().unwrap().mounts.push(request.clone());
            Ok(())
        }

        fn unmount(&mut self, device: &str, mount_point: &str) -> Result<(), ErrorCode> {
            if let Some(code) = self.fail {
                return Err(code);
            }
            self.log
                .lock()
                .unwrap()
                .unmounts
                .push((device.to_string(), mount_point.to_string()));
            Ok(())
        }

        fn poweroff(&mut self, device: &str) -> Result<(), ErrorCode> {
            self.log.lock().unwrap().poweroffs.push(device.to_string());
            Ok(())
        }

        fn current_mounts(&self) -> Result<Vec<MountEntry>, MountTableError> {
            Ok(Vec::new())
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        mount_dir: PathBuf,
        tree: DeviceTree,
        service: MountService,
        log: Arc<Mutex<Log>>,
    }

    fn fixture_with(fail: Option<ErrorCode>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mount_dir = dir.path().join("media");
        let config = DaemonConfig {
            mount_dir: mount_dir.clone(),
            ..DaemonConfig::default()
        };
        let fake = FakeMounts {
            fail,
            ..FakeMounts::default()
        };
        let log = Arc::clone(&fake.log);

        let mut tree = DeviceTree::new();
        let disk = DeviceRecord::stateless("/dev/sdb", DeviceSubtype::RemovableDisk).unwrap();
        tree.apply(Arc::new(disk), DeviceAction::Add);
        for (path, fs, label) in [
            ("/dev/sdb1", Some("vfat"), Some("STICK")),
            ("/dev/sdb2", None, None),
            ("/dev/sdb3", Some("zfs"), None),
            ("/dev/sdb4", Some("ext4"), Some("a/b")),
        ] {
            let part = DeviceRecord::partition(
                path,
                "/dev/sdb",
                fs.map(str::to_string),
                label.map(str::to_string),
            )
            .unwrap();
            tree.apply(Arc::new(part), DeviceAction::Add);
        }

        Fixture {
            _dir: dir,
            mount_dir,
            tree,
            service: MountService::new(&config, fake),
            log,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(None)
    }

    #[test]
    fn test_mount_with_defaults() {
        let mut f = fixture();
        let event = f.service.mount(&mut f.tree, "/dev/sdb1", None).unwrap();
        let expected_point = f.mount_dir.join("STICK");
        assert_eq!(
            event,
            TreeEvent::Mounted {
                path: "/dev/sdb1".to_string(),
                mount: MountInfo::new(expected_point.to_string_lossy(), "rw,nosuid,nodev,flush"),
            }
        );
        assert!(expected_point.is_dir());
        let log = f.log.lock().unwrap();
        assert_eq!(log.mounts[0].filesystem, "vfat");
        assert!(f.tree.get("/dev/sdb1").unwrap().mount().is_some());
    }

    #[test]
    fn test_mount_error_codes() {
        let mut f = fixture();
        let t = &mut f.tree;
        assert_eq!(
            f.service.mount(t, "/dev/sdz1", None),
            Err(ErrorCode::NoSuchRemovableDevice)
        );
        assert_eq!(
            f.service.mount(t, "/dev/sdb", None),
            Err(ErrorCode::NoSuchRemovableDevice)
        );
        assert_eq!(
            f.service.mount(t, "/dev/sdb2", None),
            Err(ErrorCode::FstypeNotRecognized)
        );
        assert_eq!(
            f.service.mount(t, "/dev/sdb3", None),
            Err(ErrorCode::UnsupportedFstype)
        );
        assert_eq!(
            f.service.mount(t, "/dev/sdb1", Some("rw,,noexec")),
            Err(ErrorCode::FailedParsingMountOptions)
        );
        assert_eq!(
            f.service.mount(t, "/dev/sdb1", Some("rw,exec")),
            Err(ErrorCode::FailedParsingMountOptions)
        );
        f.service.mount(t, "/dev/sdb1", Some("ro,uid=1000")).unwrap();
        assert_eq!(
            f.service.mount(t, "/dev/sdb1", None),
            Err(ErrorCode::DeviceAlreadyMounted)
        );
    }

    #[test]
    fn test_stateful_without_media_not_mountable() {
        let mut f = fixture();
        let cd = DeviceRecord::stateful("/dev/sr0", DeviceSubtype::Cdrom, MediaState::Empty, None, None)
            .unwrap();
        f.tree.apply(Arc::new(cd), DeviceAction::Add);
        assert_eq!(
            f.service.mount(&mut f.tree, "/dev/sr0", None),
            Err(ErrorCode::NoSuchRemovableDevice)
        );
    }

    #[test]
    fn test_orchestrator_code_surfaced() {
        let mut f = fixture_with(Some(ErrorCode::MountPointBusy));
        assert_eq!(
            f.service.mount(&mut f.tree, "/dev/sdb1", None),
            Err(ErrorCode::MountPointBusy)
        );
        assert!(f.tree.get("/dev/sdb1").unwrap().mount().is_none());
        assert!(!f.mount_dir.join("STICK").exists());
    }

    #[test]
    fn test_mount_point_naming() {
        let mut f = fixture();
        // Label with a slash is flattened.
        match f.service.mount(&mut f.tree, "/dev/sdb4", None).unwrap() {
            TreeEvent::Mounted { mount, .. } => {
                assert_eq!(Path::new(&mount.mount_point), f.mount_dir.join("a_b"));
            }
            other => panic!("unexpected {other:?}"),
        }

        // A non-empty directory with the label's name forces a suffix.
        let busy = f.mount_dir.join("STICK");
        fs::create_dir_all(&busy).unwrap();
        fs::write(busy.join("file"), b"x").unwrap();
        match f.service.mount(&mut f.tree, "/dev/sdb1", None).unwrap() {
            TreeEvent::Mounted { mount, .. } => {
                assert_eq!(Path::new(&mount.mount_point), f.mount_dir.join("STICK_1"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unmount() {
        let mut f = fixture();
        assert_eq!(
            f.service.unmount(&mut f.tree, "/dev/sdb1"),
            Err(ErrorCode::DeviceNotMounted)
        );
        assert_eq!(
            f.service.unmount(&mut f.tree, "/dev/nope"),
            Err(ErrorCode::NoSuchRemovableDevice)
        );

        f.service.mount(&mut f.tree, "/dev/sdb1", None).unwrap();
        let event = f.service.unmount(&mut f.tree, "/dev/sdb1").unwrap();
        assert!(matches!(event, TreeEvent::Unmounted { ref path, .. } if path == "/dev/sdb1"));
        assert!(!f.mount_dir.join("STICK").exists());
        assert_eq!(f.log.lock().unwrap().unmounts.len(), 1);
    }

    #[test]
    fn test_poweroff_rules() {
        let mut f = fixture();
        assert_eq!(
            f.service.poweroff(&f.tree, "/dev/sdb1"),
            Err(ErrorCode::NoSuchRemovableDevice)
        );
        f.service.mount(&mut f.tree, "/dev/sdb1", None).unwrap();
        assert_eq!(
            f.service.poweroff(&f.tree, "/dev/sdb"),
            Err(ErrorCode::DeviceAlreadyMounted)
        );
        f.service.unmount(&mut f.tree, "/dev/sdb1").unwrap();
        f.service.poweroff(&f.tree, "/dev/sdb").unwrap();
        assert_eq!(f.log.lock().unwrap().poweroffs, vec!["/dev/sdb".to_string()]);
    }

    #[test]
    fn test_filesystem_queries() {
        let f = fixture();
        assert!(f.service.supported_filesystems().contains(&"vfat".to_string()));
        assert!(f.service.filesystem_options("vfat").unwrap().contains(&"uid".to_string()));
        assert!(f.service.filesystem_options("zfs").is_none());
    }
}
