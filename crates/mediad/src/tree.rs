//! The daemon's live device tree.
//!
//! Root devices (disks, SD cards, optical drives) own their partitions as
//! children. The tree is owned by the event loop and never shared across
//! threads; records arrive from the monitor as `Arc<DeviceRecord>` and are
//! stored without copying.
//!
//! Every mutation returns the [`TreeEvent`]s it produced, in the order
//! clients must see them.

use std::sync::Arc;

use tracing::{debug, error};

use mediad_core::{DeviceAction, DeviceKind, DeviceRecord, MountEntry, MountInfo};
use mediad_protocol::{DeviceDescription, Notification};

/// A visible change to the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeEvent {
    Added(DeviceDescription),
    Removed { path: String },
    Changed(DeviceDescription),
    Mounted { path: String, mount: MountInfo },
    Unmounted { path: String, mount_point: String },
}

impl TreeEvent {
    pub fn path(&self) -> &str {
        match self {
            TreeEvent::Added(d) | TreeEvent::Changed(d) => &d.path,
            TreeEvent::Removed { path }
            | TreeEvent::Mounted { path, .. }
            | TreeEvent::Unmounted { path, .. } => path,
        }
    }

    /// The broadcast every client receives for this event.
    pub fn to_notification(&self) -> Notification {
        match self {
            TreeEvent::Added(d) => Notification::Added(d.clone()),
            TreeEvent::Changed(d) => Notification::Changed(d.clone()),
            TreeEvent::Removed { path } => Notification::Removed { path: path.clone() },
            TreeEvent::Mounted { path, mount } => Notification::Mounted {
                path: path.clone(),
                mount_point: mount.mount_point.clone(),
                options: mount.options.clone(),
            },
            TreeEvent::Unmounted { path, mount_point } => Notification::Unmounted {
                path: path.clone(),
                mount_point: mount_point.clone(),
            },
        }
    }
}

/// One device in the tree plus its mount state.
#[derive(Debug, Clone)]
pub struct DeviceNode {
    record: Arc<DeviceRecord>,
    mount: Option<MountInfo>,
    children: Vec<DeviceNode>,
}

impl DeviceNode {
    fn new(record: Arc<DeviceRecord>) -> Self {
        Self {
            record,
            mount: None,
            children: Vec::new(),
        }
    }

    pub fn record(&self) -> &Arc<DeviceRecord> {
        &self.record
    }

    pub fn path(&self) -> &str {
        self.record.path()
    }

    pub fn mount(&self) -> Option<&MountInfo> {
        self.mount.as_ref()
    }

    pub fn children(&self) -> &[DeviceNode] {
        &self.children
    }

    pub fn description(&self) -> DeviceDescription {
        DeviceDescription::from_record(&self.record, self.mount.as_ref())
    }
}

/// Root devices in insertion order, each with its partitions.
#[derive(Debug, Default)]
pub struct DeviceTree {
    roots: Vec<DeviceNode>,
}

impl DeviceTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of nodes, partitions included.
    pub fn len(&self) -> usize {
        self.roots.iter().map(|r| 1 + r.children.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    pub fn get(&self, path: &str) -> Option<&DeviceNode> {
        self.roots.iter().find_map(|root| {
            if root.path() == path {
                Some(root)
            } else {
                root.children.iter().find(|c| c.path() == path)
            }
        })
    }

    fn get_mut(&mut self, path: &str) -> Option<&mut DeviceNode> {
        self.roots.iter_mut().find_map(|root| {
            if root.path() == path {
                Some(root)
            } else {
                root.children.iter_mut().find(|c| c.path() == path)
            }
        })
    }

    /// Every node, depth-first: each root followed by its children.
    pub fn list_all(&self) -> Vec<&DeviceNode> {
        let mut out = Vec::with_capacity(self.len());
        for root in &self.roots {
            out.push(root);
            out.extend(root.children.iter());
        }
        out
    }

    /// The node at `path` and its subtree, or `None` if unknown.
    pub fn find(&self, path: &str) -> Option<Vec<&DeviceNode>> {
        let node = self.get(path)?;
        let mut out = Vec::with_capacity(1 + node.children.len());
        out.push(node);
        out.extend(node.children.iter());
        Some(out)
    }

    // ========================================================================
    // Monitor actions
    // ========================================================================

    /// Applies one monitor action.
    pub fn apply(&mut self, record: Arc<DeviceRecord>, action: DeviceAction) -> Vec<TreeEvent> {
        match action {
            DeviceAction::Add | DeviceAction::Online => self.insert(record).into_iter().collect(),
            DeviceAction::Remove | DeviceAction::Offline => self.remove(record.path()),
            DeviceAction::Change => self.change(record).into_iter().collect(),
        }
    }

    fn insert(&mut self, record: Arc<DeviceRecord>) -> Option<TreeEvent> {
        if self.contains(record.path()) {
            error!(bug = true, path = %record.path(), "Duplicate add for known device");
            return None;
        }

        let node = DeviceNode::new(record);
        let event = TreeEvent::Added(node.description());

        if node.record.is_root() {
            debug!(path = %node.path(), kind = %node.record.kind(), "Device added");
            self.roots.push(node);
            return Some(event);
        }

        let parent_path = node.record.parent_path().to_string();
        let parent = self.roots.iter_mut().find(|r| {
            r.path() == parent_path && r.record.kind() == DeviceKind::StatelessDevice
        });
        match parent {
            Some(parent) => {
                debug!(path = %node.path(), parent = %parent_path, "Partition added");
                parent.children.push(node);
                Some(event)
            }
            None => {
                error!(
                    bug = true,
                    path = %node.path(),
                    parent = %parent_path,
                    "Partition for unknown parent"
                );
                None
            }
        }
    }

    fn remove(&mut self, path: &str) -> Vec<TreeEvent> {
        if let Some(index) = self.roots.iter().position(|r| r.path() == path) {
            let root = self.roots.remove(index);
            let mut events: Vec<TreeEvent> = root
                .children
                .iter()
                .map(|child| TreeEvent::Removed {
                    path: child.path().to_string(),
                })
                .collect();
            events.push(TreeEvent::Removed {
                path: path.to_string(),
            });
            debug!(path = %path, partitions = root.children.len(), "Device removed");
            return events;
        }

        for root in &mut self.roots {
            if let Some(index) = root.children.iter().position(|c| c.path() == path) {
                root.children.remove(index);
                debug!(path = %path, "Partition removed");
                return vec![TreeEvent::Removed {
                    path: path.to_string(),
                }];
            }
        }

        Vec::new()
    }

    fn change(&mut self, record: Arc<DeviceRecord>) -> Option<TreeEvent> {
        let node = self.get_mut(record.path())?;

        if node.record.parent_path() != record.parent_path() {
            error!(
                bug = true,
                path = %record.path(),
                old_parent = %node.record.parent_path(),
                new_parent = %record.parent_path(),
                "Change would re-parent device, refusing"
            );
            return None;
        }
        if node.record.kind() != record.kind() {
            error!(
                bug = true,
                path = %record.path(),
                "Change with different device kind, refusing"
            );
            return None;
        }
        if *node.record == *record {
            return None;
        }

        node.record = record;
        debug!(path = %node.path(), "Device changed");
        Some(TreeEvent::Changed(node.description()))
    }

    // ========================================================================
    // Mount state
    // ========================================================================

    /// Records that `path` is mounted.
    ///
    /// Returns `None` if the path is unknown or already has exactly this
    /// mount info.
    pub fn set_mount_info(&mut self, path: &str, mount: MountInfo) -> Option<TreeEvent> {
        let node = self.get_mut(path)?;
        if node.mount.as_ref() == Some(&mount) {
            return None;
        }
        node.mount = Some(mount.clone());
        Some(TreeEvent::Mounted {
            path: path.to_string(),
            mount,
        })
    }

    /// Records that `path` is no longer mounted.
    pub fn clear_mount_info(&mut self, path: &str) -> Option<TreeEvent> {
        let node = self.get_mut(path)?;
        let previous = node.mount.take()?;
        Some(TreeEvent::Unmounted {
            path: path.to_string(),
            mount_point: previous.mount_point,
        })
    }

    /// Compares believed mount state with the live mount table.
    ///
    /// Nodes are visited in listing order. A node whose mount point moved
    /// yields `Unmounted` then `Mounted`; option-only drift is absorbed
    /// silently.
    pub fn reconcile_mounts(&mut self, live: &[MountEntry]) -> Vec<TreeEvent> {
        let mut events = Vec::new();

        let mut visit = |node: &mut DeviceNode| {
            let path = node.path().to_string();
            let current = live.iter().find(|entry| entry.device == path);

            match (node.mount.take(), current) {
                (None, None) => {}
                (Some(believed), Some(entry)) if believed.mount_point == entry.mount_point => {
                    node.mount = Some(entry.info());
                }
                (believed, current) => {
                    if let Some(old) = believed {
                        events.push(TreeEvent::Unmounted {
                            path: path.clone(),
                            mount_point: old.mount_point,
                        });
                    }
                    node.mount = current.map(MountEntry::info);
                    if let Some(mount) = &node.mount {
                        events.push(TreeEvent::Mounted {
                            path,
                            mount: mount.clone(),
                        });
                    }
                }
            }
        };

        for root in &mut self.roots {
            visit(root);
            for child in &mut root.children {
                visit(child);
            }
        }

        events
    }
}
