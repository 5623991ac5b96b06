//! Snapshot chain metadata.
//!
//! Every layer of a volume is described by a [`DiskInfo`] record. [`DiskChain`]
//! owns all records of one replica and keeps three derived views consistent:
//! the name index, the `parent -> children` index and the active chain from
//! the root to the writable head.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ReplicaError, ReplicaResult};

/// File name prefix of the writable head layer.
pub const HEAD_PREFIX: &str = "volume-head-";
/// File name prefix of snapshot layers.
pub const SNAP_PREFIX: &str = "volume-snap-";
/// File name suffix of layer data files.
pub const IMG_SUFFIX: &str = ".img";
/// Suffix appended to a data file name to form its metadata sidecar.
pub const META_SUFFIX: &str = ".meta";

/// Name of the head layer with the given sequence number.
pub fn head_disk_name(seq: u64) -> String {
    format!("{}{:03}{}", HEAD_PREFIX, seq, IMG_SUFFIX)
}

/// Name of the snapshot layer for a user-facing snapshot name.
pub fn snapshot_disk_name(name: &str) -> String {
    format!("{}{}{}", SNAP_PREFIX, name, IMG_SUFFIX)
}

/// Name of the metadata sidecar for a layer.
pub fn meta_file_name(disk: &str) -> String {
    format!("{}{}", disk, META_SUFFIX)
}

/// Whether `name` is a head layer name.
pub fn is_head_disk(name: &str) -> bool {
    head_seq(name).is_some()
}

/// Sequence number embedded in a head layer name.
pub fn head_seq(name: &str) -> Option<u64> {
    name.strip_prefix(HEAD_PREFIX)?
        .strip_suffix(IMG_SUFFIX)?
        .parse()
        .ok()
}

/// Metadata for one layer, persisted in the layer's `.meta` sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskInfo {
    /// Layer file name, e.g. `volume-snap-001.img`.
    pub name: String,
    /// Layer directly beneath this one, `None` for the chain root.
    #[serde(default)]
    pub parent: Option<String>,
    /// Layers whose parent is this layer. Derived, never persisted.
    #[serde(skip)]
    pub children: Vec<String>,
    /// Caller-supplied creation timestamp.
    pub created: String,
    /// True for requested snapshots, false for rotated head layers.
    pub user_created: bool,
    /// Set while a removal plan for this layer is outstanding.
    #[serde(default)]
    pub removed: bool,
    /// Allocated bytes of the layer when it was last frozen (diagnostic).
    #[serde(default)]
    pub size: String,
}

impl DiskInfo {
    /// Creates a record with no children, not removed, size "0".
    pub fn new(
        name: impl Into<String>,
        parent: Option<String>,
        created: impl Into<String>,
        user_created: bool,
    ) -> Self {
        Self {
            name: name.into(),
            parent,
            children: Vec::new(),
            created: created.into(),
            user_created,
            removed: false,
            size: "0".to_string(),
        }
    }

    /// Parent name, or `""` for the root.
    pub fn parent_name(&self) -> &str {
        self.parent.as_deref().unwrap_or("")
    }
}

/// All layer records of one replica plus the indices derived from them.
#[derive(Debug, Clone)]
pub struct DiskChain {
    disks: HashMap<String, DiskInfo>,
    children: HashMap<String, BTreeSet<String>>,
    active: Vec<String>,
    head: String,
}

impl DiskChain {
    /// Builds a chain from loaded records and validates it.
    ///
    /// Fails with [`ReplicaError::ChainCorruption`] when there is not exactly
    /// one root, not exactly one childless head layer, a parent is missing, or
    /// the parent links form a cycle.
    pub fn from_disks(disks: Vec<DiskInfo>) -> ReplicaResult<Self> {
        let mut map = HashMap::with_capacity(disks.len());
        for mut disk in disks {
            disk.children.clear();
            if let Some(prev) = map.insert(disk.name.clone(), disk) {
                return Err(ReplicaError::corruption(format!(
                    "duplicate layer {}",
                    prev.name
                )));
            }
        }
        let mut chain = Self {
            disks: map,
            children: HashMap::new(),
            active: Vec::new(),
            head: String::new(),
        };
        chain.rebuild()?;
        Ok(chain)
    }

    /// A fresh chain holding only a root head layer.
    pub fn with_root_head(head: DiskInfo) -> ReplicaResult<Self> {
        Self::from_disks(vec![head])
    }

    fn rebuild(&mut self) -> ReplicaResult<()> {
        if self.disks.is_empty() {
            return Err(ReplicaError::corruption("no layers"));
        }

        let mut children: HashMap<String, BTreeSet<String>> = HashMap::new();
        let mut roots = Vec::new();
        for disk in self.disks.values() {
            match &disk.parent {
                None => roots.push(disk.name.clone()),
                Some(parent) => {
                    if !self.disks.contains_key(parent) {
                        return Err(ReplicaError::corruption(format!(
                            "layer {} references missing parent {}",
                            disk.name, parent
                        )));
                    }
                    children
                        .entry(parent.clone())
                        .or_default()
                        .insert(disk.name.clone());
                }
            }
        }
        if roots.len() != 1 {
            roots.sort();
            return Err(ReplicaError::corruption(format!(
                "expected exactly one root layer, found {:?}",
                roots
            )));
        }

        let mut heads: Vec<&String> = self.disks.keys().filter(|n| is_head_disk(n)).collect();
        if heads.len() != 1 {
            heads.sort();
            return Err(ReplicaError::corruption(format!(
                "expected exactly one head layer, found {:?}",
                heads
            )));
        }
        let head = heads[0].clone();
        if children.contains_key(&head) {
            return Err(ReplicaError::corruption(format!(
                "head layer {} has children",
                head
            )));
        }

        // Every layer must reach the root; a longer walk means a cycle.
        let limit = self.disks.len();
        for name in self.disks.keys() {
            let mut cursor = name.as_str();
            let mut steps = 0;
            while let Some(parent) = self.disks[cursor].parent.as_deref() {
                steps += 1;
                if steps > limit {
                    return Err(ReplicaError::corruption(format!(
                        "parent links of {} form a cycle",
                        name
                    )));
                }
                cursor = parent;
            }
        }

        let mut active = vec![head.clone()];
        let mut cursor = head.as_str();
        while let Some(parent) = self.disks[cursor].parent.as_deref() {
            active.push(parent.to_string());
            cursor = parent;
        }
        active.reverse();

        debug!(head = %head, layers = self.disks.len(), active = active.len(), "chain rebuilt");
        self.children = children;
        self.active = active;
        self.head = head;
        Ok(())
    }

    /// Name of the writable head layer.
    pub fn head(&self) -> &str {
        &self.head
    }

    /// Active layer names from the root (index 0) to the head (last).
    pub fn active(&self) -> &[String] {
        &self.active
    }

    /// Position of a layer in the active chain.
    pub fn active_index(&self, name: &str) -> Option<usize> {
        self.active.iter().position(|n| n == name)
    }

    /// Number of layers, including side branches.
    pub fn len(&self) -> usize {
        self.disks.len()
    }

    /// Whether the chain holds no layers. Never true for a validated chain.
    pub fn is_empty(&self) -> bool {
        self.disks.is_empty()
    }

    /// Whether a layer with this exact name exists.
    pub fn contains(&self, name: &str) -> bool {
        self.disks.contains_key(name)
    }

    /// Record for a layer. `children` is left empty; use [`Self::describe`].
    pub fn get(&self, name: &str) -> Option<&DiskInfo> {
        self.disks.get(name)
    }

    /// Children of a layer, `None` when it has none.
    pub fn children_of(&self, name: &str) -> Option<&BTreeSet<String>> {
        self.children.get(name)
    }

    /// Number of children of a layer.
    pub fn child_count(&self, name: &str) -> usize {
        self.children.get(name).map_or(0, |c| c.len())
    }

    /// Copy of the `parent -> children` index. Layers without children have no entry.
    pub fn children_map(&self) -> HashMap<String, BTreeSet<String>> {
        self.children.clone()
    }

    /// Resolves a layer name or a user-facing snapshot name.
    pub fn resolve(&self, name: &str) -> Option<String> {
        if self.disks.contains_key(name) {
            return Some(name.to_string());
        }
        let disk = snapshot_disk_name(name);
        self.disks.contains_key(&disk).then_some(disk)
    }

    /// A copy of one record with its children filled in, sorted.
    pub fn describe(&self, name: &str) -> Option<DiskInfo> {
        let mut disk = self.disks.get(name)?.clone();
        disk.children = self
            .children
            .get(name)
            .map(|c| c.iter().cloned().collect())
            .unwrap_or_default();
        Some(disk)
    }

    /// Copies of every record keyed by name, children filled in.
    pub fn list(&self) -> HashMap<String, DiskInfo> {
        self.disks
            .keys()
            .filter_map(|name| self.describe(name).map(|d| (name.clone(), d)))
            .collect()
    }

    /// Copies of the active records from root to head.
    pub fn active_disks(&self) -> Vec<DiskInfo> {
        self.active
            .iter()
            .filter_map(|name| self.describe(name))
            .collect()
    }

    /// Active layer names from the head down to the root.
    pub fn chain_names(&self) -> Vec<String> {
        self.active.iter().rev().cloned().collect()
    }

    /// Sequence number for the next head layer.
    pub fn next_head_seq(&self) -> u64 {
        head_seq(&self.head).map_or(0, |seq| seq + 1)
    }

    /// Turns the head into `snapshot` and appends `new_head` above it.
    pub(crate) fn freeze_head(&mut self, snapshot: DiskInfo, new_head: DiskInfo) -> ReplicaResult<()> {
        let old = self.head.clone();
        self.disks.remove(&old);
        self.disks.insert(snapshot.name.clone(), snapshot);
        self.disks.insert(new_head.name.clone(), new_head);
        self.rebuild()
    }

    /// Drops `name` and re-points its children to its parent.
    pub(crate) fn unlink(&mut self, name: &str) -> ReplicaResult<()> {
        let removed = self
            .disks
            .remove(name)
            .ok_or_else(|| ReplicaError::invalid_target(name, "layer not found"))?;
        for disk in self.disks.values_mut() {
            if disk.parent.as_deref() == Some(name) {
                disk.parent = removed.parent.clone();
            }
        }
        self.rebuild()
    }

    /// Replaces a record in place, keeping indices consistent.
    pub(crate) fn update(&mut self, disk: DiskInfo) -> ReplicaResult<()> {
        if !self.disks.contains_key(&disk.name) {
            return Err(ReplicaError::invalid_target(&disk.name, "layer not found"));
        }
        let relinked = self.disks[&disk.name].parent != disk.parent;
        self.disks.insert(disk.name.clone(), disk);
        if relinked {
            self.rebuild()?;
        }
        Ok(())
    }
}
