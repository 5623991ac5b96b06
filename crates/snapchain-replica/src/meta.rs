//! On-disk metadata: `volume.meta`, layer sidecars and crash recovery.
//!
//! All metadata files are JSON written through a temp file, `fsync` and
//! `rename`, so a reader sees either the old or the new contents. Multi-file
//! chain mutations record their intent in `volume.meta` first; [`recover_pending`]
//! finishes or undoes an interrupted mutation when the replica is reopened.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::chain::{meta_file_name, DiskInfo, IMG_SUFFIX, META_SUFFIX};
use crate::error::{ReplicaError, ReplicaResult};
use crate::sparse::DiskFile;

/// File name of the replica-level metadata.
pub const VOLUME_META: &str = "volume.meta";

const TMP_SUFFIX: &str = ".tmp";

/// Current RFC 3339 timestamp in UTC.
pub fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// A chain mutation that was started but not yet committed to `volume.meta`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PendingOp {
    /// The head is being frozen into a snapshot.
    Snapshot {
        /// Head layer being frozen.
        old_head: String,
        /// Parent of the old head, inherited by the snapshot.
        parent: Option<String>,
        /// Snapshot layer the old head becomes.
        snapshot: String,
        /// Fresh head created above the snapshot.
        new_head: String,
        /// Creation timestamp for both new records.
        created: String,
        /// Whether the snapshot was requested by a user.
        user_created: bool,
        /// Allocated bytes of the frozen head.
        size: String,
    },
    /// The head is being replaced by a fresh head on an older snapshot.
    Revert {
        /// Head layer being discarded.
        old_head: String,
        /// Snapshot the new head is stacked on.
        snapshot: String,
        /// Fresh head.
        new_head: String,
        /// Creation timestamp of the new head.
        created: String,
    },
}

/// Replica-level metadata persisted in `volume.meta`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaInfo {
    /// Logical volume size in bytes.
    pub size: u64,
    /// Block size in bytes.
    pub block_size: u64,
    /// Current head layer.
    pub head: String,
    /// Set while the replica is open for writing, cleared on clean close.
    #[serde(default)]
    pub dirty: bool,
    /// Set while the replica is being rebuilt from a peer.
    #[serde(default)]
    pub rebuilding: bool,
    /// Name of the read-only backing image, if any.
    #[serde(default)]
    pub backing_file: Option<String>,
    /// Snapshot recorded as the last consistent point.
    #[serde(default)]
    pub checkpoint: Option<String>,
    /// Name of the owning backend (diagnostic).
    #[serde(default)]
    pub backend_name: String,
    /// Interrupted chain mutation, if any.
    #[serde(default)]
    pub pending: Option<PendingOp>,
}

/// Writes `value` as JSON to `dir/name` atomically.
pub fn write_json_atomic<T: Serialize>(dir: &Path, name: &str, value: &T) -> ReplicaResult<()> {
    let data = serde_json::to_vec_pretty(value)?;
    let target = dir.join(name);
    let tmp = dir.join(format!("{}{}", name, TMP_SUFFIX));
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&data)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, &target)?;
    sync_dir(dir)?;
    debug!(file = %target.display(), bytes = data.len(), "metadata written");
    Ok(())
}

/// Reads a JSON file.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> ReplicaResult<T> {
    let data = fs::read(path)?;
    serde_json::from_slice(&data).map_err(|e| ReplicaError::SerializationError {
        reason: format!("{}: {}", path.display(), e),
    })
}

/// Flushes directory entries so renames and unlinks are durable.
pub fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

/// Path of a layer data file.
pub fn disk_path(dir: &Path, disk: &str) -> PathBuf {
    dir.join(disk)
}

/// Path of a layer sidecar.
pub fn sidecar_path(dir: &Path, disk: &str) -> PathBuf {
    dir.join(meta_file_name(disk))
}

/// Reads `volume.meta`, `None` when absent.
pub fn read_replica_info(dir: &Path) -> ReplicaResult<Option<ReplicaInfo>> {
    let path = dir.join(VOLUME_META);
    if !path.exists() {
        return Ok(None);
    }
    read_json(&path).map(Some)
}

/// Persists `volume.meta`.
pub fn write_replica_info(dir: &Path, info: &ReplicaInfo) -> ReplicaResult<()> {
    write_json_atomic(dir, VOLUME_META, info)
}

/// Persists one layer sidecar.
pub fn write_disk_info(dir: &Path, disk: &DiskInfo) -> ReplicaResult<()> {
    write_json_atomic(dir, &meta_file_name(&disk.name), disk)
}

/// Reads one layer sidecar.
pub fn read_disk_info(dir: &Path, disk: &str) -> ReplicaResult<DiskInfo> {
    read_json(&sidecar_path(dir, disk))
}

/// Deletes a file, treating a missing file as success.
pub fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Deletes a layer's sidecar, then its data file.
pub fn remove_disk_files(dir: &Path, disk: &str) -> ReplicaResult<()> {
    remove_if_exists(&sidecar_path(dir, disk))?;
    remove_if_exists(&disk_path(dir, disk))?;
    sync_dir(dir)?;
    Ok(())
}

/// Loads every layer sidecar in `dir`.
///
/// Stale temp files left by an interrupted atomic write are deleted. A sidecar
/// whose recorded name differs from its file name, or whose data file is
/// missing, is reported as chain corruption.
pub fn load_disk_infos(dir: &Path) -> ReplicaResult<Vec<DiskInfo>> {
    let suffix = format!("{}{}", IMG_SUFFIX, META_SUFFIX);
    let mut disks = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        if file_name.ends_with(TMP_SUFFIX) {
            warn!(file = file_name, "removing stale temp file");
            remove_if_exists(&entry.path())?;
            continue;
        }
        let Some(disk) = file_name.strip_suffix(META_SUFFIX) else {
            continue;
        };
        if !file_name.ends_with(&suffix) {
            continue;
        }
        let info: DiskInfo = read_json(&entry.path())?;
        if info.name != disk {
            return Err(ReplicaError::corruption(format!(
                "sidecar {} describes {}",
                file_name, info.name
            )));
        }
        if !disk_path(dir, disk).exists() {
            return Err(ReplicaError::corruption(format!(
                "data file for {} is missing",
                disk
            )));
        }
        disks.push(info);
    }
    disks.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(disks)
}

/// Finishes or undoes the mutation recorded in `info.pending`.
///
/// Returns whether anything was recovered. `info` is updated and persisted.
pub fn recover_pending(dir: &Path, info: &mut ReplicaInfo) -> ReplicaResult<bool> {
    let Some(pending) = info.pending.clone() else {
        return Ok(false);
    };
    match &pending {
        PendingOp::Snapshot {
            old_head,
            parent,
            snapshot,
            new_head,
            created,
            user_created,
            size,
        } => {
            if disk_path(dir, old_head).exists() {
                // The rename never happened; nothing else was touched.
                info!(old_head = %old_head, snapshot = %snapshot, "rolling back interrupted snapshot");
                remove_if_exists(&sidecar_path(dir, snapshot))?;
                info.head = old_head.clone();
            } else {
                info!(snapshot = %snapshot, new_head = %new_head, "rolling forward interrupted snapshot");
                if !sidecar_path(dir, snapshot).exists() {
                    let mut snap = DiskInfo::new(snapshot.clone(), parent.clone(), created.clone(), *user_created);
                    snap.size = size.clone();
                    write_disk_info(dir, &snap)?;
                }
                remove_if_exists(&sidecar_path(dir, old_head))?;
                ensure_head(dir, new_head, snapshot, created, info.size)?;
                info.head = new_head.clone();
            }
        }
        PendingOp::Revert {
            old_head,
            snapshot,
            new_head,
            created,
        } => {
            if sidecar_path(dir, new_head).exists() {
                info!(old_head = %old_head, new_head = %new_head, "rolling forward interrupted revert");
                remove_disk_files(dir, old_head)?;
                ensure_head(dir, new_head, snapshot, created, info.size)?;
                info.head = new_head.clone();
            } else {
                info!(old_head = %old_head, new_head = %new_head, "rolling back interrupted revert");
                remove_if_exists(&disk_path(dir, new_head))?;
                info.head = old_head.clone();
            }
        }
    }
    info.pending = None;
    write_replica_info(dir, info)?;
    Ok(true)
}

fn ensure_head(dir: &Path, head: &str, parent: &str, created: &str, size: u64) -> ReplicaResult<()> {
    let path = disk_path(dir, head);
    if !path.exists() {
        DiskFile::create(&path, size)?;
    }
    if !sidecar_path(dir, head).exists() {
        let disk = DiskInfo::new(head, Some(parent.to_string()), created, false);
        write_disk_info(dir, &disk)?;
    }
    Ok(())
}
