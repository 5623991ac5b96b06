//! The replica: a block volume stored as a chain of sparse layer files.
//!
//! [`Replica`] ties the chain metadata, the block dispatcher and the on-disk
//! metadata together and exposes the volume operations. One lock guards the
//! chain and the open layers: reads and writes share it, chain mutations
//! (snapshot, revert, coalesce, remove) hold it exclusively.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::chain::{
    head_disk_name, is_head_disk, meta_file_name, snapshot_disk_name, DiskChain, DiskInfo,
    IMG_SUFFIX, META_SUFFIX,
};
use crate::config::ReplicaConfig;
use crate::error::{ReplicaError, ReplicaResult};
use crate::holes::{HolePunchStats, HolePuncher};
use crate::lun::LunGenerator;
use crate::meta::{
    disk_path, load_disk_infos, now, read_replica_info, recover_pending, remove_disk_files,
    remove_if_exists, sidecar_path, sync_dir, write_disk_info, write_replica_info, PendingOp,
    ReplicaInfo,
};
use crate::rebuild::{punchable_floor, LunMapSync, SyncState};
use crate::removal::{check_removable, plan_removal, PrepareRemoveAction, RemoveOp};
use crate::sparse::{DiskFile, SparseFile};
use crate::volume::{BackingFile, Volume};

/// Access mode of a replica within its volume group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReplicaMode {
    /// Serving reads and writes.
    #[default]
    #[serde(rename = "RW")]
    Rw,
    /// Being rebuilt: accepts writes, refuses reads.
    #[serde(rename = "WO")]
    Wo,
    /// Faulted: refuses all I/O.
    #[serde(rename = "ERR")]
    Err,
}

impl fmt::Display for ReplicaMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicaMode::Rw => write!(f, "RW"),
            ReplicaMode::Wo => write!(f, "WO"),
            ReplicaMode::Err => write!(f, "ERR"),
        }
    }
}

impl FromStr for ReplicaMode {
    type Err = ReplicaError;

    fn from_str(s: &str) -> Result<Self, ReplicaError> {
        match s {
            "RW" => Ok(ReplicaMode::Rw),
            "WO" => Ok(ReplicaMode::Wo),
            "ERR" => Ok(ReplicaMode::Err),
            other => Err(ReplicaError::InvalidConfig {
                reason: format!("unknown replica mode {}", other),
            }),
        }
    }
}

pub(crate) struct ReplicaState {
    pub(crate) info: ReplicaInfo,
    pub(crate) chain: DiskChain,
    pub(crate) volume: Volume,
    pub(crate) mode: ReplicaMode,
    /// Lowest active index whose blocks no other branch can read.
    pub(crate) punch_floor: usize,
    pub(crate) closed: bool,
}

impl ReplicaState {
    pub(crate) fn ensure_open(&self, op: &'static str) -> ReplicaResult<()> {
        if self.closed {
            return Err(ReplicaError::InvalidMode {
                op,
                mode: "closed".to_string(),
            });
        }
        Ok(())
    }

    fn refuse_mode(&self, op: &'static str, refused: &[ReplicaMode]) -> ReplicaResult<()> {
        self.ensure_open(op)?;
        if refused.contains(&self.mode) {
            return Err(ReplicaError::InvalidMode {
                op,
                mode: self.mode.to_string(),
            });
        }
        Ok(())
    }
}

/// A block volume replica stored in one directory.
pub struct Replica {
    config: ReplicaConfig,
    writable: bool,
    backing: Option<BackingFile>,
    pub(crate) state: RwLock<ReplicaState>,
    pub(crate) puncher: Option<HolePuncher>,
    pub(crate) lun_sync: LunMapSync,
}

impl fmt::Debug for Replica {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("Replica")
            .field("dir", &self.config.dir)
            .field("writable", &self.writable)
            .field("head", &state.chain.head())
            .field("mode", &state.mode)
            .finish()
    }
}

impl Replica {
    /// Opens the replica in `config.dir` for writing.
    ///
    /// With `create`, an empty directory is initialized with a single head
    /// layer. Without it a missing replica is an error.
    pub fn new(create: bool, config: ReplicaConfig, backing: Option<BackingFile>) -> ReplicaResult<Self> {
        config.validate()?;
        if read_replica_info(&config.dir)?.is_none() {
            if !create {
                return Err(ReplicaError::IoError(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no replica in {}", config.dir.display()),
                )));
            }
            initialize(&config, backing.as_ref())?;
        }
        Self::load(config, backing, true)
    }

    /// Opens an existing replica without write access.
    pub fn open_read_only(config: ReplicaConfig, backing: Option<BackingFile>) -> ReplicaResult<Self> {
        config.validate()?;
        Self::load(config, backing, false)
    }

    fn load(config: ReplicaConfig, backing: Option<BackingFile>, writable: bool) -> ReplicaResult<Self> {
        let dir = config.dir.clone();
        let mut info = read_replica_info(&dir)?.ok_or_else(|| {
            ReplicaError::IoError(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no replica in {}", dir.display()),
            ))
        })?;
        if info.size != config.size || info.block_size != config.block_size {
            return Err(ReplicaError::InvalidConfig {
                reason: format!(
                    "replica geometry {}/{} does not match config {}/{}",
                    info.size, info.block_size, config.size, config.block_size
                ),
            });
        }
        let fs_block = fs::metadata(&dir)?.blksize();
        if fs_block > 0 && config.block_size % fs_block != 0 {
            warn!(
                block_size = config.block_size,
                fs_block,
                "block size is not a multiple of the filesystem block size, block presence may be coarse"
            );
        }
        match (&info.backing_file, &backing) {
            (None, None) => {}
            (Some(name), Some(b)) if *name == b.name => {}
            (expected, given) => {
                return Err(ReplicaError::InvalidConfig {
                    reason: format!(
                        "replica expects backing file {:?}, got {:?}",
                        expected,
                        given.as_ref().map(|b| &b.name)
                    ),
                });
            }
        }

        if info.pending.is_some() {
            if !writable {
                return Err(ReplicaError::corruption(
                    "interrupted chain mutation needs a writable open to recover",
                ));
            }
            recover_pending(&dir, &mut info)?;
        }

        let (chain, volume) = load_layers(&dir, &info, backing.clone(), writable)?;
        if writable {
            info.dirty = true;
            write_replica_info(&dir, &info)?;
        }

        let puncher = if writable && config.punch_holes {
            match HolePuncher::start(config.hole_queue_capacity) {
                Ok(puncher) => Some(puncher),
                Err(e) => {
                    warn!(error = %e, "hole punching disabled");
                    None
                }
            }
        } else {
            None
        };

        info!(
            dir = %dir.display(),
            head = %chain.head(),
            layers = chain.len(),
            writable,
            "replica opened"
        );
        let punch_floor = punchable_floor(&chain);
        Ok(Self {
            config,
            writable,
            backing,
            state: RwLock::new(ReplicaState {
                info,
                chain,
                volume,
                mode: ReplicaMode::Rw,
                punch_floor,
                closed: false,
            }),
            puncher,
            lun_sync: LunMapSync::new(),
        })
    }

    /// Opens a fresh instance over the same directory.
    pub fn reload(&self, writable: bool) -> ReplicaResult<Replica> {
        let mut config = self.config.clone();
        config.size = self.state.read().info.size;
        Self::load(config, self.backing.clone(), writable)
    }

    /// Flushes all layers and stops background work. Further I/O fails.
    pub fn close(&self) -> ReplicaResult<()> {
        let mut state = self.state.write();
        if state.closed {
            return Ok(());
        }
        state.volume.sync()?;
        if self.writable {
            if let Some(mut on_disk) = read_replica_info(&self.config.dir)? {
                on_disk.dirty = false;
                write_replica_info(&self.config.dir, &on_disk)?;
            }
        }
        if let Some(puncher) = &self.puncher {
            puncher.shutdown();
        }
        state.closed = true;
        info!(dir = %self.config.dir.display(), "replica closed");
        Ok(())
    }

    /// Replica directory.
    pub fn dir(&self) -> &Path {
        &self.config.dir
    }

    /// Configuration this replica was opened with. `size` is the size at open;
    /// see [`Self::size`] after a resize.
    pub fn config(&self) -> &ReplicaConfig {
        &self.config
    }

    /// Current volume size in bytes.
    pub fn size(&self) -> u64 {
        self.state.read().info.size
    }

    /// Whether the replica accepts writes and chain mutations.
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Current access mode.
    pub fn mode(&self) -> ReplicaMode {
        self.state.read().mode
    }

    /// Changes the access mode.
    pub fn set_replica_mode(&self, mode: ReplicaMode) {
        let mut state = self.state.write();
        if state.mode != mode {
            info!(from = %state.mode, to = %mode, "replica mode changed");
            state.mode = mode;
        }
    }

    /// Sets the persisted rebuilding flag.
    pub fn set_rebuilding(&self, rebuilding: bool) -> ReplicaResult<()> {
        self.ensure_writable()?;
        let mut state = self.state.write();
        state.ensure_open("set_rebuilding")?;
        let mut next = state.info.clone();
        next.rebuilding = rebuilding;
        write_replica_info(&self.config.dir, &next)?;
        state.info = next;
        if rebuilding {
            self.lun_sync.reset();
        }
        debug!(rebuilding, "rebuilding flag updated");
        Ok(())
    }

    /// Whether a rebuild is in progress.
    pub fn is_rebuilding(&self) -> bool {
        self.state.read().info.rebuilding
    }

    /// Copy of the persisted replica metadata.
    pub fn info(&self) -> ReplicaInfo {
        self.state.read().info.clone()
    }

    /// Name of the head layer.
    pub fn head(&self) -> String {
        self.state.read().chain.head().to_string()
    }

    /// Active layer names from the head down to the root.
    pub fn chain(&self) -> Vec<String> {
        self.state.read().chain.chain_names()
    }

    /// Every layer record keyed by name, children filled in.
    pub fn list_disks(&self) -> HashMap<String, DiskInfo> {
        self.state.read().chain.list()
    }

    /// Active layer records from the root up to the head.
    pub fn active_disks(&self) -> Vec<DiskInfo> {
        self.state.read().chain.active_disks()
    }

    /// The `parent -> children` index.
    pub fn children_map(&self) -> HashMap<String, BTreeSet<String>> {
        self.state.read().chain.children_map()
    }

    /// Copy of the block location cache.
    pub fn location(&self) -> Vec<u16> {
        self.state.read().volume.location()
    }

    /// Open handle of an active layer.
    pub fn layer(&self, name: &str) -> Option<Arc<dyn SparseFile>> {
        let state = self.state.read();
        let index = state.chain.active_index(name)?;
        Some(state.volume.layers()[index].clone())
    }

    /// Allocated block indices of any layer, ascending.
    pub fn lun_map(&self, name: &str) -> ReplicaResult<Vec<u64>> {
        let state = self.state.read();
        let disk = state
            .chain
            .resolve(name)
            .ok_or_else(|| ReplicaError::invalid_target(name, "layer not found"))?;
        let layer = self.open_layer(&state, &disk)?;
        let blocks = LunGenerator::new(layer.as_ref(), self.config.block_size)
            .generate()
            .collect::<io::Result<Vec<u64>>>()?;
        Ok(blocks)
    }

    /// Counters of the hole punching queue, `None` when punching is off.
    pub fn hole_punch_stats(&self) -> Option<HolePunchStats> {
        self.puncher.as_ref().map(HolePuncher::stats)
    }

    /// State of the rebuild LUN map synchronizer.
    pub fn lun_map_state(&self) -> SyncState {
        self.lun_sync.state()
    }

    /// Snapshot recorded as the last consistent point.
    pub fn checkpoint(&self) -> Option<String> {
        self.state.read().info.checkpoint.clone()
    }

    fn ensure_writable(&self) -> ReplicaResult<()> {
        if !self.writable {
            return Err(ReplicaError::ReadOnly);
        }
        Ok(())
    }

    pub(crate) fn open_layer(&self, state: &ReplicaState, disk: &str) -> ReplicaResult<Arc<dyn SparseFile>> {
        if let Some(index) = state.chain.active_index(disk) {
            return Ok(state.volume.layers()[index].clone());
        }
        let file = DiskFile::open(&disk_path(&self.config.dir, disk), self.writable)?;
        Ok(Arc::new(file))
    }

    /// Reads `buf.len()` bytes at `offset`.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> ReplicaResult<usize> {
        let state = self.state.read();
        state.refuse_mode("read", &[ReplicaMode::Err, ReplicaMode::Wo])?;
        state.volume.read_at(buf, offset)
    }

    /// Writes `buf` at `offset` into the head layer.
    ///
    /// In WO mode the superseded copies in older layers are queued for hole
    /// punching.
    pub fn write_at(&self, buf: &[u8], offset: u64) -> ReplicaResult<usize> {
        self.ensure_writable()?;
        let state = self.state.read();
        state.refuse_mode("write", &[ReplicaMode::Err])?;
        let puncher = self.puncher.as_ref().filter(|_| state.mode == ReplicaMode::Wo);
        let layers = state.volume.layers();
        let floor = state.punch_floor;
        let bs = self.config.block_size;
        state.volume.write_at(buf, offset, |index, block| {
            if let Some(puncher) = puncher {
                if index >= floor {
                    puncher.enqueue(layers[index].clone(), block * bs, bs);
                }
            }
        })
    }

    /// Freezes the head as snapshot `name` and starts a new head above it.
    ///
    /// The new head gets `created` as its timestamp too.
    pub fn snapshot(&self, name: &str, user_created: bool, created: &str) -> ReplicaResult<()> {
        self.ensure_writable()?;
        let dir = self.config.dir.clone();
        let mut state = self.state.write();
        state.refuse_mode("snapshot", &[ReplicaMode::Err])?;

        let snapshot = snapshot_disk_name(name);
        if state.chain.contains(&snapshot)
            || disk_path(&dir, &snapshot).exists()
            || sidecar_path(&dir, &snapshot).exists()
        {
            return Err(ReplicaError::AlreadyExists { name: snapshot });
        }
        let old_head = state.chain.head().to_string();
        let new_head = head_disk_name(state.chain.next_head_seq());
        claim_head_name(&dir, &new_head)?;

        let head_layer = state
            .volume
            .layers()
            .last()
            .cloned()
            .ok_or_else(|| ReplicaError::corruption("volume has no head layer"))?;
        head_layer.sync()?;
        let size = head_layer.allocated_bytes()?.to_string();
        let parent = state.chain.get(&old_head).and_then(|d| d.parent.clone());

        let mut next = state.info.clone();
        next.pending = Some(PendingOp::Snapshot {
            old_head: old_head.clone(),
            parent: parent.clone(),
            snapshot: snapshot.clone(),
            new_head: new_head.clone(),
            created: created.to_string(),
            user_created,
            size: size.clone(),
        });
        write_replica_info(&dir, &next)?;

        let mut snap_info = DiskInfo::new(snapshot.clone(), parent, created, user_created);
        snap_info.size = size;
        let head_info = DiskInfo::new(new_head.clone(), Some(snapshot.clone()), created, false);

        let committed = (|| -> ReplicaResult<Arc<dyn SparseFile>> {
            fs::rename(disk_path(&dir, &old_head), disk_path(&dir, &snapshot))?;
            sync_dir(&dir)?;
            write_disk_info(&dir, &snap_info)?;
            remove_if_exists(&sidecar_path(&dir, &old_head))?;
            let layer = DiskFile::create(&disk_path(&dir, &new_head), next.size)?;
            write_disk_info(&dir, &head_info)?;
            next.head = new_head.clone();
            next.pending = None;
            write_replica_info(&dir, &next)?;
            Ok(Arc::new(layer))
        })();
        let new_layer = match committed {
            Ok(layer) => layer,
            Err(e) => {
                error!(snapshot = %snapshot, error = %e, "snapshot failed, recovering");
                self.recover_in_place(&mut state)?;
                return Err(e);
            }
        };
        state.info = next;

        let frozen = (|| -> ReplicaResult<()> {
            let snap_layer = DiskFile::open(&disk_path(&dir, &snapshot), self.writable)?;
            let head_index = state.volume.layers().len() - 1;
            state.volume.replace_layer(head_index, Arc::new(snap_layer));
            state.volume.push_layer(new_layer)?;
            state.chain.freeze_head(snap_info, head_info)?;
            Ok(())
        })();
        if let Err(e) = frozen {
            error!(snapshot = %snapshot, error = %e, "in-memory chain update failed, reloading");
            self.recover_in_place(&mut state)?;
            return Err(e);
        }
        state.punch_floor = punchable_floor(&state.chain);
        info!(snapshot = %snapshot, head = %new_head, user_created, "snapshot created");
        Ok(())
    }

    /// Discards the head and starts a new head on snapshot `name`.
    ///
    /// Layers between the snapshot and the old head stay as a side branch.
    pub fn revert(&self, name: &str, created: &str) -> ReplicaResult<()> {
        self.ensure_writable()?;
        let dir = self.config.dir.clone();
        let mut state = self.state.write();
        state.refuse_mode("revert", &[ReplicaMode::Err])?;

        let snapshot = state
            .chain
            .resolve(name)
            .ok_or_else(|| ReplicaError::invalid_target(name, "snapshot not found"))?;
        if is_head_disk(&snapshot) {
            return Err(ReplicaError::invalid_target(&snapshot, "cannot revert to a head layer"));
        }
        if state.chain.get(&snapshot).is_some_and(|d| d.removed) {
            return Err(ReplicaError::invalid_target(&snapshot, "snapshot is being removed"));
        }
        let old_head = state.chain.head().to_string();
        let new_head = head_disk_name(state.chain.next_head_seq());
        claim_head_name(&dir, &new_head)?;

        let mut next = state.info.clone();
        next.pending = Some(PendingOp::Revert {
            old_head: old_head.clone(),
            snapshot: snapshot.clone(),
            new_head: new_head.clone(),
            created: created.to_string(),
        });
        write_replica_info(&dir, &next)?;

        let committed = (|| -> ReplicaResult<()> {
            DiskFile::create(&disk_path(&dir, &new_head), next.size)?;
            let head_info = DiskInfo::new(new_head.clone(), Some(snapshot.clone()), created, false);
            write_disk_info(&dir, &head_info)?;
            remove_disk_files(&dir, &old_head)?;
            next.head = new_head.clone();
            next.pending = None;
            write_replica_info(&dir, &next)
        })();
        if let Err(e) = committed {
            error!(snapshot = %snapshot, error = %e, "revert failed, recovering");
            self.recover_in_place(&mut state)?;
            return Err(e);
        }
        state.info = next;
        self.reload_layers(&mut state)?;
        info!(snapshot = %snapshot, head = %new_head, "reverted");
        Ok(())
    }

    /// Validates removal of `name` and marks it; returns the steps to run.
    pub fn prepare_remove_disk(&self, name: &str) -> ReplicaResult<Vec<PrepareRemoveAction>> {
        self.ensure_writable()?;
        let mut state = self.state.write();
        state.ensure_open("prepare_remove_disk")?;
        let (disk, actions) = plan_removal(&state.chain, name)?;

        let mut info = state
            .chain
            .get(&disk)
            .cloned()
            .ok_or_else(|| ReplicaError::invalid_target(&disk, "layer not found"))?;
        info.removed = true;
        write_disk_info(&self.config.dir, &info)?;
        state.chain.update(info)?;
        info!(disk = %disk, steps = actions.len(), "removal prepared");
        Ok(actions)
    }

    /// Copies every allocated block of `source` into its parent `target`.
    pub fn coalesce(&self, source: &str, target: &str) -> ReplicaResult<()> {
        self.ensure_writable()?;
        let mut state = self.state.write();
        state.ensure_open("coalesce")?;
        let source = state
            .chain
            .resolve(source)
            .ok_or_else(|| ReplicaError::invalid_target(source, "layer not found"))?;
        let target = state
            .chain
            .resolve(target)
            .ok_or_else(|| ReplicaError::invalid_target(target, "layer not found"))?;
        if source == state.chain.head() {
            return Err(ReplicaError::invalid_target(&source, "cannot coalesce the active head"));
        }
        let parent = state.chain.get(&source).and_then(|d| d.parent.clone());
        if parent.as_deref() != Some(target.as_str()) {
            return Err(ReplicaError::invalid_target(
                &target,
                format!("not the parent of {}", source),
            ));
        }

        let from = self.open_layer(&state, &source)?;
        let into = self.open_layer(&state, &target)?;
        let bs = self.config.block_size;
        let mut buf = vec![0u8; bs as usize];
        let mut copied = 0u64;
        for block in LunGenerator::new(from.as_ref(), bs).generate() {
            let offset = block? * bs;
            from.read_full_at(&mut buf, offset)?;
            into.write_full_at(&buf, offset)?;
            copied += 1;
        }
        into.sync()?;

        let mut info = state
            .chain
            .get(&target)
            .cloned()
            .ok_or_else(|| ReplicaError::invalid_target(&target, "layer not found"))?;
        info.size = into.allocated_bytes()?.to_string();
        write_disk_info(&self.config.dir, &info)?;
        state.chain.update(info)?;
        info!(source = %source, target = %target, blocks = copied, "layer coalesced");
        Ok(())
    }

    /// Unlinks `name` from the chain and deletes its files.
    ///
    /// The layer must be removable; its data is expected to have been
    /// coalesced into the parent already.
    pub fn remove_diff_disk(&self, name: &str) -> ReplicaResult<()> {
        self.ensure_writable()?;
        let dir = self.config.dir.clone();
        let mut state = self.state.write();
        state.ensure_open("remove_diff_disk")?;
        let disk = state
            .chain
            .resolve(name)
            .ok_or_else(|| ReplicaError::invalid_target(name, "layer not found"))?;
        let parent = check_removable(&state.chain, &disk, true)?;
        let child = state
            .chain
            .children_of(&disk)
            .and_then(|c| c.iter().next().cloned())
            .ok_or_else(|| ReplicaError::not_removable(&disk, "layer has no child"))?;

        let mut child_info = state
            .chain
            .get(&child)
            .cloned()
            .ok_or_else(|| ReplicaError::corruption(format!("child {} has no record", child)))?;
        child_info.parent = Some(parent.clone());
        write_disk_info(&dir, &child_info)?;
        remove_disk_files(&dir, &disk)?;

        let active_index = state.chain.active_index(&disk);
        state.chain.unlink(&disk)?;
        if let Some(index) = active_index {
            state.volume.remove_layer(index);
        }
        if state.info.checkpoint.as_deref() == Some(disk.as_str()) {
            let mut next = state.info.clone();
            next.checkpoint = None;
            write_replica_info(&dir, &next)?;
            state.info = next;
            info!(disk = %disk, "checkpoint cleared");
        }
        state.punch_floor = punchable_floor(&state.chain);
        info!(disk = %disk, parent = %parent, child = %child, "layer removed");
        Ok(())
    }

    /// Runs the steps returned by [`Self::prepare_remove_disk`] in order.
    ///
    /// If a coalesce step fails the layer's removal mark is cleared so the
    /// removal can be planned again.
    pub fn apply_remove_actions(&self, actions: &[PrepareRemoveAction]) -> ReplicaResult<()> {
        for action in actions {
            match action.action {
                RemoveOp::Coalesce => {
                    let coalesced = action
                        .target
                        .as_deref()
                        .ok_or_else(|| {
                            ReplicaError::invalid_target(&action.source, "coalesce step without target")
                        })
                        .and_then(|target| self.coalesce(&action.source, target));
                    if let Err(e) = coalesced {
                        if let Err(clear) = self.cancel_removal(&action.source) {
                            warn!(disk = %action.source, error = %clear, "could not clear removal mark");
                        }
                        return Err(e);
                    }
                }
                RemoveOp::Remove => self.remove_diff_disk(&action.source)?,
            }
        }
        Ok(())
    }

    /// Clears the removal mark set by [`Self::prepare_remove_disk`].
    pub fn cancel_removal(&self, name: &str) -> ReplicaResult<()> {
        self.ensure_writable()?;
        let mut state = self.state.write();
        state.ensure_open("cancel_removal")?;
        let disk = state
            .chain
            .resolve(name)
            .ok_or_else(|| ReplicaError::invalid_target(name, "layer not found"))?;
        let mut info = state
            .chain
            .get(&disk)
            .cloned()
            .ok_or_else(|| ReplicaError::invalid_target(&disk, "layer not found"))?;
        if !info.removed {
            return Ok(());
        }
        info.removed = false;
        write_disk_info(&self.config.dir, &info)?;
        state.chain.update(info)?;
        info!(disk = %disk, "removal cancelled");
        Ok(())
    }

    /// Grows the volume to `size` bytes.
    ///
    /// The head file is extended and the new blocks read as zeros (or from
    /// the backing image). Shrinking is refused.
    pub fn resize(&self, size: u64) -> ReplicaResult<()> {
        self.ensure_writable()?;
        let mut state = self.state.write();
        state.refuse_mode("resize", &[ReplicaMode::Err])?;
        let current = state.info.size;
        if size == current {
            return Ok(());
        }
        if size < current {
            return Err(ReplicaError::InvalidConfig {
                reason: format!("cannot shrink volume from {} to {} bytes", current, size),
            });
        }
        if size % self.config.block_size != 0 {
            return Err(ReplicaError::InvalidConfig {
                reason: format!(
                    "size {} is not a multiple of block size {}",
                    size, self.config.block_size
                ),
            });
        }

        let head = state
            .volume
            .layers()
            .last()
            .cloned()
            .ok_or_else(|| ReplicaError::corruption("volume has no head layer"))?;
        head.set_len(size)?;
        head.sync()?;
        let mut next = state.info.clone();
        next.size = size;
        write_replica_info(&self.config.dir, &next)?;
        state.info = next;
        state.volume.resize(size)?;
        info!(from = current, to = size, "volume resized");
        Ok(())
    }

    /// Prepares and runs the removal of snapshot `name`.
    pub fn remove_snapshot(&self, name: &str) -> ReplicaResult<()> {
        let actions = self.prepare_remove_disk(name)?;
        self.apply_remove_actions(&actions)
    }

    /// Records snapshot `name` as the last consistent point.
    pub fn set_checkpoint(&self, name: &str) -> ReplicaResult<()> {
        self.ensure_writable()?;
        let mut state = self.state.write();
        state.ensure_open("set_checkpoint")?;
        let disk = state
            .chain
            .resolve(name)
            .filter(|d| !is_head_disk(d))
            .ok_or_else(|| ReplicaError::invalid_target(name, "snapshot not found"))?;
        let mut next = state.info.clone();
        next.checkpoint = Some(disk.clone());
        write_replica_info(&self.config.dir, &next)?;
        state.info = next;
        info!(checkpoint = %disk, "checkpoint set");
        Ok(())
    }

    /// Brings in-memory state back in line with the directory after a failed mutation.
    fn recover_in_place(&self, state: &mut ReplicaState) -> ReplicaResult<()> {
        let result = self.try_recover(state);
        if let Err(e) = &result {
            error!(error = %e, "recovery failed, replica faulted");
            state.mode = ReplicaMode::Err;
        }
        result
    }

    fn try_recover(&self, state: &mut ReplicaState) -> ReplicaResult<()> {
        let dir = &self.config.dir;
        let mut info =
            read_replica_info(dir)?.ok_or_else(|| ReplicaError::corruption("volume.meta vanished"))?;
        recover_pending(dir, &mut info)?;
        state.info = info;
        self.reload_layers(state)
    }

    fn reload_layers(&self, state: &mut ReplicaState) -> ReplicaResult<()> {
        let (chain, volume) = load_layers(&self.config.dir, &state.info, self.backing.clone(), self.writable)?;
        state.punch_floor = punchable_floor(&chain);
        state.chain = chain;
        state.volume = volume;
        Ok(())
    }
}

/// Lays down `volume.meta` and an empty root head in a new replica directory.
fn initialize(config: &ReplicaConfig, backing: Option<&BackingFile>) -> ReplicaResult<()> {
    let dir = &config.dir;
    fs::create_dir_all(dir)?;
    let head = head_disk_name(0);
    let sidecar_suffix = format!("{}{}", IMG_SUFFIX, META_SUFFIX);
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name();
        let name = name.to_string_lossy();
        if name.ends_with(&sidecar_suffix) && name != meta_file_name(&head) {
            return Err(ReplicaError::corruption(format!(
                "layer metadata {} without volume.meta",
                name
            )));
        }
    }
    // Leftovers of an interrupted initialization.
    remove_disk_files(dir, &head)?;

    DiskFile::create(&disk_path(dir, &head), config.size)?;
    write_disk_info(dir, &DiskInfo::new(head.clone(), None, now(), false))?;
    let info = ReplicaInfo {
        size: config.size,
        block_size: config.block_size,
        head: head.clone(),
        dirty: false,
        rebuilding: false,
        backing_file: backing.map(|b| b.name.clone()),
        checkpoint: None,
        backend_name: config.backend_name.clone(),
        pending: None,
    };
    write_replica_info(dir, &info)?;
    info!(dir = %dir.display(), size = config.size, block_size = config.block_size, "replica initialized");
    Ok(())
}

/// Fails if `head` is taken; an empty leftover data file is deleted.
fn claim_head_name(dir: &Path, head: &str) -> ReplicaResult<()> {
    if sidecar_path(dir, head).exists() {
        return Err(ReplicaError::AlreadyExists {
            name: meta_file_name(head),
        });
    }
    let path = disk_path(dir, head);
    match fs::metadata(&path) {
        Ok(meta) if meta.len() == 0 => {
            warn!(head = %head, "removing empty leftover head file");
            fs::remove_file(&path)?;
            Ok(())
        }
        Ok(_) => Err(ReplicaError::AlreadyExists {
            name: head.to_string(),
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Loads and validates the chain, then opens every active layer.
fn load_layers(
    dir: &Path,
    info: &ReplicaInfo,
    backing: Option<BackingFile>,
    writable: bool,
) -> ReplicaResult<(DiskChain, Volume)> {
    let mut chain = DiskChain::from_disks(load_disk_infos(dir)?)?;
    if chain.head() != info.head {
        return Err(ReplicaError::corruption(format!(
            "volume.meta names head {} but the chain head is {}",
            info.head,
            chain.head()
        )));
    }

    if writable {
        // A removal interrupted after the child was re-pointed leaves a
        // marked, childless layer behind.
        let leftovers: Vec<String> = chain
            .list()
            .into_values()
            .filter(|d| d.removed && d.children.is_empty() && d.name != chain.head())
            .map(|d| d.name)
            .collect();
        for disk in leftovers {
            warn!(disk = %disk, "finishing interrupted removal");
            remove_disk_files(dir, &disk)?;
            chain.unlink(&disk)?;
        }

        // A plan that never reached its remove step leaves the mark on a
        // layer that still has its child.
        let abandoned: Vec<DiskInfo> = chain
            .list()
            .into_values()
            .filter(|d| d.removed && !d.children.is_empty())
            .collect();
        for mut disk in abandoned {
            warn!(disk = %disk.name, "clearing removal mark of an unfinished plan");
            disk.removed = false;
            disk.children.clear();
            write_disk_info(dir, &disk)?;
            chain.update(disk)?;
        }
    }

    let mut volume = Volume::new(info.size, info.block_size, backing);
    for name in chain.active() {
        let file = DiskFile::open(&disk_path(dir, name), writable)?;
        volume.push_layer(Arc::new(file))?;
    }
    volume.preload()?;
    Ok((chain, volume))
}
