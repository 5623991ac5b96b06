#![warn(missing_docs)]

//! Snapchain replica: a block volume stored as a chain of sparse layer files
//!
//! A replica keeps one writable head layer on top of read-only snapshot
//! layers and an optional backing image. Reads resolve every block to the
//! newest layer holding it through a block location cache; snapshots freeze
//! the head; removal merges a snapshot into its parent. During rebuilds,
//! blocks superseded by the head are punched out of older layers.

pub mod chain;
pub mod config;
pub mod error;
pub mod holes;
pub mod lun;
pub mod meta;
pub mod rebuild;
pub mod removal;
pub mod replica;
pub mod sparse;
pub mod volume;

pub use chain::{head_disk_name, snapshot_disk_name, DiskChain, DiskInfo};
pub use config::{ReplicaConfig, ALLOCATION_UNIT, LUN_MAP_TIMEOUT_ENV, PUNCH_HOLES_ENV};
pub use error::{ReplicaError, ReplicaResult};
pub use holes::{HolePunchStats, HolePuncher, HoleRequest};
pub use lun::{LunBlocks, LunGenerator};
pub use meta::{PendingOp, ReplicaInfo, VOLUME_META};
pub use rebuild::{LunMapSync, NoPause, PauseFn, PausePoint, SyncReport, SyncState};
pub use removal::{PrepareRemoveAction, RemoveOp};
pub use replica::{Replica, ReplicaMode};
pub use sparse::{DiskFile, Extent, MemFile, SparseFile};
pub use volume::{BackingFile, Volume, LOCATION_NONE, LOCATION_UNRESOLVED};
