//! Replica configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ReplicaError, ReplicaResult};

/// Environment variable bounding the rebuild LUN map comparison, in seconds.
pub const LUN_MAP_TIMEOUT_ENV: &str = "UPDATE_LUN_MAP_TIMEOUT";
/// Environment variable enabling (`true`/`1`) or disabling hole punching.
pub const PUNCH_HOLES_ENV: &str = "SNAPCHAIN_PUNCH_HOLES";
/// Granularity at which the filesystem reports data extents.
///
/// Block presence is derived from `SEEK_DATA`/`SEEK_HOLE`, which only see
/// whole pages, so every block must cover whole pages.
pub const ALLOCATION_UNIT: u64 = 4096;

/// Configuration for one replica instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaConfig {
    /// Directory holding the layer files and metadata.
    pub dir: PathBuf,
    /// Logical volume size in bytes.
    pub size: u64,
    /// Block size in bytes; every layer and the backing image use it.
    pub block_size: u64,
    /// Name of the backend that owns this replica (diagnostic).
    pub backend_name: String,
    /// Whether shadowed blocks are deallocated during rebuild.
    pub punch_holes: bool,
    /// Capacity of the hole punching queue.
    pub hole_queue_capacity: usize,
    /// Upper bound for the rebuild comparison phase, in seconds.
    pub lun_map_timeout_secs: u64,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/var/lib/snapchain/replica"),
            size: 0,
            block_size: 4096,
            backend_name: "snapchain".to_string(),
            punch_holes: cfg!(target_os = "linux"),
            hole_queue_capacity: 4096,
            lun_map_timeout_secs: 300,
        }
    }
}

impl ReplicaConfig {
    /// Creates a config for the given directory and geometry with defaults elsewhere.
    pub fn new(dir: impl Into<PathBuf>, size: u64, block_size: u64) -> Self {
        Self {
            dir: dir.into(),
            size,
            block_size,
            ..Default::default()
        }
    }

    /// Loads a config from a `.json` or `.toml` file.
    pub fn from_file(path: &Path) -> ReplicaResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| ReplicaError::SerializationError {
                reason: e.to_string(),
            }),
            "json" => Ok(serde_json::from_str(&contents)?),
            _ => Err(ReplicaError::InvalidConfig {
                reason: format!("unsupported config file extension: {}", ext),
            }),
        }
    }

    /// Applies overrides from the process environment.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(raw) = std::env::var(LUN_MAP_TIMEOUT_ENV) {
            match raw.trim().parse::<u64>() {
                Ok(secs) => {
                    debug!(secs, "LUN map timeout overridden from environment");
                    self.lun_map_timeout_secs = secs;
                }
                Err(_) => warn!(value = %raw, "ignoring malformed {}", LUN_MAP_TIMEOUT_ENV),
            }
        }
        if let Ok(raw) = std::env::var(PUNCH_HOLES_ENV) {
            match raw.trim().to_lowercase().as_str() {
                "1" | "true" | "yes" => self.punch_holes = true,
                "0" | "false" | "no" => self.punch_holes = false,
                _ => warn!(value = %raw, "ignoring malformed {}", PUNCH_HOLES_ENV),
            }
        }
        self
    }

    /// Timeout for the rebuild comparison phase.
    pub fn lun_map_timeout(&self) -> Duration {
        Duration::from_secs(self.lun_map_timeout_secs)
    }

    /// Number of blocks in the volume.
    pub fn block_count(&self) -> u64 {
        self.size / self.block_size
    }

    /// Checks that the geometry is usable.
    pub fn validate(&self) -> ReplicaResult<()> {
        if self.block_size == 0 {
            return Err(ReplicaError::InvalidConfig {
                reason: "block size must be non-zero".to_string(),
            });
        }
        if self.block_size % ALLOCATION_UNIT != 0 {
            return Err(ReplicaError::InvalidConfig {
                reason: format!(
                    "block size {} is not a multiple of the {}-byte allocation unit",
                    self.block_size, ALLOCATION_UNIT
                ),
            });
        }
        if self.size % self.block_size != 0 {
            return Err(ReplicaError::InvalidConfig {
                reason: format!(
                    "size {} is not a multiple of block size {}",
                    self.size, self.block_size
                ),
            });
        }
        if self.hole_queue_capacity == 0 {
            return Err(ReplicaError::InvalidConfig {
                reason: "hole queue capacity must be non-zero".to_string(),
            });
        }
        Ok(())
    }
}
