//! Error types for the replica engine.

use thiserror::Error;

/// Result type alias for replica operations.
pub type ReplicaResult<T> = Result<T, ReplicaError>;

/// Error variants for replica operations.
#[derive(Debug, Error)]
pub enum ReplicaError {
    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// A read or write failed after part of the buffer was transferred.
    #[error("I/O failed after {completed} bytes: {source}")]
    PartialIo {
        /// Bytes transferred before the failure.
        completed: usize,
        /// The underlying error.
        source: std::io::Error,
    },

    /// On-disk chain metadata violates a chain invariant.
    #[error("Chain corruption: {reason}")]
    ChainCorruption {
        /// Description of the violated invariant.
        reason: String,
    },

    /// A snapshot or head file with this name is already present.
    #[error("Already exists: {name}")]
    AlreadyExists {
        /// The colliding file name.
        name: String,
    },

    /// The named layer does not exist or cannot be the target of the operation.
    #[error("Invalid target {name}: {reason}")]
    InvalidTarget {
        /// The requested layer name.
        name: String,
        /// Why the layer was rejected.
        reason: String,
    },

    /// The layer exists but removing it would break the chain topology.
    #[error("Layer {name} is not removable: {reason}")]
    NotRemovable {
        /// The requested layer name.
        name: String,
        /// Why the removal was rejected.
        reason: String,
    },

    /// Rebuild LUN map comparison exceeded its time budget.
    #[error("Timed out after {elapsed_ms} ms")]
    TimedOut {
        /// Milliseconds spent before giving up.
        elapsed_ms: u64,
    },

    /// The replica mode does not allow the requested operation.
    #[error("Operation {op} not allowed in mode {mode}")]
    InvalidMode {
        /// The rejected operation.
        op: &'static str,
        /// The current replica mode.
        mode: String,
    },

    /// The replica was opened read-only.
    #[error("Replica is read-only")]
    ReadOnly,

    /// The I/O range falls outside the volume.
    #[error("Range out of bounds: offset {offset} length {len} exceeds volume size {size}")]
    OutOfRange {
        /// Start of the requested range.
        offset: u64,
        /// Length of the requested range.
        len: u64,
        /// Volume size in bytes.
        size: u64,
    },

    /// Configuration values are inconsistent.
    #[error("Invalid config: {reason}")]
    InvalidConfig {
        /// Description of the problem.
        reason: String,
    },

    /// Serialization/deserialization error.
    #[error("Serialization error: {reason}")]
    SerializationError {
        /// Description of the error.
        reason: String,
    },

    /// The platform lacks a required capability.
    #[error("Unsupported: {0}")]
    Unsupported(String),
}

impl From<serde_json::Error> for ReplicaError {
    fn from(e: serde_json::Error) -> Self {
        ReplicaError::SerializationError {
            reason: e.to_string(),
        }
    }
}

impl ReplicaError {
    pub(crate) fn corruption(reason: impl Into<String>) -> Self {
        ReplicaError::ChainCorruption {
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_target(name: &str, reason: impl Into<String>) -> Self {
        ReplicaError::InvalidTarget {
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn not_removable(name: &str, reason: impl Into<String>) -> Self {
        ReplicaError::NotRemovable {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replica_result_alias() {
        let ok: ReplicaResult<i32> = Ok(42);
        assert!(ok.is_ok());

        let err: ReplicaResult<i32> = Err(ReplicaError::ReadOnly);
        assert!(err.is_err());
    }

    #[test]
    fn test_io_error_from_std() {
        let std_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: ReplicaError = std_err.into();
        assert!(matches!(err, ReplicaError::IoError(_)));
    }

    #[test]
    fn test_partial_io_reports_count() {
        let err = ReplicaError::PartialIo {
            completed: 8192,
            source: std::io::Error::new(std::io::ErrorKind::Other, "disk gone"),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("8192"));
        assert!(msg.contains("disk gone"));
    }

    #[test]
    fn test_chain_corruption() {
        let err = ReplicaError::corruption("two heads");
        assert_eq!(format!("{}", err), "Chain corruption: two heads");
    }

    #[test]
    fn test_not_removable() {
        let err = ReplicaError::not_removable("volume-snap-001.img", "child is the head");
        let msg = format!("{}", err);
        assert!(msg.contains("volume-snap-001.img"));
        assert!(msg.contains("child is the head"));
    }

    #[test]
    fn test_out_of_range() {
        let err = ReplicaError::OutOfRange {
            offset: 4096,
            len: 8192,
            size: 8192,
        };
        assert_eq!(
            format!("{}", err),
            "Range out of bounds: offset 4096 length 8192 exceeds volume size 8192"
        );
    }

    #[test]
    fn test_serde_json_error_conversion() {
        let parse: Result<u32, _> = serde_json::from_str::<u32>("not-json");
        let err: ReplicaError = parse.unwrap_err().into();
        assert!(matches!(err, ReplicaError::SerializationError { .. }));
    }
}
