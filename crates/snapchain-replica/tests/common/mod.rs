//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Once;

use snapchain_replica::{Replica, ReplicaConfig};
use tracing_subscriber::EnvFilter;

/// Block size used by the data-path tests.
pub const B: u64 = 4096;
/// Sub-block granularity for unaligned I/O.
pub const BS: u64 = 512;

static TRACING: Once = Once::new();

/// Installs a test subscriber once per test binary. Filter with `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A config for `dir` with hole punching off.
pub fn config(dir: &Path, size: u64, block_size: u64) -> ReplicaConfig {
    let mut config = ReplicaConfig::new(dir, size, block_size);
    config.punch_holes = false;
    config
}

/// Creates a fresh replica in `dir`.
pub fn create(dir: &Path, size: u64, block_size: u64) -> Replica {
    init_tracing();
    Replica::new(true, config(dir, size, block_size), None).unwrap()
}

pub fn fill(buf: &mut [u8], val: u8) {
    buf.fill(val);
}

pub fn filled(len: usize, val: u8) -> Vec<u8> {
    vec![val; len]
}

/// Writes one full block of `val` at each listed block index.
pub fn fill_blocks(r: &Replica, blocks: &[u64], val: u8) {
    let buf = filled(B as usize, val);
    for &block in blocks {
        let n = r.write_at(&buf, block * B).unwrap();
        assert_eq!(n, B as usize);
    }
}

pub fn read_all(r: &Replica, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    r.read_at(&mut buf, 0).unwrap();
    buf
}
