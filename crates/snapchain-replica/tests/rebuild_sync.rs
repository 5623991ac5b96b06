//! Rebuild LUN map synchronization against real sparse files.

#![cfg(target_os = "linux")]

mod common;

use std::path::Path;
use std::time::Duration;

use common::{fill_blocks, init_tracing, read_all, B};
use snapchain_replica::{
    PauseFn, Replica, ReplicaConfig, ReplicaError, ReplicaMode, SyncReport, SyncState,
};
use tempfile::tempdir;

const T0: &str = "2024-05-01T10:00:00+00:00";

fn punching_config(dir: &Path, size: u64) -> ReplicaConfig {
    let mut config = common::config(dir, size, B);
    config.punch_holes = true;
    config.lun_map_timeout_secs = 5;
    config
}

fn open(config: &ReplicaConfig, create: bool) -> Replica {
    init_tracing();
    Replica::new(create, config.clone(), None).unwrap()
}

#[tokio::test]
async fn test_update_lun_map() {
    let dir = tempdir().unwrap();
    let config = punching_config(dir.path(), 100 * B);

    let r = open(&config, true);
    r.set_replica_mode(ReplicaMode::Wo);
    let lun_map_s0 = [1u64, 3, 5, 6];
    fill_blocks(&r, &lun_map_s0, 1);
    assert_eq!(r.lun_map(&r.head()).unwrap(), lun_map_s0);
    r.snapshot("000", false, T0).unwrap();
    r.close().unwrap();

    let r = open(&config, false);
    r.set_replica_mode(ReplicaMode::Wo);
    assert_eq!(r.lun_map("000").unwrap(), lun_map_s0);

    // Written before the pass captures the older layers.
    let lun_map_hb = [4u64, 8, 10, 11];
    fill_blocks(&r, &lun_map_hb, 2);
    assert_eq!(r.lun_map("000").unwrap(), lun_map_s0);
    assert_eq!(r.lun_map(&r.head()).unwrap(), lun_map_hb);

    r.set_rebuilding(true).unwrap();
    assert_eq!(r.hole_punch_stats().unwrap().enqueued, 0);

    // Written after the capture, before the head is scanned.
    let replica = &r;
    let pause = PauseFn(move || async move {
        fill_blocks(replica, &[1, 3, 5, 6, 8, 10, 11], 3);
    });
    let report = r.update_lun_map_with(&pause).await.unwrap();

    assert_eq!(report.preload_layers, 1);
    assert_eq!(report.preload_blocks, 4);
    assert_eq!(report.head_blocks, 8);
    assert_eq!(report.punched, 4);
    assert!(!report.aborted);
    assert_eq!(r.lun_map_state(), SyncState::Done);

    assert_eq!(r.lun_map("000").unwrap(), Vec::<u64>::new());
    assert_eq!(r.lun_map(&r.head()).unwrap(), vec![1, 3, 4, 5, 6, 8, 10, 11]);

    // Four from the WO writes over 000, four from the pass itself.
    let stats = r.hole_punch_stats().unwrap();
    assert_eq!(stats.enqueued, 8);
    assert_eq!(stats.dropped, 0);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.punched, stats.enqueued);

    r.set_replica_mode(ReplicaMode::Rw);
    let data = read_all(&r, 12 * B as usize);
    let per_block: Vec<u8> = data.chunks(B as usize).map(|c| c[0]).collect();
    assert_eq!(per_block, vec![0, 3, 0, 3, 2, 3, 3, 0, 3, 0, 3, 3]);
}

#[tokio::test]
async fn test_rw_writes_leave_older_layers_alone() {
    let dir = tempdir().unwrap();
    let config = punching_config(dir.path(), 8 * B);
    let r = open(&config, true);

    fill_blocks(&r, &[0, 1, 2], 1);
    r.snapshot("000", true, T0).unwrap();
    fill_blocks(&r, &[1, 2], 2);
    assert_eq!(r.lun_map("000").unwrap(), vec![0, 1, 2]);
    assert_eq!(r.hole_punch_stats().unwrap().enqueued, 0);

    r.set_rebuilding(true).unwrap();
    let report = r.update_lun_map().await.unwrap();
    assert_eq!(report.punched, 2);
    assert_eq!(r.lun_map("000").unwrap(), vec![0]);

    let data = read_all(&r, 3 * B as usize);
    let per_block: Vec<u8> = data.chunks(B as usize).map(|c| c[0]).collect();
    assert_eq!(per_block, vec![1, 2, 2]);
}

#[tokio::test]
async fn test_comparison_timeout() {
    let dir = tempdir().unwrap();
    let mut config = punching_config(dir.path(), 8 * B);
    config.lun_map_timeout_secs = 0;
    let r = open(&config, true);
    fill_blocks(&r, &[0], 1);
    r.snapshot("000", true, T0).unwrap();
    fill_blocks(&r, &[0], 2);
    r.set_rebuilding(true).unwrap();

    let slow = PauseFn(|| tokio::time::sleep(Duration::from_millis(50)));
    let result = r.update_lun_map_with(&slow).await;
    assert!(matches!(result, Err(ReplicaError::TimedOut { .. })));
    assert_eq!(r.lun_map_state(), SyncState::TimedOut);
    // Nothing was punched.
    assert_eq!(r.lun_map("000").unwrap(), vec![0]);

    // A zero budget times out even when the scans themselves are instant.
    let result = r.update_lun_map().await;
    assert!(matches!(result, Err(ReplicaError::TimedOut { .. })));
    assert_eq!(r.lun_map("000").unwrap(), vec![0]);
    r.close().unwrap();

    // The rebuilding flag survives the reopen; a pass within budget follows.
    config.lun_map_timeout_secs = 5;
    let r = open(&config, false);
    assert!(r.is_rebuilding());
    let report = r.update_lun_map().await.unwrap();
    assert_eq!(report.punched, 1);
    assert_eq!(r.lun_map_state(), SyncState::Done);
    assert_eq!(r.lun_map("000").unwrap(), Vec::<u64>::new());
}

#[tokio::test]
async fn test_dropped_pass_returns_to_idle() {
    let dir = tempdir().unwrap();
    let r = open(&punching_config(dir.path(), 4 * B), true);
    fill_blocks(&r, &[0, 1], 1);
    r.snapshot("000", true, T0).unwrap();
    fill_blocks(&r, &[1], 2);
    r.set_rebuilding(true).unwrap();

    let stuck = PauseFn(|| tokio::time::sleep(Duration::from_secs(30)));
    let cancelled = tokio::time::timeout(Duration::from_millis(50), r.update_lun_map_with(&stuck)).await;
    assert!(cancelled.is_err());
    assert_eq!(r.lun_map_state(), SyncState::Idle);

    let report = r.update_lun_map().await.unwrap();
    assert_eq!(report.punched, 1);
    assert_eq!(r.lun_map_state(), SyncState::Done);
    assert_eq!(r.lun_map("000").unwrap(), vec![0]);
}

#[tokio::test]
async fn test_rw_writes_during_pass_are_punched_by_the_pass() {
    let dir = tempdir().unwrap();
    let r = open(&punching_config(dir.path(), 8 * B), true);
    fill_blocks(&r, &[1, 3, 5], 1);
    r.snapshot("000", true, T0).unwrap();
    r.set_rebuilding(true).unwrap();

    // RW writes queue nothing, so every punch below comes from the pass.
    let replica = &r;
    let pause = PauseFn(move || async move {
        replica.set_replica_mode(ReplicaMode::Rw);
        fill_blocks(replica, &[1, 3, 5, 7], 2);
    });
    let report = r.update_lun_map_with(&pause).await.unwrap();
    assert_eq!(report.preload_blocks, 3);
    assert_eq!(report.head_blocks, 4);
    assert_eq!(report.punched, 3);
    assert_eq!(r.hole_punch_stats().unwrap().enqueued, 3);
    assert_eq!(r.lun_map("000").unwrap(), Vec::<u64>::new());

    let data = read_all(&r, 8 * B as usize);
    let per_block: Vec<u8> = data.chunks(B as usize).map(|c| c[0]).collect();
    assert_eq!(per_block, vec![0, 2, 0, 2, 0, 2, 0, 2]);
}

#[tokio::test]
async fn test_requires_rebuilding() {
    let dir = tempdir().unwrap();
    let r = open(&punching_config(dir.path(), 4 * B), true);
    let result = r.update_lun_map().await;
    assert!(matches!(result, Err(ReplicaError::InvalidMode { .. })));
    assert_eq!(r.lun_map_state(), SyncState::Idle);
}

#[tokio::test]
async fn test_disabled_punching_is_a_no_op() {
    let dir = tempdir().unwrap();
    let r = open(&common::config(dir.path(), 4 * B, B), true);
    fill_blocks(&r, &[0], 1);
    r.snapshot("000", true, T0).unwrap();
    fill_blocks(&r, &[0], 2);
    assert!(r.hole_punch_stats().is_none());

    let report = r.update_lun_map().await.unwrap();
    assert_eq!(report, SyncReport::default());
    assert_eq!(r.lun_map("000").unwrap(), vec![0]);
}

#[tokio::test]
async fn test_chain_change_aborts_pass() {
    let dir = tempdir().unwrap();
    let r = open(&punching_config(dir.path(), 4 * B), true);
    fill_blocks(&r, &[0], 1);
    r.snapshot("000", true, T0).unwrap();
    fill_blocks(&r, &[0], 2);
    r.set_rebuilding(true).unwrap();

    let replica = &r;
    let pause = PauseFn(move || async move {
        replica.snapshot("001", true, T0).unwrap();
    });
    let report = r.update_lun_map_with(&pause).await.unwrap();
    assert!(report.aborted);
    assert_eq!(report.punched, 0);
    assert_eq!(r.lun_map_state(), SyncState::Done);
    assert_eq!(r.lun_map("000").unwrap(), vec![0]);
}

#[tokio::test]
async fn test_side_branch_is_never_punched() {
    let dir = tempdir().unwrap();
    let r = open(&punching_config(dir.path(), 4 * B), true);
    fill_blocks(&r, &[0], 1);
    r.snapshot("base", true, T0).unwrap();
    fill_blocks(&r, &[0], 2);
    r.snapshot("a", true, T0).unwrap();
    fill_blocks(&r, &[0], 3);
    r.snapshot("b", true, T0).unwrap();
    r.revert("a", T0).unwrap();

    r.set_replica_mode(ReplicaMode::Wo);
    fill_blocks(&r, &[0], 4);
    assert_eq!(r.hole_punch_stats().unwrap().enqueued, 0);

    r.set_rebuilding(true).unwrap();
    let report = r.update_lun_map().await.unwrap();
    assert_eq!(report.preload_layers, 0);
    assert_eq!(report.punched, 0);
    assert_eq!(r.lun_map("a").unwrap(), vec![0]);
    assert_eq!(r.lun_map("base").unwrap(), vec![0]);

    // The branch still reads what it held.
    r.set_replica_mode(ReplicaMode::Rw);
    r.revert("b", T0).unwrap();
    let mut block = vec![0u8; B as usize];
    r.read_at(&mut block, 0).unwrap();
    assert!(block.iter().all(|&v| v == 3));
}

#[test]
fn test_punching_off_without_runtime() {
    let dir = tempdir().unwrap();
    let r = open(&punching_config(dir.path(), 4 * B), true);
    assert!(r.hole_punch_stats().is_none());
    r.set_replica_mode(ReplicaMode::Wo);
    fill_blocks(&r, &[0], 1);
}
