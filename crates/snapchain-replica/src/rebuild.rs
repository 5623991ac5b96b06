//! Rebuild-time LUN map synchronization.
//!
//! While a replica is rebuilt, writes land in its head while older layers are
//! still being filled from a peer. Once the snapshots are in place,
//! [`Replica::update_lun_map`] finds the blocks that both an older layer and
//! the head hold and punches them out of the older layer, since the head copy
//! shadows them.
//!
//! The pass runs through [`SyncState`]: the older layers are captured
//! (`Preloaded`), their block sets are collected under a time budget
//! (`Comparing`), then the head is scanned and the overlap punched
//! (`Punching`) before the queue is flushed (`Done`).

use std::collections::BTreeSet;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::chain::DiskChain;
use crate::error::{ReplicaError, ReplicaResult};
use crate::lun::LunGenerator;
use crate::replica::Replica;
use crate::sparse::SparseFile;

/// Phase of a LUN map synchronization pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncState {
    /// No pass has run since the last reset.
    Idle,
    /// The older layers have been captured.
    Preloaded,
    /// Collecting the block sets of the older layers.
    Comparing,
    /// Scanning the head and queueing punches.
    Punching,
    /// The pass finished and the queue was flushed.
    Done,
    /// Comparing exceeded its time budget.
    TimedOut,
}

impl SyncState {
    /// Whether moving from `self` to `next` is a legal step.
    pub fn can_transition(self, next: SyncState) -> bool {
        use SyncState::*;
        matches!(
            (self, next),
            (Idle | Done | TimedOut, Preloaded)
                | (Preloaded, Comparing)
                | (Comparing, Punching | TimedOut)
                | (Punching, Done)
                | (_, Idle)
        )
    }
}

/// Tracks the phase of the current pass.
#[derive(Debug)]
pub struct LunMapSync {
    state: Mutex<SyncState>,
}

impl Default for LunMapSync {
    fn default() -> Self {
        Self::new()
    }
}

impl LunMapSync {
    /// Starts in [`SyncState::Idle`].
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SyncState::Idle),
        }
    }

    /// Current phase.
    pub fn state(&self) -> SyncState {
        *self.state.lock()
    }

    /// Moves to `next`, rejecting illegal steps.
    pub fn transition(&self, next: SyncState) -> ReplicaResult<()> {
        let mut state = self.state.lock();
        if !state.can_transition(next) {
            return Err(ReplicaError::InvalidMode {
                op: "update_lun_map",
                mode: format!("{:?}", *state),
            });
        }
        debug!(from = ?*state, to = ?next, "lun map sync transition");
        *state = next;
        Ok(())
    }

    /// Back to [`SyncState::Idle`].
    pub fn reset(&self) {
        *self.state.lock() = SyncState::Idle;
    }
}

/// Hook awaited at the end of the comparison phase.
///
/// Production passes use [`NoPause`]; tests inject writes here to exercise
/// the window between capturing the older layers and scanning the head.
pub trait PausePoint: Send + Sync {
    /// Runs at the pause point.
    fn pause(&self) -> impl Future<Output = ()> + Send;
}

/// A pause point that returns immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPause;

impl PausePoint for NoPause {
    async fn pause(&self) {}
}

/// A pause point backed by an async closure.
pub struct PauseFn<F>(pub F);

impl<F, Fut> PausePoint for PauseFn<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send,
{
    fn pause(&self) -> impl Future<Output = ()> + Send {
        (self.0)()
    }
}

/// Outcome of one synchronization pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    /// Older layers compared against the head.
    pub preload_layers: usize,
    /// Blocks held by those layers.
    pub preload_blocks: usize,
    /// Blocks held by the head.
    pub head_blocks: usize,
    /// Punches queued.
    pub punched: usize,
    /// Punches dropped by a full queue.
    pub dropped: usize,
    /// Set when the chain changed during the pass and nothing was punched.
    pub aborted: bool,
    /// Wall time of the pass.
    pub elapsed_ms: u64,
}

/// Lowest active index whose data only the active chain can read.
///
/// A layer with more than one child also backs a side branch; it and every
/// layer beneath it must keep their blocks. The head index is returned when
/// no older layer qualifies.
pub(crate) fn punchable_floor(chain: &DiskChain) -> usize {
    let active = chain.active();
    let head = active.len().saturating_sub(1);
    let mut floor = head;
    for index in (0..head).rev() {
        if chain.child_count(&active[index]) != 1 {
            break;
        }
        floor = index;
    }
    floor
}

struct Capture {
    head: String,
    head_layer: Arc<dyn SparseFile>,
    layers: Vec<(String, Arc<dyn SparseFile>)>,
}

/// Returns the synchronizer to [`SyncState::Idle`] if a pass ends mid-way,
/// whether by error or by the pass future being dropped.
struct PassGuard<'a> {
    sync: &'a LunMapSync,
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.sync.state.lock();
        if matches!(
            *state,
            SyncState::Preloaded | SyncState::Comparing | SyncState::Punching
        ) {
            debug!(from = ?*state, "lun map sync pass abandoned");
            *state = SyncState::Idle;
        }
    }
}

/// Collects the allocated blocks of `layer` on the blocking pool.
async fn scan_blocks(layer: Arc<dyn SparseFile>, block_size: u64) -> ReplicaResult<BTreeSet<u64>> {
    let set = tokio::task::spawn_blocking(move || {
        LunGenerator::new(layer.as_ref(), block_size).collect_set()
    })
    .await
    .map_err(|e| ReplicaError::IoError(io::Error::new(io::ErrorKind::Other, e.to_string())))??;
    Ok(set)
}

impl Replica {
    /// Runs one synchronization pass with no pause hook.
    pub async fn update_lun_map(&self) -> ReplicaResult<SyncReport> {
        self.update_lun_map_with(&NoPause).await
    }

    /// Runs one synchronization pass, awaiting `pause` before the head scan.
    ///
    /// Fails with [`ReplicaError::TimedOut`] when collecting the older layers'
    /// blocks (including the pause) reaches the configured timeout. If the
    /// chain changes during the pass nothing is punched and the report is
    /// marked aborted. Dropping the returned future mid-pass leaves the
    /// synchronizer idle.
    pub async fn update_lun_map_with<P: PausePoint>(&self, pause: &P) -> ReplicaResult<SyncReport> {
        let started = Instant::now();
        if !self.config().punch_holes {
            info!("hole punching disabled, skipping lun map sync");
            return Ok(SyncReport::default());
        }
        let puncher = self
            .puncher
            .as_ref()
            .ok_or_else(|| ReplicaError::Unsupported("hole puncher is not running".to_string()))?;

        let capture = {
            let state = self.state.read();
            state.ensure_open("update_lun_map")?;
            if !state.info.rebuilding {
                return Err(ReplicaError::InvalidMode {
                    op: "update_lun_map",
                    mode: "not rebuilding".to_string(),
                });
            }
            let active = state.chain.active();
            let layers = state.volume.layers();
            let head = active.len() - 1;
            Capture {
                head: active[head].clone(),
                head_layer: layers[head].clone(),
                layers: (state.punch_floor..head)
                    .map(|i| (active[i].clone(), layers[i].clone()))
                    .collect(),
            }
        };
        self.lun_sync.transition(SyncState::Preloaded)?;
        let _guard = PassGuard { sync: &self.lun_sync };

        let bs = self.config().block_size;
        let budget = self.config().lun_map_timeout();
        let compare_started = Instant::now();
        let compare = async {
            self.lun_sync.transition(SyncState::Comparing)?;
            let mut sets = Vec::with_capacity(capture.layers.len());
            for (_, layer) in &capture.layers {
                sets.push(scan_blocks(layer.clone(), bs).await?);
            }
            pause.pause().await;
            Ok::<Vec<BTreeSet<u64>>, ReplicaError>(sets)
        };
        let preload = match tokio::time::timeout(budget, compare).await {
            Ok(Ok(sets)) if compare_started.elapsed() < budget => sets,
            Ok(Err(e)) => return Err(e),
            Ok(Ok(_)) | Err(_) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                self.lun_sync.transition(SyncState::TimedOut)?;
                warn!(elapsed_ms, "lun map comparison timed out");
                return Err(ReplicaError::TimedOut { elapsed_ms });
            }
        };
        self.lun_sync.transition(SyncState::Punching)?;

        let mut report = SyncReport {
            preload_layers: capture.layers.len(),
            preload_blocks: preload.iter().map(BTreeSet::len).sum(),
            ..Default::default()
        };
        let head_blocks = scan_blocks(capture.head_layer.clone(), bs).await?;
        report.head_blocks = head_blocks.len();
        self.queue_shadowed(&capture, &preload, &head_blocks, &mut report);
        puncher.flush().await?;
        self.lun_sync.transition(SyncState::Done)?;

        report.elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            layers = report.preload_layers,
            head_blocks = report.head_blocks,
            punched = report.punched,
            dropped = report.dropped,
            aborted = report.aborted,
            elapsed_ms = report.elapsed_ms,
            "lun map sync finished"
        );
        Ok(report)
    }

    /// Queues punches for the overlap if the chain still matches the capture.
    ///
    /// The head only gains blocks while it stays the head, so a head scan
    /// taken before the check is a subset of what the head holds now.
    fn queue_shadowed(
        &self,
        capture: &Capture,
        preload: &[BTreeSet<u64>],
        head_blocks: &BTreeSet<u64>,
        report: &mut SyncReport,
    ) {
        let Some(puncher) = self.puncher.as_ref() else {
            return;
        };
        let state = self.state.read();
        let unchanged = state.chain.head() == capture.head
            && capture.layers.iter().all(|(name, _)| {
                state
                    .chain
                    .active_index(name)
                    .is_some_and(|i| i >= state.punch_floor)
            });
        if !unchanged {
            warn!("chain changed during lun map sync, nothing punched");
            report.aborted = true;
            return;
        }

        let bs = self.config().block_size;
        for ((name, layer), blocks) in capture.layers.iter().zip(preload) {
            let mut queued = 0usize;
            for block in blocks.intersection(head_blocks) {
                if puncher.enqueue(layer.clone(), block * bs, bs) {
                    queued += 1;
                } else {
                    report.dropped += 1;
                }
            }
            debug!(layer = %name, queued, "shadowed blocks queued");
            report.punched += queued;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::DiskInfo;

    #[test]
    fn test_transitions() {
        use SyncState::*;
        assert!(Idle.can_transition(Preloaded));
        assert!(Preloaded.can_transition(Comparing));
        assert!(Comparing.can_transition(Punching));
        assert!(Comparing.can_transition(TimedOut));
        assert!(Punching.can_transition(Done));
        assert!(Done.can_transition(Preloaded));
        assert!(!Idle.can_transition(Punching));
        assert!(!Preloaded.can_transition(Preloaded));
        assert!(!Punching.can_transition(TimedOut));
        assert!(Punching.can_transition(Idle));
    }

    #[test]
    fn test_concurrent_pass_rejected() {
        let sync = LunMapSync::new();
        sync.transition(SyncState::Preloaded).unwrap();
        assert!(matches!(
            sync.transition(SyncState::Preloaded),
            Err(ReplicaError::InvalidMode { .. })
        ));
        sync.reset();
        assert_eq!(sync.state(), SyncState::Idle);
    }

    #[test]
    fn test_pass_guard_resets_unfinished_pass() {
        let sync = LunMapSync::new();
        sync.transition(SyncState::Preloaded).unwrap();
        {
            let _guard = PassGuard { sync: &sync };
            sync.transition(SyncState::Comparing).unwrap();
        }
        assert_eq!(sync.state(), SyncState::Idle);

        sync.transition(SyncState::Preloaded).unwrap();
        {
            let _guard = PassGuard { sync: &sync };
            sync.transition(SyncState::Comparing).unwrap();
            sync.transition(SyncState::TimedOut).unwrap();
        }
        assert_eq!(sync.state(), SyncState::TimedOut);
    }

    #[tokio::test]
    async fn test_scan_blocks_on_blocking_pool() {
        let layer = Arc::new(crate::sparse::MemFile::new(16, 4));
        layer.write_full_at(&[1; 4], 4).unwrap();
        layer.write_full_at(&[1; 4], 12).unwrap();
        let set = scan_blocks(layer, 4).await.unwrap();
        assert_eq!(set.into_iter().collect::<Vec<_>>(), vec![1, 3]);
    }

    #[test]
    fn test_punchable_floor_linear() {
        let chain = DiskChain::from_disks(vec![
            DiskInfo::new("volume-snap-000.img", None, "t", true),
            DiskInfo::new("volume-snap-001.img", Some("volume-snap-000.img".into()), "t", true),
            DiskInfo::new("volume-head-002.img", Some("volume-snap-001.img".into()), "t", false),
        ])
        .unwrap();
        assert_eq!(punchable_floor(&chain), 0);
    }

    #[test]
    fn test_punchable_floor_stops_at_branch() {
        let chain = DiskChain::from_disks(vec![
            DiskInfo::new("volume-snap-000.img", None, "t", true),
            DiskInfo::new("volume-snap-001.img", Some("volume-snap-000.img".into()), "t", true),
            DiskInfo::new("volume-snap-side.img", Some("volume-snap-001.img".into()), "t", true),
            DiskInfo::new("volume-snap-002.img", Some("volume-snap-001.img".into()), "t", true),
            DiskInfo::new("volume-head-003.img", Some("volume-snap-002.img".into()), "t", false),
        ])
        .unwrap();
        // Active: 000, 001, 002, head. 001 backs the side branch.
        assert_eq!(punchable_floor(&chain), 2);
    }

    #[test]
    fn test_punchable_floor_head_only() {
        let chain =
            DiskChain::from_disks(vec![DiskInfo::new("volume-head-000.img", None, "t", false)]).unwrap();
        assert_eq!(punchable_floor(&chain), 0);
    }

    #[tokio::test]
    async fn test_pause_fn_runs_closure() {
        let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = hits.clone();
        let pause = PauseFn(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        });
        pause.pause().await;
        NoPause.pause().await;
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
