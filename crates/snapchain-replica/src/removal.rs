//! Snapshot removal planning.
//!
//! Removing a snapshot is split in two: [`plan_removal`] checks that the layer
//! can go and returns the ordered actions, and the replica executes them
//! (merge the layer into its parent, then unlink it). Only a layer with exactly
//! one child, which is not the head, and whose parent has no other children is
//! removable; anything else would change what some other layer reads.

use serde::{Deserialize, Serialize};

use crate::chain::DiskChain;
use crate::error::{ReplicaError, ReplicaResult};

/// Kind of a removal step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoveOp {
    /// Copy the data of `source` into `target`.
    Coalesce,
    /// Unlink `source` from the chain and delete its files.
    Remove,
}

/// One step of a removal plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareRemoveAction {
    /// What to do.
    pub action: RemoveOp,
    /// Layer being removed.
    pub source: String,
    /// Layer receiving the data, for [`RemoveOp::Coalesce`].
    #[serde(default)]
    pub target: Option<String>,
}

impl PrepareRemoveAction {
    /// A coalesce step from `source` into `target`.
    pub fn coalesce(source: &str, target: &str) -> Self {
        Self {
            action: RemoveOp::Coalesce,
            source: source.to_string(),
            target: Some(target.to_string()),
        }
    }

    /// A remove step for `source`.
    pub fn remove(source: &str) -> Self {
        Self {
            action: RemoveOp::Remove,
            source: source.to_string(),
            target: None,
        }
    }
}

/// Checks that `disk` can be removed and returns its parent.
///
/// `allow_marked` accepts a layer whose removal flag is already set, which is
/// the state the executor sees after planning.
pub fn check_removable(chain: &DiskChain, disk: &str, allow_marked: bool) -> ReplicaResult<String> {
    let info = chain
        .get(disk)
        .ok_or_else(|| ReplicaError::invalid_target(disk, "layer not found"))?;
    if disk == chain.head() {
        return Err(ReplicaError::invalid_target(disk, "cannot remove the active head"));
    }
    if info.removed && !allow_marked {
        return Err(ReplicaError::not_removable(disk, "removal already prepared"));
    }
    let children = chain.child_count(disk);
    if children != 1 {
        return Err(ReplicaError::not_removable(
            disk,
            format!("layer has {} children, expected 1", children),
        ));
    }
    let parent = info
        .parent
        .clone()
        .ok_or_else(|| ReplicaError::not_removable(disk, "root layer has no parent to merge into"))?;
    if chain
        .children_of(disk)
        .is_some_and(|c| c.contains(chain.head()))
    {
        return Err(ReplicaError::not_removable(disk, "only child is the active head"));
    }
    if chain.child_count(&parent) > 1 {
        return Err(ReplicaError::not_removable(
            disk,
            format!("parent {} has other children", parent),
        ));
    }
    Ok(parent)
}

/// Resolves `name` and plans its removal.
///
/// Returns the resolved layer name and the actions `[Coalesce, Remove]`.
pub fn plan_removal(chain: &DiskChain, name: &str) -> ReplicaResult<(String, Vec<PrepareRemoveAction>)> {
    let disk = chain
        .resolve(name)
        .ok_or_else(|| ReplicaError::invalid_target(name, "layer not found"))?;
    let parent = check_removable(chain, &disk, false)?;
    let actions = vec![
        PrepareRemoveAction::coalesce(&disk, &parent),
        PrepareRemoveAction::remove(&disk),
    ];
    Ok((disk, actions))
}
