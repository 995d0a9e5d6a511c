//! DaemonSets run one pod per node: only CPU and memory can change

use super::{apply_container_changes, reject_removal};
use crate::error::{OptimizerError, Result};
use crate::gate::GateViolation;
use crate::models::{ProposedChanges, WorkloadSpec};

pub(super) fn mutate(spec: &mut WorkloadSpec, changes: &ProposedChanges) -> Result<()> {
    reject_removal(changes)?;
    if changes.touches_replicas() {
        return Err(GateViolation::DaemonSetReplicaChange.into());
    }
    if !changes.node_selector.is_empty() {
        return Err(OptimizerError::Unsupported(
            "DaemonSet placement follows the node pool".into(),
        ));
    }
    apply_container_changes(spec, &changes.containers)
}
