//! StatefulSets: resource changes freely, replica changes only with manual approval

use super::{apply_container_changes, apply_schedule, reject_removal};
use crate::error::{OptimizerError, Result};
use crate::gate::GateViolation;
use crate::models::{ProposedChanges, WorkloadSpec};

pub(super) fn mutate(
    spec: &mut WorkloadSpec,
    changes: &ProposedChanges,
    manual_approval: bool,
) -> Result<()> {
    reject_removal(changes)?;
    if changes.touches_replicas() && !manual_approval {
        return Err(GateViolation::StatefulSetReplicaAutoApply.into());
    }
    if !changes.node_selector.is_empty() {
        return Err(OptimizerError::Unsupported(
            "stateful workloads stay on on-demand capacity".into(),
        ));
    }
    apply_container_changes(spec, &changes.containers)?;
    if let Some(replicas) = changes.replicas {
        spec.replicas = Some(replicas);
    }
    if let Some(schedule) = &changes.scaling_schedule {
        apply_schedule(spec, schedule)?;
    }
    Ok(())
}
