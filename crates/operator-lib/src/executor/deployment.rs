//! Deployments support every automatable optimization

use super::{apply_container_changes, apply_schedule, reject_removal};
use crate::error::Result;
use crate::models::{ProposedChanges, WorkloadSpec};

pub(super) fn mutate(spec: &mut WorkloadSpec, changes: &ProposedChanges) -> Result<()> {
    reject_removal(changes)?;
    apply_container_changes(spec, &changes.containers)?;
    if let Some(replicas) = changes.replicas {
        spec.replicas = Some(replicas);
    }
    for (key, value) in &changes.node_selector {
        spec.node_selector.insert(key.clone(), value.clone());
    }
    if let Some(schedule) = &changes.scaling_schedule {
        apply_schedule(spec, schedule)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::workload;
    use crate::models::{ScalingSchedule, WorkloadKind, ANNOTATION_SCALING_SCHEDULE};
    use std::collections::BTreeMap;

    #[test]
    fn test_spot_and_schedule_changes() {
        let mut spec = workload(WorkloadKind::Deployment, Some(6), "1", "2Gi");
        let mut node_selector = BTreeMap::new();
        node_selector.insert("cloud.google.com/gke-spot".to_string(), "true".to_string());
        let changes = ProposedChanges {
            node_selector,
            scaling_schedule: Some(ScalingSchedule {
                off_peak_hours: vec![0, 1, 2],
                peak_replicas: 6,
                off_peak_replicas: 3,
            }),
            ..Default::default()
        };
        mutate(&mut spec, &changes).unwrap();
        assert_eq!(spec.node_selector.len(), 1);
        // Peak replica count is left to the scaler
        assert_eq!(spec.replicas, Some(6));
        let raw = &spec.annotations[ANNOTATION_SCALING_SCHEDULE];
        let schedule: ScalingSchedule = serde_json::from_str(raw).unwrap();
        assert_eq!(schedule.off_peak_replicas, 3);
    }

    #[test]
    fn test_unknown_container_is_rejected() {
        let mut spec = workload(WorkloadKind::Deployment, Some(2), "1", "2Gi");
        let changes = ProposedChanges {
            containers: vec![crate::models::ContainerChange {
                name: "missing".into(),
                cpu_request: Some("100m".into()),
                ..Default::default()
            }],
            ..Default::default()
        };
        assert!(mutate(&mut spec, &changes).is_err());
    }

    #[test]
    fn test_removal_is_never_automated() {
        let mut spec = workload(WorkloadKind::Deployment, Some(2), "1", "2Gi");
        let changes = ProposedChanges {
            remove_workload: true,
            ..Default::default()
        };
        assert!(mutate(&mut spec, &changes).is_err());
    }
}
