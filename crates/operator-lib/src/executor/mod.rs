//! Apply Executor
//!
//! Mutates the declared spec of a target workload to carry out a
//! recommendation, and restores it from the Rollback Store.
//!
//! Apply order:
//! 1. Read the live spec; stop if the idempotence marker names this recommendation
//!    and abort with a conflict if it moved since the analysis
//! 2. Build the new spec through the strategy for the workload kind
//! 3. Re-validate replica floor and disruption budget
//! 4. Capture the rollback baseline (strictly before the mutation)
//! 5. Stamp apply annotations and replace the spec in a single update

mod daemonset;
mod deployment;
mod statefulset;

use chrono::{SecondsFormat, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{OptimizerError, Result};
use crate::gate::GateViolation;
use crate::models::{
    ContainerChange, OptimizationPolicy, ProposedChanges, Recommendation, RollbackRecord,
    ScalingSchedule, WorkloadKind, WorkloadRef, WorkloadSpec, ANNOTATION_APPLIED_RECOMMENDATION,
    ANNOTATION_OPTIMIZED_AT, ANNOTATION_OPTIMIZED_BY, ANNOTATION_SCALING_SCHEDULE, MANAGER_NAME,
};
use crate::rollback::{RollbackStore, StoreOutcome};
use crate::workload::WorkloadApi;

/// Attempts to replace the spec during a rollback when the live object keeps moving
const ROLLBACK_ATTEMPTS: u32 = 3;

/// Result of an apply
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    Applied {
        previous: WorkloadSpec,
        updated: WorkloadSpec,
        /// `None` when an earlier baseline record was kept
        baseline: Option<StoreOutcome>,
    },
    /// The marker shows this recommendation is already in effect
    AlreadyApplied,
}

pub struct ApplyExecutor {
    workloads: Arc<dyn WorkloadApi>,
    rollback: Arc<RollbackStore>,
}

impl ApplyExecutor {
    pub fn new(workloads: Arc<dyn WorkloadApi>, rollback: Arc<RollbackStore>) -> Self {
        Self { workloads, rollback }
    }

    pub fn rollback_store(&self) -> &RollbackStore {
        &self.rollback
    }

    /// Apply `recommendation` to the workload it was computed from.
    ///
    /// `analyzed_version` is the resource version the analysis read. Any
    /// other live version means someone else edited the workload since, and
    /// the apply aborts with `ApplyConflict` before touching anything.
    pub async fn apply(
        &self,
        policy: &OptimizationPolicy,
        recommendation: &Recommendation,
        analyzed_version: u64,
    ) -> Result<ApplyOutcome> {
        let target = recommendation
            .workload
            .as_ref()
            .or(policy.spec.target_workload.as_ref())
            .ok_or_else(|| {
                OptimizerError::Unsupported("cluster-wide recommendations are advisory".into())
            })?;
        if recommendation.optimization_type.is_advisory() {
            return Err(OptimizerError::Unsupported(format!(
                "{} recommendations are advisory",
                recommendation.optimization_type
            )));
        }

        let live = self.workloads.get(target).await?;
        if live.applied_recommendation() == Some(recommendation.id.as_str()) {
            debug!(
                workload = %target,
                recommendation_id = %recommendation.id,
                "Recommendation already in effect"
            );
            return Ok(ApplyOutcome::AlreadyApplied);
        }
        if live.resource_version != analyzed_version {
            return Err(OptimizerError::conflict(
                target.to_string(),
                format!(
                    "analyzed at version {}, live object is at {}",
                    analyzed_version, live.resource_version
                ),
            ));
        }

        let mut next = live.clone();
        match target.kind {
            WorkloadKind::Deployment => deployment::mutate(&mut next, &recommendation.changes)?,
            WorkloadKind::StatefulSet => statefulset::mutate(
                &mut next,
                &recommendation.changes,
                policy.spec.manual_approval,
            )?,
            WorkloadKind::DaemonSet => daemonset::mutate(&mut next, &recommendation.changes)?,
        }
        self.check_replicas(&live, &next, policy).await?;

        let baseline = self.rollback.capture_baseline(&live, &recommendation.id).await?;

        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        next.annotations.insert(ANNOTATION_OPTIMIZED_AT.to_string(), now);
        next.annotations
            .insert(ANNOTATION_OPTIMIZED_BY.to_string(), MANAGER_NAME.to_string());
        next.annotations.insert(
            ANNOTATION_APPLIED_RECOMMENDATION.to_string(),
            recommendation.id.clone(),
        );

        let updated = self.workloads.replace(next).await?;
        info!(
            workload = %target,
            recommendation_id = %recommendation.id,
            optimization_type = %recommendation.optimization_type,
            "Workload spec updated"
        );
        Ok(ApplyOutcome::Applied {
            previous: live,
            updated,
            baseline,
        })
    }

    /// Replica counts the new spec would run with, including any off-peak schedule
    fn replica_targets(live: &WorkloadSpec, next: &WorkloadSpec) -> Vec<u32> {
        let mut targets = Vec::new();
        if next.replicas != live.replicas {
            targets.extend(next.replicas);
        }
        if let Some(schedule) = next
            .annotations
            .get(ANNOTATION_SCALING_SCHEDULE)
            .and_then(|raw| serde_json::from_str::<ScalingSchedule>(raw).ok())
        {
            targets.push(schedule.off_peak_replicas);
        }
        targets
    }

    async fn check_replicas(
        &self,
        live: &WorkloadSpec,
        next: &WorkloadSpec,
        policy: &OptimizationPolicy,
    ) -> Result<()> {
        let targets = Self::replica_targets(live, next);
        if targets.is_empty() {
            return Ok(());
        }
        let budget = self.workloads.disruption_budget(&live.reference).await?;

        for replicas in targets {
            if replicas < 1 {
                return Err(GateViolation::ReplicaFloor.into());
            }
            if let Some(floor) = policy.spec.min_available {
                if replicas < floor {
                    return Err(GateViolation::DisruptionBudget(format!(
                        "{} replicas is below the policy minimum of {}",
                        replicas, floor
                    ))
                    .into());
                }
            }
            if let Some(budget) = budget {
                if let Some(min) = budget.min_available {
                    if replicas < min {
                        return Err(GateViolation::DisruptionBudget(format!(
                            "{} replicas is below minAvailable {}",
                            replicas, min
                        ))
                        .into());
                    }
                }
                if let Some(max) = budget.max_unavailable {
                    if replicas <= max {
                        return Err(GateViolation::DisruptionBudget(format!(
                            "{} replicas could all be unavailable under maxUnavailable {}",
                            replicas, max
                        ))
                        .into());
                    }
                }
            }
        }
        Ok(())
    }

    /// Restore the captured spec of `workload` and verify it converged.
    ///
    /// The record is retired only after validation succeeded.
    pub async fn execute_rollback(&self, workload: &WorkloadRef) -> Result<WorkloadSpec> {
        let key = RollbackRecord::key_for(workload);
        let record = self
            .rollback
            .restore(&key)
            .await?
            .ok_or_else(|| OptimizerError::NotFound(format!("rollback record {}", key)))?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            let live = self.workloads.get(workload).await?;
            let restored = WorkloadSpec {
                resource_version: live.resource_version,
                ..record.spec.clone()
            };
            match self.workloads.replace(restored).await {
                Ok(_) => break,
                Err(e @ OptimizerError::ApplyConflict { .. }) if attempt < ROLLBACK_ATTEMPTS => {
                    warn!(
                        workload = %workload,
                        attempt = attempt,
                        error = %e,
                        "Rollback raced with another writer, retrying"
                    );
                }
                Err(e) => {
                    return Err(OptimizerError::rollback_failure(
                        workload.to_string(),
                        format!("restore not committed: {}", e),
                    ))
                }
            }
        }

        let restored = self.validate_rollback(&record).await?;
        if let Err(e) = self.rollback.remove(&key).await {
            warn!(
                key = %key,
                error = %e,
                "Rollback succeeded but the record could not be archived"
            );
        }
        info!(
            workload = %workload,
            recommendation_id = %record.recommendation_id,
            "Workload rolled back"
        );
        Ok(restored)
    }

    /// Re-read the live spec and require it to equal the recorded one
    pub async fn validate_rollback(&self, record: &RollbackRecord) -> Result<WorkloadSpec> {
        let live = self.workloads.get(&record.workload).await?;
        let drift = describe_drift(&record.spec, &live.declared());
        if drift.is_empty() {
            Ok(live)
        } else {
            Err(OptimizerError::rollback_failure(
                record.workload.to_string(),
                drift.join("; "),
            ))
        }
    }
}

/// Apply per-container resource changes from a recommendation
pub(crate) fn apply_container_changes(
    spec: &mut WorkloadSpec,
    changes: &[ContainerChange],
) -> Result<()> {
    for change in changes {
        let container = spec
            .containers
            .iter_mut()
            .find(|c| c.name == change.name)
            .ok_or_else(|| {
                OptimizerError::NotFound(format!("container {} in {}", change.name, spec.reference))
            })?;
        let resources = &mut container.resources;
        if let Some(v) = &change.cpu_request {
            resources.cpu_request = Some(v.clone());
        }
        if let Some(v) = &change.cpu_limit {
            resources.cpu_limit = Some(v.clone());
        }
        if let Some(v) = &change.memory_request {
            resources.memory_request = Some(v.clone());
        }
        if let Some(v) = &change.memory_limit {
            resources.memory_limit = Some(v.clone());
        }
    }
    Ok(())
}

/// Write an off-peak schedule for the in-cluster scaler
pub(crate) fn apply_schedule(spec: &mut WorkloadSpec, schedule: &ScalingSchedule) -> Result<()> {
    spec.annotations.insert(
        ANNOTATION_SCALING_SCHEDULE.to_string(),
        serde_json::to_string(schedule)?,
    );
    Ok(())
}

pub(crate) fn reject_removal(changes: &ProposedChanges) -> Result<()> {
    if changes.remove_workload {
        return Err(OptimizerError::Unsupported(
            "workload removal is never automated".into(),
        ));
    }
    Ok(())
}

/// Human-readable differences between a recorded and a live spec
fn describe_drift(expected: &WorkloadSpec, live: &WorkloadSpec) -> Vec<String> {
    let mut drift = Vec::new();
    if expected.replicas != live.replicas {
        drift.push(format!("replicas {:?} != {:?}", live.replicas, expected.replicas));
    }
    if expected.containers != live.containers {
        for want in &expected.containers {
            match live.containers.iter().find(|c| c.name == want.name) {
                Some(have) if have.resources != want.resources => {
                    drift.push(format!("container {} resources differ", want.name))
                }
                None => drift.push(format!("container {} missing", want.name)),
                _ => {}
            }
        }
        if live.containers.len() != expected.containers.len() {
            drift.push("container list differs".to_string());
        }
    }
    if expected.annotations != live.annotations {
        drift.push("annotations differ".to_string());
    }
    if expected.labels != live.labels {
        drift.push("labels differ".to_string());
    }
    if expected.node_selector != live.node_selector {
        drift.push("node selector differs".to_string());
    }
    if drift.is_empty() && expected != live {
        drift.push("spec differs".to_string());
    }
    drift
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::workload;
    use crate::error::ErrorClass;
    use crate::models::{
        CostEstimate, DisruptionBudget, OptimizationType, PolicySpec, RiskAssessment, RiskLevel,
        RollbackPlan,
    };
    use crate::pricing::PriceSource;
    use crate::rollback::{FileRecordStore, InMemoryTtlStore};
    use crate::workload::InMemoryWorkloadApi;
    use tempfile::TempDir;

    pub(super) fn recommendation(
        opt: OptimizationType,
        changes: ProposedChanges,
    ) -> Recommendation {
        let cost = CostEstimate {
            hourly: 1.0,
            monthly: 730.0,
            instance_type: None,
            source: PriceSource::Resolver,
        };
        Recommendation {
            id: format!("rec-{}", opt.as_str().to_lowercase()),
            workload: Some(WorkloadRef::new(WorkloadKind::Deployment, "shop", "web")),
            optimization_type: opt,
            title: String::new(),
            description: String::new(),
            current_cost: cost.clone(),
            optimized_cost: cost,
            monthly_savings: 50.0,
            yearly_savings: 600.0,
            savings_percentage: 6.8,
            change_percent: 20.0,
            confidence: 0.9,
            confidence_factors: vec![],
            risk: RiskAssessment {
                level: RiskLevel::Low,
                score: 0.0,
                factors: vec![],
                mitigations: vec![],
            },
            changes,
            rollback_plan: RollbackPlan {
                steps: vec![],
                estimated_minutes: 5,
                automatable: true,
            },
            as_of: 0,
        }
    }

    fn cpu_change() -> ProposedChanges {
        ProposedChanges {
            cpu_request: Some("800m".into()),
            containers: vec![ContainerChange {
                name: "app".into(),
                cpu_request: Some("800m".into()),
                cpu_limit: Some("1200m".into()),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn policy() -> OptimizationPolicy {
        OptimizationPolicy::new(
            "shop",
            "web-cost",
            PolicySpec {
                target_workload: Some(WorkloadRef::new(WorkloadKind::Deployment, "shop", "web")),
                optimization_type: Some(OptimizationType::All),
                auto_apply: true,
                ..Default::default()
            },
        )
    }

    struct Fixture {
        _dir: TempDir,
        api: Arc<InMemoryWorkloadApi>,
        fast: Arc<InMemoryTtlStore>,
        executor: ApplyExecutor,
    }

    impl Fixture {
        /// Apply against whatever version is live right now
        async fn apply(&self, rec: &Recommendation) -> Result<ApplyOutcome> {
            let version = self.api.get(&web()).await.unwrap().resource_version;
            self.executor.apply(&policy(), rec, version).await
        }
    }

    async fn fixture(spec: WorkloadSpec) -> Fixture {
        let dir = TempDir::new().unwrap();
        let api = Arc::new(InMemoryWorkloadApi::new());
        api.upsert(spec);
        let fast = Arc::new(InMemoryTtlStore::default());
        let durable = Arc::new(FileRecordStore::open(dir.path()).await.unwrap());
        let rollback = Arc::new(RollbackStore::new(
            fast.clone(),
            durable,
            crate::rollback::fast::DEFAULT_TTL,
        ));
        let executor = ApplyExecutor::new(api.clone(), rollback);
        Fixture {
            _dir: dir,
            api,
            fast,
            executor,
        }
    }

    fn web() -> WorkloadRef {
        WorkloadRef::new(WorkloadKind::Deployment, "shop", "web")
    }

    #[tokio::test]
    async fn test_apply_then_rollback_restores_identical_spec() {
        let f = fixture(workload(WorkloadKind::Deployment, Some(5), "2", "4Gi")).await;
        let before = f.api.get(&web()).await.unwrap();

        let rec = recommendation(OptimizationType::RightSizeCpu, cpu_change());
        let outcome = f.apply(&rec).await.unwrap();
        let ApplyOutcome::Applied { updated, baseline, .. } = outcome else {
            panic!("expected an apply");
        };
        assert!(baseline.is_some());
        assert_eq!(updated.containers[0].resources.cpu_request.as_deref(), Some("800m"));
        assert_eq!(updated.applied_recommendation(), Some(rec.id.as_str()));

        f.executor.execute_rollback(&web()).await.unwrap();
        let after = f.api.get(&web()).await.unwrap();
        assert_eq!(
            serde_json::to_vec(&after.declared()).unwrap(),
            serde_json::to_vec(&before.declared()).unwrap()
        );
    }

    #[tokio::test]
    async fn test_marker_prevents_second_apply() {
        let f = fixture(workload(WorkloadKind::Deployment, Some(5), "2", "4Gi")).await;
        let rec = recommendation(OptimizationType::RightSizeCpu, cpu_change());
        f.apply(&rec).await.unwrap();
        let version = f.api.get(&web()).await.unwrap().resource_version;

        assert_eq!(f.apply(&rec).await.unwrap(), ApplyOutcome::AlreadyApplied);
        assert_eq!(f.api.get(&web()).await.unwrap().resource_version, version);
    }

    #[tokio::test]
    async fn test_edit_since_analysis_conflicts() {
        let f = fixture(workload(WorkloadKind::Deployment, Some(5), "2", "4Gi")).await;
        let analyzed = f.api.get(&web()).await.unwrap();

        let mut edited = analyzed.clone();
        edited.replicas = Some(9);
        edited.containers[0].resources.cpu_request = Some("3000m".into());
        f.api.upsert(edited);

        let rec = recommendation(OptimizationType::RightSizeCpu, cpu_change());
        let err = f
            .executor
            .apply(&policy(), &rec, analyzed.resource_version)
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::ApplyConflict);

        let live = f.api.get(&web()).await.unwrap();
        assert_eq!(live.replicas, Some(9));
        assert_eq!(live.containers[0].resources.cpu_request.as_deref(), Some("3000m"));
        assert!(f.fast.is_empty());
    }

    #[tokio::test]
    async fn test_successive_applies_roll_back_to_original() {
        let f = fixture(workload(WorkloadKind::Deployment, Some(5), "2", "4Gi")).await;
        let original = f.api.get(&web()).await.unwrap().declared();

        f.apply(&recommendation(OptimizationType::RightSizeCpu, cpu_change()))
            .await
            .unwrap();
        let replicas = ProposedChanges {
            replicas: Some(3),
            ..Default::default()
        };
        let outcome = f
            .apply(&recommendation(OptimizationType::ReduceReplicas, replicas))
            .await
            .unwrap();
        assert!(matches!(outcome, ApplyOutcome::Applied { baseline: None, .. }));

        f.executor.execute_rollback(&web()).await.unwrap();
        assert_eq!(f.api.get(&web()).await.unwrap().declared(), original);
    }

    #[tokio::test]
    async fn test_disruption_budget_blocks_replica_reduction() {
        let f = fixture(workload(WorkloadKind::Deployment, Some(5), "2", "4Gi")).await;
        f.api.set_disruption_budget(
            &web(),
            DisruptionBudget {
                min_available: Some(4),
                max_unavailable: None,
            },
        );
        let rec = recommendation(
            OptimizationType::ReduceReplicas,
            ProposedChanges {
                replicas: Some(3),
                ..Default::default()
            },
        );
        let err = f.apply(&rec).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::ValidationError);
        // Nothing was captured or mutated
        assert!(f.fast.is_empty());
        assert_eq!(f.api.get(&web()).await.unwrap().replicas, Some(5));
    }

    #[tokio::test]
    async fn test_replicas_never_below_one() {
        let f = fixture(workload(WorkloadKind::Deployment, Some(2), "2", "4Gi")).await;
        let rec = recommendation(
            OptimizationType::ReduceReplicas,
            ProposedChanges {
                replicas: Some(0),
                ..Default::default()
            },
        );
        let err = f.apply(&rec).await.unwrap_err();
        assert!(matches!(err, OptimizerError::Validation(GateViolation::ReplicaFloor)));
    }

    #[tokio::test]
    async fn test_validate_rollback_detects_drift() {
        let f = fixture(workload(WorkloadKind::Deployment, Some(5), "2", "4Gi")).await;
        let rec = recommendation(OptimizationType::RightSizeCpu, cpu_change());
        f.apply(&rec).await.unwrap();

        // Another controller edits the workload right after our restore lands
        f.api.drift_after_replace(&web(), |w| w.replicas = Some(7)).await;
        let err = f.executor.execute_rollback(&web()).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::RollbackFailure);
        assert!(err.to_string().contains("replicas"));
        // The record is kept for manual recovery
        assert!(f.executor.rollback_store().restore_for(&web()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_apply_survives_fast_store_outage() {
        let f = fixture(workload(WorkloadKind::Deployment, Some(5), "2", "4Gi")).await;
        f.fast.set_unavailable(true);
        let rec = recommendation(OptimizationType::RightSizeCpu, cpu_change());
        let outcome = f.apply(&rec).await.unwrap();
        let ApplyOutcome::Applied { baseline: Some(baseline), .. } = outcome else {
            panic!("expected a fresh baseline");
        };
        assert_eq!(baseline.failed_store(), Some("fast"));

        f.fast.set_unavailable(false);
        f.executor.execute_rollback(&web()).await.unwrap();
        assert_eq!(
            f.api.get(&web()).await.unwrap().containers[0].resources.cpu_request.as_deref(),
            Some("2")
        );
    }
}
