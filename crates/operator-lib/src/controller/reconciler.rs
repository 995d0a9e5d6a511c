//! One reconciliation cycle of one policy
//!
//! A cycle is split in two halves. [`Reconciler::plan`] reads the policy,
//! analyzes the target and gates the best candidate; it only writes status
//! and may be abandoned at any await point. [`Reconciler::apply`] mutates the
//! workload and must run to completion once started.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::state::{can_transition, Trigger};
use super::store::PolicyStore;
use super::ControllerConfig;
use crate::engine::{sort_by_savings, AnalysisInput, RecommendationEngine};
use crate::error::{ErrorClass, OptimizerError, Result};
use crate::executor::{ApplyExecutor, ApplyOutcome};
use crate::gate::{GateDecision, PolicyGate, SkipReason};
use crate::health::{components, HealthRegistry};
use crate::models::{
    OptimizationPolicy, OptimizationType, Phase, PolicyKey, PolicySpec, Recommendation,
    StatusError, UtilizationSample, WorkloadRef, WorkloadSpec,
};
use crate::observability::{ControllerMetrics, StructuredLogger};
use crate::pricing::{PriceBook, PricingResolver};
use crate::rollback::RollbackStore;
use crate::utilization::UtilizationStore;
use crate::workload::WorkloadApi;

/// External collaborators of the controller
#[derive(Clone)]
pub struct Collaborators {
    pub policies: Arc<dyn PolicyStore>,
    pub workloads: Arc<dyn WorkloadApi>,
    pub utilization: Arc<dyn UtilizationStore>,
    pub pricing: Arc<dyn PricingResolver>,
    pub rollback: Arc<RollbackStore>,
}

/// When the policy wants its next cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub requeue_after: Duration,
}

impl ReconcileOutcome {
    fn after(requeue_after: Duration) -> Self {
        Self { requeue_after }
    }
}

/// An allowed recommendation waiting to be applied
#[derive(Debug)]
pub struct PendingApply {
    pub policy: OptimizationPolicy,
    pub recommendation: Recommendation,
    pub workload: WorkloadSpec,
    started: Instant,
}

/// Result of the cancellable half of a cycle
#[derive(Debug)]
pub enum Plan {
    /// Nothing to mutate; wait for the next trigger
    Idle(ReconcileOutcome),
    Apply(Box<PendingApply>),
    /// Deletion was requested
    Delete,
    /// The policy no longer exists
    Gone,
}

struct Analysis {
    workload: WorkloadSpec,
    recommendations: Vec<Recommendation>,
}

pub struct Reconciler {
    policies: Arc<dyn PolicyStore>,
    workloads: Arc<dyn WorkloadApi>,
    utilization: Arc<dyn UtilizationStore>,
    pricing: Arc<dyn PricingResolver>,
    engine: RecommendationEngine,
    gate: PolicyGate,
    executor: ApplyExecutor,
    config: ControllerConfig,
    health: HealthRegistry,
    metrics: ControllerMetrics,
    logger: StructuredLogger,
}

impl Reconciler {
    pub fn new(
        collaborators: Collaborators,
        engine: RecommendationEngine,
        gate: PolicyGate,
        config: ControllerConfig,
        health: HealthRegistry,
    ) -> Self {
        let executor = ApplyExecutor::new(collaborators.workloads.clone(), collaborators.rollback);
        let logger = StructuredLogger::new(config.instance_id.clone());
        Self {
            policies: collaborators.policies,
            workloads: collaborators.workloads,
            utilization: collaborators.utilization,
            pricing: collaborators.pricing,
            engine,
            gate,
            executor,
            config,
            health,
            metrics: ControllerMetrics::new(),
            logger,
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn policies(&self) -> &Arc<dyn PolicyStore> {
        &self.policies
    }

    /// Run both halves of a cycle back to back
    pub async fn reconcile(&self, key: &PolicyKey, trigger: Trigger) -> Result<ReconcileOutcome> {
        match self.plan(key, trigger).await? {
            Plan::Idle(outcome) => Ok(outcome),
            Plan::Apply(pending) => self.apply(*pending).await,
            Plan::Delete => {
                self.finalize_deletion(key).await?;
                Ok(ReconcileOutcome::after(self.config.reconcile_interval))
            }
            Plan::Gone => Ok(ReconcileOutcome::after(self.config.reconcile_interval)),
        }
    }

    /// Analyze and gate. Writes status only.
    pub async fn plan(&self, key: &PolicyKey, trigger: Trigger) -> Result<Plan> {
        self.metrics.inc_reconciliations(trigger.as_str());

        let Some(mut policy) = self.policies.get(key).await? else {
            return Ok(Plan::Gone);
        };
        if policy.is_deleting() {
            return Ok(Plan::Delete);
        }
        let interval = self.interval(&policy);

        if policy.status.phase == Phase::Applying {
            self.settle_interrupted_apply(&mut policy).await?;
        }

        let new_generation = policy.has_new_generation();
        if !new_generation {
            let waiting_for_edit = policy.status.requires_intervention
                || policy.status.phase == Phase::RolledBack
                || policy.status.last_error.as_ref().map(|e| e.class)
                    == Some(ErrorClass::ValidationError);
            if waiting_for_edit {
                debug!(policy = %key, phase = %policy.status.phase, "Waiting for a spec change");
                return Ok(Plan::Idle(ReconcileOutcome::after(interval)));
            }
        } else {
            policy.status.requires_intervention = false;
            policy.status.consecutive_failures = 0;
            policy.status.last_error = None;
            policy.status.retry_at = None;
        }
        policy.status.observed_generation = policy.metadata.generation;

        if let Err(violation) = self.gate.validate(&policy, None) {
            let err = OptimizerError::from(violation);
            self.record_failure(&mut policy, &err);
            policy.status.message = Some(err.to_string());
            self.save(&policy).await?;
            return Ok(Plan::Idle(ReconcileOutcome::after(interval)));
        }

        let entered = policy.status.phase;
        let message = format!("analysis triggered by {}", trigger);
        self.transition(&mut policy, Phase::Analyzing, message)?;
        self.save(&policy).await?;
        let started = Instant::now();

        let target = policy
            .spec
            .target_workload
            .clone()
            .ok_or_else(|| OptimizerError::Unsupported("policy without target".into()))?;

        let analysis = match self.analyze(&policy, &target).await {
            Ok(analysis) => analysis,
            Err(e) => {
                let retry_in = self.record_failure(&mut policy, &e).unwrap_or(interval);
                let resting = self.resting_phase(&policy, entered);
                self.transition(&mut policy, resting, e.to_string())?;
                self.save(&policy).await?;
                return Ok(Plan::Idle(ReconcileOutcome::after(retry_in)));
            }
        };

        policy.status.last_analysis = Some(Utc::now());
        policy.status.last_error = None;
        policy.status.retry_at = None;
        policy.status.consecutive_failures = 0;

        let Analysis {
            workload,
            recommendations,
        } = analysis;

        let mut decisions: Vec<(Recommendation, GateDecision)> = recommendations
            .into_iter()
            .map(|rec| {
                let decision = self.gate.check_apply(&policy, &rec, &workload);
                (rec, decision)
            })
            .collect();
        if decisions.is_empty() {
            let in_effect = policy.status.applied_recommendation_id.is_some()
                && policy.status.applied_recommendation_id.as_deref()
                    == workload.applied_recommendation();
            let resting = if in_effect { Phase::Applied } else { Phase::Pending };
            policy.status.current_recommendation = None;
            policy.status.skip_reason = None;
            self.transition(&mut policy, resting, "no optimization opportunities found")?;
            self.save(&policy).await?;
            return Ok(Plan::Idle(ReconcileOutcome::after(interval)));
        }

        // Best allowed candidate, else the best one for reporting
        let chosen = decisions
            .iter()
            .position(|(_, decision)| decision.is_allowed())
            .unwrap_or(0);
        let (recommendation, decision) = decisions.swap_remove(chosen);
        self.logger.log_recommendation(key, &recommendation);

        match decision {
            GateDecision::Skip(SkipReason::AlreadyApplied) => {
                policy.status.applied_recommendation_id = Some(recommendation.id.clone());
                policy.status.current_recommendation = Some(recommendation);
                policy.status.skip_reason = None;
                self.transition(&mut policy, Phase::Applied, "recommendation already in effect")?;
                self.save(&policy).await?;
                Ok(Plan::Idle(ReconcileOutcome::after(interval)))
            }
            GateDecision::Skip(reason) => {
                let reason = reason.to_string();
                self.logger.log_apply_skipped(key, &recommendation.id, &reason);
                let title = recommendation.title.clone();
                policy.status.current_recommendation = Some(recommendation);
                policy.status.skip_reason = Some(reason);
                self.transition(&mut policy, Phase::Ready, title)?;
                self.save(&policy).await?;
                Ok(Plan::Idle(ReconcileOutcome::after(interval)))
            }
            GateDecision::Allow => {
                policy.status.current_recommendation = Some(recommendation.clone());
                policy.status.skip_reason = None;
                self.transition(&mut policy, Phase::Ready, recommendation.title.clone())?;
                self.save(&policy).await?;
                Ok(Plan::Apply(Box::new(PendingApply {
                    policy,
                    recommendation,
                    workload,
                    started,
                })))
            }
        }
    }

    /// Mutate the workload. Must not be abandoned once started.
    pub async fn apply(&self, pending: PendingApply) -> Result<ReconcileOutcome> {
        let PendingApply {
            mut policy,
            recommendation,
            workload,
            started,
        } = pending;
        let key = policy.key();
        let interval = self.interval(&policy);

        let message = format!("applying {}", recommendation.title);
        self.transition(&mut policy, Phase::Applying, message)?;
        self.save(&policy).await?;

        let applied = self
            .executor
            .apply(&policy, &recommendation, workload.resource_version)
            .await;
        match applied {
            Ok(ApplyOutcome::Applied { baseline, .. }) => {
                if let Some(outcome) = &baseline {
                    match outcome.failed_store() {
                        Some(store) => {
                            let reason = outcome.warning.clone().unwrap_or_default();
                            self.metrics.inc_degraded_write(store);
                            self.logger.log_degraded_write(&workload.reference, store, &reason);
                            let message = format!("{} store rejected writes", store);
                            self.health
                                .set_degraded(components::ROLLBACK_STORE, message)
                                .await;
                        }
                        None => self.health.set_healthy(components::ROLLBACK_STORE).await,
                    }
                    policy.status.rollback_warning = outcome.warning.clone();
                }

                let status = &mut policy.status;
                status.applied_optimizations += 1;
                status.total_savings = cents(status.total_savings + recommendation.monthly_savings);
                status.effective_savings =
                    cents(status.effective_savings + recommendation.monthly_savings);
                status.last_applied = Some(Utc::now());
                status.applied_recommendation_id = Some(recommendation.id.clone());
                let message = format!("applied {}", recommendation.title);
                self.transition(&mut policy, Phase::Applied, message)?;

                self.metrics.inc_applied(recommendation.optimization_type);
                self.metrics.add_savings(recommendation.monthly_savings);
                self.metrics.observe_analysis_to_apply(started.elapsed());
                self.logger.log_applied(&key, &workload.reference, &recommendation);
                self.save(&policy).await?;
                Ok(ReconcileOutcome::after(interval))
            }
            Ok(ApplyOutcome::AlreadyApplied) => {
                policy.status.applied_recommendation_id = Some(recommendation.id.clone());
                self.transition(&mut policy, Phase::Applied, "recommendation already in effect")?;
                self.save(&policy).await?;
                Ok(ReconcileOutcome::after(interval))
            }
            Err(e) => self.apply_failed(policy, &workload.reference, e).await,
        }
    }

    async fn apply_failed(
        &self,
        mut policy: OptimizationPolicy,
        target: &WorkloadRef,
        err: OptimizerError,
    ) -> Result<ReconcileOutcome> {
        let retry_in = self.record_failure(&mut policy, &err);
        self.transition(&mut policy, Phase::Failed, err.to_string())?;
        self.save(&policy).await?;

        // A conflict means someone else moved the workload; our change never landed
        let conflict = matches!(err, OptimizerError::ApplyConflict { .. });
        if !conflict && policy.spec.rollback_on_failure {
            let record = self
                .executor
                .rollback_store()
                .restore_for(target)
                .await
                .unwrap_or_else(|e| {
                    warn!(workload = %target, error = %e, "Could not look up rollback record");
                    None
                });
            if record.is_some() {
                return self.roll_back(policy, target, "apply failed").await;
            }
        }
        Ok(ReconcileOutcome::after(retry_in.unwrap_or_else(|| self.interval(&policy))))
    }

    /// Finish a requested deletion: roll back what this policy changed, then
    /// drop the object. Returns `false` when the object had to be kept.
    pub async fn finalize_deletion(&self, key: &PolicyKey) -> Result<bool> {
        let Some(mut policy) = self.policies.get(key).await? else {
            return Ok(true);
        };
        if !policy.is_deleting() {
            return Ok(false);
        }
        if policy.status.phase == Phase::Applying {
            self.settle_interrupted_apply(&mut policy).await?;
        }

        let needs_rollback = policy.status.applied_recommendation_id.is_some()
            && policy.status.phase != Phase::RolledBack;
        if let (true, Some(target)) = (needs_rollback, policy.spec.target_workload.clone()) {
            match self.executor.execute_rollback(&target).await {
                Ok(_) => {
                    self.metrics.inc_rollbacks();
                    self.logger.log_rollback(key, &target, true, "policy deleted");
                    self.retire_savings(&mut policy);
                    policy.status.applied_recommendation_id = None;
                    self.transition(&mut policy, Phase::RolledBack, "rolled back before deletion")?;
                    self.save(&policy).await?;
                }
                Err(OptimizerError::NotFound(what)) => {
                    warn!(policy = %key, missing = %what, "Nothing left to roll back");
                }
                Err(e) => {
                    self.logger.log_rollback(key, &target, false, &e.to_string());
                    self.record_failure(&mut policy, &e);
                    policy.status.message = Some(format!("deletion blocked: {}", e));
                    self.save(&policy).await?;
                    return Ok(false);
                }
            }
        }

        self.policies.finalize(key).await?;
        Ok(true)
    }

    async fn roll_back(
        &self,
        mut policy: OptimizationPolicy,
        target: &WorkloadRef,
        reason: &str,
    ) -> Result<ReconcileOutcome> {
        let key = policy.key();
        let interval = self.interval(&policy);
        match self.executor.execute_rollback(target).await {
            Ok(_) => {
                self.metrics.inc_rollbacks();
                self.logger.log_rollback(&key, target, true, reason);
                self.retire_savings(&mut policy);
                policy.status.applied_recommendation_id = None;
                let message = format!("rolled back: {}", reason);
                self.transition(&mut policy, Phase::RolledBack, message)?;
            }
            Err(e) => {
                self.logger.log_rollback(&key, target, false, &e.to_string());
                self.record_failure(&mut policy, &e);
            }
        }
        self.save(&policy).await?;
        Ok(ReconcileOutcome::after(interval))
    }

    async fn analyze(&self, policy: &OptimizationPolicy, target: &WorkloadRef) -> Result<Analysis> {
        let timeout = self.config.analysis_timeout;
        let optimization_type = policy.spec.optimization_type.unwrap_or(OptimizationType::All);
        let per_workload = optimization_type != OptimizationType::NodeConsolidation;

        let workload = tokio::time::timeout(timeout, self.workloads.get(target))
            .await
            .map_err(|_| OptimizerError::timeout("workload api"))??;

        let samples = if per_workload {
            self.samples(target, policy.spec.metrics_window).await?
        } else {
            Vec::new()
        };

        let provider = policy.spec.provider.unwrap_or(self.config.provider);
        let region = policy
            .spec
            .region
            .clone()
            .unwrap_or_else(|| self.config.region.clone());
        let (prices, pricing_error) = PriceBook::resolve(
            self.pricing.as_ref(),
            provider,
            &region,
            policy.spec.instance_hint.as_deref(),
            timeout,
        )
        .await;
        match pricing_error {
            Some(e) => self.health.set_degraded(components::PRICING, e.to_string()).await,
            None => self.health.set_healthy(components::PRICING).await,
        }

        let found = if per_workload {
            self.engine.analyze(&AnalysisInput {
                workload: &workload,
                samples: &samples,
                prices: &prices,
                optimization_type,
                min_replicas: policy.spec.min_available.unwrap_or(1).max(1),
            })
        } else {
            Ok(Vec::new())
        };

        let cluster = if optimization_type.accepts(OptimizationType::NodeConsolidation) {
            match self.consolidation(&prices).await {
                Ok(candidate) => candidate,
                Err(e) if per_workload => {
                    warn!(policy = %policy.key(), error = %e, "Skipping node consolidation");
                    None
                }
                Err(e) => return Err(e),
            }
        } else {
            None
        };

        let mut recommendations = match (found, cluster) {
            (Ok(mut found), cluster) => {
                found.extend(cluster);
                found
            }
            // Too little history for this workload, but the cluster view still stands
            (Err(OptimizerError::InsufficientData(reason)), Some(cluster)) => {
                debug!(
                    workload = %target,
                    reason = %reason,
                    "Only the cluster candidate is available"
                );
                vec![cluster]
            }
            (Err(e), _) => return Err(e),
        };
        sort_by_savings(&mut recommendations);

        Ok(Analysis {
            workload,
            recommendations,
        })
    }

    async fn samples(
        &self,
        target: &WorkloadRef,
        window: Duration,
    ) -> Result<Vec<UtilizationSample>> {
        match tokio::time::timeout(
            self.config.analysis_timeout,
            self.utilization.get_samples(target, window),
        )
        .await
        {
            Ok(Ok(samples)) => {
                self.health.set_healthy(components::UTILIZATION_STORE).await;
                Ok(samples)
            }
            Ok(Err(e)) => {
                self.health
                    .set_degraded(components::UTILIZATION_STORE, e.to_string())
                    .await;
                Err(e)
            }
            Err(_) => {
                self.health
                    .set_degraded(components::UTILIZATION_STORE, "query timed out")
                    .await;
                Err(OptimizerError::timeout("utilization store"))
            }
        }
    }

    /// Node consolidation over a fresh cluster snapshot
    async fn consolidation(&self, prices: &PriceBook) -> Result<Option<Recommendation>> {
        let timeout = self.config.analysis_timeout;
        let snapshot = tokio::time::timeout(timeout, self.workloads.cluster_snapshot())
            .await
            .map_err(|_| OptimizerError::timeout("workload api"))??;
        Ok(self.engine.analyze_cluster(&snapshot, prices))
    }

    /// Resolve an `Applying` phase left behind by a crashed cycle
    async fn settle_interrupted_apply(&self, policy: &mut OptimizationPolicy) -> Result<()> {
        let expected = policy
            .status
            .current_recommendation
            .as_ref()
            .map(|rec| rec.id.clone());
        let marker = match &policy.spec.target_workload {
            Some(target) => self
                .workloads
                .get(target)
                .await
                .ok()
                .and_then(|w| w.applied_recommendation().map(str::to_string)),
            None => None,
        };

        if marker.is_some() && marker == expected {
            let savings = policy
                .status
                .current_recommendation
                .as_ref()
                .map(|rec| rec.monthly_savings);
            if let Some(savings) = savings {
                let status = &mut policy.status;
                status.applied_optimizations += 1;
                status.total_savings = cents(status.total_savings + savings);
                status.effective_savings = cents(status.effective_savings + savings);
                self.metrics.add_savings(savings);
            }
            policy.status.applied_recommendation_id = marker;
            policy.status.last_applied = Some(Utc::now());
            self.transition(policy, Phase::Applied, "apply completed before restart")?;
        } else {
            self.transition(policy, Phase::Failed, "apply interrupted before commit")?;
        }
        self.save(policy).await
    }

    /// A rollback restores the baseline, undoing every apply since it was captured
    fn retire_savings(&self, policy: &mut OptimizationPolicy) {
        let undone = std::mem::take(&mut policy.status.effective_savings);
        if undone > 0.0 {
            self.metrics.sub_savings(undone);
        }
    }

    /// Record `err` on the status. Returns the backoff when it is retryable.
    fn record_failure(
        &self,
        policy: &mut OptimizationPolicy,
        err: &OptimizerError,
    ) -> Option<Duration> {
        let class = err.class();
        let now = Utc::now();
        let status = &mut policy.status;

        let retry_in = match class {
            // Not a failure of the policy; try again on the normal cadence
            ErrorClass::InsufficientData => Some(self.interval_of(&policy.spec)),
            // The workload moved under us; analyze the new spec right away
            ErrorClass::ApplyConflict => Some(Duration::ZERO),
            _ if err.is_retryable() => {
                status.consecutive_failures += 1;
                Some(backoff(
                    self.config.backoff_base,
                    self.config.backoff_max,
                    status.consecutive_failures,
                ))
            }
            _ => {
                status.consecutive_failures += 1;
                None
            }
        };

        status.last_error = Some(StatusError {
            class,
            message: err.to_string(),
            at: now,
        });
        status.retry_at =
            retry_in.and_then(|d| chrono::Duration::from_std(d).ok().map(|d| now + d));
        if class == ErrorClass::RollbackFailure {
            status.requires_intervention = true;
        }

        if class != ErrorClass::InsufficientData {
            self.metrics.inc_failed(class);
        }
        self.logger
            .log_failure(&policy.key(), class, &err.to_string(), retry_in);
        retry_in
    }

    fn transition(
        &self,
        policy: &mut OptimizationPolicy,
        to: Phase,
        message: impl Into<String>,
    ) -> Result<()> {
        let from = policy.status.phase;
        let message = message.into();
        if from != to || to == Phase::Analyzing {
            if !can_transition(from, to) {
                return Err(OptimizerError::Unsupported(format!(
                    "phase transition {} -> {} for {}",
                    from,
                    to,
                    policy.key()
                )));
            }
            self.logger
                .log_phase_transition(&policy.key(), from, to, &message);
        }
        policy.status.phase = to;
        policy.status.message = Some(message);
        Ok(())
    }

    /// Phase to return to when an analysis could not finish
    fn resting_phase(&self, policy: &OptimizationPolicy, entered: Phase) -> Phase {
        if entered == Phase::Applied && policy.status.applied_recommendation_id.is_some() {
            Phase::Applied
        } else {
            Phase::Pending
        }
    }

    async fn save(&self, policy: &OptimizationPolicy) -> Result<()> {
        match self
            .policies
            .update_status(&policy.key(), policy.status.clone())
            .await
        {
            // Finalized underneath us
            Err(OptimizerError::NotFound(_)) => Ok(()),
            other => other,
        }
    }

    fn interval(&self, policy: &OptimizationPolicy) -> Duration {
        self.interval_of(&policy.spec)
    }

    fn interval_of(&self, spec: &PolicySpec) -> Duration {
        spec.schedule_interval()
            .filter(|d| !d.is_zero())
            .unwrap_or(self.config.reconcile_interval)
    }
}

fn cents(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}

/// Exponential backoff: `base * 2^(failures - 1)`, capped at `max`
pub fn backoff(base: Duration, max: Duration, failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(20);
    base.saturating_mul(1u32 << exponent).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::testing::*;
    use crate::engine::testing::workload;
    use crate::models::{NodeInfo, RiskLevel, WorkloadKind};
    use crate::units::{parse_cpu, GIB};
    use crate::utilization::InMemoryUtilizationStore;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let base = Duration::from_secs(30);
        let max = Duration::from_secs(1800);
        assert_eq!(backoff(base, max, 1), Duration::from_secs(30));
        assert_eq!(backoff(base, max, 2), Duration::from_secs(60));
        assert_eq!(backoff(base, max, 4), Duration::from_secs(240));
        assert_eq!(backoff(base, max, 10), max);
        assert_eq!(backoff(base, max, u32::MAX), max);
    }

    #[tokio::test]
    async fn test_auto_apply_reaches_applied() {
        let f = fixture().await;
        let key = create(&f, auto_cpu(&f.target)).await;

        f.reconciler.reconcile(&key, Trigger::Created).await.unwrap();

        let status = status(&f, &key).await;
        assert_eq!(status.phase, Phase::Applied);
        assert_eq!(status.applied_optimizations, 1);
        assert!(status.total_savings > 0.0);
        assert_eq!(status.observed_generation, 1);
        let rec = status.current_recommendation.unwrap();
        assert_eq!(status.applied_recommendation_id.as_deref(), Some(rec.id.as_str()));

        let live = f.workloads.get(&f.target).await.unwrap();
        assert_eq!(live.applied_recommendation(), Some(rec.id.as_str()));
        let cpu = parse_cpu(live.containers[0].resources.cpu_request.as_deref().unwrap()).unwrap();
        assert!(cpu < 1000, "cpu request {}m", cpu);
    }

    #[tokio::test]
    async fn test_second_cycle_does_not_reapply() {
        let f = fixture().await;
        let key = create(&f, auto_cpu(&f.target)).await;
        f.reconciler.reconcile(&key, Trigger::Created).await.unwrap();
        let version = f.workloads.get(&f.target).await.unwrap().resource_version;

        f.reconciler.reconcile(&key, Trigger::Timer).await.unwrap();

        let status = status(&f, &key).await;
        assert_eq!(status.phase, Phase::Applied);
        assert_eq!(status.applied_optimizations, 1);
        assert_eq!(f.workloads.get(&f.target).await.unwrap().resource_version, version);
    }

    #[tokio::test]
    async fn test_dry_run_stops_at_ready() {
        let f = fixture().await;
        let key = create(
            &f,
            PolicySpec {
                dry_run: true,
                auto_apply: false,
                ..auto_cpu(&f.target)
            },
        )
        .await;

        let outcome = f.reconciler.reconcile(&key, Trigger::Created).await.unwrap();
        assert_eq!(outcome.requeue_after, Duration::from_secs(30 * 60));

        let status = status(&f, &key).await;
        assert_eq!(status.phase, Phase::Ready);
        assert!(status.current_recommendation.is_some());
        assert!(status.skip_reason.unwrap().contains("dry run"));
        assert_eq!(f.workloads.get(&f.target).await.unwrap().resource_version, 1);
    }

    #[tokio::test]
    async fn test_risk_above_policy_limit_stays_ready() {
        let f = fixture().await;
        let key = create(
            &f,
            PolicySpec {
                target_workload: Some(f.target.clone()),
                optimization_type: Some(OptimizationType::SpotMigration),
                min_confidence: 0.8,
                max_risk_level: RiskLevel::Low,
                auto_apply: true,
                ..Default::default()
            },
        )
        .await;

        f.reconciler.reconcile(&key, Trigger::Created).await.unwrap();
        f.reconciler.reconcile(&key, Trigger::Timer).await.unwrap();

        let status = status(&f, &key).await;
        assert_eq!(status.phase, Phase::Ready);
        let rec = status.current_recommendation.unwrap();
        assert_eq!(rec.optimization_type, OptimizationType::SpotMigration);
        assert!(rec.risk.level > RiskLevel::Low);
        assert!(status.skip_reason.is_some());
        assert_eq!(status.applied_optimizations, 0);
        assert!(f.workloads.get(&f.target).await.unwrap().node_selector.is_empty());
    }

    #[tokio::test]
    async fn test_deletion_rolls_back_applied_change() {
        let f = fixture().await;
        let original = f.workloads.get(&f.target).await.unwrap().declared();
        let key = create(&f, auto_cpu(&f.target)).await;
        f.reconciler.reconcile(&key, Trigger::Created).await.unwrap();
        assert_eq!(status(&f, &key).await.phase, Phase::Applied);

        f.policies.request_deletion(&key).await.unwrap();
        f.reconciler.reconcile(&key, Trigger::Deleted).await.unwrap();

        assert!(f.policies.get(&key).await.unwrap().is_none());
        let live = f.workloads.get(&f.target).await.unwrap();
        assert_eq!(live.declared(), original);
    }

    #[tokio::test]
    async fn test_fast_store_outage_sets_rollback_warning() {
        let f = fixture().await;
        let original = f.workloads.get(&f.target).await.unwrap().declared();
        f.fast.set_unavailable(true);
        let key = create(&f, auto_cpu(&f.target)).await;

        f.reconciler.reconcile(&key, Trigger::Created).await.unwrap();
        let status = status(&f, &key).await;
        assert_eq!(status.phase, Phase::Applied);
        assert!(status.rollback_warning.is_some());

        f.policies.request_deletion(&key).await.unwrap();
        assert!(f.reconciler.finalize_deletion(&key).await.unwrap());
        assert_eq!(f.workloads.get(&f.target).await.unwrap().declared(), original);
    }

    #[tokio::test]
    async fn test_failed_apply_rolls_back() {
        let f = fixture().await;
        let original = f.workloads.get(&f.target).await.unwrap().declared();
        let key = create(&f, auto_cpu(&f.target)).await;
        f.workloads.fail_next_replaces(1);

        f.reconciler.reconcile(&key, Trigger::Created).await.unwrap();

        let status = status(&f, &key).await;
        assert_eq!(status.phase, Phase::RolledBack);
        assert_eq!(status.last_error.unwrap().class, ErrorClass::Internal);
        assert_eq!(status.applied_optimizations, 0);
        assert_eq!(f.workloads.get(&f.target).await.unwrap().declared(), original);

        // Parked until the spec changes
        f.reconciler.reconcile(&key, Trigger::Timer).await.unwrap();
        assert_eq!(self::status(&f, &key).await.phase, Phase::RolledBack);

        f.policies
            .update_spec(&key, PolicySpec {
                max_change_percent: 75,
                ..auto_cpu(&f.target)
            })
            .await
            .unwrap();
        f.reconciler.reconcile(&key, Trigger::SpecChanged).await.unwrap();
        assert_eq!(self::status(&f, &key).await.phase, Phase::Applied);
    }

    #[tokio::test]
    async fn test_insufficient_data_waits_on_normal_cadence() {
        let spec = workload(WorkloadKind::Deployment, Some(5), "2000m", "4Gi");
        let f = fixture_with(spec, Arc::new(InMemoryUtilizationStore::default())).await;
        let key = create(&f, auto_cpu(&f.target)).await;

        let outcome = f.reconciler.reconcile(&key, Trigger::Created).await.unwrap();
        assert_eq!(outcome.requeue_after, Duration::from_secs(30 * 60));

        let status = status(&f, &key).await;
        assert_eq!(status.phase, Phase::Pending);
        assert_eq!(status.last_error.unwrap().class, ErrorClass::InsufficientData);
        assert_eq!(status.consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_utilization_timeout_backs_off() {
        let spec = workload(WorkloadKind::Deployment, Some(5), "2000m", "4Gi");
        let f = fixture_with(spec, StalledStore::new(Duration::from_secs(3600))).await;
        let key = create(&f, auto_cpu(&f.target)).await;

        let first = f.reconciler.reconcile(&key, Trigger::Created).await.unwrap();
        assert_eq!(first.requeue_after, Duration::from_secs(30));
        let second = f.reconciler.reconcile(&key, Trigger::Timer).await.unwrap();
        assert_eq!(second.requeue_after, Duration::from_secs(60));

        let status = status(&f, &key).await;
        assert_eq!(status.phase, Phase::Pending);
        assert_eq!(status.last_error.unwrap().class, ErrorClass::AnalysisTimeout);
        assert_eq!(status.consecutive_failures, 2);
        assert!(status.retry_at.is_some());
    }

    #[tokio::test]
    async fn test_protected_target_is_a_validation_error() {
        let f = fixture().await;
        let target = WorkloadRef::new(WorkloadKind::Deployment, "kube-system", "coredns");
        let key = create(&f, auto_cpu(&target)).await;

        f.reconciler.reconcile(&key, Trigger::Created).await.unwrap();
        let first = status(&f, &key).await;
        assert_eq!(first.phase, Phase::Pending);
        assert_eq!(first.last_error.as_ref().unwrap().class, ErrorClass::ValidationError);

        // Not retried until the spec changes
        f.reconciler.reconcile(&key, Trigger::Timer).await.unwrap();
        assert_eq!(status(&f, &key).await.consecutive_failures, first.consecutive_failures);
    }

    #[tokio::test]
    async fn test_interrupted_apply_is_detected() {
        let f = fixture().await;
        let key = create(&f, auto_cpu(&f.target)).await;
        f.reconciler.reconcile(&key, Trigger::Created).await.unwrap();

        // Simulate a crash after the workload write but before the status write
        let mut crashed = status(&f, &key).await;
        crashed.phase = Phase::Applying;
        crashed.applied_optimizations = 0;
        f.policies.update_status(&key, crashed).await.unwrap();

        f.reconciler.reconcile(&key, Trigger::Resync).await.unwrap();
        let status = status(&f, &key).await;
        assert_eq!(status.phase, Phase::Applied);
        assert_eq!(status.applied_optimizations, 1);
    }

    #[tokio::test]
    async fn test_missing_policy_is_gone() {
        let f = fixture().await;
        let plan = f
            .reconciler
            .plan(&PolicyKey::new("shop", "missing"), Trigger::Timer)
            .await
            .unwrap();
        assert!(matches!(plan, Plan::Gone));
    }

    fn node(name: &str, zone: &str) -> NodeInfo {
        NodeInfo {
            name: name.into(),
            zone: zone.into(),
            cpu_millicores: 16_000,
            memory_bytes: 64 * GIB,
            instance_type: None,
            hourly_cost: None,
        }
    }

    #[tokio::test]
    async fn test_node_consolidation_is_reported_as_advisory() {
        let f = fixture().await;
        f.workloads
            .set_nodes(vec![node("a1", "a"), node("a2", "a"), node("b1", "b"), node("b2", "b")])
            .await;
        let key = create(
            &f,
            PolicySpec {
                target_workload: Some(f.target.clone()),
                optimization_type: Some(OptimizationType::NodeConsolidation),
                auto_apply: true,
                ..Default::default()
            },
        )
        .await;

        f.reconciler.reconcile(&key, Trigger::Created).await.unwrap();

        let status = status(&f, &key).await;
        assert_eq!(status.phase, Phase::Ready);
        let rec = status.current_recommendation.unwrap();
        assert_eq!(rec.optimization_type, OptimizationType::NodeConsolidation);
        assert!(rec.workload.is_none());
        assert!(!rec.changes.nodes_to_drain.is_empty());
        assert!(status.skip_reason.unwrap().contains("advisory"));
        assert_eq!(f.workloads.get(&f.target).await.unwrap().resource_version, 1);
    }

    #[tokio::test]
    async fn test_consolidation_stands_without_workload_history() {
        let f = fixture_with(
            reference_workload(),
            Arc::new(InMemoryUtilizationStore::default()),
        )
        .await;
        f.workloads.set_nodes(vec![node("a1", "a"), node("a2", "a")]).await;
        let key = create(
            &f,
            PolicySpec {
                target_workload: Some(f.target.clone()),
                optimization_type: Some(OptimizationType::All),
                ..Default::default()
            },
        )
        .await;

        f.reconciler.reconcile(&key, Trigger::Created).await.unwrap();

        let status = status(&f, &key).await;
        assert_eq!(status.phase, Phase::Ready);
        assert_eq!(
            status.current_recommendation.unwrap().optimization_type,
            OptimizationType::NodeConsolidation
        );
    }

    #[tokio::test]
    async fn test_edit_between_analysis_and_apply_is_reanalyzed() {
        let f = fixture().await;
        let key = create(&f, auto_cpu(&f.target)).await;
        let Plan::Apply(pending) = f.reconciler.plan(&key, Trigger::Created).await.unwrap() else {
            panic!("expected an allowed recommendation");
        };

        // Another actor edits the workload before the apply starts
        let mut edited = f.workloads.get(&f.target).await.unwrap();
        edited.replicas = Some(9);
        edited.containers[0].resources.cpu_request = Some("3000m".into());
        edited.containers[0].resources.cpu_limit = Some("3000m".into());
        f.workloads.upsert(edited);

        let outcome = f.reconciler.apply(*pending).await.unwrap();
        assert_eq!(outcome.requeue_after, Duration::ZERO);

        let failed = status(&f, &key).await;
        assert_eq!(failed.phase, Phase::Failed);
        assert_eq!(failed.last_error.unwrap().class, ErrorClass::ApplyConflict);
        assert_eq!(failed.consecutive_failures, 0);
        assert_eq!(failed.applied_optimizations, 0);
        let live = f.workloads.get(&f.target).await.unwrap();
        assert_eq!(live.replicas, Some(9));
        assert_eq!(live.containers[0].resources.cpu_request.as_deref(), Some("3000m"));
        assert!(f.fast.is_empty());

        // The next cycle works from the edited spec
        f.reconciler.reconcile(&key, Trigger::Timer).await.unwrap();
        assert_eq!(status(&f, &key).await.phase, Phase::Applied);
        let record = f
            .reconciler
            .executor
            .rollback_store()
            .restore_for(&f.target)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.spec.replicas, Some(9));
        assert_eq!(
            record.spec.containers[0].resources.cpu_request.as_deref(),
            Some("3000m")
        );
    }

    #[tokio::test]
    async fn test_rollback_retires_effective_savings() {
        let f = fixture().await;
        let key = create(&f, auto_cpu(&f.target)).await;
        f.reconciler.reconcile(&key, Trigger::Created).await.unwrap();

        let applied = status(&f, &key).await;
        assert!(applied.effective_savings > 0.0);
        assert_eq!(applied.effective_savings, applied.total_savings);

        let policy = f.policies.get(&key).await.unwrap().unwrap();
        f.reconciler
            .roll_back(policy, &f.target, "operator request")
            .await
            .unwrap();

        let rolled_back = status(&f, &key).await;
        assert_eq!(rolled_back.phase, Phase::RolledBack);
        assert_eq!(rolled_back.effective_savings, 0.0);
        assert_eq!(rolled_back.total_savings, applied.total_savings);
    }
}
