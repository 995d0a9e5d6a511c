//! Reconciliation controller
//!
//! Watches policy objects and drives each one through its lifecycle:
//! - [`state`]: allowed phase transitions
//! - [`store`]: policy objects and their change events
//! - [`reconciler`]: one analyze/gate/apply cycle
//! - [`task`]: per-policy serialization of cycles
//! - [`lease`]: single active instance
//!
//! Only the lease holder reconciles. Losing the lease stops every policy
//! task (after in-flight applies settle) and returns the instance to standby.

pub mod lease;
pub mod reconciler;
pub mod state;
pub mod store;
pub mod task;
#[cfg(test)]
pub(crate) mod testing;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::health::{components, HealthRegistry};
use crate::models::PolicyKey;
use crate::observability::{ControllerMetrics, StructuredLogger};
use crate::pricing::Provider;

pub use lease::{FileLease, InMemoryLease, LeaderLease};
pub use reconciler::{Collaborators, Plan, ReconcileOutcome, Reconciler};
pub use state::Trigger;
pub use store::{InMemoryPolicyStore, PolicyEvent, PolicyStore};
use task::{TaskHandle, TaskMessage};

/// Controller timing and identity
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Lease holder identity
    pub instance_id: String,
    /// Cadence of periodic re-analysis
    pub reconcile_interval: Duration,
    /// Bound on each collaborator call during analysis
    pub analysis_timeout: Duration,
    pub lease_ttl: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Pricing defaults for policies that do not name a provider or region
    pub provider: Provider,
    pub region: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            instance_id: "costopt-operator".to_string(),
            reconcile_interval: Duration::from_secs(30 * 60),
            analysis_timeout: Duration::from_secs(10),
            lease_ttl: Duration::from_secs(15),
            backoff_base: Duration::from_secs(30),
            backoff_max: Duration::from_secs(30 * 60),
            provider: Provider::Aws,
            region: "us-east-1".to_string(),
        }
    }
}

pub struct Controller {
    reconciler: Arc<Reconciler>,
    lease: Arc<dyn LeaderLease>,
    health: HealthRegistry,
    metrics: ControllerMetrics,
    logger: StructuredLogger,
}

impl Controller {
    pub fn new(
        reconciler: Arc<Reconciler>,
        lease: Arc<dyn LeaderLease>,
        health: HealthRegistry,
    ) -> Self {
        let logger = StructuredLogger::new(reconciler.config().instance_id.clone());
        Self {
            reconciler,
            lease,
            health,
            metrics: ControllerMetrics::new(),
            logger,
        }
    }

    /// Alternate between standby and leading until `shutdown` flips
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let config = self.reconciler.config().clone();
        let retry = (config.lease_ttl / 3).max(Duration::from_millis(10));
        self.health.set_healthy(components::CONTROLLER).await;

        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.lease.try_acquire(&config.instance_id, config.lease_ttl).await {
                Ok(true) => {
                    self.health.set_healthy(components::LEASE).await;
                    self.lead(&mut shutdown).await;
                }
                Ok(false) => {
                    debug!(instance = %config.instance_id, "Standing by, lease held elsewhere");
                    self.health.set_healthy(components::LEASE).await;
                }
                Err(e) => {
                    warn!(error = %e, "Lease acquisition failed");
                    self.health
                        .set_degraded(components::LEASE, e.to_string())
                        .await;
                }
            }

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(retry) => {}
            }
        }

        self.lease.release(&config.instance_id).await?;
        self.logger.log_shutdown("shutdown requested");
        Ok(())
    }

    /// Reconcile every policy until the lease is lost or shutdown is requested
    async fn lead(&self, shutdown: &mut watch::Receiver<bool>) {
        let config = self.reconciler.config().clone();
        self.metrics.set_leader(true);
        self.logger.log_leadership(true);

        let (stop_tasks, tasks_rx) = watch::channel(false);
        // Subscribe before listing so nothing falls between the two
        let mut events = self.reconciler.policies().subscribe();
        let mut tasks: HashMap<PolicyKey, TaskHandle> = HashMap::new();
        self.resync(&mut tasks, &tasks_rx).await;

        let mut renew =
            tokio::time::interval((config.lease_ttl / 3).max(Duration::from_millis(10)));
        renew.set_missed_tick_behavior(MissedTickBehavior::Delay);
        renew.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = renew.tick() => {
                    match self.lease.renew(&config.instance_id, config.lease_ttl).await {
                        Ok(true) => {}
                        Ok(false) => {
                            warn!(instance = %config.instance_id, "Leader lease lost");
                            break;
                        }
                        Err(e) => {
                            warn!(
                                instance = %config.instance_id,
                                error = %e,
                                "Leader lease renewal failed"
                            );
                            self.health.set_degraded(components::LEASE, e.to_string()).await;
                            break;
                        }
                    }
                    tasks.retain(|_, handle| !handle.is_finished());
                    self.metrics.set_active_policies(tasks.len() as i64);
                }
                event = events.recv() => match event {
                    Ok(PolicyEvent::Applied(key)) => {
                        let trigger = if tasks.contains_key(&key) {
                            Trigger::SpecChanged
                        } else {
                            Trigger::Created
                        };
                        let message = TaskMessage::Reconcile(trigger);
                        self.dispatch(&mut tasks, key, message, &tasks_rx).await;
                    }
                    Ok(PolicyEvent::Deleted(key)) => {
                        self.dispatch(&mut tasks, key, TaskMessage::Delete, &tasks_rx).await;
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed = missed, "Policy events dropped, resyncing");
                        self.resync(&mut tasks, &tasks_rx).await;
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }

        let _ = stop_tasks.send(true);
        for (_, handle) in tasks.drain() {
            handle.join().await;
        }
        self.metrics.set_active_policies(0);
        self.metrics.set_leader(false);
        self.logger.log_leadership(false);
    }

    async fn resync(
        &self,
        tasks: &mut HashMap<PolicyKey, TaskHandle>,
        stop: &watch::Receiver<bool>,
    ) {
        let policies = match self.reconciler.policies().list().await {
            Ok(policies) => policies,
            Err(e) => {
                warn!(error = %e, "Listing policies failed");
                return;
            }
        };
        info!(policies = policies.len(), "Resyncing policies");
        self.metrics
            .set_savings(policies.iter().map(|p| p.status.effective_savings).sum());
        for policy in policies {
            let message = if policy.is_deleting() {
                TaskMessage::Delete
            } else {
                TaskMessage::Reconcile(Trigger::Resync)
            };
            self.dispatch(tasks, policy.key(), message, stop).await;
        }
        self.metrics.set_active_policies(tasks.len() as i64);
    }

    async fn dispatch(
        &self,
        tasks: &mut HashMap<PolicyKey, TaskHandle>,
        key: PolicyKey,
        message: TaskMessage,
        stop: &watch::Receiver<bool>,
    ) {
        if let Some(handle) = tasks.get(&key) {
            if !handle.is_finished() && handle.send(message).await {
                return;
            }
        }
        let handle = task::spawn(key.clone(), self.reconciler.clone(), message, stop.clone());
        tasks.insert(key, handle);
        self.metrics.set_active_policies(tasks.len() as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::{steady_samples, workload};
    use crate::engine::RecommendationEngine;
    use crate::gate::{apply_admission_defaults, PolicyGate, ProtectedTargets};
    use crate::models::{
        OptimizationPolicy, OptimizationType, Phase, PolicySpec, WorkloadKind, WorkloadRef,
    };
    use crate::pricing::StaticPriceCatalog;
    use crate::rollback::{InMemoryTtlStore, RollbackStore};
    use crate::utilization::InMemoryUtilizationStore;
    use crate::workload::{InMemoryWorkloadApi, WorkloadApi};
    use tokio::task::JoinHandle;

    struct Harness {
        policies: Arc<InMemoryPolicyStore>,
        workloads: Arc<InMemoryWorkloadApi>,
        target: WorkloadRef,
        reconciler: Arc<Reconciler>,
    }

    async fn harness(instance: &str) -> Harness {
        let spec = workload(WorkloadKind::Deployment, Some(5), "2000m", "4Gi");
        let target = spec.reference.clone();
        let workloads = Arc::new(InMemoryWorkloadApi::new());
        workloads.upsert(spec);
        let utilization = InMemoryUtilizationStore::default();
        utilization.append(&target, steady_samples(7, 0.6, 0.1, 1.5, 0.18));
        let policies = Arc::new(InMemoryPolicyStore::new());
        let rollback = Arc::new(RollbackStore::new(
            Arc::new(InMemoryTtlStore::default()),
            Arc::new(InMemoryTtlStore::default()),
            crate::rollback::fast::DEFAULT_TTL,
        ));
        let reconciler = Arc::new(Reconciler::new(
            Collaborators {
                policies: policies.clone(),
                workloads: workloads.clone(),
                utilization: Arc::new(utilization),
                pricing: Arc::new(StaticPriceCatalog),
                rollback,
            },
            RecommendationEngine::default(),
            PolicyGate::new(ProtectedTargets::default()),
            ControllerConfig {
                instance_id: instance.to_string(),
                lease_ttl: Duration::from_millis(300),
                ..Default::default()
            },
            HealthRegistry::with_components().await,
        ));
        Harness {
            policies,
            workloads,
            target,
            reconciler,
        }
    }

    fn start(
        reconciler: Arc<Reconciler>,
        lease: Arc<dyn LeaderLease>,
    ) -> (watch::Sender<bool>, JoinHandle<Result<()>>) {
        let (tx, rx) = watch::channel(false);
        let controller = Controller::new(reconciler, lease, HealthRegistry::new());
        let join = tokio::spawn(async move { controller.run(rx).await });
        (tx, join)
    }

    async fn wait_for_phase(policies: &InMemoryPolicyStore, key: &PolicyKey, phase: Phase) -> bool {
        for _ in 0..250 {
            if let Ok(Some(policy)) = policies.get(key).await {
                if policy.status.phase == phase {
                    return true;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    fn auto_cpu(target: &WorkloadRef) -> OptimizationPolicy {
        let mut policy = OptimizationPolicy::new(
            "shop",
            "web-cost",
            PolicySpec {
                target_workload: Some(target.clone()),
                optimization_type: Some(OptimizationType::RightSizeCpu),
                max_change_percent: 80,
                auto_apply: true,
                ..Default::default()
            },
        );
        apply_admission_defaults(&mut policy);
        policy
    }

    #[tokio::test]
    async fn test_created_policy_is_applied_and_deleted_policy_rolled_back() {
        let h = harness("operator-0").await;
        let original = h.workloads.get(&h.target).await.unwrap().declared();
        let (shutdown, join) = start(h.reconciler.clone(), Arc::new(InMemoryLease::new()));

        let key = h.policies.create(auto_cpu(&h.target)).await.unwrap().key();
        assert!(wait_for_phase(&h.policies, &key, Phase::Applied).await);
        assert_ne!(h.workloads.get(&h.target).await.unwrap().declared(), original);

        h.policies.request_deletion(&key).await.unwrap();
        let mut gone = false;
        for _ in 0..250 {
            if h.policies.get(&key).await.unwrap().is_none() {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(gone);
        assert_eq!(h.workloads.get(&h.target).await.unwrap().declared(), original);

        shutdown.send(true).unwrap();
        join.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_existing_policies_picked_up_on_start() {
        let h = harness("operator-0").await;
        let key = h.policies.create(auto_cpu(&h.target)).await.unwrap().key();

        let (shutdown, join) = start(h.reconciler.clone(), Arc::new(InMemoryLease::new()));
        assert!(wait_for_phase(&h.policies, &key, Phase::Applied).await);

        shutdown.send(true).unwrap();
        join.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_standby_does_not_reconcile() {
        let h = harness("operator-1").await;
        let lease = Arc::new(InMemoryLease::new());
        assert!(lease
            .try_acquire("operator-0", Duration::from_secs(3600))
            .await
            .unwrap());

        let (shutdown, join) = start(h.reconciler.clone(), lease.clone());
        let key = h.policies.create(auto_cpu(&h.target)).await.unwrap().key();
        tokio::time::sleep(Duration::from_millis(300)).await;
        let policy = h.policies.get(&key).await.unwrap().unwrap();
        assert_eq!(policy.status.phase, Phase::Pending);
        assert_eq!(lease.holder().await.as_deref(), Some("operator-0"));

        // Takes over once the active instance lets go
        lease.release("operator-0").await.unwrap();
        assert!(wait_for_phase(&h.policies, &key, Phase::Applied).await);
        assert_eq!(lease.holder().await.as_deref(), Some("operator-1"));

        shutdown.send(true).unwrap();
        join.await.unwrap().unwrap();
        assert_eq!(lease.holder().await, None);
    }
}
