//! Fixtures shared by the reconciler and task tests

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::reconciler::{Collaborators, Reconciler};
use super::store::{InMemoryPolicyStore, PolicyStore};
use super::ControllerConfig;
use crate::engine::testing::{steady_samples, workload};
use crate::engine::RecommendationEngine;
use crate::error::Result;
use crate::gate::{apply_admission_defaults, PolicyGate, ProtectedTargets};
use crate::health::HealthRegistry;
use crate::models::{
    ClusterSnapshot, DisruptionBudget, OptimizationPolicy, OptimizationType, PolicyKey,
    PolicySpec, PolicyStatus, UtilizationSample, WorkloadKind, WorkloadRef, WorkloadSpec,
};
use crate::pricing::StaticPriceCatalog;
use crate::rollback::{fast::DEFAULT_TTL, InMemoryTtlStore, RollbackStore};
use crate::utilization::{InMemoryUtilizationStore, UtilizationStore};
use crate::workload::{InMemoryWorkloadApi, WorkloadApi};

pub struct Fixture {
    pub reconciler: Arc<Reconciler>,
    pub policies: Arc<InMemoryPolicyStore>,
    pub workloads: Arc<InMemoryWorkloadApi>,
    pub fast: Arc<InMemoryTtlStore>,
    pub target: WorkloadRef,
}

/// 2000m / 4Gi, 5 replicas
pub fn reference_workload() -> WorkloadSpec {
    workload(WorkloadKind::Deployment, Some(5), "2000m", "4Gi")
}

/// A week of steady low utilization for the reference workload
pub fn steady_store(target: &WorkloadRef) -> Arc<dyn UtilizationStore> {
    let store = InMemoryUtilizationStore::default();
    store.append(target, steady_samples(7, 0.6, 0.1, 1.5, 0.18));
    Arc::new(store)
}

pub async fn fixture() -> Fixture {
    let spec = reference_workload();
    let utilization = steady_store(&spec.reference);
    fixture_with(spec, utilization).await
}

pub async fn fixture_with(spec: WorkloadSpec, utilization: Arc<dyn UtilizationStore>) -> Fixture {
    build(spec, utilization, |api| -> Arc<dyn WorkloadApi> { api }).await
}

/// Like [`fixture_with`], with the reconciler seeing the workload API through `wrap`
pub async fn build(
    spec: WorkloadSpec,
    utilization: Arc<dyn UtilizationStore>,
    wrap: impl FnOnce(Arc<InMemoryWorkloadApi>) -> Arc<dyn WorkloadApi>,
) -> Fixture {
    let workloads = Arc::new(InMemoryWorkloadApi::new());
    let target = spec.reference.clone();
    workloads.upsert(spec);
    let policies = Arc::new(InMemoryPolicyStore::new());
    let fast = Arc::new(InMemoryTtlStore::default());
    let durable = Arc::new(InMemoryTtlStore::new(Duration::from_secs(365 * 24 * 3600)));
    let rollback = Arc::new(RollbackStore::new(fast.clone(), durable, DEFAULT_TTL));

    let reconciler = Reconciler::new(
        Collaborators {
            policies: policies.clone(),
            workloads: wrap(workloads.clone()),
            utilization,
            pricing: Arc::new(StaticPriceCatalog),
            rollback,
        },
        RecommendationEngine::default(),
        PolicyGate::new(ProtectedTargets::default()),
        ControllerConfig {
            instance_id: "test-0".into(),
            ..Default::default()
        },
        HealthRegistry::with_components().await,
    );
    Fixture {
        reconciler: Arc::new(reconciler),
        policies,
        workloads,
        fast,
        target,
    }
}

pub async fn create(f: &Fixture, spec: PolicySpec) -> PolicyKey {
    let mut policy = OptimizationPolicy::new("shop", "web-cost", spec);
    apply_admission_defaults(&mut policy);
    f.policies.create(policy).await.unwrap().key()
}

pub fn auto_cpu(target: &WorkloadRef) -> PolicySpec {
    PolicySpec {
        target_workload: Some(target.clone()),
        optimization_type: Some(OptimizationType::RightSizeCpu),
        max_change_percent: 80,
        auto_apply: true,
        ..Default::default()
    }
}

pub async fn status(f: &Fixture, key: &PolicyKey) -> PolicyStatus {
    f.policies.get(key).await.unwrap().unwrap().status
}

/// Utilization store that answers after `delay` with no samples
pub struct StalledStore {
    delay: Duration,
    calls: AtomicUsize,
}

impl StalledStore {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UtilizationStore for StalledStore {
    async fn get_samples(
        &self,
        _workload: &WorkloadRef,
        _window: Duration,
    ) -> Result<Vec<UtilizationSample>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(Vec::new())
    }
}

/// Workload API whose replaces take `delay` to commit
pub struct SlowReplace {
    pub inner: Arc<InMemoryWorkloadApi>,
    pub delay: Duration,
}

#[async_trait]
impl WorkloadApi for SlowReplace {
    async fn get(&self, workload: &WorkloadRef) -> Result<WorkloadSpec> {
        self.inner.get(workload).await
    }

    async fn replace(&self, spec: WorkloadSpec) -> Result<WorkloadSpec> {
        tokio::time::sleep(self.delay).await;
        self.inner.replace(spec).await
    }

    async fn disruption_budget(&self, workload: &WorkloadRef) -> Result<Option<DisruptionBudget>> {
        self.inner.disruption_budget(workload).await
    }

    async fn cluster_snapshot(&self) -> Result<ClusterSnapshot> {
        self.inner.cluster_snapshot().await
    }
}
