//! Workload API
//!
//! The declared-object API of the cluster, reduced to what the controller
//! needs: read a workload's declared spec, replace it under optimistic
//! concurrency, read its disruption budget, and snapshot nodes and
//! placements for consolidation. [`InMemoryWorkloadApi`] is the in-process
//! implementation seeded from the inventory file.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::error::{OptimizerError, Result};
use crate::models::{
    ClusterSnapshot, DisruptionBudget, NodeInfo, PodPlacement, WorkloadRef, WorkloadSpec,
};

#[async_trait]
pub trait WorkloadApi: Send + Sync {
    /// Current declared spec, including its resource version
    async fn get(&self, workload: &WorkloadRef) -> Result<WorkloadSpec>;

    /// Replace the declared spec.
    ///
    /// Fails with `ApplyConflict` when `spec.resource_version` no longer
    /// matches the live object. Returns the stored spec with its new version.
    async fn replace(&self, spec: WorkloadSpec) -> Result<WorkloadSpec>;

    async fn disruption_budget(&self, workload: &WorkloadRef) -> Result<Option<DisruptionBudget>>;

    async fn cluster_snapshot(&self) -> Result<ClusterSnapshot>;
}

type Mutation = Box<dyn FnOnce(&mut WorkloadSpec) + Send>;

/// In-memory cluster state
#[derive(Default)]
pub struct InMemoryWorkloadApi {
    workloads: DashMap<String, WorkloadSpec>,
    budgets: DashMap<String, DisruptionBudget>,
    nodes: RwLock<Vec<NodeInfo>>,
    placements: RwLock<Vec<PodPlacement>>,
    failing_replaces: AtomicU32,
    /// Edits made by "another actor" right after the next replace of a workload
    drift: Mutex<HashMap<String, Mutation>>,
}

impl InMemoryWorkloadApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Insert or overwrite a workload as an external actor would, bumping its version
    pub fn upsert(&self, mut spec: WorkloadSpec) {
        let key = spec.reference.key();
        let version = self
            .workloads
            .get(&key)
            .map(|w| w.resource_version)
            .unwrap_or(0);
        spec.resource_version = version + 1;
        self.workloads.insert(key, spec);
    }

    pub fn set_disruption_budget(&self, workload: &WorkloadRef, budget: DisruptionBudget) {
        self.budgets.insert(workload.key(), budget);
    }

    pub async fn set_nodes(&self, nodes: Vec<NodeInfo>) {
        *self.nodes.write().await = nodes;
    }

    pub async fn set_placements(&self, placements: Vec<PodPlacement>) {
        *self.placements.write().await = placements;
    }

    /// Make the next `count` replace calls fail
    pub fn fail_next_replaces(&self, count: u32) {
        self.failing_replaces.store(count, Ordering::SeqCst);
    }

    /// Mutate the stored spec right after the next replace of `workload` commits
    pub async fn drift_after_replace(
        &self,
        workload: &WorkloadRef,
        mutation: impl FnOnce(&mut WorkloadSpec) + Send + 'static,
    ) {
        self.drift
            .lock()
            .await
            .insert(workload.key(), Box::new(mutation));
    }

    pub fn len(&self) -> usize {
        self.workloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workloads.is_empty()
    }

    fn take_failure(&self) -> bool {
        self.failing_replaces
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl WorkloadApi for InMemoryWorkloadApi {
    async fn get(&self, workload: &WorkloadRef) -> Result<WorkloadSpec> {
        self.workloads
            .get(&workload.key())
            .map(|w| w.clone())
            .ok_or_else(|| OptimizerError::NotFound(workload.to_string()))
    }

    async fn replace(&self, mut spec: WorkloadSpec) -> Result<WorkloadSpec> {
        let key = spec.reference.key();
        if self.take_failure() {
            return Err(OptimizerError::store("workload api", "replace rejected"));
        }
        let drift = self.drift.lock().await.remove(&key);

        let stored = {
            let mut entry = self
                .workloads
                .get_mut(&key)
                .ok_or_else(|| OptimizerError::NotFound(spec.reference.to_string()))?;
            if entry.resource_version != spec.resource_version {
                return Err(OptimizerError::conflict(
                    spec.reference.to_string(),
                    format!(
                        "resource version {} is stale, live object is at {}",
                        spec.resource_version, entry.resource_version
                    ),
                ));
            }
            spec.resource_version += 1;
            *entry = spec;
            let stored = entry.clone();
            if let Some(mutate) = drift {
                mutate(entry.value_mut());
                entry.resource_version += 1;
            }
            stored
        };
        debug!(
            workload = %stored.reference,
            version = stored.resource_version,
            "Workload replaced"
        );
        Ok(stored)
    }

    async fn disruption_budget(&self, workload: &WorkloadRef) -> Result<Option<DisruptionBudget>> {
        Ok(self.budgets.get(&workload.key()).map(|b| *b))
    }

    async fn cluster_snapshot(&self) -> Result<ClusterSnapshot> {
        let mut workloads: Vec<WorkloadSpec> =
            self.workloads.iter().map(|w| w.value().clone()).collect();
        workloads.sort_by(|a, b| a.reference.cmp(&b.reference));
        Ok(ClusterSnapshot {
            nodes: self.nodes.read().await.clone(),
            workloads,
            placements: self.placements.read().await.clone(),
        })
    }
}
