//! Policy object store
//!
//! Declarative storage for `OptimizationPolicy` objects with a change-event
//! stream. Spec writes bump the generation and emit an event; status writes
//! are reserved for the controller and emit nothing.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use crate::error::{OptimizerError, Result};
use crate::models::{OptimizationPolicy, PolicyKey, PolicySpec, PolicyStatus};

/// Change events consumed by the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyEvent {
    /// Created or spec updated
    Applied(PolicyKey),
    /// Deletion requested; the object stays until finalized
    Deleted(PolicyKey),
}

#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn list(&self) -> Result<Vec<OptimizationPolicy>>;

    async fn get(&self, key: &PolicyKey) -> Result<Option<OptimizationPolicy>>;

    async fn create(&self, policy: OptimizationPolicy) -> Result<OptimizationPolicy>;

    /// Replace the spec, bumping the generation when it changed
    async fn update_spec(&self, key: &PolicyKey, spec: PolicySpec) -> Result<OptimizationPolicy>;

    async fn update_status(&self, key: &PolicyKey, status: PolicyStatus) -> Result<()>;

    /// Mark for deletion; the controller finalizes once rollback finished
    async fn request_deletion(&self, key: &PolicyKey) -> Result<OptimizationPolicy>;

    /// Remove the object for good
    async fn finalize(&self, key: &PolicyKey) -> Result<()>;

    fn subscribe(&self) -> broadcast::Receiver<PolicyEvent>;
}

pub struct InMemoryPolicyStore {
    policies: RwLock<BTreeMap<PolicyKey, OptimizationPolicy>>,
    events: broadcast::Sender<PolicyEvent>,
}

impl Default for InMemoryPolicyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryPolicyStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            policies: RwLock::new(BTreeMap::new()),
            events,
        }
    }

    fn emit(&self, event: PolicyEvent) {
        // No subscribers while the controller is on standby
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl PolicyStore for InMemoryPolicyStore {
    async fn list(&self) -> Result<Vec<OptimizationPolicy>> {
        Ok(self.policies.read().await.values().cloned().collect())
    }

    async fn get(&self, key: &PolicyKey) -> Result<Option<OptimizationPolicy>> {
        Ok(self.policies.read().await.get(key).cloned())
    }

    async fn create(&self, policy: OptimizationPolicy) -> Result<OptimizationPolicy> {
        let key = policy.key();
        {
            let mut policies = self.policies.write().await;
            if policies.contains_key(&key) {
                return Err(OptimizerError::AlreadyExists(format!("policy {}", key)));
            }
            policies.insert(key.clone(), policy.clone());
        }
        debug!(policy = %key, "Policy created");
        self.emit(PolicyEvent::Applied(key));
        Ok(policy)
    }

    async fn update_spec(&self, key: &PolicyKey, spec: PolicySpec) -> Result<OptimizationPolicy> {
        let (updated, changed) = {
            let mut policies = self.policies.write().await;
            let policy = policies
                .get_mut(key)
                .ok_or_else(|| OptimizerError::NotFound(format!("policy {}", key)))?;
            let changed = policy.spec != spec;
            if changed {
                policy.spec = spec;
                policy.metadata.generation += 1;
            }
            (policy.clone(), changed)
        };
        if changed {
            self.emit(PolicyEvent::Applied(key.clone()));
        }
        Ok(updated)
    }

    async fn update_status(&self, key: &PolicyKey, status: PolicyStatus) -> Result<()> {
        let mut policies = self.policies.write().await;
        let policy = policies
            .get_mut(key)
            .ok_or_else(|| OptimizerError::NotFound(format!("policy {}", key)))?;
        policy.status = status;
        Ok(())
    }

    async fn request_deletion(&self, key: &PolicyKey) -> Result<OptimizationPolicy> {
        let policy = {
            let mut policies = self.policies.write().await;
            let policy = policies
                .get_mut(key)
                .ok_or_else(|| OptimizerError::NotFound(format!("policy {}", key)))?;
            policy
                .metadata
                .deletion_timestamp
                .get_or_insert_with(Utc::now);
            policy.clone()
        };
        self.emit(PolicyEvent::Deleted(key.clone()));
        Ok(policy)
    }

    async fn finalize(&self, key: &PolicyKey) -> Result<()> {
        self.policies.write().await.remove(key);
        debug!(policy = %key, "Policy finalized");
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<PolicyEvent> {
        self.events.subscribe()
    }
}
