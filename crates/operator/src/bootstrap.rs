//! Wiring of the operator's collaborators

use anyhow::{Context, Result};
use operator_lib::{
    controller::{
        Collaborators, Controller, FileLease, InMemoryPolicyStore, LeaderLease, PolicyStore,
        Reconciler,
    },
    engine::RecommendationEngine,
    gate::PolicyGate,
    health::HealthRegistry,
    inventory::Inventory,
    observability::ControllerMetrics,
    pricing::StaticPriceCatalog,
    rollback::{FileRecordStore, InMemoryTtlStore, RollbackStore},
    utilization::InMemoryUtilizationStore,
    workload::InMemoryWorkloadApi,
};
use std::sync::Arc;
use tracing::info;

use crate::api::AppState;
use crate::config::OperatorConfig;

/// Everything the binary runs
pub struct Operator {
    pub controller: Controller,
    pub app_state: Arc<AppState>,
    pub health: HealthRegistry,
    pub policies: usize,
}

/// Build the operator from configuration, seeding from the inventory file if one is set
pub async fn bootstrap(config: &OperatorConfig) -> Result<Operator> {
    let controller_config = config.controller_config()?;
    let health = HealthRegistry::with_components().await;
    let metrics = ControllerMetrics::new();

    let workloads = Arc::new(InMemoryWorkloadApi::new());
    let utilization = Arc::new(InMemoryUtilizationStore::default());
    let policies: Arc<dyn PolicyStore> = Arc::new(InMemoryPolicyStore::new());

    if let Some(path) = &config.inventory_path {
        let inventory = Inventory::load(path)
            .await
            .with_context(|| format!("Failed to load inventory {}", path.display()))?;
        let summary = inventory
            .seed(&workloads, &utilization, policies.as_ref())
            .await
            .context("Failed to seed inventory")?;
        for _ in 0..summary.policies {
            metrics.inc_policies_created();
        }
    }

    let durable = FileRecordStore::open(config.rollback_dir())
        .await
        .with_context(|| {
            format!(
                "Failed to open rollback store in {}",
                config.rollback_dir().display()
            )
        })?;
    let rollback = Arc::new(RollbackStore::new(
        Arc::new(InMemoryTtlStore::new(config.fast_store_ttl()?)),
        Arc::new(durable),
        config.fast_store_ttl()?,
    ));

    let gate = Arc::new(PolicyGate::new(config.protected()?));
    let reconciler = Arc::new(Reconciler::new(
        Collaborators {
            policies: policies.clone(),
            workloads: workloads.clone(),
            utilization,
            pricing: Arc::new(StaticPriceCatalog),
            rollback,
        },
        RecommendationEngine::default(),
        gate.as_ref().clone(),
        controller_config,
        health.clone(),
    ));

    let lease: Arc<dyn LeaderLease> = Arc::new(FileLease::new(config.lease_path()));
    let controller = Controller::new(reconciler, lease, health.clone());
    let policy_count = policies.list().await?.len();
    info!(
        instance = %config.instance_id,
        policies = policy_count,
        workloads = workloads.len(),
        "Operator wired"
    );

    let app_state = Arc::new(AppState::new(
        health.clone(),
        metrics,
        policies,
        workloads,
        gate,
    ));

    Ok(Operator {
        controller,
        app_state,
        health,
        policies: policy_count,
    })
}
