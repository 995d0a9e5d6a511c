//! Cluster inventory file
//!
//! A JSON document describing workloads, nodes, utilization history,
//! disruption budgets and policies. The operator seeds its in-memory
//! collaborators from it at startup; the CLI analyzes it offline.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

use crate::controller::PolicyStore;
use crate::error::{OptimizerError, Result};
use crate::gate::apply_admission_defaults;
use crate::models::{
    ClusterSnapshot, DisruptionBudget, NodeInfo, OptimizationPolicy, PodPlacement,
    UtilizationSample, WorkloadRef, WorkloadSpec,
};
use crate::utilization::InMemoryUtilizationStore;
use crate::workload::InMemoryWorkloadApi;

/// Utilization history of one workload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UtilizationSeries {
    pub workload: WorkloadRef,
    pub samples: Vec<UtilizationSample>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetEntry {
    pub workload: WorkloadRef,
    pub budget: DisruptionBudget,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Inventory {
    #[serde(default)]
    pub workloads: Vec<WorkloadSpec>,
    #[serde(default)]
    pub nodes: Vec<NodeInfo>,
    #[serde(default)]
    pub placements: Vec<PodPlacement>,
    #[serde(default)]
    pub utilization: Vec<UtilizationSeries>,
    #[serde(default)]
    pub disruption_budgets: Vec<BudgetEntry>,
    #[serde(default)]
    pub policies: Vec<OptimizationPolicy>,
}

/// Counts of what was loaded
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeedSummary {
    pub workloads: usize,
    pub series: usize,
    pub policies: usize,
}

impl Inventory {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = tokio::fs::read(path.as_ref()).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn snapshot(&self) -> ClusterSnapshot {
        ClusterSnapshot {
            nodes: self.nodes.clone(),
            workloads: self.workloads.clone(),
            placements: self.placements.clone(),
        }
    }

    pub fn workload(&self, target: &WorkloadRef) -> Option<&WorkloadSpec> {
        self.workloads.iter().find(|w| &w.reference == target)
    }

    pub fn samples_for(&self, target: &WorkloadRef) -> Vec<UtilizationSample> {
        let mut samples: Vec<UtilizationSample> = self
            .utilization
            .iter()
            .filter(|s| &s.workload == target)
            .flat_map(|s| s.samples.iter().copied())
            .collect();
        samples.sort_by_key(|s| s.timestamp);
        samples
    }

    pub fn budget_for(&self, target: &WorkloadRef) -> Option<DisruptionBudget> {
        self.disruption_budgets
            .iter()
            .find(|b| &b.workload == target)
            .map(|b| b.budget)
    }

    /// Load everything into the in-memory collaborators.
    ///
    /// Policies go through admission defaults; ones that already exist are
    /// left alone.
    pub async fn seed(
        self,
        workloads: &InMemoryWorkloadApi,
        utilization: &InMemoryUtilizationStore,
        policies: &dyn PolicyStore,
    ) -> Result<SeedSummary> {
        let mut summary = SeedSummary::default();

        for spec in self.workloads {
            workloads.upsert(spec);
            summary.workloads += 1;
        }
        for entry in self.disruption_budgets {
            workloads.set_disruption_budget(&entry.workload, entry.budget);
        }
        workloads.set_nodes(self.nodes).await;
        workloads.set_placements(self.placements).await;

        for series in self.utilization {
            utilization.append(&series.workload, series.samples);
            summary.series += 1;
        }

        for mut policy in self.policies {
            apply_admission_defaults(&mut policy);
            match policies.create(policy).await {
                Ok(_) => summary.policies += 1,
                Err(OptimizerError::AlreadyExists(what)) => {
                    warn!(policy = %what, "Policy already present, skipping")
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            workloads = summary.workloads,
            series = summary.series,
            policies = summary.policies,
            "Inventory loaded"
        );
        Ok(summary)
    }
}
