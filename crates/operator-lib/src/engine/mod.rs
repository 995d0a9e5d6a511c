//! Recommendation Engine
//!
//! Pure computation over a workload's declared shape, a window of its
//! utilization history and a price snapshot. The engine holds no state and
//! performs no I/O: calling it twice with the same input yields identical
//! recommendations, ids included.
//!
//! Analyzers:
//! - [`rightsizing`]: CPU and memory requests from P95 usage plus a safety margin
//! - [`replicas`]: replica count for a 70% per-replica utilization target
//! - [`spot`]: migration of eligible workloads to spot capacity
//! - [`scheduled`]: off-peak scale-down from hour-of-week patterns
//! - [`unused`]: workloads idle over a full week or more
//! - [`consolidation`]: cluster-wide bin packing onto fewer nodes

pub mod consolidation;
pub mod cost;
pub mod replicas;
pub mod rightsizing;
pub mod scheduled;
pub mod scoring;
pub mod spot;
pub mod stats;
pub mod unused;

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{OptimizerError, Result};
use crate::models::{
    ClusterSnapshot, CostEstimate, OptimizationType, ProposedChanges, Recommendation,
    UtilizationSample, WorkloadSpec,
};
use crate::pricing::PriceBook;
use cost::{CostModel, Demand};
use stats::UtilizationSummary;

/// Minimum number of samples before any workload analysis runs
pub const MIN_SAMPLES: usize = 12;

/// Tunables of the engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Multiplier applied to P95 usage when sizing requests
    pub safety_margin: f64,
    /// Minimum relative reduction worth recommending
    pub materiality_floor: f64,
    /// Per-replica utilization the replica analyzer aims for
    pub target_utilization: f64,
    pub cpu_limit_factor: f64,
    pub memory_limit_factor: f64,
    /// Spot discount when the price book has no spot price
    pub spot_discount: f64,
    /// Average utilization under which a workload counts as unused
    pub unused_threshold: f64,
    /// Relative peak/trough spread that triggers scheduled scaling
    pub schedule_spread_threshold: f64,
    /// Replica factor applied during off-peak windows
    pub off_peak_factor: f64,
    /// Fraction of node capacity usable when bin packing
    pub node_headroom: f64,
    pub min_samples: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            safety_margin: 1.15,
            materiality_floor: 0.10,
            target_utilization: 0.70,
            cpu_limit_factor: 1.5,
            memory_limit_factor: 1.3,
            spot_discount: crate::pricing::DEFAULT_SPOT_DISCOUNT,
            unused_threshold: 0.05,
            schedule_spread_threshold: 0.4,
            off_peak_factor: 0.5,
            node_headroom: 0.85,
            min_samples: MIN_SAMPLES,
        }
    }
}

/// Everything a single-workload analysis depends on
#[derive(Debug, Clone, Copy)]
pub struct AnalysisInput<'a> {
    pub workload: &'a WorkloadSpec,
    pub samples: &'a [UtilizationSample],
    pub prices: &'a PriceBook,
    pub optimization_type: OptimizationType,
    /// Replica floor from the policy and disruption budget
    pub min_replicas: u32,
}

/// Shared view handed to every analyzer
pub(crate) struct AnalysisContext<'a> {
    pub workload: &'a WorkloadSpec,
    pub samples: &'a [UtilizationSample],
    pub summary: UtilizationSummary,
    pub costs: CostModel<'a>,
    pub prices: &'a PriceBook,
    pub config: &'a EngineConfig,
    pub min_replicas: u32,
}

impl AnalysisContext<'_> {
    pub fn current_demand(&self) -> Demand {
        Demand {
            cpu_millicores_per_replica: self.workload.cpu_request_millicores(),
            memory_bytes_per_replica: self.workload.memory_request_bytes(),
            replicas: self.workload.replica_count(),
        }
    }

    /// Turn an analyzer draft into a fully scored recommendation
    pub fn finish(&self, draft: Draft) -> Recommendation {
        let current_cost = self.costs.on_demand(&self.current_demand());
        let (monthly_savings, yearly_savings, savings_percentage) =
            cost::savings(&current_cost, &draft.optimized_cost);
        let confidence = scoring::confidence(
            &self.summary,
            draft.optimization_type,
            self.prices.is_fallback(),
        );
        let risk = scoring::risk(
            draft.optimization_type,
            self.workload,
            self.summary.cpu_utilization_avg,
        );

        with_content_id(Recommendation {
            id: String::new(),
            workload: Some(self.workload.reference.clone()),
            optimization_type: draft.optimization_type,
            title: draft.title,
            description: draft.description,
            current_cost,
            optimized_cost: draft.optimized_cost,
            monthly_savings,
            yearly_savings,
            savings_percentage,
            change_percent: round_tenth(draft.change_percent),
            confidence: confidence.score,
            confidence_factors: confidence.factors,
            risk,
            changes: draft.changes,
            rollback_plan: scoring::rollback_plan(draft.optimization_type),
            as_of: self.summary.as_of,
        })
    }
}

/// Analyzer output before costs and scores are attached
pub(crate) struct Draft {
    pub optimization_type: OptimizationType,
    pub title: String,
    pub description: String,
    pub optimized_cost: CostEstimate,
    pub change_percent: f64,
    pub changes: ProposedChanges,
}

pub(crate) fn round_tenth(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Derive the id of a recommendation from the rest of its content
pub(crate) fn with_content_id(mut rec: Recommendation) -> Recommendation {
    rec.id = String::new();
    let bytes = serde_json::to_vec(&rec).unwrap_or_default();
    let digest = Sha256::digest(&bytes);
    rec.id = format!("rec-{}", &hex::encode(digest)[..16]);
    rec
}

/// Stateless recommendation engine
#[derive(Debug, Clone, Default)]
pub struct RecommendationEngine {
    config: EngineConfig,
}

impl RecommendationEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Produce the candidates for one workload, best savings first.
    ///
    /// Returns `InsufficientData` when the window holds fewer than
    /// `min_samples` samples; no partial candidates are produced then.
    pub fn analyze(&self, input: &AnalysisInput<'_>) -> Result<Vec<Recommendation>> {
        if input.samples.len() < self.config.min_samples {
            return Err(OptimizerError::InsufficientData(format!(
                "{} samples in window, at least {} required",
                input.samples.len(),
                self.config.min_samples
            )));
        }

        let ctx = AnalysisContext {
            workload: input.workload,
            samples: input.samples,
            summary: UtilizationSummary::from_samples(input.workload, input.samples),
            costs: CostModel::new(input.prices).with_spot_discount(self.config.spot_discount),
            prices: input.prices,
            config: &self.config,
            min_replicas: input.min_replicas.max(1),
        };

        let wanted = input.optimization_type;
        let mut drafts = Vec::new();
        if wanted.accepts(OptimizationType::RightSizeCpu) {
            drafts.extend(rightsizing::right_size_cpu(&ctx));
        }
        if wanted.accepts(OptimizationType::RightSizeMemory) {
            drafts.extend(rightsizing::right_size_memory(&ctx));
        }
        if wanted.accepts(OptimizationType::ReduceReplicas) {
            drafts.extend(replicas::reduce_replicas(&ctx));
        }
        if wanted.accepts(OptimizationType::SpotMigration) {
            drafts.extend(spot::migrate_to_spot(&ctx));
        }
        if wanted.accepts(OptimizationType::ScheduledScaling) {
            drafts.extend(scheduled::off_peak_scaling(&ctx));
        }
        if wanted.accepts(OptimizationType::RemoveUnused) {
            drafts.extend(unused::detect_unused(&ctx));
        }

        let mut recommendations: Vec<Recommendation> =
            drafts.into_iter().map(|d| ctx.finish(d)).collect();
        sort_by_savings(&mut recommendations);

        debug!(
            workload = %input.workload.reference,
            samples = input.samples.len(),
            candidates = recommendations.len(),
            "Workload analysis complete"
        );
        Ok(recommendations)
    }

    /// Cluster-wide node consolidation, if fewer nodes would do
    pub fn analyze_cluster(
        &self,
        snapshot: &ClusterSnapshot,
        prices: &PriceBook,
    ) -> Option<Recommendation> {
        consolidation::consolidate(snapshot, prices, &self.config)
    }
}

/// Best candidate first: highest monthly savings, ties broken by id
pub fn sort_by_savings(recommendations: &mut [Recommendation]) {
    recommendations.sort_by(|a, b| {
        b.monthly_savings
            .partial_cmp(&a.monthly_savings)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
}
