//! Confidence and risk scoring, plus per-type rollback plans
//!
//! Both scores are deterministic functions of the factors they list:
//! - Confidence starts at 0.5 and gains from sample volume, stability and
//!   window length; degraded inputs (fallback pricing) subtract from it.
//! - Risk is additive over its factors and capped at 1.0.

use std::time::Duration;

use super::stats::UtilizationSummary;
use crate::models::{
    OptimizationType, RiskAssessment, RiskLevel, RollbackPlan, WorkloadKind, WorkloadSpec,
};

const SEVEN_DAYS: Duration = Duration::from_secs(7 * 24 * 3600);

/// Penalty when costs were computed from the fallback estimate
pub const FALLBACK_PRICING_PENALTY: f64 = 0.1;

/// Confidence score together with the factors that produced it
#[derive(Debug, Clone, PartialEq)]
pub struct Confidence {
    pub score: f64,
    pub factors: Vec<String>,
}

pub fn confidence(
    summary: &UtilizationSummary,
    optimization_type: OptimizationType,
    fallback_pricing: bool,
) -> Confidence {
    let mut score = 0.5;
    let mut factors = Vec::new();

    if summary.sample_count > 1000 {
        score += 0.2;
        factors.push(format!("{} samples", summary.sample_count));
    } else if summary.sample_count > 500 {
        score += 0.1;
        factors.push(format!("{} samples", summary.sample_count));
    }

    if summary.variance < 0.15 {
        score += 0.2;
        factors.push(format!("stable utilization (variance {:.2})", summary.variance));
    } else if summary.variance < 0.25 {
        score += 0.1;
        factors.push(format!("moderate variance ({:.2})", summary.variance));
    }

    if summary.span >= SEVEN_DAYS {
        score += 0.1;
        factors.push("at least 7 days of history".to_string());
    }

    if matches!(
        optimization_type,
        OptimizationType::RightSizeCpu | OptimizationType::RightSizeMemory
    ) {
        score += 0.05;
        factors.push("right-sizing".to_string());
    }

    if fallback_pricing {
        score -= FALLBACK_PRICING_PENALTY;
        factors.push("pricing unavailable, static estimate used".to_string());
    }

    Confidence {
        score: score.clamp(0.0, 1.0),
        factors,
    }
}

/// Risk of applying a change of `optimization_type` to `workload`
pub fn risk(
    optimization_type: OptimizationType,
    workload: &WorkloadSpec,
    cpu_utilization: f64,
) -> RiskAssessment {
    let mut score: f64 = 0.0;
    let mut factors = Vec::new();
    let mut mitigations = Vec::new();

    if optimization_type == OptimizationType::SpotMigration {
        score += 0.5;
        factors.push("Spot capacity can be reclaimed with short notice".to_string());
        mitigations.push("Keep a disruption budget and graceful termination handlers".to_string());
    }
    if workload.reference.kind == WorkloadKind::StatefulSet {
        score += 0.2;
        factors.push("Stateful workload".to_string());
        mitigations.push("Apply during a maintenance window and verify replication".to_string());
    }
    if workload.reference.kind.has_replicas() && workload.replica_count() == 1 {
        score += 0.15;
        factors.push("Single replica".to_string());
        mitigations.push("Scale out temporarily before applying".to_string());
    }
    if cpu_utilization > 0.8 {
        score += 0.2;
        factors.push(format!("High CPU utilization ({:.0}%)", cpu_utilization * 100.0));
        mitigations.push("Watch CPU throttling closely after the change".to_string());
    }

    mitigations.push("Monitor the workload for 24 hours after applying".to_string());

    let score = score.min(1.0);
    let level = if optimization_type == OptimizationType::SpotMigration {
        RiskLevel::Medium
    } else {
        RiskLevel::from_score(score)
    };

    RiskAssessment {
        level,
        score,
        factors,
        mitigations,
    }
}

pub fn rollback_plan(optimization_type: OptimizationType) -> RollbackPlan {
    let (steps, estimated_minutes, automatable): (&[&str], u32, bool) = match optimization_type {
        OptimizationType::RightSizeCpu | OptimizationType::RightSizeMemory => (
            &[
                "Restore the recorded container requests and limits",
                "Wait for the rollout to complete",
                "Verify pods are running and ready",
            ],
            5,
            true,
        ),
        OptimizationType::ReduceReplicas => (
            &["Restore the recorded replica count", "Verify all replicas are ready"],
            2,
            true,
        ),
        OptimizationType::SpotMigration => (
            &[
                "Remove the spot node selector",
                "Wait for pods to reschedule onto on-demand nodes",
                "Verify all replicas are ready",
            ],
            10,
            true,
        ),
        OptimizationType::ScheduledScaling => (
            &[
                "Remove the off-peak scaling schedule",
                "Restore the recorded replica count",
            ],
            5,
            true,
        ),
        OptimizationType::RemoveUnused => (
            &["Recreate the workload from its recorded spec"],
            10,
            false,
        ),
        OptimizationType::NodeConsolidation | OptimizationType::All => (
            &[
                "Uncordon drained nodes or scale the node group back up",
                "Let the scheduler rebalance pods",
            ],
            15,
            false,
        ),
    };

    RollbackPlan {
        steps: steps.iter().map(|s| s.to_string()).collect(),
        estimated_minutes,
        automatable,
    }
}
