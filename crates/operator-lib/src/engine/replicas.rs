//! Replica count optimization

use super::cost::Demand;
use super::{AnalysisContext, Draft};
use crate::models::{OptimizationType, ProposedChanges};

/// `ceil(replicas × utilization / target)`, floored at `min_replicas` (and 1)
pub fn optimal_replicas(replicas: u32, utilization: f64, target: f64, min_replicas: u32) -> u32 {
    let raw = (replicas as f64 * utilization.max(0.0) / target - 1e-9).ceil();
    (raw.max(0.0) as u32).max(min_replicas).max(1)
}

pub(crate) fn reduce_replicas(ctx: &AnalysisContext<'_>) -> Option<Draft> {
    if !ctx.workload.reference.kind.has_replicas() {
        return None;
    }
    let current = ctx.workload.replica_count();
    let utilization = ctx
        .summary
        .cpu_utilization_avg
        .max(ctx.summary.memory_utilization_avg);
    let optimal = optimal_replicas(
        current,
        utilization,
        ctx.config.target_utilization,
        ctx.min_replicas,
    );
    if optimal >= current {
        return None;
    }

    let optimized = ctx.costs.on_demand(&Demand {
        replicas: optimal,
        ..ctx.current_demand()
    });

    Some(Draft {
        optimization_type: OptimizationType::ReduceReplicas,
        title: format!("Reduce replicas of {}", ctx.workload.reference.name),
        description: format!(
            "Scale from {} to {} replicas: average utilization is {:.0}%, target is {:.0}% per replica",
            current,
            optimal,
            utilization * 100.0,
            ctx.config.target_utilization * 100.0
        ),
        optimized_cost: optimized,
        change_percent: (current - optimal) as f64 / current as f64 * 100.0,
        changes: ProposedChanges {
            replicas: Some(optimal),
            ..Default::default()
        },
    })
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::super::{AnalysisInput, RecommendationEngine};
    use super::*;
    use crate::models::WorkloadKind;

    #[test]
    fn test_optimal_replicas_formula() {
        assert_eq!(optimal_replicas(10, 0.35, 0.7, 1), 5);
        assert_eq!(optimal_replicas(5, 0.42, 0.7, 1), 3);
        assert_eq!(optimal_replicas(4, 0.7, 0.7, 1), 4);
        assert_eq!(optimal_replicas(3, 0.0, 0.7, 1), 1);
        assert_eq!(optimal_replicas(3, 0.0, 0.7, 0), 1);
        assert_eq!(optimal_replicas(10, 0.1, 0.7, 4), 4);
    }

    #[test]
    fn test_never_below_one_replica() {
        for replicas in 1..20 {
            for pct in 0..=100 {
                let n = optimal_replicas(replicas, pct as f64 / 100.0, 0.7, 0);
                assert!(n >= 1);
            }
        }
    }

    #[test]
    fn test_daemonset_has_no_replica_recommendation() {
        let engine = RecommendationEngine::default();
        let w = workload(WorkloadKind::DaemonSet, None, "1", "1Gi");
        let samples = steady_samples(2, 0.05, 0.0, 0.05, 0.0);
        let book = aws_book();
        let recs = engine
            .analyze(&AnalysisInput {
                workload: &w,
                samples: &samples,
                prices: &book,
                optimization_type: OptimizationType::ReduceReplicas,
                min_replicas: 1,
            })
            .unwrap();
        assert!(recs.is_empty());
    }

    #[test]
    fn test_respects_min_available() {
        let engine = RecommendationEngine::default();
        let w = workload(WorkloadKind::Deployment, Some(6), "1", "1Gi");
        let samples = steady_samples(2, 0.1, 0.0, 0.1, 0.0);
        let book = aws_book();
        let recs = engine
            .analyze(&AnalysisInput {
                workload: &w,
                samples: &samples,
                prices: &book,
                optimization_type: OptimizationType::ReduceReplicas,
                min_replicas: 4,
            })
            .unwrap();
        assert_eq!(recs[0].changes.replicas, Some(4));
        assert!((recs[0].change_percent - 33.3).abs() < 1e-9);
    }
}
