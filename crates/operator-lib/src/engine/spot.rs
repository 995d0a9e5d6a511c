//! Spot capacity migration

use super::{AnalysisContext, Draft};
use crate::models::{OptimizationType, ProposedChanges, WorkloadKind, WorkloadSpec};
use crate::pricing::Provider;
use std::collections::BTreeMap;

/// Why a workload cannot move to spot capacity, if it cannot
pub fn ineligibility(workload: &WorkloadSpec, provider: Provider) -> Option<&'static str> {
    if workload.reference.kind == WorkloadKind::StatefulSet {
        return Some("stateful workloads keep on-demand capacity");
    }
    if !workload.reference.kind.has_replicas() || workload.replica_count() <= 1 {
        return Some("needs more than one replica to tolerate reclaims");
    }
    if workload.is_marked_critical() {
        return Some("workload is labelled critical");
    }
    let (key, value) = provider.spot_node_selector();
    if workload.node_selector.get(key).map(String::as_str) == Some(value) {
        return Some("already scheduled on spot capacity");
    }
    None
}

pub(crate) fn migrate_to_spot(ctx: &AnalysisContext<'_>) -> Option<Draft> {
    let provider = ctx.prices.provider;
    if ineligibility(ctx.workload, provider).is_some() {
        return None;
    }

    let optimized = ctx.costs.spot(&ctx.current_demand());
    let (key, value) = provider.spot_node_selector();
    let mut node_selector = BTreeMap::new();
    node_selector.insert(key.to_string(), value.to_string());

    Some(Draft {
        optimization_type: OptimizationType::SpotMigration,
        title: format!("Move {} to spot capacity", ctx.workload.reference.name),
        description: format!(
            "Schedule all {} replicas on {} spot nodes",
            ctx.workload.replica_count(),
            provider
        ),
        optimized_cost: optimized,
        change_percent: 0.0,
        changes: ProposedChanges {
            node_selector,
            ..Default::default()
        },
    })
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::super::{AnalysisInput, RecommendationEngine};
    use super::*;
    use crate::models::RiskLevel;

    #[test]
    fn test_eligibility_signals() {
        let mut w = workload(WorkloadKind::Deployment, Some(3), "1", "1Gi");
        assert_eq!(ineligibility(&w, Provider::Aws), None);

        w.replicas = Some(1);
        assert!(ineligibility(&w, Provider::Aws).is_some());
        w.replicas = Some(3);

        w.labels.insert("tier".into(), "critical".into());
        assert!(ineligibility(&w, Provider::Aws).is_some());
        w.labels.clear();

        w.node_selector
            .insert("eks.amazonaws.com/capacityType".into(), "SPOT".into());
        assert!(ineligibility(&w, Provider::Aws).is_some());
        assert_eq!(ineligibility(&w, Provider::Gcp), None);

        let sts = workload(WorkloadKind::StatefulSet, Some(3), "1", "1Gi");
        assert!(ineligibility(&sts, Provider::Aws).is_some());
    }

    #[test]
    fn test_spot_recommendation_is_medium_risk() {
        let engine = RecommendationEngine::default();
        let w = workload(WorkloadKind::Deployment, Some(4), "1", "2Gi");
        let samples = steady_samples(2, 0.6, 0.1, 1.5, 0.1);
        let book = aws_book();
        let recs = engine
            .analyze(&AnalysisInput {
                workload: &w,
                samples: &samples,
                prices: &book,
                optimization_type: OptimizationType::SpotMigration,
                min_replicas: 1,
            })
            .unwrap();
        assert_eq!(recs.len(), 1);
        let rec = &recs[0];
        assert_eq!(rec.risk.level, RiskLevel::Medium);
        assert!((rec.savings_percentage - 65.0).abs() < 0.5);
        assert_eq!(
            rec.changes.node_selector.get("eks.amazonaws.com/capacityType").map(String::as_str),
            Some("SPOT")
        );
    }
}
