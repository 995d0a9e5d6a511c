//! Off-peak scheduled scaling
//!
//! Samples are bucketed by hour of the week. When the spread between the
//! busy (P90) and quiet (P10) bucket means is large enough, buckets below
//! the midpoint are treated as off-peak and the workload is scaled down by
//! a fixed factor during them.

use super::stats::{hour_of_week_buckets, percentile};
use super::{AnalysisContext, Draft};
use crate::models::{CostEstimate, OptimizationType, ProposedChanges, ScalingSchedule};

/// Minimum number of populated hour-of-week buckets
pub const MIN_BUCKETS: usize = 24;

pub(crate) fn off_peak_scaling(ctx: &AnalysisContext<'_>) -> Option<Draft> {
    if !ctx.workload.reference.kind.has_replicas() {
        return None;
    }
    let replicas = ctx.workload.replica_count();
    let off_peak_replicas = ((replicas as f64 * ctx.config.off_peak_factor).floor() as u32)
        .max(ctx.min_replicas)
        .max(1);
    if off_peak_replicas >= replicas {
        return None;
    }

    let buckets = hour_of_week_buckets(ctx.samples);
    if buckets.len() < MIN_BUCKETS {
        return None;
    }
    let means: Vec<f64> = buckets.values().copied().collect();
    let peak = percentile(&means, 90.0);
    let trough = percentile(&means, 10.0);
    if peak <= 0.0 || (peak - trough) / peak < ctx.config.schedule_spread_threshold {
        return None;
    }

    let midpoint = (peak + trough) / 2.0;
    let off_peak_hours: Vec<u16> = buckets
        .iter()
        .filter(|(_, mean)| **mean < midpoint)
        .map(|(hour, _)| *hour)
        .collect();
    if off_peak_hours.is_empty() {
        return None;
    }
    let off_peak_fraction = off_peak_hours.len() as f64 / buckets.len() as f64;

    let current = ctx.costs.on_demand(&ctx.current_demand());
    let monthly = current.monthly * (1.0 - off_peak_fraction * ctx.config.off_peak_factor);
    let optimized = CostEstimate {
        hourly: monthly / crate::pricing::HOURS_PER_MONTH,
        monthly: super::cost::round_cents(monthly),
        ..current
    };

    Some(Draft {
        optimization_type: OptimizationType::ScheduledScaling,
        title: format!("Scale {} down off-peak", ctx.workload.reference.name),
        description: format!(
            "Run {} instead of {} replicas during {} quiet hours per week ({:.0}% of observed hours)",
            off_peak_replicas,
            replicas,
            off_peak_hours.len(),
            off_peak_fraction * 100.0
        ),
        optimized_cost: optimized,
        change_percent: (replicas - off_peak_replicas) as f64 / replicas as f64 * 100.0,
        changes: ProposedChanges {
            scaling_schedule: Some(ScalingSchedule {
                off_peak_hours,
                peak_replicas: replicas,
                off_peak_replicas,
            }),
            ..Default::default()
        },
    })
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::super::{AnalysisInput, RecommendationEngine};
    use crate::models::{OptimizationType, UtilizationSample, WorkloadKind};
    use crate::units::GIB;

    /// Busy 08:00-20:00 every day, nearly idle at night
    fn diurnal_samples(days: i64) -> Vec<UtilizationSample> {
        (0..days * 24 * 4)
            .map(|i| {
                let ts = EPOCH + i * 900;
                let hour = (i / 4) % 24;
                let busy = (8..20).contains(&hour);
                UtilizationSample {
                    timestamp: ts,
                    cpu_cores: if busy { 0.8 } else { 0.1 },
                    memory_bytes: GIB,
                    network_bytes: 0,
                }
            })
            .collect()
    }

    #[test]
    fn test_diurnal_pattern_triggers_schedule() {
        let engine = RecommendationEngine::default();
        let w = workload(WorkloadKind::Deployment, Some(6), "1", "2Gi");
        let samples = diurnal_samples(7);
        let book = aws_book();
        let recs = engine
            .analyze(&AnalysisInput {
                workload: &w,
                samples: &samples,
                prices: &book,
                optimization_type: OptimizationType::ScheduledScaling,
                min_replicas: 1,
            })
            .unwrap();
        assert_eq!(recs.len(), 1);
        let schedule = recs[0].changes.scaling_schedule.as_ref().unwrap();
        assert_eq!(schedule.off_peak_replicas, 3);
        assert_eq!(schedule.peak_replicas, 6);
        assert_eq!(schedule.off_peak_hours.len(), 7 * 12);
        // Half the hours at half the replicas
        assert!((recs[0].savings_percentage - 25.0).abs() < 0.2);
    }

    #[test]
    fn test_flat_pattern_is_ignored() {
        let engine = RecommendationEngine::default();
        let w = workload(WorkloadKind::Deployment, Some(6), "1", "2Gi");
        let samples = steady_samples(7, 0.5, 0.05, 1.0, 0.0);
        let book = aws_book();
        let recs = engine
            .analyze(&AnalysisInput {
                workload: &w,
                samples: &samples,
                prices: &book,
                optimization_type: OptimizationType::ScheduledScaling,
                min_replicas: 1,
            })
            .unwrap();
        assert!(recs.is_empty());
    }

    #[test]
    fn test_needs_a_day_of_buckets() {
        let engine = RecommendationEngine::default();
        let w = workload(WorkloadKind::Deployment, Some(6), "1", "2Gi");
        let samples: Vec<_> = diurnal_samples(1).into_iter().take(4 * 20).collect();
        let book = aws_book();
        let recs = engine
            .analyze(&AnalysisInput {
                workload: &w,
                samples: &samples,
                prices: &book,
                optimization_type: OptimizationType::ScheduledScaling,
                min_replicas: 1,
            })
            .unwrap();
        assert!(recs.is_empty());
    }
}
