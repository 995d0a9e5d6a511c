//! Unused workload detection

use std::time::Duration;

use super::{AnalysisContext, Draft};
use crate::models::{CostEstimate, OptimizationType, ProposedChanges};

/// Minimum observed history before a workload can be called unused
pub const MIN_IDLE_SPAN: Duration = Duration::from_secs(7 * 24 * 3600);

pub(crate) fn detect_unused(ctx: &AnalysisContext<'_>) -> Option<Draft> {
    let summary = &ctx.summary;
    if summary.span < MIN_IDLE_SPAN {
        return None;
    }
    let threshold = ctx.config.unused_threshold;
    if summary.cpu_utilization_avg >= threshold || summary.memory_utilization_avg >= threshold {
        return None;
    }

    let current = ctx.costs.on_demand(&ctx.current_demand());
    let optimized = CostEstimate {
        hourly: 0.0,
        monthly: 0.0,
        ..current
    };

    Some(Draft {
        optimization_type: OptimizationType::RemoveUnused,
        title: format!("Remove or schedule unused workload {}", ctx.workload.reference.name),
        description: format!(
            "Average utilization over {} days is {:.1}% CPU and {:.1}% memory",
            summary.span.as_secs() / 86_400,
            summary.cpu_utilization_avg * 100.0,
            summary.memory_utilization_avg * 100.0
        ),
        optimized_cost: optimized,
        change_percent: 100.0,
        changes: ProposedChanges {
            remove_workload: true,
            ..Default::default()
        },
    })
}
