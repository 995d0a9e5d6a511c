//! Right-sizing of CPU and memory requests
//!
//! New request = P95 usage × safety margin, computed per replica and
//! distributed over containers in proportion to their current requests.
//! Limits follow the new requests (CPU ×1.5, memory ×1.3). Only reductions
//! above the materiality floor are reported.

use super::cost::Demand;
use super::{AnalysisContext, Draft};
use crate::models::{ContainerChange, OptimizationType, ProposedChanges};
use crate::units::{format_cpu, format_memory, MIB};

/// Ceiling that ignores floating-point noise just above an integer
fn ceil(value: f64) -> u64 {
    (value - 1e-6).ceil().max(0.0) as u64
}

fn ceil_to_mib(bytes: f64) -> u64 {
    ceil(bytes / MIB as f64).max(1) * MIB
}

pub(crate) fn right_size_cpu(ctx: &AnalysisContext<'_>) -> Option<Draft> {
    let current = ctx.workload.cpu_request_millicores();
    if current == 0 {
        return None;
    }
    let target = ceil(ctx.summary.cpu_p95_cores * 1000.0 * ctx.config.safety_margin).max(1);
    let reduction = (current as f64 - target as f64) / current as f64;
    if reduction <= ctx.config.materiality_floor {
        return None;
    }

    let containers: Vec<ContainerChange> = ctx
        .workload
        .containers
        .iter()
        .filter(|c| c.resources.cpu_request_millicores() > 0)
        .map(|c| {
            let share = c.resources.cpu_request_millicores() as f64 / current as f64;
            let request = ceil(target as f64 * share).max(1);
            ContainerChange {
                name: c.name.clone(),
                cpu_request: Some(format_cpu(request)),
                cpu_limit: Some(format_cpu(ceil(request as f64 * ctx.config.cpu_limit_factor))),
                ..Default::default()
            }
        })
        .collect();
    let new_total: u64 = containers
        .iter()
        .filter_map(|c| c.cpu_request.as_deref())
        .filter_map(crate::units::parse_cpu)
        .sum();

    let optimized = ctx.costs.on_demand(&Demand {
        cpu_millicores_per_replica: new_total,
        ..ctx.current_demand()
    });

    Some(Draft {
        optimization_type: OptimizationType::RightSizeCpu,
        title: format!("Right-size CPU of {}", ctx.workload.reference.name),
        description: format!(
            "Reduce the CPU request from {} to {} per replica: P95 usage is {} with a {:.0}% safety margin",
            format_cpu(current),
            format_cpu(new_total),
            format_cpu(ceil(ctx.summary.cpu_p95_cores * 1000.0)),
            (ctx.config.safety_margin - 1.0) * 100.0
        ),
        optimized_cost: optimized,
        change_percent: (current as f64 - new_total as f64) / current as f64 * 100.0,
        changes: ProposedChanges {
            cpu_request: Some(format_cpu(new_total)),
            containers,
            ..Default::default()
        },
    })
}

pub(crate) fn right_size_memory(ctx: &AnalysisContext<'_>) -> Option<Draft> {
    let current = ctx.workload.memory_request_bytes();
    if current == 0 {
        return None;
    }
    let target = ctx.summary.memory_p95_bytes * ctx.config.safety_margin;
    let reduction = (current as f64 - target) / current as f64;
    if reduction <= ctx.config.materiality_floor {
        return None;
    }

    let containers: Vec<ContainerChange> = ctx
        .workload
        .containers
        .iter()
        .filter(|c| c.resources.memory_request_bytes() > 0)
        .map(|c| {
            let share = c.resources.memory_request_bytes() as f64 / current as f64;
            let request = ceil_to_mib(target * share);
            ContainerChange {
                name: c.name.clone(),
                memory_request: Some(format_memory(request)),
                memory_limit: Some(format_memory(ceil_to_mib(
                    request as f64 * ctx.config.memory_limit_factor,
                ))),
                ..Default::default()
            }
        })
        .collect();
    let new_total: u64 = containers
        .iter()
        .filter_map(|c| c.memory_request.as_deref())
        .filter_map(crate::units::parse_memory)
        .sum();
    if new_total >= current {
        return None;
    }

    let optimized = ctx.costs.on_demand(&Demand {
        memory_bytes_per_replica: new_total,
        ..ctx.current_demand()
    });

    Some(Draft {
        optimization_type: OptimizationType::RightSizeMemory,
        title: format!("Right-size memory of {}", ctx.workload.reference.name),
        description: format!(
            "Reduce the memory request from {} to {} per replica: P95 usage is {} with a {:.0}% safety margin",
            format_memory(current),
            format_memory(new_total),
            format_memory(ctx.summary.memory_p95_bytes as u64),
            (ctx.config.safety_margin - 1.0) * 100.0
        ),
        optimized_cost: optimized,
        change_percent: (current as f64 - new_total as f64) / current as f64 * 100.0,
        changes: ProposedChanges {
            memory_request: Some(format_memory(new_total)),
            containers,
            ..Default::default()
        },
    })
}
