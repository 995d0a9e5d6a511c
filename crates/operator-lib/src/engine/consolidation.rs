//! Cluster-wide node consolidation
//!
//! First-fit-decreasing bin packing of every replica's request onto the
//! smallest node set that still satisfies:
//! - per-node headroom (only a fraction of allocatable capacity is packed)
//! - anti-affinity (no two replicas of an anti-affine workload share a node)
//! - zone spread (a spread workload keeps as many zones as it uses today,
//!   bounded by its replica count)
//!
//! Candidate node sets are prefixes of the node list in zone-round-robin
//! order, tried from the capacity lower bound upwards. DaemonSet pods run on
//! every node and are charged against each node's capacity instead.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::cost::{round_cents, CostModel};
use super::{round_tenth, scoring, with_content_id, EngineConfig};
use crate::models::{
    ClusterSnapshot, CostEstimate, NodeInfo, OptimizationType, ProposedChanges, Recommendation,
    RiskAssessment, RiskLevel, WorkloadKind,
};
use crate::pricing::{PriceBook, PriceSource, HOURS_PER_MONTH};
use crate::units::GIB;

#[derive(Debug, Clone)]
struct Pod {
    workload: usize,
    cpu: u64,
    memory: u64,
}

#[derive(Debug, Clone)]
struct Bin<'a> {
    node: &'a NodeInfo,
    cpu_free: f64,
    memory_free: f64,
    hosted: BTreeSet<usize>,
}

struct Packing<'a> {
    snapshot: &'a ClusterSnapshot,
    pods: Vec<Pod>,
    /// Minimum distinct zones per zone-spread workload
    required_zones: HashMap<usize, usize>,
    headroom: f64,
    daemon_cpu: u64,
    daemon_memory: u64,
}

impl<'a> Packing<'a> {
    fn new(snapshot: &'a ClusterSnapshot, headroom: f64) -> Self {
        let zone_of: HashMap<&str, &str> = snapshot
            .nodes
            .iter()
            .map(|n| (n.name.as_str(), n.zone.as_str()))
            .collect();
        let all_zones: BTreeSet<&str> = snapshot.nodes.iter().map(|n| n.zone.as_str()).collect();

        let mut pods = Vec::new();
        let mut required_zones = HashMap::new();
        let mut daemon_cpu = 0;
        let mut daemon_memory = 0;

        for (idx, w) in snapshot.workloads.iter().enumerate() {
            if w.reference.kind == WorkloadKind::DaemonSet {
                daemon_cpu += w.cpu_request_millicores();
                daemon_memory += w.memory_request_bytes();
                continue;
            }
            let replicas = w.replica_count();
            for _ in 0..replicas {
                pods.push(Pod {
                    workload: idx,
                    cpu: w.cpu_request_millicores(),
                    memory: w.memory_request_bytes(),
                });
            }
            if w.scheduling.zone_spread {
                let used: BTreeSet<&str> = snapshot
                    .placements
                    .iter()
                    .filter(|p| p.workload == w.reference)
                    .filter_map(|p| zone_of.get(p.node.as_str()).copied())
                    .collect();
                let zones = if used.is_empty() { all_zones.len() } else { used.len() };
                required_zones.insert(idx, zones.min(replicas as usize));
            }
        }

        let max_cpu = snapshot
            .nodes
            .iter()
            .map(|n| n.cpu_millicores)
            .max()
            .unwrap_or(1)
            .max(1) as f64;
        let max_mem = snapshot
            .nodes
            .iter()
            .map(|n| n.memory_bytes)
            .max()
            .unwrap_or(1)
            .max(1) as f64;
        let key = |p: &Pod| (p.cpu as f64 / max_cpu).max(p.memory as f64 / max_mem);
        pods.sort_by(|a, b| {
            key(b)
                .partial_cmp(&key(a))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.workload.cmp(&b.workload))
        });

        Self {
            snapshot,
            pods,
            required_zones,
            headroom,
            daemon_cpu,
            daemon_memory,
        }
    }

    fn capacity(&self, node: &NodeInfo) -> (f64, f64) {
        (
            node.cpu_millicores as f64 * self.headroom - self.daemon_cpu as f64,
            node.memory_bytes as f64 * self.headroom - self.daemon_memory as f64,
        )
    }

    /// Smallest node count no packing can beat
    fn lower_bound(&self) -> usize {
        let (max_cpu, max_mem) = self
            .snapshot
            .nodes
            .iter()
            .map(|n| self.capacity(n))
            .fold((0.0_f64, 0.0_f64), |acc, c| (acc.0.max(c.0), acc.1.max(c.1)));
        let total_cpu: u64 = self.pods.iter().map(|p| p.cpu).sum();
        let total_mem: u64 = self.pods.iter().map(|p| p.memory).sum();
        let by = |total: u64, cap: f64| {
            if cap <= 0.0 {
                usize::MAX
            } else {
                (total as f64 / cap).ceil() as usize
            }
        };
        let anti = self
            .snapshot
            .workloads
            .iter()
            .filter(|w| w.scheduling.anti_affinity && w.reference.kind != WorkloadKind::DaemonSet)
            .map(|w| w.replica_count() as usize)
            .max()
            .unwrap_or(0);
        by(total_cpu, max_cpu).max(by(total_mem, max_mem)).max(anti).max(1)
    }

    fn try_pack(&self, nodes: &[&'a NodeInfo]) -> bool {
        let mut bins: Vec<Bin<'a>> = nodes
            .iter()
            .map(|n| {
                let (cpu, mem) = self.capacity(n);
                Bin {
                    node: n,
                    cpu_free: cpu,
                    memory_free: mem,
                    hosted: BTreeSet::new(),
                }
            })
            .collect();
        if bins.iter().any(|b| b.cpu_free < 0.0 || b.memory_free < 0.0) {
            return false;
        }

        let mut zones_used: HashMap<usize, BTreeSet<String>> = HashMap::new();
        for pod in &self.pods {
            let workload = &self.snapshot.workloads[pod.workload];
            let fits = |b: &Bin<'_>| {
                b.cpu_free >= pod.cpu as f64
                    && b.memory_free >= pod.memory as f64
                    && !(workload.scheduling.anti_affinity && b.hosted.contains(&pod.workload))
            };

            let wants_new_zone = self
                .required_zones
                .get(&pod.workload)
                .map(|req| zones_used.get(&pod.workload).map(|z| z.len()).unwrap_or(0) < *req)
                .unwrap_or(false);
            let used = zones_used.get(&pod.workload);
            let in_new_zone = |b: &Bin<'_>| used.map(|z| !z.contains(&b.node.zone)).unwrap_or(true);

            let chosen = if wants_new_zone {
                bins.iter()
                    .position(|b| fits(b) && in_new_zone(b))
                    .or_else(|| bins.iter().position(|b| fits(b)))
            } else {
                bins.iter().position(|b| fits(b))
            };

            let Some(idx) = chosen else {
                return false;
            };
            let bin = &mut bins[idx];
            bin.cpu_free -= pod.cpu as f64;
            bin.memory_free -= pod.memory as f64;
            bin.hosted.insert(pod.workload);
            zones_used
                .entry(pod.workload)
                .or_default()
                .insert(bin.node.zone.clone());
        }

        self.required_zones.iter().all(|(workload, required)| {
            zones_used.get(workload).map(|z| z.len()).unwrap_or(0) >= *required
        })
    }
}

/// Nodes ordered largest-first within each zone, zones interleaved
fn zone_round_robin(nodes: &[NodeInfo]) -> Vec<&NodeInfo> {
    let mut by_zone: BTreeMap<&str, Vec<&NodeInfo>> = BTreeMap::new();
    for node in nodes {
        by_zone.entry(node.zone.as_str()).or_default().push(node);
    }
    for list in by_zone.values_mut() {
        list.sort_by(|a, b| {
            (b.cpu_millicores, b.memory_bytes)
                .cmp(&(a.cpu_millicores, a.memory_bytes))
                .then_with(|| a.name.cmp(&b.name))
        });
    }
    let longest = by_zone.values().map(Vec::len).max().unwrap_or(0);
    let mut ordered = Vec::with_capacity(nodes.len());
    for i in 0..longest {
        for list in by_zone.values() {
            if let Some(node) = list.get(i) {
                ordered.push(*node);
            }
        }
    }
    ordered
}

/// Minimum node count the cluster's workloads fit on, if packing succeeds at all
pub fn minimum_nodes(snapshot: &ClusterSnapshot, headroom: f64) -> Option<(usize, Vec<String>)> {
    let packing = Packing::new(snapshot, headroom);
    let ordered = zone_round_robin(&snapshot.nodes);
    let start = packing.lower_bound();
    (start..=ordered.len())
        .find(|k| packing.try_pack(&ordered[..*k]))
        .map(|k| {
            let drained = ordered[k..].iter().map(|n| n.name.clone()).collect();
            (k, drained)
        })
}

pub(crate) fn consolidate(
    snapshot: &ClusterSnapshot,
    prices: &PriceBook,
    config: &EngineConfig,
) -> Option<Recommendation> {
    let total = snapshot.nodes.len();
    if total < 2 {
        return None;
    }
    let (target, drained) = minimum_nodes(snapshot, config.node_headroom)?;
    if target >= total {
        return None;
    }

    let costs = CostModel::new(prices);
    let hourly = |n: &NodeInfo| {
        n.hourly_cost.unwrap_or_else(|| {
            costs.node_hourly(
                n.instance_type.as_deref(),
                n.cpu_millicores as f64 / 1000.0,
                n.memory_bytes as f64 / GIB as f64,
            )
        })
    };
    let current_hourly: f64 = snapshot.nodes.iter().map(hourly).sum();
    let drained_hourly: f64 = snapshot
        .nodes
        .iter()
        .filter(|n| drained.contains(&n.name))
        .map(hourly)
        .sum();
    let source = if prices.is_fallback() {
        PriceSource::Fallback
    } else {
        PriceSource::Resolver
    };
    let estimate = |h: f64| CostEstimate {
        hourly: (h * 10_000.0).round() / 10_000.0,
        monthly: round_cents(h * HOURS_PER_MONTH),
        instance_type: None,
        source,
    };
    let current_cost = estimate(current_hourly);
    let optimized_cost = estimate(current_hourly - drained_hourly);
    let (monthly_savings, yearly_savings, savings_percentage) =
        super::cost::savings(&current_cost, &optimized_cost);

    let mut confidence: f64 = 0.5;
    let mut confidence_factors = Vec::new();
    if !snapshot.placements.is_empty() {
        confidence += 0.1;
        confidence_factors.push("current pod placements known".to_string());
    }
    if prices.is_fallback() {
        confidence -= scoring::FALLBACK_PRICING_PENALTY;
        confidence_factors.push("pricing unavailable, static estimate used".to_string());
    }

    let mut score: f64 = 0.3;
    let mut factors = vec![format!("Pods on {} drained nodes are rescheduled", drained.len())];
    let mut mitigations = vec!["Drain nodes one at a time and watch pending pods".to_string()];
    if snapshot
        .workloads
        .iter()
        .any(|w| w.reference.kind == WorkloadKind::StatefulSet)
    {
        score += 0.2;
        factors.push("Stateful workloads may move".to_string());
        mitigations.push("Confirm volumes can attach in the target zones".to_string());
    }
    let score = score.min(1.0);

    Some(with_content_id(Recommendation {
        id: String::new(),
        workload: None,
        optimization_type: OptimizationType::NodeConsolidation,
        title: format!("Consolidate {} nodes onto {}", total, target),
        description: format!(
            "All workload requests fit on {} of {} nodes at {:.0}% packing headroom",
            target,
            total,
            config.node_headroom * 100.0
        ),
        current_cost,
        optimized_cost,
        monthly_savings,
        yearly_savings,
        savings_percentage,
        change_percent: round_tenth((total - target) as f64 / total as f64 * 100.0),
        confidence: confidence.clamp(0.0, 1.0),
        confidence_factors,
        risk: RiskAssessment {
            level: RiskLevel::from_score(score),
            score,
            factors,
            mitigations,
        },
        changes: ProposedChanges {
            target_node_count: Some(target as u32),
            nodes_to_drain: drained,
            ..Default::default()
        },
        rollback_plan: scoring::rollback_plan(OptimizationType::NodeConsolidation),
        as_of: 0,
    }))
}
