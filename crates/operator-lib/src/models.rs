//! Core data models for the optimization operator
//!
//! Policy objects follow the declarative-object conventions of the cluster
//! API (camelCase on the wire, metadata + spec + status). Everything else is
//! internal and serialized in the same style for the HTTP API and the
//! inventory file.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ErrorClass;
use crate::pricing::{PriceSource, Provider};
use crate::units::{self, duration_str};

/// Annotation stamped on a workload when an optimization is applied
pub const ANNOTATION_OPTIMIZED_AT: &str = "optimization.k8s.io/optimized-at";
/// Annotation naming the component that applied the optimization
pub const ANNOTATION_OPTIMIZED_BY: &str = "optimization.k8s.io/optimized-by";
/// Idempotence marker: id of the recommendation currently applied
pub const ANNOTATION_APPLIED_RECOMMENDATION: &str = "optimization.k8s.io/applied-recommendation";
/// Off-peak scaling schedule consumed by the in-cluster scaler
pub const ANNOTATION_SCALING_SCHEDULE: &str = "optimization.k8s.io/scaling-schedule";
/// Label marking objects managed by the operator
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
/// Value written to the `optimized-by` annotation and the managed-by label
pub const MANAGER_NAME: &str = "cost-optimizer-operator";

/// Kinds of workloads the operator can optimize
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum WorkloadKind {
    Deployment,
    StatefulSet,
    DaemonSet,
}

impl WorkloadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadKind::Deployment => "Deployment",
            WorkloadKind::StatefulSet => "StatefulSet",
            WorkloadKind::DaemonSet => "DaemonSet",
        }
    }

    /// DaemonSets run one pod per node and have no replica count
    pub fn has_replicas(&self) -> bool {
        !matches!(self, WorkloadKind::DaemonSet)
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkloadKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "deployment" => Ok(WorkloadKind::Deployment),
            "statefulset" => Ok(WorkloadKind::StatefulSet),
            "daemonset" => Ok(WorkloadKind::DaemonSet),
            other => Err(format!("unknown workload kind '{}'", other)),
        }
    }
}

/// Reference to a target workload
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkloadRef {
    pub kind: WorkloadKind,
    pub name: String,
    pub namespace: String,
}

impl WorkloadRef {
    pub fn new(kind: WorkloadKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    /// Stable key used by stores and the rollback record
    pub fn key(&self) -> String {
        format!("{}:{}:{}", self.namespace, self.kind, self.name)
    }
}

impl fmt::Display for WorkloadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// Optimization strategies a policy can request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OptimizationType {
    #[serde(rename = "RightSizeCPU")]
    RightSizeCpu,
    RightSizeMemory,
    ReduceReplicas,
    SpotMigration,
    ScheduledScaling,
    NodeConsolidation,
    RemoveUnused,
    All,
}

impl OptimizationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptimizationType::RightSizeCpu => "RightSizeCPU",
            OptimizationType::RightSizeMemory => "RightSizeMemory",
            OptimizationType::ReduceReplicas => "ReduceReplicas",
            OptimizationType::SpotMigration => "SpotMigration",
            OptimizationType::ScheduledScaling => "ScheduledScaling",
            OptimizationType::NodeConsolidation => "NodeConsolidation",
            OptimizationType::RemoveUnused => "RemoveUnused",
            OptimizationType::All => "All",
        }
    }

    /// Whether a recommendation of type `other` satisfies a policy asking for `self`
    pub fn accepts(&self, other: OptimizationType) -> bool {
        *self == OptimizationType::All || *self == other
    }

    /// Advisory types are reported but never mutate a workload automatically
    pub fn is_advisory(&self) -> bool {
        matches!(
            self,
            OptimizationType::NodeConsolidation | OptimizationType::RemoveUnused
        )
    }

    /// Types that change (or schedule changes of) the replica count
    pub fn changes_replicas(&self) -> bool {
        matches!(
            self,
            OptimizationType::ReduceReplicas | OptimizationType::ScheduledScaling
        )
    }
}

impl fmt::Display for OptimizationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OptimizationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RightSizeCPU" => Ok(OptimizationType::RightSizeCpu),
            "RightSizeMemory" => Ok(OptimizationType::RightSizeMemory),
            "ReduceReplicas" => Ok(OptimizationType::ReduceReplicas),
            "SpotMigration" => Ok(OptimizationType::SpotMigration),
            "ScheduledScaling" => Ok(OptimizationType::ScheduledScaling),
            "NodeConsolidation" => Ok(OptimizationType::NodeConsolidation),
            "RemoveUnused" => Ok(OptimizationType::RemoveUnused),
            "All" => Ok(OptimizationType::All),
            other => Err(format!("unknown optimization type '{}'", other)),
        }
    }
}

/// Ordered risk classification gating automation
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// Map a numeric risk score onto a level.
    ///
    /// Bands: `< 0.5` Low, `[0.5, 0.7)` Medium, `[0.7, 0.9]` High, `> 0.9` Critical.
    pub fn from_score(score: f64) -> Self {
        if score > 0.9 {
            RiskLevel::Critical
        } else if score >= 0.7 {
            RiskLevel::High
        } else if score >= 0.5 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "Low",
            RiskLevel::Medium => "Medium",
            RiskLevel::High => "High",
            RiskLevel::Critical => "Critical",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_max_change_percent() -> u32 {
    50
}

fn default_min_confidence() -> f64 {
    0.7
}

fn default_rollback_on_failure() -> bool {
    true
}

fn default_metrics_window() -> Duration {
    Duration::from_secs(7 * 24 * 3600)
}

/// Desired optimization behavior for one target workload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicySpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_workload: Option<WorkloadRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimization_type: Option<OptimizationType>,
    #[serde(default = "default_max_change_percent")]
    pub max_change_percent: u32,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    #[serde(default)]
    pub max_risk_level: RiskLevel,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub auto_apply: bool,
    #[serde(default = "default_rollback_on_failure")]
    pub rollback_on_failure: bool,
    #[serde(default = "default_metrics_window", with = "duration_str")]
    pub metrics_window: Duration,
    /// Reconcile cadence override, e.g. `1h`; the controller default applies when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    /// Explicit approval for changes that are never applied without one
    #[serde(default)]
    pub manual_approval: bool,
    /// Replica floor for replica recommendations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_available: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<Provider>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// Instance shape to price against instead of inferring one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_hint: Option<String>,
}

impl Default for PolicySpec {
    fn default() -> Self {
        Self {
            target_workload: None,
            optimization_type: None,
            max_change_percent: default_max_change_percent(),
            min_confidence: default_min_confidence(),
            max_risk_level: RiskLevel::default(),
            dry_run: false,
            auto_apply: false,
            rollback_on_failure: default_rollback_on_failure(),
            metrics_window: default_metrics_window(),
            schedule: None,
            manual_approval: false,
            min_available: None,
            provider: None,
            region: None,
            instance_hint: None,
        }
    }
}

impl PolicySpec {
    /// Parsed reconcile cadence, if the policy overrides it
    pub fn schedule_interval(&self) -> Option<Duration> {
        self.schedule.as_deref().and_then(units::parse_duration)
    }
}

/// Object metadata for policies
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub generation: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
    /// Set when deletion was requested; the object is removed once rollback finished
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

fn default_namespace() -> String {
    "default".to_string()
}

/// Key identifying a policy object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PolicyKey {
    pub namespace: String,
    pub name: String,
}

impl PolicyKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for PolicyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Lifecycle phase of a policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Phase {
    #[default]
    Pending,
    Analyzing,
    Ready,
    Applying,
    Applied,
    Failed,
    RolledBack,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Pending => "Pending",
            Phase::Analyzing => "Analyzing",
            Phase::Ready => "Ready",
            Phase::Applying => "Applying",
            Phase::Applied => "Applied",
            Phase::Failed => "Failed",
            Phase::RolledBack => "RolledBack",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last error recorded on a policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusError {
    pub class: ErrorClass,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Status sub-object, written only by the controller
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyStatus {
    #[serde(default)]
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_analysis: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_applied: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_recommendation: Option<Recommendation>,
    #[serde(default)]
    pub applied_optimizations: u64,
    #[serde(default)]
    pub total_savings: f64,
    /// Monthly savings of applied changes that have not been rolled back
    #[serde(default)]
    pub effective_savings: f64,
    #[serde(default)]
    pub observed_generation: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_recommendation_id: Option<String>,
    /// Why the current recommendation was not applied automatically
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    /// Set when a rollback record could only be written to one backing store
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_warning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<StatusError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub requires_intervention: bool,
}

/// Declarative optimization policy object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationPolicy {
    pub metadata: ObjectMeta,
    pub spec: PolicySpec,
    #[serde(default)]
    pub status: PolicyStatus,
}

impl OptimizationPolicy {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, spec: PolicySpec) -> Self {
        Self {
            metadata: ObjectMeta {
                name: name.into(),
                namespace: namespace.into(),
                generation: 1,
                ..Default::default()
            },
            spec,
            status: PolicyStatus::default(),
        }
    }

    pub fn key(&self) -> PolicyKey {
        PolicyKey::new(&self.metadata.namespace, &self.metadata.name)
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Whether the spec changed since the controller last observed it
    pub fn has_new_generation(&self) -> bool {
        self.metadata.generation > self.status.observed_generation
    }
}

/// Point-in-time utilization of one workload, averaged per replica
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UtilizationSample {
    /// Unix timestamp in seconds
    pub timestamp: i64,
    pub cpu_cores: f64,
    pub memory_bytes: u64,
    #[serde(default)]
    pub network_bytes: u64,
}

/// Requests and limits of one container, as declared quantities
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirements {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_request: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_request: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_limit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<String>,
}

impl ResourceRequirements {
    pub fn cpu_request_millicores(&self) -> u64 {
        self.cpu_request.as_deref().and_then(units::parse_cpu).unwrap_or(0)
    }

    pub fn memory_request_bytes(&self) -> u64 {
        self.memory_request
            .as_deref()
            .and_then(units::parse_memory)
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    #[serde(default)]
    pub resources: ResourceRequirements,
}

/// Placement constraints relevant to node consolidation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulingConstraints {
    /// No two replicas may share a node
    #[serde(default)]
    pub anti_affinity: bool,
    /// Replicas must stay spread across zones
    #[serde(default)]
    pub zone_spread: bool,
}

/// Declared spec of a live workload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSpec {
    pub reference: WorkloadRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<u32>,
    pub containers: Vec<ContainerSpec>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,
    #[serde(default)]
    pub scheduling: SchedulingConstraints,
    /// Optimistic-concurrency token maintained by the workload API
    #[serde(default)]
    pub resource_version: u64,
}

impl WorkloadSpec {
    /// Replica count; DaemonSets count as one pod per node for sizing purposes
    pub fn replica_count(&self) -> u32 {
        self.replicas.unwrap_or(1)
    }

    /// CPU request of one replica, summed over containers
    pub fn cpu_request_millicores(&self) -> u64 {
        self.containers
            .iter()
            .map(|c| c.resources.cpu_request_millicores())
            .sum()
    }

    /// Memory request of one replica, summed over containers
    pub fn memory_request_bytes(&self) -> u64 {
        self.containers
            .iter()
            .map(|c| c.resources.memory_request_bytes())
            .sum()
    }

    /// The declared spec without the concurrency token, for equality checks
    pub fn declared(&self) -> WorkloadSpec {
        WorkloadSpec {
            resource_version: 0,
            ..self.clone()
        }
    }

    pub fn applied_recommendation(&self) -> Option<&str> {
        self.annotations
            .get(ANNOTATION_APPLIED_RECOMMENDATION)
            .map(String::as_str)
    }

    /// Whether any label key or value marks the workload as critical
    pub fn is_marked_critical(&self) -> bool {
        self.labels.iter().any(|(k, v)| {
            let v = v.to_ascii_lowercase();
            v == "critical" || (k.to_ascii_lowercase().contains("critical") && v == "true")
        })
    }
}

/// Disruption budget guarding a workload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisruptionBudget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_available: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<u32>,
}

/// A schedulable node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub name: String,
    #[serde(default)]
    pub zone: String,
    pub cpu_millicores: u64,
    pub memory_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hourly_cost: Option<f64>,
}

/// Node hosting one replica of a workload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodPlacement {
    pub workload: WorkloadRef,
    pub node: String,
}

/// Node and workload shape of the whole cluster
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    #[serde(default)]
    pub nodes: Vec<NodeInfo>,
    #[serde(default)]
    pub workloads: Vec<WorkloadSpec>,
    #[serde(default)]
    pub placements: Vec<PodPlacement>,
}

/// Monetary estimate of running a workload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostEstimate {
    pub hourly: f64,
    pub monthly: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_type: Option<String>,
    pub source: PriceSource,
}

/// Risk of applying a recommendation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub level: RiskLevel,
    pub score: f64,
    pub factors: Vec<String>,
    pub mitigations: Vec<String>,
}

/// New resources for one container
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerChange {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_request: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_limit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_request: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<String>,
}

/// Replica schedule for detected off-peak windows
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalingSchedule {
    /// Hours of the week (0 = Monday 00:00 UTC) considered off-peak
    pub off_peak_hours: Vec<u16>,
    pub peak_replicas: u32,
    pub off_peak_replicas: u32,
}

/// Structured set of changes a recommendation proposes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposedChanges {
    /// Per-replica CPU request after the change
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_request: Option<String>,
    /// Per-replica memory request after the change
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_request: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub containers: Vec<ContainerChange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<u32>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scaling_schedule: Option<ScalingSchedule>,
    #[serde(default)]
    pub remove_workload: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_node_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes_to_drain: Vec<String>,
}

impl ProposedChanges {
    pub fn touches_replicas(&self) -> bool {
        self.replicas.is_some() || self.scaling_schedule.is_some()
    }
}

/// How to undo a recommendation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackPlan {
    pub steps: Vec<String>,
    pub estimated_minutes: u32,
    pub automatable: bool,
}

/// Scored optimization candidate produced by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
    /// Content hash of everything else in the recommendation
    pub id: String,
    /// Target workload; `None` for cluster-wide recommendations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workload: Option<WorkloadRef>,
    pub optimization_type: OptimizationType,
    pub title: String,
    pub description: String,
    pub current_cost: CostEstimate,
    pub optimized_cost: CostEstimate,
    pub monthly_savings: f64,
    pub yearly_savings: f64,
    pub savings_percentage: f64,
    /// Largest relative change of any resource dimension, in percent
    pub change_percent: f64,
    pub confidence: f64,
    #[serde(default)]
    pub confidence_factors: Vec<String>,
    pub risk: RiskAssessment,
    pub changes: ProposedChanges,
    pub rollback_plan: RollbackPlan,
    /// Timestamp of the newest sample the recommendation is based on
    pub as_of: i64,
}

/// Pre-change spec of a workload, captured before the first applied change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackRecord {
    pub key: String,
    pub workload: WorkloadRef,
    pub spec: WorkloadSpec,
    pub recommendation_id: String,
    pub captured_at: DateTime<Utc>,
}

impl RollbackRecord {
    /// Store key for the rollback record of a workload
    pub fn key_for(workload: &WorkloadRef) -> String {
        format!("rollback:{}", workload.key())
    }

    pub fn capture(live: &WorkloadSpec, recommendation_id: impl Into<String>) -> Self {
        Self {
            key: Self::key_for(&live.reference),
            workload: live.reference.clone(),
            spec: live.declared(),
            recommendation_id: recommendation_id.into(),
            captured_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_risk_level_bands() {
        assert_eq!(RiskLevel::from_score(0.0), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(0.49), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(0.5), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(0.7), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(0.9), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(0.95), RiskLevel::Critical);
        assert!(RiskLevel::Low < RiskLevel::Medium);
        assert!(RiskLevel::High < RiskLevel::Critical);
    }

    #[test]
    fn test_policy_spec_wire_format() {
        let json = r#"{
            "targetWorkload": {"kind": "Deployment", "name": "web", "namespace": "shop"},
            "optimizationType": "RightSizeCPU",
            "maxChangePercent": 40,
            "autoApply": true,
            "metricsWindow": "14d"
        }"#;
        let spec: PolicySpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.optimization_type, Some(OptimizationType::RightSizeCpu));
        assert_eq!(spec.max_change_percent, 40);
        assert_eq!(spec.min_confidence, 0.7);
        assert!(spec.rollback_on_failure);
        assert_eq!(spec.metrics_window, Duration::from_secs(14 * 86_400));

        let back = serde_json::to_value(&spec).unwrap();
        assert_eq!(back["optimizationType"], "RightSizeCPU");
        assert_eq!(back["metricsWindow"], "14d");
    }

    #[test]
    fn test_optimization_type_acceptance() {
        assert!(OptimizationType::All.accepts(OptimizationType::SpotMigration));
        assert!(OptimizationType::RightSizeCpu.accepts(OptimizationType::RightSizeCpu));
        assert!(!OptimizationType::RightSizeCpu.accepts(OptimizationType::RightSizeMemory));
        assert!(OptimizationType::RemoveUnused.is_advisory());
        assert!(OptimizationType::ScheduledScaling.changes_replicas());
        assert_eq!(
            "ReduceReplicas".parse::<OptimizationType>(),
            Ok(OptimizationType::ReduceReplicas)
        );
    }

    #[test]
    fn test_workload_requests_sum_containers() {
        let spec = WorkloadSpec {
            reference: WorkloadRef::new(WorkloadKind::Deployment, "shop", "web"),
            replicas: Some(3),
            containers: vec![
                ContainerSpec {
                    name: "app".into(),
                    resources: ResourceRequirements {
                        cpu_request: Some("1500m".into()),
                        memory_request: Some("1Gi".into()),
                        ..Default::default()
                    },
                },
                ContainerSpec {
                    name: "sidecar".into(),
                    resources: ResourceRequirements {
                        cpu_request: Some("500m".into()),
                        memory_request: Some("512Mi".into()),
                        ..Default::default()
                    },
                },
            ],
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            node_selector: BTreeMap::new(),
            scheduling: SchedulingConstraints::default(),
            resource_version: 7,
        };
        assert_eq!(spec.cpu_request_millicores(), 2000);
        assert_eq!(spec.memory_request_bytes(), 1536 * units::MIB);
        assert_eq!(spec.declared().resource_version, 0);
        assert_eq!(
            RollbackRecord::key_for(&spec.reference),
            "rollback:shop:Deployment:web"
        );
    }

    #[test]
    fn test_critical_label_detection() {
        let mut spec = WorkloadSpec {
            reference: WorkloadRef::new(WorkloadKind::Deployment, "shop", "web"),
            replicas: Some(2),
            containers: vec![],
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            node_selector: BTreeMap::new(),
            scheduling: SchedulingConstraints::default(),
            resource_version: 0,
        };
        assert!(!spec.is_marked_critical());
        spec.labels.insert("tier".into(), "critical".into());
        assert!(spec.is_marked_critical());
        spec.labels.clear();
        spec.labels.insert("business-critical".into(), "true".into());
        assert!(spec.is_marked_critical());
    }
}
