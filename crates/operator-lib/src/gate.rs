//! Policy Gate
//!
//! Stateless validation of policy objects. [`PolicyGate::validate`] runs at
//! admission and rejects synchronously; [`PolicyGate::check_apply`] runs
//! again before every automatic apply, against the specific recommendation
//! about to be applied, and turns any objection into a recorded skip.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::models::{
    OptimizationPolicy, OptimizationType, PolicyStatus, Recommendation, RiskLevel, WorkloadKind,
    WorkloadRef, WorkloadSpec, LABEL_MANAGED_BY, MANAGER_NAME,
};

/// Highest `maxChangePercent` allowed together with `autoApply`
pub const AUTO_APPLY_MAX_CHANGE_PERCENT: u32 = 80;

/// Minimum confidence threshold for automatic spot migration
pub const SPOT_AUTO_APPLY_MIN_CONFIDENCE: f64 = 0.8;

/// Reasons a policy is rejected
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GateViolation {
    #[error("targetWorkload is required")]
    MissingTarget,
    #[error("targetWorkload name and namespace must not be empty")]
    EmptyTarget,
    #[error("optimizationType is required")]
    MissingOptimizationType,
    #[error("maxChangePercent must be between 1 and 100, got {0}")]
    MaxChangePercentOutOfRange(u32),
    #[error("minConfidence must be between 0.0 and 1.0, got {0}")]
    MinConfidenceOutOfRange(f64),
    #[error("dryRun and autoApply cannot both be enabled")]
    DryRunWithAutoApply,
    #[error("autoApply is not allowed with maxRiskLevel {0}")]
    AutoApplyRiskTooHigh(RiskLevel),
    #[error("autoApply is not allowed with maxChangePercent above {AUTO_APPLY_MAX_CHANGE_PERCENT}, got {0}")]
    AutoApplyChangeTooLarge(u32),
    #[error("SpotMigration with autoApply requires minConfidence of at least {SPOT_AUTO_APPLY_MIN_CONFIDENCE}, got {0}")]
    SpotAutoApplyLowConfidence(f64),
    #[error("ReduceReplicas cannot be auto-applied to a StatefulSet")]
    StatefulSetReplicaAutoApply,
    #[error("DaemonSets have no replica count to change")]
    DaemonSetReplicaChange,
    #[error("schedule '{0}' is not a valid duration")]
    InvalidSchedule(String),
    #[error("namespace '{0}' is protected")]
    ProtectedNamespace(String),
    #[error("workload '{0}' is protected")]
    ProtectedWorkload(String),
    #[error("workloads labelled {0} are protected")]
    ProtectedLabel(String),
    #[error("replica count must stay at least 1")]
    ReplicaFloor,
    #[error("change violates disruption budget: {0}")]
    DisruptionBudget(String),
}

impl GateViolation {
    /// Protected-target violations are authorization failures, not malformed input
    pub fn is_protected_target(&self) -> bool {
        matches!(
            self,
            GateViolation::ProtectedNamespace(_)
                | GateViolation::ProtectedWorkload(_)
                | GateViolation::ProtectedLabel(_)
        )
    }
}

/// What a protected entry matches within its namespace scope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSelector {
    Any,
    Name(String),
    Label { key: String, value: String },
}

/// One deny-list entry: `namespace`, `namespace/name`, `namespace/key=value`,
/// with `*` as the namespace matching every namespace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProtectedTarget {
    /// `None` matches every namespace
    pub namespace: Option<String>,
    pub selector: TargetSelector,
}

impl ProtectedTarget {
    pub fn namespace(ns: &str) -> Self {
        Self {
            namespace: Some(ns.to_string()),
            selector: TargetSelector::Any,
        }
    }

    pub fn name(name: &str) -> Self {
        Self {
            namespace: None,
            selector: TargetSelector::Name(name.to_string()),
        }
    }

    pub fn label(key: &str, value: &str) -> Self {
        Self {
            namespace: None,
            selector: TargetSelector::Label {
                key: key.to_string(),
                value: value.to_string(),
            },
        }
    }

    fn violation(
        &self,
        target: &WorkloadRef,
        workload: Option<&WorkloadSpec>,
    ) -> Option<GateViolation> {
        if let Some(ns) = &self.namespace {
            if ns != &target.namespace {
                return None;
            }
        }
        match &self.selector {
            TargetSelector::Any => {
                Some(GateViolation::ProtectedNamespace(target.namespace.clone()))
            }
            TargetSelector::Name(name) if name == &target.name => {
                Some(GateViolation::ProtectedWorkload(target.name.clone()))
            }
            TargetSelector::Label { key, value } => workload
                .filter(|w| w.labels.get(key) == Some(value))
                .map(|_| GateViolation::ProtectedLabel(format!("{}={}", key, value))),
            _ => None,
        }
    }
}

impl TryFrom<String> for ProtectedTarget {
    type Error = String;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        raw.parse()
    }
}

impl std::str::FromStr for ProtectedTarget {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err("empty protected target".to_string());
        }
        let (ns, rest) = match raw.split_once('/') {
            Some((ns, rest)) => (ns, Some(rest)),
            None => (raw, None),
        };
        let namespace = if ns == "*" { None } else { Some(ns.to_string()) };
        let selector = match rest {
            None | Some("") => TargetSelector::Any,
            Some(r) => match r.split_once('=') {
                Some((key, value)) => TargetSelector::Label {
                    key: key.to_string(),
                    value: value.to_string(),
                },
                None => TargetSelector::Name(r.to_string()),
            },
        };
        if namespace.is_none() && selector == TargetSelector::Any {
            return Err(format!("'{}' would protect every workload", raw));
        }
        Ok(Self {
            namespace,
            selector,
        })
    }
}

impl From<ProtectedTarget> for String {
    fn from(target: ProtectedTarget) -> Self {
        target.to_string()
    }
}

impl fmt::Display for ProtectedTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ns = self.namespace.as_deref().unwrap_or("*");
        match &self.selector {
            TargetSelector::Any => write!(f, "{}", ns),
            TargetSelector::Name(name) => write!(f, "{}/{}", ns, name),
            TargetSelector::Label { key, value } => write!(f, "{}/{}={}", ns, key, value),
        }
    }
}

/// Deny-list of targets no policy may touch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectedTargets {
    entries: Vec<ProtectedTarget>,
}

impl Default for ProtectedTargets {
    fn default() -> Self {
        let mut entries: Vec<ProtectedTarget> = ["kube-system", "kube-public", "kube-node-lease"]
            .iter()
            .map(|ns| ProtectedTarget::namespace(ns))
            .collect();
        entries.extend(
            ["kube-dns", "coredns", "kube-proxy", "metrics-server", "kubernetes-dashboard"]
                .iter()
                .map(|n| ProtectedTarget::name(n)),
        );
        entries.push(ProtectedTarget::label("app.kubernetes.io/component", "controller"));
        Self { entries }
    }
}

impl ProtectedTargets {
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Default deny-list plus `extra` entries
    pub fn with_extra(extra: impl IntoIterator<Item = ProtectedTarget>) -> Self {
        let mut targets = Self::default();
        for entry in extra {
            if !targets.entries.contains(&entry) {
                targets.entries.push(entry);
            }
        }
        targets
    }

    pub fn entries(&self) -> &[ProtectedTarget] {
        &self.entries
    }

    /// First protection matching the target, if any
    pub fn check(
        &self,
        target: &WorkloadRef,
        workload: Option<&WorkloadSpec>,
    ) -> Option<GateViolation> {
        self.entries.iter().find_map(|e| e.violation(target, workload))
    }
}

/// Why a recommendation was not applied automatically
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    DryRun,
    AutoApplyDisabled,
    Violation(GateViolation),
    Advisory(OptimizationType),
    TypeMismatch {
        requested: OptimizationType,
        recommended: OptimizationType,
    },
    LowConfidence { confidence: f64, required: f64 },
    RiskTooHigh { level: RiskLevel, allowed: RiskLevel },
    ChangeTooLarge { change: f64, allowed: u32 },
    AlreadyApplied,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::DryRun => write!(f, "dry run: recommendation recorded only"),
            SkipReason::AutoApplyDisabled => write!(f, "autoApply is disabled"),
            SkipReason::Violation(v) => write!(f, "{}", v),
            SkipReason::Advisory(t) => write!(f, "{} recommendations are advisory", t),
            SkipReason::TypeMismatch {
                requested,
                recommended,
            } => write!(f, "policy requests {}, recommendation is {}", requested, recommended),
            SkipReason::LowConfidence {
                confidence,
                required,
            } => write!(f, "confidence {:.2} below minConfidence {:.2}", confidence, required),
            SkipReason::RiskTooHigh { level, allowed } => {
                write!(f, "risk {} exceeds maxRiskLevel {}", level, allowed)
            }
            SkipReason::ChangeTooLarge { change, allowed } => {
                write!(f, "change of {:.1}% exceeds maxChangePercent {}", change, allowed)
            }
            SkipReason::AlreadyApplied => write!(f, "recommendation already applied"),
        }
    }
}

/// Outcome of the pre-apply check
#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    Allow,
    Skip(SkipReason),
}

impl GateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, GateDecision::Allow)
    }
}

/// Defaults stamped on a policy when it is admitted: fresh status, first
/// generation and the managed-by label
pub fn apply_admission_defaults(policy: &mut OptimizationPolicy) {
    policy.status = PolicyStatus::default();
    policy.metadata.generation = policy.metadata.generation.max(1);
    policy.metadata.deletion_timestamp = None;
    policy
        .metadata
        .creation_timestamp
        .get_or_insert_with(chrono::Utc::now);
    policy
        .metadata
        .labels
        .entry(LABEL_MANAGED_BY.to_string())
        .or_insert_with(|| MANAGER_NAME.to_string());
}

/// Stateless validator for policies and pre-apply checks
#[derive(Debug, Clone, Default)]
pub struct PolicyGate {
    protected: ProtectedTargets,
}

impl PolicyGate {
    pub fn new(protected: ProtectedTargets) -> Self {
        Self { protected }
    }

    pub fn protected(&self) -> &ProtectedTargets {
        &self.protected
    }

    /// Every rule the policy breaks. `workload` enables label-based protection.
    pub fn violations(
        &self,
        policy: &OptimizationPolicy,
        workload: Option<&WorkloadSpec>,
    ) -> Vec<GateViolation> {
        let spec = &policy.spec;
        let mut violations = Vec::new();

        match &spec.target_workload {
            None => violations.push(GateViolation::MissingTarget),
            Some(t) if t.name.trim().is_empty() || t.namespace.trim().is_empty() => {
                violations.push(GateViolation::EmptyTarget)
            }
            Some(t) => violations.extend(self.protected.check(t, workload)),
        }
        if spec.optimization_type.is_none() {
            violations.push(GateViolation::MissingOptimizationType);
        }
        if !(1..=100).contains(&spec.max_change_percent) {
            violations.push(GateViolation::MaxChangePercentOutOfRange(spec.max_change_percent));
        }
        if !(0.0..=1.0).contains(&spec.min_confidence) || spec.min_confidence.is_nan() {
            violations.push(GateViolation::MinConfidenceOutOfRange(spec.min_confidence));
        }
        if let Some(schedule) = &spec.schedule {
            if spec.schedule_interval().filter(|d| !d.is_zero()).is_none() {
                violations.push(GateViolation::InvalidSchedule(schedule.clone()));
            }
        }
        if spec.dry_run && spec.auto_apply {
            violations.push(GateViolation::DryRunWithAutoApply);
        }

        let kind = spec.target_workload.as_ref().map(|t| t.kind);
        let opt_type = spec.optimization_type;

        let changes_replicas = opt_type.map(|t| t.changes_replicas()).unwrap_or(false);
        if kind == Some(WorkloadKind::DaemonSet) && changes_replicas {
            violations.push(GateViolation::DaemonSetReplicaChange);
        }

        if spec.auto_apply {
            if spec.max_risk_level >= RiskLevel::High {
                violations.push(GateViolation::AutoApplyRiskTooHigh(spec.max_risk_level));
            }
            if spec.max_change_percent > AUTO_APPLY_MAX_CHANGE_PERCENT {
                violations.push(GateViolation::AutoApplyChangeTooLarge(spec.max_change_percent));
            }
            if opt_type == Some(OptimizationType::SpotMigration)
                && spec.min_confidence < SPOT_AUTO_APPLY_MIN_CONFIDENCE
            {
                violations.push(GateViolation::SpotAutoApplyLowConfidence(spec.min_confidence));
            }
            if kind == Some(WorkloadKind::StatefulSet)
                && opt_type == Some(OptimizationType::ReduceReplicas)
            {
                violations.push(GateViolation::StatefulSetReplicaAutoApply);
            }
        }

        violations
    }

    /// Admission check: the first violated rule rejects the policy
    pub fn validate(
        &self,
        policy: &OptimizationPolicy,
        workload: Option<&WorkloadSpec>,
    ) -> Result<(), GateViolation> {
        match self.violations(policy, workload).into_iter().next() {
            Some(v) => Err(v),
            None => Ok(()),
        }
    }

    /// Pre-apply check of a specific recommendation
    pub fn check_apply(
        &self,
        policy: &OptimizationPolicy,
        recommendation: &Recommendation,
        workload: &WorkloadSpec,
    ) -> GateDecision {
        let spec = &policy.spec;

        if spec.dry_run {
            return GateDecision::Skip(SkipReason::DryRun);
        }
        if !spec.auto_apply {
            return GateDecision::Skip(SkipReason::AutoApplyDisabled);
        }
        if let Err(v) = self.validate(policy, Some(workload)) {
            return GateDecision::Skip(SkipReason::Violation(v));
        }
        if let Some(v) = self.protected.check(&workload.reference, Some(workload)) {
            return GateDecision::Skip(SkipReason::Violation(v));
        }
        if workload.applied_recommendation() == Some(recommendation.id.as_str()) {
            return GateDecision::Skip(SkipReason::AlreadyApplied);
        }

        let rec_type = recommendation.optimization_type;
        if rec_type.is_advisory() {
            return GateDecision::Skip(SkipReason::Advisory(rec_type));
        }
        if let Some(requested) = spec.optimization_type {
            if !requested.accepts(rec_type) {
                return GateDecision::Skip(SkipReason::TypeMismatch {
                    requested,
                    recommended: rec_type,
                });
            }
        }
        if recommendation.confidence < spec.min_confidence {
            return GateDecision::Skip(SkipReason::LowConfidence {
                confidence: recommendation.confidence,
                required: spec.min_confidence,
            });
        }
        if recommendation.risk.level > spec.max_risk_level {
            return GateDecision::Skip(SkipReason::RiskTooHigh {
                level: recommendation.risk.level,
                allowed: spec.max_risk_level,
            });
        }
        if recommendation.change_percent > spec.max_change_percent as f64 {
            return GateDecision::Skip(SkipReason::ChangeTooLarge {
                change: recommendation.change_percent,
                allowed: spec.max_change_percent,
            });
        }
        if rec_type == OptimizationType::SpotMigration
            && recommendation.confidence < SPOT_AUTO_APPLY_MIN_CONFIDENCE
        {
            return GateDecision::Skip(SkipReason::LowConfidence {
                confidence: recommendation.confidence,
                required: SPOT_AUTO_APPLY_MIN_CONFIDENCE,
            });
        }
        if recommendation.changes.touches_replicas() {
            match workload.reference.kind {
                WorkloadKind::StatefulSet => {
                    return GateDecision::Skip(SkipReason::Violation(
                        GateViolation::StatefulSetReplicaAutoApply,
                    ))
                }
                WorkloadKind::DaemonSet => {
                    return GateDecision::Skip(SkipReason::Violation(
                        GateViolation::DaemonSetReplicaChange,
                    ))
                }
                WorkloadKind::Deployment => {}
            }
        }

        GateDecision::Allow
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PolicySpec, ProposedChanges};
    use crate::engine::testing::workload;

    fn policy(kind: WorkloadKind, opt: OptimizationType) -> OptimizationPolicy {
        OptimizationPolicy::new(
            "shop",
            "web-cost",
            PolicySpec {
                target_workload: Some(WorkloadRef::new(kind, "shop", "web")),
                optimization_type: Some(opt),
                ..Default::default()
            },
        )
    }

    fn auto(mut p: OptimizationPolicy) -> OptimizationPolicy {
        p.spec.auto_apply = true;
        p
    }

    fn recommendation(
        opt: OptimizationType,
        confidence: f64,
        level: RiskLevel,
        change: f64,
    ) -> Recommendation {
        use crate::models::{CostEstimate, RiskAssessment, RollbackPlan};
        use crate::pricing::PriceSource;
        let cost = CostEstimate {
            hourly: 1.0,
            monthly: 730.0,
            instance_type: None,
            source: PriceSource::Fallback,
        };
        Recommendation {
            id: "rec-test".into(),
            workload: Some(WorkloadRef::new(WorkloadKind::Deployment, "shop", "web")),
            optimization_type: opt,
            title: String::new(),
            description: String::new(),
            current_cost: cost.clone(),
            optimized_cost: cost,
            monthly_savings: 100.0,
            yearly_savings: 1200.0,
            savings_percentage: 10.0,
            change_percent: change,
            confidence,
            confidence_factors: vec![],
            risk: RiskAssessment {
                level,
                score: 0.0,
                factors: vec![],
                mitigations: vec![],
            },
            changes: ProposedChanges::default(),
            rollback_plan: RollbackPlan {
                steps: vec![],
                estimated_minutes: 5,
                automatable: true,
            },
            as_of: 0,
        }
    }

    #[test]
    fn test_valid_policy_passes() {
        let gate = PolicyGate::default();
        let manual = policy(WorkloadKind::Deployment, OptimizationType::All);
        assert_eq!(gate.validate(&manual, None), Ok(()));
        let automatic = auto(policy(WorkloadKind::Deployment, OptimizationType::RightSizeCpu));
        assert_eq!(gate.validate(&automatic, None), Ok(()));
    }

    #[test]
    fn test_required_fields_and_ranges() {
        let gate = PolicyGate::default();
        let mut p = policy(WorkloadKind::Deployment, OptimizationType::All);
        p.spec.target_workload = None;
        p.spec.optimization_type = None;
        p.spec.max_change_percent = 0;
        p.spec.min_confidence = 1.5;
        let v = gate.violations(&p, None);
        assert!(v.contains(&GateViolation::MissingTarget));
        assert!(v.contains(&GateViolation::MissingOptimizationType));
        assert!(v.contains(&GateViolation::MaxChangePercentOutOfRange(0)));
        assert!(v.contains(&GateViolation::MinConfidenceOutOfRange(1.5)));

        p.spec.max_change_percent = 101;
        assert!(gate
            .violations(&p, None)
            .contains(&GateViolation::MaxChangePercentOutOfRange(101)));
    }

    #[test]
    fn test_dry_run_and_auto_apply_exclusive() {
        let gate = PolicyGate::default();
        let mut p = auto(policy(WorkloadKind::Deployment, OptimizationType::All));
        p.spec.dry_run = true;
        assert_eq!(gate.validate(&p, None), Err(GateViolation::DryRunWithAutoApply));
    }

    #[test]
    fn test_auto_apply_rules() {
        let gate = PolicyGate::default();

        let mut p = auto(policy(WorkloadKind::Deployment, OptimizationType::All));
        p.spec.max_risk_level = RiskLevel::High;
        assert_eq!(
            gate.validate(&p, None),
            Err(GateViolation::AutoApplyRiskTooHigh(RiskLevel::High))
        );

        let mut p = auto(policy(WorkloadKind::Deployment, OptimizationType::All));
        p.spec.max_change_percent = 81;
        assert_eq!(gate.validate(&p, None), Err(GateViolation::AutoApplyChangeTooLarge(81)));
        p.spec.max_change_percent = 80;
        assert_eq!(gate.validate(&p, None), Ok(()));

        let mut p = auto(policy(WorkloadKind::Deployment, OptimizationType::SpotMigration));
        p.spec.min_confidence = 0.75;
        assert_eq!(gate.validate(&p, None), Err(GateViolation::SpotAutoApplyLowConfidence(0.75)));
        p.spec.min_confidence = 0.8;
        assert_eq!(gate.validate(&p, None), Ok(()));

        let p = auto(policy(WorkloadKind::StatefulSet, OptimizationType::ReduceReplicas));
        assert_eq!(gate.validate(&p, None), Err(GateViolation::StatefulSetReplicaAutoApply));
        // Without autoApply the same policy is only advisory
        let p = policy(WorkloadKind::StatefulSet, OptimizationType::ReduceReplicas);
        assert_eq!(gate.validate(&p, None), Ok(()));

        let p = policy(WorkloadKind::DaemonSet, OptimizationType::ReduceReplicas);
        assert_eq!(gate.validate(&p, None), Err(GateViolation::DaemonSetReplicaChange));
    }

    #[test]
    fn test_protected_targets() {
        let gate = PolicyGate::default();
        let mut p = policy(WorkloadKind::Deployment, OptimizationType::All);
        p.spec.target_workload = Some(WorkloadRef::new(
            WorkloadKind::Deployment,
            "kube-system",
            "anything",
        ));
        let err = gate.validate(&p, None).unwrap_err();
        assert!(err.is_protected_target());

        p.spec.target_workload =
            Some(WorkloadRef::new(WorkloadKind::Deployment, "infra", "coredns"));
        assert_eq!(
            gate.validate(&p, None),
            Err(GateViolation::ProtectedWorkload("coredns".into()))
        );

        p.spec.target_workload = Some(WorkloadRef::new(WorkloadKind::Deployment, "shop", "web"));
        let mut w = workload(WorkloadKind::Deployment, Some(2), "1", "1Gi");
        w.labels.insert("app.kubernetes.io/component".into(), "controller".into());
        assert!(gate.validate(&p, None).is_ok());
        assert!(matches!(gate.validate(&p, Some(&w)), Err(GateViolation::ProtectedLabel(_))));
    }

    #[test]
    fn test_protected_target_parsing() {
        let t: ProtectedTarget = "payments".parse().unwrap();
        assert_eq!(t, ProtectedTarget::namespace("payments"));
        let t: ProtectedTarget = "*/ledger".parse().unwrap();
        assert_eq!(t, ProtectedTarget::name("ledger"));
        let t: ProtectedTarget = "*/app.kubernetes.io/component=controller".parse().unwrap();
        assert_eq!(t, ProtectedTarget::label("app.kubernetes.io/component", "controller"));
        assert_eq!(t.to_string(), "*/app.kubernetes.io/component=controller");
        assert!("*".parse::<ProtectedTarget>().is_err());

        let json = serde_json::to_string(&ProtectedTarget::name("ledger")).unwrap();
        assert_eq!(json, "\"*/ledger\"");

        let extra = ProtectedTargets::with_extra(vec![ProtectedTarget::namespace("payments")]);
        assert_eq!(extra.entries().len(), ProtectedTargets::default().entries().len() + 1);
    }

    #[test]
    fn test_check_apply_thresholds() {
        let gate = PolicyGate::default();
        let w = workload(WorkloadKind::Deployment, Some(3), "1", "1Gi");
        let p = auto(policy(WorkloadKind::Deployment, OptimizationType::All));

        let ok = recommendation(OptimizationType::RightSizeCpu, 0.9, RiskLevel::Low, 50.0);
        assert_eq!(gate.check_apply(&p, &ok, &w), GateDecision::Allow);

        let low = recommendation(OptimizationType::RightSizeCpu, 0.69, RiskLevel::Low, 10.0);
        assert!(matches!(
            gate.check_apply(&p, &low, &w),
            GateDecision::Skip(SkipReason::LowConfidence { .. })
        ));

        let risky = recommendation(OptimizationType::RightSizeCpu, 0.9, RiskLevel::High, 10.0);
        assert!(matches!(
            gate.check_apply(&p, &risky, &w),
            GateDecision::Skip(SkipReason::RiskTooHigh { .. })
        ));

        // maxChangePercent is inclusive
        let big = recommendation(OptimizationType::RightSizeCpu, 0.9, RiskLevel::Low, 50.1);
        assert!(matches!(
            gate.check_apply(&p, &big, &w),
            GateDecision::Skip(SkipReason::ChangeTooLarge { .. })
        ));

        let unused = recommendation(OptimizationType::RemoveUnused, 1.0, RiskLevel::Low, 100.0);
        assert!(matches!(
            gate.check_apply(&p, &unused, &w),
            GateDecision::Skip(SkipReason::Advisory(_))
        ));

        let mut dry = policy(WorkloadKind::Deployment, OptimizationType::All);
        dry.spec.dry_run = true;
        assert_eq!(gate.check_apply(&dry, &ok, &w), GateDecision::Skip(SkipReason::DryRun));
        assert_eq!(
            gate.check_apply(&policy(WorkloadKind::Deployment, OptimizationType::All), &ok, &w),
            GateDecision::Skip(SkipReason::AutoApplyDisabled)
        );
    }

    #[test]
    fn test_check_apply_never_reduces_statefulset_replicas() {
        let gate = PolicyGate::default();
        let w = workload(WorkloadKind::StatefulSet, Some(3), "1", "1Gi");
        let mut p = auto(policy(WorkloadKind::StatefulSet, OptimizationType::All));
        p.spec.manual_approval = true;
        let mut rec = recommendation(OptimizationType::ReduceReplicas, 0.95, RiskLevel::Low, 33.3);
        rec.changes.replicas = Some(2);
        assert_eq!(
            gate.check_apply(&p, &rec, &w),
            GateDecision::Skip(SkipReason::Violation(GateViolation::StatefulSetReplicaAutoApply))
        );
    }

    #[test]
    fn test_admission_defaults() {
        let mut p = policy(WorkloadKind::Deployment, OptimizationType::All);
        p.status.applied_optimizations = 4;
        p.status.phase = crate::models::Phase::Applied;
        p.metadata.generation = 0;
        apply_admission_defaults(&mut p);
        assert_eq!(p.status.phase, crate::models::Phase::Pending);
        assert_eq!(p.status.applied_optimizations, 0);
        assert_eq!(p.status.total_savings, 0.0);
        assert_eq!(p.metadata.generation, 1);
        assert!(p.metadata.creation_timestamp.is_some());
        assert_eq!(
            p.metadata.labels.get(LABEL_MANAGED_BY).map(String::as_str),
            Some(MANAGER_NAME)
        );
    }

    #[test]
    fn test_check_apply_detects_marker() {
        let gate = PolicyGate::default();
        let mut w = workload(WorkloadKind::Deployment, Some(3), "1", "1Gi");
        w.annotations.insert(
            crate::models::ANNOTATION_APPLIED_RECOMMENDATION.into(),
            "rec-test".into(),
        );
        let p = auto(policy(WorkloadKind::Deployment, OptimizationType::All));
        let rec = recommendation(OptimizationType::RightSizeCpu, 0.9, RiskLevel::Low, 10.0);
        assert_eq!(gate.check_apply(&p, &rec, &w), GateDecision::Skip(SkipReason::AlreadyApplied));
    }
}
