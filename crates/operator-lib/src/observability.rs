//! Observability infrastructure for the optimization operator
//!
//! Provides:
//! - Prometheus metrics (policy, apply, failure and rollback counters, savings gauge,
//!   analysis-to-apply latency)
//! - Structured JSON logging with tracing

use prometheus::{
    register_gauge, register_histogram, register_int_counter, register_int_counter_vec,
    register_int_gauge, Gauge, Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::error::ErrorClass;
use crate::models::{OptimizationType, Phase, PolicyKey, Recommendation, WorkloadRef};

/// Histogram buckets for the analysis-to-apply cycle (in seconds)
const CYCLE_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<ControllerMetricsInner> = OnceLock::new();

struct ControllerMetricsInner {
    policies_created: IntCounter,
    optimizations_applied: IntCounterVec,
    optimizations_failed: IntCounterVec,
    rollbacks: IntCounter,
    total_monthly_savings: Gauge,
    analysis_to_apply_seconds: Histogram,
    reconciliations: IntCounterVec,
    active_policies: IntGauge,
    leader: IntGauge,
    degraded_writes: IntCounterVec,
}

impl ControllerMetricsInner {
    fn new() -> Self {
        Self {
            policies_created: register_int_counter!(
                "costopt_policies_created_total",
                "Number of optimization policies admitted"
            )
            .expect("Failed to register policies_created_total"),

            optimizations_applied: register_int_counter_vec!(
                "costopt_optimizations_applied_total",
                "Number of optimizations applied to workloads",
                &["optimization_type"]
            )
            .expect("Failed to register optimizations_applied_total"),

            optimizations_failed: register_int_counter_vec!(
                "costopt_optimizations_failed_total",
                "Number of failed reconciliation steps by error class",
                &["reason"]
            )
            .expect("Failed to register optimizations_failed_total"),

            rollbacks: register_int_counter!(
                "costopt_rollbacks_total",
                "Number of rollbacks executed"
            )
            .expect("Failed to register rollbacks_total"),

            total_monthly_savings: register_gauge!(
                "costopt_total_monthly_savings_usd",
                "Monthly savings of applied optimizations currently in effect"
            )
            .expect("Failed to register total_monthly_savings_usd"),

            analysis_to_apply_seconds: register_histogram!(
                "costopt_analysis_to_apply_seconds",
                "Time from the start of analysis to a committed apply",
                CYCLE_BUCKETS.to_vec()
            )
            .expect("Failed to register analysis_to_apply_seconds"),

            reconciliations: register_int_counter_vec!(
                "costopt_reconciliations_total",
                "Reconciliation cycles by trigger",
                &["trigger"]
            )
            .expect("Failed to register reconciliations_total"),

            active_policies: register_int_gauge!(
                "costopt_active_policies",
                "Policies with a running reconciliation task"
            )
            .expect("Failed to register active_policies"),

            leader: register_int_gauge!(
                "costopt_leader",
                "1 while this instance holds the controller lease"
            )
            .expect("Failed to register leader"),

            degraded_writes: register_int_counter_vec!(
                "costopt_rollback_store_degraded_writes_total",
                "Rollback record writes that reached only one backing store",
                &["store"]
            )
            .expect("Failed to register rollback_store_degraded_writes_total"),
        }
    }
}

/// Controller metrics for Prometheus exposition
///
/// Lightweight handle to the global metrics instance; clones share the
/// same underlying metrics.
#[derive(Clone)]
pub struct ControllerMetrics {
    _private: (),
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ControllerMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(ControllerMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &ControllerMetricsInner {
        GLOBAL_METRICS.get_or_init(ControllerMetricsInner::new)
    }

    pub fn inc_policies_created(&self) {
        self.inner().policies_created.inc();
    }

    pub fn inc_applied(&self, optimization_type: OptimizationType) {
        self.inner()
            .optimizations_applied
            .with_label_values(&[optimization_type.as_str()])
            .inc();
    }

    pub fn inc_failed(&self, class: ErrorClass) {
        self.inner()
            .optimizations_failed
            .with_label_values(&[class.as_str()])
            .inc();
    }

    pub fn inc_rollbacks(&self) {
        self.inner().rollbacks.inc();
    }

    pub fn add_savings(&self, monthly: f64) {
        self.inner().total_monthly_savings.add(monthly);
    }

    /// Take back savings undone by a rollback
    pub fn sub_savings(&self, monthly: f64) {
        self.inner().total_monthly_savings.sub(monthly);
    }

    pub fn set_savings(&self, monthly: f64) {
        self.inner().total_monthly_savings.set(monthly);
    }

    pub fn observe_analysis_to_apply(&self, elapsed: Duration) {
        self.inner()
            .analysis_to_apply_seconds
            .observe(elapsed.as_secs_f64());
    }

    pub fn inc_reconciliations(&self, trigger: &str) {
        self.inner()
            .reconciliations
            .with_label_values(&[trigger])
            .inc();
    }

    pub fn set_active_policies(&self, count: i64) {
        self.inner().active_policies.set(count);
    }

    pub fn set_leader(&self, leader: bool) {
        self.inner().leader.set(i64::from(leader));
    }

    pub fn inc_degraded_write(&self, store: &str) {
        self.inner()
            .degraded_writes
            .with_label_values(&[store])
            .inc();
    }
}

/// Structured logger for controller events
///
/// One JSON event per lifecycle moment of a policy, tagged with the
/// controller instance.
#[derive(Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Log operator startup
    pub fn log_startup(&self, version: &str, policies: usize) {
        info!(
            event = "operator_started",
            instance = %self.instance,
            version = %version,
            policies = policies,
            "Cost optimization operator started"
        );
    }

    /// Log operator shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "operator_shutdown",
            instance = %self.instance,
            reason = %reason,
            "Cost optimization operator shutting down"
        );
    }

    /// Log a leadership change
    pub fn log_leadership(&self, leader: bool) {
        if leader {
            info!(
                event = "leadership_acquired",
                instance = %self.instance,
                "Acquired controller lease, reconciling policies"
            );
        } else {
            warn!(
                event = "leadership_lost",
                instance = %self.instance,
                "Controller lease lost, standing by"
            );
        }
    }

    pub fn log_phase_transition(&self, policy: &PolicyKey, from: Phase, to: Phase, message: &str) {
        info!(
            event = "phase_transition",
            instance = %self.instance,
            policy = %policy,
            from = %from,
            to = %to,
            message = %message,
            "Policy phase changed"
        );
    }

    pub fn log_recommendation(&self, policy: &PolicyKey, rec: &Recommendation) {
        info!(
            event = "recommendation_produced",
            instance = %self.instance,
            policy = %policy,
            recommendation_id = %rec.id,
            optimization_type = %rec.optimization_type,
            monthly_savings = rec.monthly_savings,
            confidence = rec.confidence,
            risk = %rec.risk.level,
            "Recommendation produced"
        );
    }

    pub fn log_applied(&self, policy: &PolicyKey, workload: &WorkloadRef, rec: &Recommendation) {
        info!(
            event = "optimization_applied",
            instance = %self.instance,
            policy = %policy,
            workload = %workload,
            recommendation_id = %rec.id,
            optimization_type = %rec.optimization_type,
            monthly_savings = rec.monthly_savings,
            "Optimization applied"
        );
    }

    pub fn log_apply_skipped(&self, policy: &PolicyKey, recommendation_id: &str, reason: &str) {
        info!(
            event = "apply_skipped",
            instance = %self.instance,
            policy = %policy,
            recommendation_id = %recommendation_id,
            reason = %reason,
            "Recommendation not applied"
        );
    }

    pub fn log_rollback(
        &self,
        policy: &PolicyKey,
        workload: &WorkloadRef,
        success: bool,
        details: &str,
    ) {
        if success {
            info!(
                event = "rollback_executed",
                instance = %self.instance,
                policy = %policy,
                workload = %workload,
                "Workload restored to its pre-optimization spec"
            );
        } else {
            error!(
                event = "rollback_failed",
                instance = %self.instance,
                policy = %policy,
                workload = %workload,
                details = %details,
                "Rollback did not converge, manual intervention required"
            );
        }
    }

    pub fn log_failure(
        &self,
        policy: &PolicyKey,
        class: ErrorClass,
        message: &str,
        retry_in: Option<Duration>,
    ) {
        warn!(
            event = "reconcile_failed",
            instance = %self.instance,
            policy = %policy,
            class = %class,
            message = %message,
            retry_in_secs = ?retry_in.map(|d| d.as_secs()),
            "Reconciliation step failed"
        );
    }

    /// Log a rollback record that reached only one backing store
    pub fn log_degraded_write(&self, workload: &WorkloadRef, failed_store: &str, reason: &str) {
        warn!(
            event = "rollback_store_degraded",
            instance = %self.instance,
            workload = %workload,
            failed_store = %failed_store,
            reason = %reason,
            "Rollback record written to a single store"
        );
    }
}
