//! HTTP API: health checks, Prometheus metrics, policy objects and admission

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use operator_lib::{
    controller::PolicyStore,
    gate::{apply_admission_defaults, GateViolation, PolicyGate},
    health::{ComponentStatus, HealthRegistry},
    models::{OptimizationPolicy, PolicyKey, PolicySpec},
    observability::ControllerMetrics,
    workload::WorkloadApi,
    OptimizerError,
};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub metrics: ControllerMetrics,
    pub policies: Arc<dyn PolicyStore>,
    pub workloads: Arc<dyn WorkloadApi>,
    pub gate: Arc<PolicyGate>,
}

impl AppState {
    pub fn new(
        health_registry: HealthRegistry,
        metrics: ControllerMetrics,
        policies: Arc<dyn PolicyStore>,
        workloads: Arc<dyn WorkloadApi>,
        gate: Arc<PolicyGate>,
    ) -> Self {
        Self {
            health_registry,
            metrics,
            policies,
            workloads,
            gate,
        }
    }

    /// Run the admission rules against `policy`, resolving the target for label checks
    async fn admit(&self, policy: &OptimizationPolicy) -> Vec<GateViolation> {
        let workload = match &policy.spec.target_workload {
            Some(target) => self.workloads.get(target).await.ok(),
            None => None,
        };
        self.gate.violations(policy, workload.as_ref())
    }
}

/// JSON error body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<String>,
}

pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    fn new(status: StatusCode, error: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                error: error.into(),
                violations: Vec::new(),
            },
        }
    }

    /// 403 when a protected target is involved, 400 otherwise
    fn rejected(violations: &[GateViolation]) -> Self {
        let status = if violations.iter().any(GateViolation::is_protected_target) {
            StatusCode::FORBIDDEN
        } else {
            StatusCode::BAD_REQUEST
        };
        let messages: Vec<String> = violations.iter().map(|v| v.to_string()).collect();
        Self {
            status,
            body: ErrorBody {
                error: messages.first().cloned().unwrap_or_default(),
                violations: messages,
            },
        }
    }
}

impl From<OptimizerError> for ApiError {
    fn from(err: OptimizerError) -> Self {
        match err {
            OptimizerError::NotFound(_) => Self::new(StatusCode::NOT_FOUND, err.to_string()),
            OptimizerError::AlreadyExists(_) => Self::new(StatusCode::CONFLICT, err.to_string()),
            OptimizerError::Validation(v) => Self::rejected(&[v]),
            other => {
                warn!(error = %other, "Policy request failed");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, other.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

/// Health check response - returns 200 if healthy, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK, // Still operational
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 if ready, 503 if not ready
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

async fn list_policies(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<OptimizationPolicy>>, ApiError> {
    Ok(Json(state.policies.list().await?))
}

async fn get_policy(
    State(state): State<Arc<AppState>>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<OptimizationPolicy>, ApiError> {
    let key = PolicyKey::new(namespace, name);
    state
        .policies
        .get(&key)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, format!("policy {} not found", key)))
}

async fn create_policy(
    State(state): State<Arc<AppState>>,
    Json(mut policy): Json<OptimizationPolicy>,
) -> Result<(StatusCode, Json<OptimizationPolicy>), ApiError> {
    apply_admission_defaults(&mut policy);
    let violations = state.admit(&policy).await;
    if !violations.is_empty() {
        info!(
            policy = %policy.key(),
            violations = violations.len(),
            "Policy rejected at admission"
        );
        return Err(ApiError::rejected(&violations));
    }

    let created = state.policies.create(policy).await?;
    state.metrics.inc_policies_created();
    info!(policy = %created.key(), "Policy created");
    Ok((StatusCode::CREATED, Json(created)))
}

async fn update_policy(
    State(state): State<Arc<AppState>>,
    Path((namespace, name)): Path<(String, String)>,
    Json(spec): Json<PolicySpec>,
) -> Result<Json<OptimizationPolicy>, ApiError> {
    let key = PolicyKey::new(namespace, name);
    let mut candidate = state
        .policies
        .get(&key)
        .await?
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, format!("policy {} not found", key)))?;
    if candidate.is_deleting() {
        return Err(ApiError::new(
            StatusCode::CONFLICT,
            format!("policy {} is being deleted", key),
        ));
    }
    candidate.spec = spec.clone();
    let violations = state.admit(&candidate).await;
    if !violations.is_empty() {
        return Err(ApiError::rejected(&violations));
    }

    Ok(Json(state.policies.update_spec(&key, spec).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct DeleteParams {
    /// Drop the object without rolling back, for policies stuck on a failed rollback
    #[serde(default)]
    pub force: bool,
}

async fn delete_policy(
    State(state): State<Arc<AppState>>,
    Path((namespace, name)): Path<(String, String)>,
    Query(params): Query<DeleteParams>,
) -> Result<Response, ApiError> {
    let key = PolicyKey::new(namespace, name);
    let policy = state.policies.request_deletion(&key).await?;
    if params.force {
        warn!(policy = %key, "Policy force-deleted without rollback");
        state.policies.finalize(&key).await?;
        return Ok(StatusCode::NO_CONTENT.into_response());
    }
    Ok((StatusCode::ACCEPTED, Json(policy)).into_response())
}

/// Admission-review style answer
#[derive(Debug, Serialize, Deserialize)]
pub struct ValidationResponse {
    pub allowed: bool,
    pub code: u16,
    pub message: String,
}

async fn validate_policy(
    State(state): State<Arc<AppState>>,
    Json(mut policy): Json<OptimizationPolicy>,
) -> Json<ValidationResponse> {
    apply_admission_defaults(&mut policy);
    let violations = state.admit(&policy).await;
    if violations.is_empty() {
        return Json(ValidationResponse {
            allowed: true,
            code: StatusCode::OK.as_u16(),
            message: "policy is valid".to_string(),
        });
    }
    let rejected = ApiError::rejected(&violations);
    Json(ValidationResponse {
        allowed: false,
        code: rejected.status.as_u16(),
        message: rejected.body.violations.join("; "),
    })
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/api/v1/policies", get(list_policies).post(create_policy))
        .route(
            "/api/v1/policies/:namespace/:name",
            get(get_policy).put(update_policy).delete(delete_policy),
        )
        .route("/api/v1/validate", post(validate_policy))
        .with_state(state)
}

/// Start the API server
pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
