//! HTTP API for health checks, Prometheus metrics and offender state

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use guard_lib::{
    health::{ComponentStatus, HealthRegistry},
    observability::GuardMetrics,
    pipeline::Pipeline,
    AgentStatus,
};
use std::sync::Arc;
use tracing::{error, info};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub metrics: GuardMetrics,
    pub pipeline: Arc<Pipeline>,
    pub host: String,
    pub backend: String,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        health_registry: HealthRegistry,
        metrics: GuardMetrics,
        pipeline: Arc<Pipeline>,
        host: impl Into<String>,
        backend: impl Into<String>,
    ) -> Self {
        Self {
            health_registry,
            metrics,
            pipeline,
            host: host.into(),
            backend: backend.into(),
            started_at: Utc::now(),
        }
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
async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    match state.metrics.gather_text() {
        Ok(text) => (
            StatusCode::OK,
            [("content-type", "text/plain; charset=utf-8")],
            text,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// Every tracked source, banned or not
async fn offenders(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.pipeline.tracker().offenders())
}

async fn bans(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.pipeline.tracker().bans())
}

async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let tracker = state.pipeline.tracker();
    let stats = tracker.stats();

    Json(AgentStatus {
        agent_version: env!("CARGO_PKG_VERSION").to_string(),
        host: state.host.clone(),
        backend: state.backend.clone(),
        model_version: state.pipeline.classifier().version(),
        tracked: stats.tracked,
        banned: stats.banned,
        enforcement_pending: state.pipeline.enforcer().parked(),
        naughty_count: tracker.config().naughty_count,
        ban_duration_minutes: tracker.config().ban_duration_minutes,
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
    })
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/api/v1/offenders", get(offenders))
        .route("/api/v1/bans", get(bans))
        .route("/api/v1/status", get(status))
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
