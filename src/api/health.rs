/// Liveness, readiness and component health
///
/// Liveness only proves the process answers. Readiness requires the
/// database. The detailed report also flags rotating action points whose key
/// is overdue, which means the rotation job has stopped running.

use crate::{context::AppContext, error::GateResult, metrics};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Instant;

/// Ordered so the worst component decides the overall state
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentReport {
    pub component: String,
    pub health: Health,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub problem: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ComponentReport {
    fn new(component: &str, health: Health) -> Self {
        Self {
            component: component.to_string(),
            health,
            latency_ms: None,
            problem: None,
            details: None,
        }
    }

    fn timed(mut self, started: Instant) -> Self {
        self.latency_ms = Some(started.elapsed().as_millis() as u64);
        self
    }

    fn problem(mut self, problem: impl Into<String>) -> Self {
        self.problem = Some(problem.into());
        self
    }

    fn details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub health: Health,
    pub version: String,
    pub uptime_seconds: f64,
    pub components: Vec<ComponentReport>,
}

pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/health", get(health_basic))
        .route("/health/live", get(liveness))
        .route("/health/ready", get(readiness))
        .route("/health/detailed", get(health_detailed))
        .route("/metrics", get(metrics_endpoint))
}

pub async fn health_basic() -> Json<Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

pub async fn liveness() -> Json<Value> {
    Json(json!({ "status": "alive" }))
}

/// 503 until the database answers
pub async fn readiness(State(ctx): State<AppContext>) -> Result<Json<Value>, StatusCode> {
    crate::db::test_connection(&ctx.db).await.map_err(|e| {
        tracing::warn!(error = %e, "Readiness check failed on the database");
        StatusCode::SERVICE_UNAVAILABLE
    })?;
    Ok(Json(json!({ "status": "ready" })))
}

/// Prometheus scrape endpoint
pub async fn metrics_endpoint() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render_metrics(),
    )
}

pub async fn health_detailed(State(ctx): State<AppContext>) -> (StatusCode, Json<HealthReport>) {
    let (database, rotation) = futures::join!(database_report(&ctx), rotation_report(&ctx));
    let components = vec![database, sms_report(&ctx), rotation];
    let health = overall(&components);

    if health != Health::Healthy {
        tracing::warn!(?health, "Detailed health check found problems");
    }

    let status = match health {
        Health::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    let report = HealthReport {
        health,
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: metrics::uptime_seconds(),
        components,
    };
    (status, Json(report))
}

async fn database_report(ctx: &AppContext) -> ComponentReport {
    let started = Instant::now();
    match crate::db::test_connection(&ctx.db).await {
        Ok(()) => ComponentReport::new("database", Health::Healthy)
            .details(json!({ "connections": ctx.db.size() })),
        Err(e) => ComponentReport::new("database", Health::Unhealthy).problem(e.to_string()),
    }
    .timed(started)
}

fn sms_report(ctx: &AppContext) -> ComponentReport {
    ComponentReport::new("sms_gateway", Health::Healthy).details(json!({
        "provider": ctx.sms_gateway.name(),
        "virtual_number": ctx.sms_gateway.virtual_number(),
    }))
}

/// Rotating points whose key is more than two intervals old
async fn overdue_rotations(ctx: &AppContext, now: DateTime<Utc>) -> GateResult<usize> {
    let rows: Vec<(DateTime<Utc>, i64)> = sqlx::query_as(
        "SELECT rotated_at, qr_rotation_minutes FROM qr_action_point
         WHERE is_active = 1 AND qr_rotation_minutes > 0",
    )
    .fetch_all(&ctx.db)
    .await?;

    Ok(rows
        .into_iter()
        .filter(|(rotated_at, minutes)| *rotated_at + Duration::minutes(minutes * 2) < now)
        .count())
}

async fn rotation_report(ctx: &AppContext) -> ComponentReport {
    let started = Instant::now();
    match overdue_rotations(ctx, Utc::now()).await {
        Ok(0) => ComponentReport::new("action_point_rotation", Health::Healthy),
        // Scans still validate against the old key
        Ok(overdue) => ComponentReport::new("action_point_rotation", Health::Degraded)
            .problem(format!("{} action points overdue for rotation", overdue))
            .details(json!({ "overdue": overdue })),
        Err(e) => {
            ComponentReport::new("action_point_rotation", Health::Unhealthy).problem(e.to_string())
        }
    }
    .timed(started)
}

fn overall(components: &[ComponentReport]) -> Health {
    components
        .iter()
        .map(|c| c.health)
        .max()
        .unwrap_or(Health::Healthy)
}
