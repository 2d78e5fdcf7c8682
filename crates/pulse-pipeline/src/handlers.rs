//! HTTP handlers for the pipeline surface

use crate::context::AppContext;
use crate::health::OverallHealth;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use pulse_common::time::parse_timestamp;
use pulse_common::{Error, IngestRequest};
use pulse_store::MetricQuery;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Shared state for handlers
pub type AppState = Arc<AppContext>;

/// Build the router with all endpoints
pub fn create_router(context: AppState) -> Router {
    Router::new()
        .route("/health", get(health_report))
        .route("/health/live", get(liveness))
        .route("/v1/ingest", post(ingest))
        .route("/v1/metrics/query", get(query_metrics))
        .route("/v1/forecast", post(run_forecast))
        .route("/v1/detect", post(detect_anomalies))
        .route("/v1/evaluate", post(evaluate_rules))
        .route("/v1/rules", post(upsert_rule).get(list_rules))
        .route("/v1/rules/:rule_id", axum::routing::delete(delete_rule))
        .route("/v1/alerts/:alert_id/ack", post(acknowledge_alert))
        .route("/v1/alerts/:alert_id/resolve", post(resolve_alert))
        .route("/v1/alerts/:alert_id/history", get(alert_history))
        .route("/v1/stats/:tenant_id", get(tenant_stats))
        .with_state(context)
}

fn error_response(error: &Error) -> Response {
    let status = match error {
        Error::Validation(_) | Error::Configuration(_) => StatusCode::BAD_REQUEST,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
        Error::UpstreamUnavailable(_) | Error::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        Error::Timeout(_) | Error::PoolTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        Error::InsufficientData(_) => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let body = json!({
        "code": error.wire_code(),
        "message": error.to_string(),
        "retryable": error.is_retryable(),
    });
    (status, Json(body)).into_response()
}

async fn liveness() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn health_report(State(context): State<AppState>) -> Response {
    let report = context.health.check_all().await;
    let status = match report.overall {
        OverallHealth::Healthy | OverallHealth::Degraded => StatusCode::OK,
        OverallHealth::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    let pool = context.pool.stats();
    let body = json!({
        "overall": report.overall,
        "probes": report.probes,
        "checked_at": report.checked_at,
        "pool": {
            "max_size": pool.max_size,
            "in_use": pool.in_use,
            "idle": pool.idle,
            "acquired_total": pool.acquired_total,
            "timeouts_total": pool.timeouts_total,
        },
    });
    (status, Json(body)).into_response()
}

async fn ingest(
    State(context): State<AppState>,
    Json(request): Json<IngestRequest>,
) -> Response {
    debug!(
        "ingest request from tenant {} with {} item(s)",
        request.tenant_id,
        request.metrics.len()
    );
    let response = context.ingest.ingest(request).await;
    let status = if response.success || response.accepted > 0 {
        StatusCode::OK
    } else {
        StatusCode::BAD_REQUEST
    };
    (status, Json(response)).into_response()
}

#[derive(Debug, Deserialize)]
struct MetricsQueryParams {
    tenant_id: String,
    #[serde(default)]
    metric_key: Option<String>,
    #[serde(default)]
    start: Option<String>,
    #[serde(default)]
    end: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    offset: Option<usize>,
}

async fn query_metrics(
    State(context): State<AppState>,
    Query(params): Query<MetricsQueryParams>,
) -> Response {
    let start = match params.start.as_deref().map(parse_timestamp).transpose() {
        Ok(start) => start,
        Err(e) => return error_response(&e),
    };
    let end = match params.end.as_deref().map(parse_timestamp).transpose() {
        Ok(end) => end,
        Err(e) => return error_response(&e),
    };

    let query = MetricQuery {
        tenant_id: params.tenant_id,
        metric_key: params.metric_key,
        start,
        end,
        dimension_filters: Default::default(),
        limit: params.limit.unwrap_or(1_000),
        offset: params.offset.unwrap_or(0),
    };
    match context.metric_store.query(&query).await {
        Ok(points) => Json(json!({"count": points.len(), "points": points})).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn run_forecast(
    State(context): State<AppState>,
    Json(request): Json<pulse_common::ForecastRequest>,
) -> Response {
    match context.run_forecast(request).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
struct DetectPayload {
    tenant_id: String,
    metric_key: String,
    #[serde(default)]
    dimensions: pulse_common::Dimensions,
    #[serde(default = "default_sensitivity")]
    sensitivity: f64,
}

fn default_sensitivity() -> f64 {
    0.5
}

async fn detect_anomalies(
    State(context): State<AppState>,
    Json(payload): Json<DetectPayload>,
) -> Response {
    match context
        .detect_anomalies(
            &payload.tenant_id,
            &payload.metric_key,
            &payload.dimensions,
            payload.sensitivity,
        )
        .await
    {
        Ok(result) => Json(result).into_response(),
        Err(e) => error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
struct EvaluatePayload {
    tenant_id: String,
    metric_key: String,
    #[serde(default)]
    dimensions: pulse_common::Dimensions,
}

async fn evaluate_rules(
    State(context): State<AppState>,
    Json(payload): Json<EvaluatePayload>,
) -> Response {
    match context
        .evaluate_latest(&payload.tenant_id, &payload.metric_key, &payload.dimensions)
        .await
    {
        Ok(processed) => {
            let summary: Vec<_> = processed
                .iter()
                .map(|p| {
                    json!({
                        "rule_id": p.rule_id,
                        "alert_id": p.alert_id,
                        "verdict": format!("{:?}", p.verdict),
                        "channels_attempted": p.dispatch.len(),
                    })
                })
                .collect();
            Json(json!({"alerts": summary})).into_response()
        }
        Err(e) => error_response(&e),
    }
}

async fn upsert_rule(
    State(context): State<AppState>,
    Json(rule): Json<pulse_common::AlertRule>,
) -> Response {
    match context.upsert_rule(rule).await {
        Ok(()) => (StatusCode::NO_CONTENT, ()).into_response(),
        Err(e) => error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
struct ListRulesParams {
    #[serde(default)]
    tenant_id: Option<String>,
}

async fn list_rules(
    State(context): State<AppState>,
    Query(params): Query<ListRulesParams>,
) -> Response {
    let rules = context.rules.list_rules(params.tenant_id.as_deref()).await;
    let rules: Vec<_> = rules.iter().map(|r| r.as_ref().clone()).collect();
    Json(json!({"count": rules.len(), "rules": rules})).into_response()
}

async fn delete_rule(
    State(context): State<AppState>,
    Path(rule_id): Path<String>,
) -> Response {
    match context.delete_rule(&rule_id).await {
        Ok(true) => (StatusCode::NO_CONTENT, ()).into_response(),
        Ok(false) => error_response(&Error::NotFound(format!("rule {}", rule_id))),
        Err(e) => error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
struct ActorPayload {
    actor: String,
    #[serde(default)]
    reason: Option<String>,
}

async fn acknowledge_alert(
    State(context): State<AppState>,
    Path(alert_id): Path<Uuid>,
    Json(payload): Json<ActorPayload>,
) -> Response {
    match context
        .alerts
        .lifecycle()
        .acknowledge(alert_id, &payload.actor)
        .await
    {
        Ok(state) => Json(state).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn resolve_alert(
    State(context): State<AppState>,
    Path(alert_id): Path<Uuid>,
    Json(payload): Json<ActorPayload>,
) -> Response {
    match context
        .alerts
        .lifecycle()
        .resolve(alert_id, &payload.actor, payload.reason.as_deref())
        .await
    {
        Ok(state) => Json(state).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn alert_history(
    State(context): State<AppState>,
    Path(alert_id): Path<Uuid>,
) -> Response {
    match context.alerts.lifecycle().history(alert_id).await {
        Ok(transitions) => Json(json!({"transitions": transitions})).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn tenant_stats(
    State(context): State<AppState>,
    Path(tenant_id): Path<String>,
) -> Response {
    match context.alerts.lifecycle().stats(&tenant_id).await {
        Ok(stats) => Json(json!({
            "by_status": stats.by_status,
            "by_severity": stats.by_severity,
            "mttr_ms": stats.mttr_ms,
            "mtfr_ms": stats.mtfr_ms,
        }))
        .into_response(),
        Err(e) => error_response(&e),
    }
}
