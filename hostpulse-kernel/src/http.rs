/*!
 * HostPulse query API
 *
 * Read-only JSON over HTTP on top of the metrics repository:
 * - GET /metrics?hostname=&from_time=&to_time=&limit=&offset=
 * - GET /metrics/latest?hostname=
 * - GET /metrics/latest/all (newest sample of every host)
 * - GET /hosts, /hosts/{hostname}, /hosts/{hostname}/metrics
 * - GET /health (always open), /system/health
 *
 * When an API key is configured every route but /health requires the
 * `x-api-key` header.
 */

use crate::error::ApiError;
use crate::health::{HealthTracker, KernelHealth};
use crate::repository::{MetricQuery, MetricsRepository};
use crate::store::MetricStore;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Path, Query, Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use hostpulse_bus::{Host, MetricMessage};
use serde::{Deserialize, Serialize};

#[derive(Clone)]
pub struct AppState {
    pub repository: MetricsRepository,
    pub store: MetricStore,
    pub health_tracker: HealthTracker,
    pub api_key: Option<String>,
}

impl AppState {
    pub fn new(store: MetricStore, health_tracker: HealthTracker, api_key: Option<String>) -> Self {
        Self {
            repository: MetricsRepository::new(store.pool().clone()),
            store,
            health_tracker,
            api_key: api_key.filter(|key| !key.is_empty()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListParams {
    hostname: Option<String>,
    from_time: Option<String>,
    to_time: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct HostParams {
    hostname: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MetricsResponse {
    pub metrics: Vec<MetricMessage>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LatestResponse {
    pub metric: Option<MetricMessage>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HostsResponse {
    pub hosts: Vec<Host>,
}

async fn require_api_key(
    State(app): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = app.api_key.as_deref() else {
        return Ok(next.run(req).await);
    };

    // liveness stays open
    if req.uri().path() == "/health" {
        return Ok(next.run(req).await);
    }

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == expected);

    if !ok {
        tracing::warn!(path = %req.uri().path(), "rejected request without valid API key");
        return Err(ApiError::Unauthorized);
    }
    Ok(next.run(req).await)
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/metrics", get(list_metrics))
        .route("/metrics/latest", get(latest_metrics))
        .route("/metrics/latest/all", get(latest_per_host))
        .route("/hosts", get(list_hosts))
        .route("/hosts/{hostname}", get(get_host))
        .route("/hosts/{hostname}/metrics", get(metrics_by_host))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_api_key))
        .with_state(app_state)
}

fn query_params<T>(params: Result<Query<T>, QueryRejection>) -> Result<T, ApiError> {
    params
        .map(|Query(p)| p)
        .map_err(|e| ApiError::InvalidArgument(e.body_text()))
}

// GET /metrics
async fn list_metrics(
    State(app): State<AppState>,
    params: Result<Query<ListParams>, QueryRejection>,
) -> Result<Json<MetricsResponse>, ApiError> {
    let params = query_params(params)?;
    let query = MetricQuery::parse(
        params.hostname.as_deref().unwrap_or_default(),
        params.from_time.as_deref(),
        params.to_time.as_deref(),
        params.limit.unwrap_or(0),
        params.offset.unwrap_or(0),
    )?;
    let metrics = app.repository.list_metrics(&query).await?;
    Ok(Json(MetricsResponse { metrics }))
}

// GET /metrics/latest
async fn latest_metrics(
    State(app): State<AppState>,
    params: Result<Query<HostParams>, QueryRejection>,
) -> Result<Json<LatestResponse>, ApiError> {
    let params = query_params(params)?;
    let metric = app
        .repository
        .latest_metric(params.hostname.as_deref().unwrap_or_default())
        .await?;
    Ok(Json(LatestResponse { metric }))
}

// GET /metrics/latest/all
async fn latest_per_host(State(app): State<AppState>) -> Result<Json<MetricsResponse>, ApiError> {
    let metrics = app.repository.latest_per_host().await?;
    Ok(Json(MetricsResponse { metrics }))
}

// GET /hosts/{hostname}/metrics
async fn metrics_by_host(
    State(app): State<AppState>,
    Path(hostname): Path<String>,
) -> Result<Json<MetricsResponse>, ApiError> {
    let metrics = app.repository.metrics_by_host(&hostname).await?;
    Ok(Json(MetricsResponse { metrics }))
}

// GET /hosts
async fn list_hosts(State(app): State<AppState>) -> Result<Json<HostsResponse>, ApiError> {
    let hosts = app.repository.list_hosts().await?;
    Ok(Json(HostsResponse { hosts }))
}

// GET /hosts/{hostname}
async fn get_host(
    State(app): State<AppState>,
    Path(hostname): Path<String>,
) -> Result<Json<Host>, ApiError> {
    app.repository
        .host(&hostname)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("host {hostname}")))
}

// GET /system/health
async fn get_system_health(State(app): State<AppState>) -> Json<KernelHealth> {
    Json(app.health_tracker.get_health(&app.store).await)
}
