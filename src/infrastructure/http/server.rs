//! Control-plane HTTP surface: a thin axum router over `Controller`/`AlertRouter`.
//!
//! New relative to the teacher, which only exposes push-based metrics. Grounded on
//! `examples/hot3246624-pm_as_ofi/src/admin.rs`'s `Router`/`State`/handler shape.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde_json::{json, Value};

use crate::application::alert_router::{AlertRouter, WebhookAlert};
use crate::application::controller::Controller;
use crate::domain::errors::CoreError;
use crate::domain::grid::types::GridParameters;
use crate::infrastructure::metrics::GridMetrics;

#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<Controller>,
    pub alert_router: Arc<AlertRouter>,
    pub metrics: Arc<GridMetrics>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/api/status", get(status))
        .route("/api/grids", get(all_grids))
        .route("/api/grids/{symbol}", get(one_grid))
        .route("/api/grids/{symbol}/start", post(start_symbol))
        .route("/api/pause", post(pause_all))
        .route("/api/pause/{symbol}", post(pause_symbol))
        .route("/api/resume", post(resume_all))
        .route("/api/resume/{symbol}", post(resume_symbol))
        .route("/api/rebalance", post(rebalance_all))
        .route("/api/deploy", post(deploy))
        .route("/api/risk", get(risk))
        .route("/api/kill", post(kill))
        .route("/api/reset-kill", post(reset_kill))
        .route("/api/prices", get(prices))
        .route("/api/tv-alert", post(tv_alert))
        .route("/api/alerts", get(alerts))
        .with_state(state)
}

fn core_error_status(err: &CoreError) -> StatusCode {
    match err {
        CoreError::UnknownSymbol(_) => StatusCode::NOT_FOUND,
        CoreError::KilledByRisk { .. } => StatusCode::FORBIDDEN,
        CoreError::StopLossTripped { .. } => StatusCode::FORBIDDEN,
        CoreError::InvalidParameters(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "grid_engine": "up",
        "risk_manager": "up",
        "ts": Utc::now(),
    }))
}

async fn metrics(State(state): State<AppState>) -> (StatusCode, [(axum::http::HeaderName, &'static str); 1], String) {
    let grids = state.controller.all_grid_snapshots().await;
    let risk = state.controller.risk_snapshot().await;
    let body = state.metrics.render(&grids, &risk);
    (StatusCode::OK, [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}

async fn status(State(state): State<AppState>) -> Json<Value> {
    let grids = state.controller.all_grid_snapshots().await;
    let risk = state.controller.risk_snapshot().await;
    Json(json!({ "grids": grids, "risk": risk, "ts": Utc::now() }))
}

async fn all_grids(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.controller.all_grid_snapshots().await))
}

async fn one_grid(State(state): State<AppState>, Path(symbol): Path<String>) -> (StatusCode, Json<Value>) {
    match state.controller.grid_snapshot(&symbol).await {
        Some(snap) => (StatusCode::OK, Json(json!(snap))),
        None => (StatusCode::NOT_FOUND, Json(json!({ "error": "unknown symbol" }))),
    }
}

async fn start_symbol(State(state): State<AppState>, Path(symbol): Path<String>) -> (StatusCode, Json<Value>) {
    match state.controller.start(&symbol).await {
        Ok(result) => (StatusCode::OK, Json(json!({ "status": "started", "symbol": symbol, "result": result }))),
        Err(e @ (CoreError::StopLossTripped { .. } | CoreError::KilledByRisk { .. })) => (
            StatusCode::FORBIDDEN,
            Json(json!({ "status": "blocked", "reason": e.to_string() })),
        ),
        Err(e) => (core_error_status(&e), Json(json!({ "error": e.to_string() }))),
    }
}

async fn pause_all(State(state): State<AppState>) -> Json<Value> {
    Json(json!(result_map(state.controller.pause_all().await)))
}

async fn pause_symbol(State(state): State<AppState>, Path(symbol): Path<String>) -> (StatusCode, Json<Value>) {
    one_symbol_result(state.controller.pause(&symbol).await)
}

async fn resume_all(State(state): State<AppState>) -> Json<Value> {
    Json(json!(result_map(state.controller.resume_all().await)))
}

async fn resume_symbol(State(state): State<AppState>, Path(symbol): Path<String>) -> (StatusCode, Json<Value>) {
    one_symbol_result(state.controller.resume(&symbol).await)
}

async fn rebalance_all(State(state): State<AppState>) -> Json<Value> {
    Json(json!(result_map(state.controller.rebalance_all().await)))
}

fn result_map(results: HashMap<String, Result<crate::application::grid_worker::CommandResult, CoreError>>) -> Value {
    let mapped: HashMap<String, Value> = results
        .into_iter()
        .map(|(symbol, res)| {
            let v = match res {
                Ok(r) => json!({ "ok": true, "result": r }),
                Err(e) => json!({ "ok": false, "error": e.to_string() }),
            };
            (symbol, v)
        })
        .collect();
    json!(mapped)
}

fn one_symbol_result(res: Result<crate::application::grid_worker::CommandResult, CoreError>) -> (StatusCode, Json<Value>) {
    match res {
        Ok(r) => (StatusCode::OK, Json(json!({ "ok": true, "result": r }))),
        Err(e) => (core_error_status(&e), Json(json!({ "ok": false, "error": e.to_string() }))),
    }
}

async fn deploy(State(state): State<AppState>, Json(params): Json<GridParameters>) -> (StatusCode, Json<Value>) {
    match state.controller.deploy(params.clone()).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "deployed", "symbol": params.symbol, "config": params }))),
        Err(e) => (core_error_status(&e), Json(json!({ "error": e.to_string() }))),
    }
}

async fn risk(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.controller.risk_snapshot().await))
}

async fn kill(State(state): State<AppState>) -> Json<Value> {
    let results = state.controller.kill("operator requested kill".to_string()).await;
    Json(json!(results))
}

async fn reset_kill(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    match state.controller.reset_kill().await {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "reset" }))),
        Err(reason) => (StatusCode::CONFLICT, Json(json!({ "status": "still_blocked", "reason": reason }))),
    }
}

async fn prices(State(state): State<AppState>) -> Json<Value> {
    let grids = state.controller.all_grid_snapshots().await;
    let out: HashMap<String, Value> = grids
        .into_iter()
        .map(|(symbol, snap)| (symbol, json!({ "price": snap.current_price, "ts": snap.last_update })))
        .collect();
    Json(json!(out))
}

async fn tv_alert(State(state): State<AppState>, headers: HeaderMap, body: axum::body::Bytes) -> (StatusCode, Json<Value>) {
    let signature = headers
        .get("X-Webhook-Signature")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !state.alert_router.verify_signature(&body, signature) {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "invalid signature" })));
    }
    let alert: WebhookAlert = match serde_json::from_slice(&body) {
        Ok(a) => a,
        Err(e) => return (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() }))),
    };
    match state.alert_router.route(&state.controller, alert.clone()).await {
        Ok((operation, result)) => (
            StatusCode::OK,
            Json(json!({ "alert": alert, "action": operation, "grid_result": result })),
        ),
        Err(e) => {
            let status = match &e {
                crate::application::alert_router::AlertError::Core(CoreError::KilledByRisk { .. }) => StatusCode::FORBIDDEN,
                crate::application::alert_router::AlertError::UnknownAction(_) => StatusCode::BAD_REQUEST,
                crate::application::alert_router::AlertError::BadSignature => StatusCode::UNAUTHORIZED,
                crate::application::alert_router::AlertError::Core(inner) => core_error_status(inner),
            };
            (status, Json(json!({ "error": e.to_string() })))
        }
    }
}

#[derive(serde::Deserialize)]
struct AlertsQuery {
    symbol: Option<String>,
    limit: Option<usize>,
}

async fn alerts(State(state): State<AppState>, Query(q): Query<AlertsQuery>) -> Json<Value> {
    let records = state.alert_router.history(q.symbol.as_deref(), q.limit.unwrap_or(100)).await;

    // Stats are computed over the full history, not the limit-truncated `records` above, and
    // broken down by mapped operation so a small `limit` query never understates the counts.
    let full_history = state.alert_router.all_history().await;
    let mut stats: HashMap<String, HashMap<String, usize>> = HashMap::new();
    for r in full_history.iter().filter(|r| q.symbol.as_deref().is_none_or(|s| r.symbol == s)) {
        *stats.entry(r.symbol.clone()).or_default().entry(r.mapped_operation.clone()).or_insert(0) += 1;
    }
    Json(json!({ "alerts": records, "stats": stats }))
}
