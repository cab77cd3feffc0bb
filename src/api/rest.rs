// =============================================================================
// Operator REST surface
// =============================================================================
//
// The control plane the CLI subcommands talk to:
//
//   GET  /api/v1/status     full engine status snapshot
//   POST /api/v1/halt       operator halt (entries blocked, exits run)
//   POST /api/v1/resume     clear halt, set trading Live
//   POST /api/v1/close-all  market-close every open position
//   POST /api/v1/stop       graceful shutdown
//
// Everything is localhost-oriented; there is no auth layer here. Deployments
// that expose the port put their own proxy in front.
// =============================================================================

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::app_state::AppState;
use crate::engine::close_all_positions;
use crate::types::TradingMode;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/status", get(status))
        .route("/api/v1/halt", post(halt))
        .route("/api/v1/resume", post(resume))
        .route("/api/v1/close-all", post(close_all))
        .route("/api/v1/stop", post(stop))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn status(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(serde_json::to_value(state.build_status()).unwrap_or_else(|_| json!({})))
}

async fn halt(State(state): State<Arc<AppState>>) -> Json<Value> {
    state.kernel.operator_halt("OPERATOR");
    state.increment_version();
    info!("operator halt via API");
    Json(json!({ "ok": true, "halt_state": state.kernel.halt_state().to_string() }))
}

async fn resume(State(state): State<Arc<AppState>>) -> Json<Value> {
    state.kernel.operator_resume();
    state.set_trading_mode(TradingMode::Live);
    info!("operator resume via API");
    Json(json!({ "ok": true, "trading_mode": "Live" }))
}

async fn close_all(State(state): State<Arc<AppState>>) -> Json<Value> {
    let count = state.tracker.open_positions().len();
    close_all_positions(&state).await;
    state.increment_version();
    Json(json!({ "ok": true, "closed": count }))
}

async fn stop(State(state): State<Arc<AppState>>) -> Json<Value> {
    info!("shutdown requested via API");
    state.request_shutdown(false);
    Json(json!({ "ok": true }))
}
