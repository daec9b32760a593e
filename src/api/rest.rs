// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/` and are strictly read-only: the
// engine's write surface is the ledger API, not HTTP. The UI layer polls
// these or rides the WebSocket feed.
//
// CORS is configured permissively for development; tighten `allowed_origins`
// in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};

use crate::app_state::AppState;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/state", get(full_state))
        .route("/api/v1/positions", get(positions))
        .route("/api/v1/trades", get(trades))
        .route("/api/v1/candles", get(candles))
        // ── WebSocket (handled in the ws module but mounted here) ────
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health
// =============================================================================

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "state_version": state.current_state_version(),
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "server_time": chrono::Utc::now().timestamp_millis(),
    }))
}

// =============================================================================
// Account views
// =============================================================================

async fn full_state(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.build_snapshot())
}

async fn positions(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.ledger.open_positions())
}

async fn trades(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.ledger.trade_history())
}

// =============================================================================
// Candle views
// =============================================================================

#[derive(Deserialize)]
struct CandleQuery {
    symbol: String,
    /// Interval in seconds; defaults to one minute.
    #[serde(default = "default_interval_secs")]
    interval_secs: u64,
}

fn default_interval_secs() -> u64 {
    60
}

async fn candles(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CandleQuery>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    if query.interval_secs == 0 {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "interval_secs must be positive" })),
        ));
    }

    let snapshot = state.candle_snapshot(&query.symbol.to_uppercase(), query.interval_secs);
    Ok(Json(serde_json::json!({
        "symbol": query.symbol.to_uppercase(),
        "interval_secs": query.interval_secs,
        "finalized": snapshot.finalized,
        "current": snapshot.current,
    })))
}
