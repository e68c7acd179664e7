// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. Public endpoints (health) require no
// authentication. All other endpoints require a valid Bearer token checked via
// the `AuthBearer` extractor.
//
// CORS is configured permissively for development; tighten `allowed_origins`
// in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{FromRef, Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::auth::AuthBearer;
use crate::app_state::AppState;
use crate::orchestrator::Orchestrator;
use crate::types::AccountMode;

// =============================================================================
// Combined router state
// =============================================================================

/// Bundles the shared trading state with the orchestrator handle so control
/// endpoints can drive FSM transitions directly. Most handlers only need
/// `AppState`, resolved automatically via `FromRef`.
#[derive(Clone)]
pub struct ApiState {
    pub app: Arc<AppState>,
    pub orchestrator: Arc<Orchestrator>,
}

impl FromRef<ApiState> for Arc<AppState> {
    fn from_ref(input: &ApiState) -> Self {
        input.app.clone()
    }
}

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(app: Arc<AppState>, orchestrator: Arc<Orchestrator>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let state = ApiState { app, orchestrator };

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Authenticated ───────────────────────────────────────────
        .route("/api/v1/state", get(full_state))
        .route("/api/v1/positions", get(positions))
        .route("/api/v1/regime", get(regime))
        .route("/api/v1/decisions", get(decisions))
        .route("/api/v1/control/pause", post(control_pause))
        .route("/api/v1/control/resume", post(control_resume))
        .route("/api/v1/control/kill", post(control_kill))
        .route("/api/v1/control/account-mode", post(control_account_mode))
        .route("/api/v1/heartbeat", post(heartbeat))
        .route("/api/v1/trade-journal", get(trade_journal))
        .route("/api/v1/trade-journal/stats", get(trade_journal_stats))
        // ── WebSocket (handled separately in ws module but mounted here) ─
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        // ── Middleware & State ───────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health (public)
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    state_version: u64,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let resp = HealthResponse {
        status: "ok",
        state_version: state.current_state_version(),
        server_time: chrono::Utc::now().timestamp_millis(),
    };
    Json(resp)
}

// =============================================================================
// Full state snapshot (authenticated)
// =============================================================================

async fn full_state(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.build_snapshot();
    Json(snapshot)
}

// =============================================================================
// Positions (authenticated)
// =============================================================================

async fn positions(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let positions = state.position_manager.open_positions();
    Json(positions)
}

// =============================================================================
// Regime (authenticated)
// =============================================================================

async fn regime(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let regime_state = state.regime_detector.current_regime();
    match regime_state {
        Some(rs) => {
            let snapshot = serde_json::json!({
                "regime": rs.regime.to_string(),
                "adx": rs.adx,
                "bbw": rs.bbw,
                "hurst": rs.hurst,
                "entropy": rs.entropy,
                "confidence": rs.confidence,
                "regime_age_seconds": rs.regime_age_secs,
            });
            Json(snapshot).into_response()
        }
        None => {
            let body = serde_json::json!({ "regime": null, "message": "No regime data available yet" });
            Json(body).into_response()
        }
    }
}

// =============================================================================
// Decisions (authenticated)
// =============================================================================

async fn decisions(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let decisions = state.recent_decisions.read().clone();
    Json(decisions)
}

// =============================================================================
// Control endpoints (authenticated)
// =============================================================================

#[derive(Serialize)]
struct ControlResponse {
    trading_mode: String,
    message: String,
}

fn engine_error_response(err: crate::error::EngineError) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::CONFLICT,
        Json(serde_json::json!({ "error": err.to_string() })),
    )
}

async fn control_pause(
    _auth: AuthBearer,
    State(api): State<ApiState>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    api.orchestrator.pause().map_err(engine_error_response)?;
    info!("trading paused via API");
    Ok(Json(ControlResponse {
        trading_mode: "Paused".to_string(),
        message: "Trading paused".to_string(),
    }))
}

async fn control_resume(
    _auth: AuthBearer,
    State(api): State<ApiState>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    api.orchestrator.resume().map_err(engine_error_response)?;
    info!("trading resumed via API");
    Ok(Json(ControlResponse {
        trading_mode: "Scanning".to_string(),
        message: "Trading resumed".to_string(),
    }))
}

async fn control_kill(_auth: AuthBearer, State(api): State<ApiState>) -> impl IntoResponse {
    {
        let mut config = api.app.system_config.write();
        config.trading_mode = crate::types::TradingMode::Killed;
    }
    let result = api.orchestrator.stop();
    api.app.increment_version();
    warn!("trading KILLED via API");

    match result {
        Ok(()) => Json(ControlResponse {
            trading_mode: "Killed".to_string(),
            message: "Trading killed — manual restart required".to_string(),
        })
        .into_response(),
        Err(e) => engine_error_response(e).into_response(),
    }
}

#[derive(Deserialize)]
struct AccountModeRequest {
    account_mode: String,
    #[serde(default)]
    confirm_live: bool,
}

#[derive(Serialize)]
struct AccountModeResponse {
    account_mode: String,
}

async fn control_account_mode(
    _auth: AuthBearer,
    State(api): State<ApiState>,
    Json(req): Json<AccountModeRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let mode = match req.account_mode.to_lowercase().as_str() {
        "paper" => AccountMode::Paper,
        "live" => {
            if !req.confirm_live {
                return Err((
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({
                        "error": "Switching to Live mode requires confirm_live: true",
                    })),
                ));
            }
            warn!("switching to LIVE account mode via API");
            AccountMode::Live
        }
        _ => {
            return Err((
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "error": format!("Invalid account mode: '{}'. Use 'paper' or 'live'.", req.account_mode),
                })),
            ));
        }
    };

    {
        let mut config = api.app.system_config.write();
        config.account_mode = mode;
    }
    api.app.increment_version();
    info!(account_mode = %mode, "account mode changed via API");

    Ok(Json(AccountModeResponse { account_mode: mode.to_string() }))
}

// =============================================================================
// Heartbeat (authenticated)
// =============================================================================

async fn heartbeat(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    *state.last_ws_user_event.write() = std::time::Instant::now();
    state.increment_version();

    Json(serde_json::json!({
        "status": "ok",
        "server_time": chrono::Utc::now().timestamp_millis(),
    }))
}

// =============================================================================
// Trade Journal (authenticated)
// =============================================================================

async fn trade_journal(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let closed = state.position_manager.closed_positions(500);
    Json(closed)
}

async fn trade_journal_stats(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let closed = state.position_manager.closed_positions(500);
    let total_trades = closed.len();
    if total_trades == 0 {
        return Json(serde_json::json!({
            "total_trades": 0,
            "win_rate": 0.0,
            "total_net_pnl": 0.0,
            "profit_factor": 0.0,
        }));
    }
    let wins = closed.iter().filter(|p| p.realized_pnl_usd > 0.0).count();
    let win_rate = wins as f64 / total_trades as f64;
    let total_net_pnl: f64 = closed.iter().map(|p| p.realized_pnl_usd).sum();
    let gross_profit: f64 = closed
        .iter()
        .filter(|p| p.realized_pnl_usd > 0.0)
        .map(|p| p.realized_pnl_usd)
        .sum();
    let gross_loss: f64 = closed
        .iter()
        .filter(|p| p.realized_pnl_usd < 0.0)
        .map(|p| p.realized_pnl_usd.abs())
        .sum();
    let profit_factor = if gross_loss > 0.0 {
        gross_profit / gross_loss
    } else if gross_profit > 0.0 {
        f64::INFINITY
    } else {
        0.0
    };
    Json(serde_json::json!({
        "total_trades": total_trades,
        "win_rate": win_rate,
        "total_net_pnl": total_net_pnl,
        "profit_factor": profit_factor,
    }))
}
