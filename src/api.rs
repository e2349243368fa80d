// src/api.rs
//! Read-only status API: `/health`, `/history`, `/metrics`.

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tower_http::cors::CorsLayer;

use crate::metrics::Metrics;
use crate::pipeline::StatusSnapshot;
use crate::state::HistoryEntry;

const DEFAULT_HISTORY_LIMIT: usize = 20;

#[derive(Clone)]
pub struct AppState {
    status: watch::Receiver<StatusSnapshot>,
}

pub fn router(status: watch::Receiver<StatusSnapshot>, metrics: &Metrics) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/history", get(history))
        .with_state(AppState { status })
        .merge(metrics.router())
        .layer(CorsLayer::very_permissive())
}

#[derive(Serialize)]
struct HealthResp {
    status: &'static str,
    consecutive_failures: u32,
    last_notification_id: Option<i64>,
    last_cycle_at: Option<chrono::DateTime<chrono::Utc>>,
    last_error: Option<String>,
    providers: Vec<String>,
}

async fn health(State(state): State<AppState>) -> Json<HealthResp> {
    let s = state.status.borrow().clone();
    Json(HealthResp {
        status: s.status,
        consecutive_failures: s.consecutive_failures,
        last_notification_id: s.last_notification_id,
        last_cycle_at: s.last_cycle_at,
        last_error: s.last_error,
        providers: s.providers,
    })
}

#[derive(Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

async fn history(
    State(state): State<AppState>,
    Query(q): Query<HistoryQuery>,
) -> Json<Vec<HistoryEntry>> {
    let limit = q.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    let items = state
        .status
        .borrow()
        .history
        .iter()
        .take(limit)
        .cloned()
        .collect();
    Json(items)
}
