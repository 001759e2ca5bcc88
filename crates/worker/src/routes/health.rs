//! Health check endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use saga::SweepReport;
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub backend: &'static str,
    /// Report of the most recent sweep, `null` until the first one finishes.
    pub last_sweep: Option<SweepReport>,
}

/// GET /health: returns worker health and the last sweep report.
pub async fn check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let last_sweep = state.sweeps.borrow().clone();
    let status = match &last_sweep {
        Some(report) if !report.escalated.is_empty() => "degraded",
        _ => "ok",
    };
    Json(HealthResponse {
        status,
        backend: state.backend,
        last_sweep,
    })
}
