// Keyfed — HTTP Routes
//
// GET|POST /schedule         due-mode pass over every partner
// GET|POST /import?partner=  forced cycle for one partner
// GET      /health           store liveness
//
// Both triggers accept `timeout=<duration>` (e.g. `90s`, `5m`); without it
// the configured trigger timeout applies.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::time::Instant;
use tower_http::trace::TraceLayer;

use crate::federation::{Coordinator, ImportError, PartnerResult};
use crate::store::FederationStore;

pub fn router<S: FederationStore>(coordinator: Arc<Coordinator<S>>) -> Router {
    Router::new()
        .route("/schedule", get(schedule::<S>).post(schedule::<S>))
        .route("/import", get(import::<S>).post(import::<S>))
        .route("/health", get(health::<S>))
        .layer(TraceLayer::new_for_http())
        .with_state(coordinator)
}

#[derive(Debug, Deserialize)]
struct TriggerParams {
    partner: Option<String>,
    timeout: Option<String>,
}

impl TriggerParams {
    fn deadline<S: FederationStore>(&self, coordinator: &Coordinator<S>) -> Result<Instant, Response> {
        match self.timeout.as_deref() {
            None => Ok(coordinator.trigger_deadline()),
            Some(raw) => humantime::parse_duration(raw)
                .map_err(|e| e.to_string())
                .and_then(|timeout| Instant::now().checked_add(timeout).ok_or_else(|| "out of range".to_string()))
                .map_err(|e| error_response(StatusCode::BAD_REQUEST, format!("invalid timeout '{}': {}", raw, e))),
        }
    }
}

async fn schedule<S: FederationStore>(
    State(coordinator): State<Arc<Coordinator<S>>>,
    Query(params): Query<TriggerParams>,
) -> Response {
    let deadline = match params.deadline(&*coordinator) {
        Ok(deadline) => deadline,
        Err(response) => return response,
    };

    match coordinator.schedule(deadline).await {
        Ok(summary) => {
            let status = if summary.ok {
                StatusCode::OK
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            (status, Json(summary)).into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "Schedule pass could not list partners");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn import<S: FederationStore>(
    State(coordinator): State<Arc<Coordinator<S>>>,
    Query(params): Query<TriggerParams>,
) -> Response {
    let deadline = match params.deadline(&*coordinator) {
        Ok(deadline) => deadline,
        Err(response) => return response,
    };
    let Some(partner) = params.partner.filter(|p| !p.trim().is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "missing 'partner' query parameter".into());
    };

    match coordinator.import(&partner, deadline).await {
        Ok(outcome) => {
            let status = if outcome.is_failure() {
                StatusCode::INTERNAL_SERVER_ERROR
            } else {
                StatusCode::OK
            };
            (status, Json(PartnerResult { partner, outcome })).into_response()
        }
        Err(e @ ImportError::PartnerNotFound(_)) => error_response(StatusCode::NOT_FOUND, e.to_string()),
        Err(e) => {
            tracing::error!(partner = %partner, error = %e, "Import could not start");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn health<S: FederationStore>(State(coordinator): State<Arc<Coordinator<S>>>) -> Response {
    match coordinator.health() {
        Ok(()) => (StatusCode::OK, "OK").into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "Health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "store unavailable").into_response()
        }
    }
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "ok": false, "error": message }))).into_response()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
