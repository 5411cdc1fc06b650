//! Read-only HTTP view of scheduler progress.

use std::collections::BTreeMap;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::SchedulerMode;
use crate::progress::{EntityProgress, EntityProgressTracker};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub mode: String,
    pub busy: usize,
    pub entities: BTreeMap<String, EntityProgress>,
}

#[derive(Clone)]
struct StatusAppState {
    mode: SchedulerMode,
    tracker: EntityProgressTracker,
}

pub fn status_router(mode: SchedulerMode, tracker: EntityProgressTracker) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .route("/status/{entity_key}", get(get_entity_status))
        .with_state(StatusAppState { mode, tracker })
}

async fn get_status(State(state): State<StatusAppState>) -> Json<StatusSnapshot> {
    let entities = state.tracker.snapshot();
    let busy = entities.values().filter(|p| p.busy).count();
    debug!(
        component = "status",
        event = "http.status.request",
        entities = entities.len(),
        busy
    );
    Json(StatusSnapshot {
        mode: state.mode.as_str().to_string(),
        busy,
        entities,
    })
}

async fn get_entity_status(
    State(state): State<StatusAppState>,
    Path(entity_key): Path<String>,
) -> Response {
    match state.tracker.progress(&entity_key) {
        Some(progress) => Json(progress).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("unknown entity {entity_key}") })),
        )
            .into_response(),
    }
}
