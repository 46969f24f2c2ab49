use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::gateway_util::AppStateData;
use crate::usage::BackendState;

pub const SANTACALL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// A handler for a simple liveness check
pub async fn status_handler() -> Json<Value> {
    Json(json!({ "status": "ok", "version": SANTACALL_VERSION }))
}

/// A handler for a health check that also reports which usage store is in use.
///
/// The gateway stays healthy when Redis is down since usage falls back to memory.
pub async fn health_handler(State(app_state): State<AppStateData>) -> Json<Value> {
    let ledger = &app_state.ledger;
    let storage = match ledger.backend_state() {
        BackendState::Ready(store) => store.name(),
        BackendState::Unavailable => "memory (durable store unavailable)",
        BackendState::Uninitialized if ledger.durable_configured() => "not connected yet",
        BackendState::Uninitialized => "memory",
    };
    Json(json!({ "status": "ok", "storage": storage }))
}
