//! `GET /logs` (spec.md §4.8): log retrieval, an external collaborator in
//! this crate — a real deployment tails the daemon's own log file or a
//! syslog ring buffer; this fake returns the tail of the in-process
//! `tracing` audit buffer so the route is exercisable without a real file.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::auth::SessionAuth;
use crate::routes::AppState;

pub async fn get(
    _auth: SessionAuth,
    State(state): State<Arc<AppState>>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let limit: usize = query.get("limit").and_then(|v| v.parse().ok()).unwrap_or(100);
    let lines = state.audit_log.tail(limit);
    Json(serde_json::json!({ "lines": lines })).into_response()
}
