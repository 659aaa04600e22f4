//! `/rest/v1/system/full-configuration` (spec.md §4.8): declarative whole-
//! tree GET/PUT/PATCH, dispatched straight to the Write Engine's two-pass
//! algorithm rather than through the URI Resolver.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use http::StatusCode;

use crate::auth::SessionAuth;
use crate::error::{Error, Result};
use crate::read_engine::{QueryParams, ReadEngine};
use crate::routes::rest::commit_with_validation;
use crate::routes::AppState;
use crate::uri;
use crate::write_engine;

pub async fn get(
    _auth: SessionAuth,
    State(state): State<Arc<AppState>>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Response> {
    config_type(&query)?;
    let schema = state.cm.schema().clone();
    let idl = state.cm.idl().clone();
    let root = uri::resolve("/rest/v1/system", &schema, &idl)?;
    let mut engine = ReadEngine::new(&schema, &idl);
    let depth_params = QueryParams { depth: 10, ..Default::default() };
    let body = engine.serialize(&root, &depth_params)?;
    Ok(Json(body).into_response())
}

pub async fn put(
    _auth: SessionAuth,
    State(state): State<Arc<AppState>>,
    Query(query): Query<HashMap<String, String>>,
    body: axum::body::Bytes,
) -> Result<Response> {
    config_type(&query)?;
    let schema = state.cm.schema().clone();
    let idl = state.cm.idl().clone();
    let body_json: serde_json::Value = serde_json::from_slice(&body).map_err(|e| Error::DataValidationFailed(e.to_string()))?;

    let txn = idl.open_transaction();
    let changes = write_engine::full_configuration(&schema, &idl, &txn, &body_json)?;
    commit_with_validation(&state, &schema, &idl, &txn, &changes).await?;
    Ok(StatusCode::OK.into_response())
}

/// PATCH applies the same declarative two-pass algorithm as PUT: this
/// system's full-configuration body is already a sparse "what should
/// exist" document, so a partial PATCH and a full PUT converge on the same
/// write-engine entry point (documented simplification, see DESIGN.md).
pub async fn patch(
    auth: SessionAuth,
    state: State<Arc<AppState>>,
    query: Query<HashMap<String, String>>,
    body: axum::body::Bytes,
) -> Result<Response> {
    put(auth, state, query, body).await
}

fn config_type(query: &HashMap<String, String>) -> Result<()> {
    match query.get("type").map(String::as_str) {
        None | Some("running") | Some("startup") => Ok(()),
        Some(other) => Err(Error::ParameterNotAllowed(format!("unknown full-configuration type `{other}`"))),
    }
}
