//! `GET`/`PUT /account` (spec.md §4.8): the one custom, schema-validated
//! endpoint outside the generic `/rest/v1/system` tree. Grounded on
//! SPEC_FULL.md §4.8's addition of the `jsonschema` crate for this route.

use std::sync::Arc;

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use http::StatusCode;
use parking_lot::RwLock;
use serde_json::Value as Json_;

use crate::auth::SessionAuth;
use crate::error::Error;
use crate::routes::AppState;

/// A tiny key/value document validated against the configured account
/// JSON schema on write; there is no dedicated `Account` table in the
/// switch schema, so this is held in process memory rather than the IDL.
///
/// The schema is kept as plain `Value` and recompiled on each write rather
/// than cached as a `jsonschema::JSONSchema`, since that type borrows from
/// the `Value` it was compiled from and the schema document has nowhere
/// stable to live alongside it in this struct.
pub struct AccountStore {
    schema: Json_,
    document: RwLock<Json_>,
}

impl AccountStore {
    pub fn new(schema: Json_, initial: Json_) -> Self {
        Self {
            schema,
            document: RwLock::new(initial),
        }
    }
}

pub async fn get(_auth: SessionAuth, State(state): State<Arc<AppState>>) -> Response {
    Json(state.account.document.read().clone()).into_response()
}

pub async fn put(_auth: SessionAuth, State(state): State<Arc<AppState>>, Json(body): Json<Json_>) -> Response {
    let compiled = match jsonschema::JSONSchema::compile(&state.account.schema) {
        Ok(compiled) => compiled,
        Err(e) => return Error::Internal(anyhow::anyhow!(e.to_string())).into_response(),
    };
    if let Err(errors) = compiled.validate(&body) {
        let messages: Vec<String> = errors.map(|e| e.to_string()).collect();
        return Error::DataValidationFailed(messages.join("; ")).into_response();
    }
    *state.account.document.write() = body;
    StatusCode::OK.into_response()
}
