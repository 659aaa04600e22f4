//! `/rest/v1/system/...` dispatch: URI Resolver into Read/Write Engine,
//! plus the ETag/If-Match handling and query-parameter rejection rules of
//! spec.md §4.8 steps 5-6.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use http::{header, Method, StatusCode};
use sha1::{Digest, Sha1};

use crate::auth::SessionAuth;
use crate::error::{Error, Result};
use crate::idl::CommitResult;
use crate::read_engine::{parse_sort, QueryParams, ReadEngine, Selector};
use crate::routes::AppState;
use crate::uri;
use crate::write_engine::{self, PatchOp};

const RESERVED_PARAMS: &[&str] = &["depth", "selector", "sort", "offset", "limit", "keys"];

fn non_reserved_filters(query: &HashMap<String, String>) -> Vec<(String, String)> {
    query
        .iter()
        .filter(|(k, _)| !RESERVED_PARAMS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn query_params(query: &HashMap<String, String>, method: &Method) -> Result<QueryParams> {
    if *method != Method::GET {
        if query.contains_key("sort") || query.contains_key("depth") || query.contains_key("keys") {
            return Err(Error::ParameterNotAllowed("sort/depth/keys are GET-only".into()));
        }
    }

    let depth = match query.get("depth") {
        Some(raw) => raw
            .parse::<u32>()
            .map_err(|_| Error::ParameterNotAllowed("depth must be an integer".into()))?
            .min(10),
        None => 0,
    };
    let selector = Selector::parse(query.get("selector").map(String::as_str))?;
    let sort = query.get("sort").map(|raw| parse_sort(raw)).unwrap_or_default();
    let offset = query.get("offset").and_then(|v| v.parse().ok());
    let limit = query.get("limit").and_then(|v| v.parse().ok());
    let keys = query.get("keys").map(|raw| raw.split(',').map(str::to_owned).collect());
    let filters = non_reserved_filters(query);

    Ok(QueryParams { depth, selector, sort, offset, limit, keys, filters })
}

fn etag_for(body: &serde_json::Value) -> String {
    let bytes = serde_json::to_vec(body).unwrap_or_default();
    let digest = Sha1::digest(&bytes);
    format!("\"{digest:x}\"")
}

fn if_match_satisfied(header_value: &str, etag: &str) -> bool {
    header_value.trim() == "*" || header_value.split(',').any(|candidate| candidate.trim() == etag)
}

pub async fn dispatch(
    _auth: SessionAuth,
    State(state): State<Arc<AppState>>,
    method: Method,
    uri_path: axum::extract::OriginalUri,
    Query(query): Query<HashMap<String, String>>,
    headers: http::HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    match run_dispatch(&state, &method, uri_path.0.path(), &query, &headers, &body).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn run_dispatch(
    state: &AppState,
    method: &Method,
    path: &str,
    query: &HashMap<String, String>,
    headers: &http::HeaderMap,
    body: &[u8],
) -> Result<Response> {
    let params = query_params(query, method)?;
    if params.selector != Selector::All && *method != Method::GET && !headers.contains_key(header::IF_MATCH) {
        return Err(Error::ParameterNotAllowed("selector is GET-only unless combined with If-Match".into()));
    }

    let schema = state.cm.schema().clone();
    let idl = state.cm.idl().clone();

    let resource = uri::resolve(path, &schema, &idl)?;

    let current_json = {
        let mut engine = ReadEngine::new(&schema, &idl);
        engine.serialize(&resource, &QueryParams::default()).ok()
    };
    let current_etag = current_json.as_ref().map(etag_for);

    if let Some(if_match) = headers.get(header::IF_MATCH).and_then(|v| v.to_str().ok()) {
        if let Some(etag) = &current_etag {
            if !if_match_satisfied(if_match, etag) && *method != Method::PUT {
                return Err(Error::PreconditionFailed);
            }
        }
    }

    let response = match *method {
        Method::GET => {
            if let (Some(if_none_match), Some(etag)) =
                (headers.get(header::IF_NONE_MATCH).and_then(|v| v.to_str().ok()), &current_etag)
            {
                if if_match_satisfied(if_none_match, etag) {
                    return Err(Error::NotModified);
                }
            }
            let mut engine = ReadEngine::new(&schema, &idl);
            let body = engine.serialize(&resource, &params)?;
            Json(body).into_response()
        }
        Method::POST => {
            let body_json: serde_json::Value =
                serde_json::from_slice(body).map_err(|e| Error::DataValidationFailed(e.to_string()))?;
            let txn = idl.open_transaction();
            let (_uuid, changes) = write_engine::create(&schema, &idl, &txn, &resource, &body_json)?;
            commit_with_validation(state, &schema, &idl, &txn, &changes).await?;
            StatusCode::CREATED.into_response()
        }
        Method::PUT => {
            let body_json: serde_json::Value =
                serde_json::from_slice(body).map_err(|e| Error::DataValidationFailed(e.to_string()))?;
            if let (Some(current), Some(if_match)) = (&current_json, headers.get(header::IF_MATCH).and_then(|v| v.to_str().ok())) {
                if &body_json == current {
                    let _ = if_match;
                    return Ok(StatusCode::OK.into_response());
                }
            }
            let txn = idl.open_transaction();
            let changes = write_engine::replace(&schema, &idl, &txn, &resource, &body_json)?;
            commit_with_validation(state, &schema, &idl, &txn, &changes).await?;
            StatusCode::OK.into_response()
        }
        Method::PATCH => {
            let ops: Vec<PatchOp> = serde_json::from_slice(body).map_err(|e| Error::DataValidationFailed(e.to_string()))?;
            let txn = idl.open_transaction();
            let changes = write_engine::patch(&schema, &idl, &txn, &resource, &ops)?;
            commit_with_validation(state, &schema, &idl, &txn, &changes).await?;
            StatusCode::OK.into_response()
        }
        Method::DELETE => {
            let txn = idl.open_transaction();
            let changes = write_engine::delete(&schema, &idl, &txn, &resource)?;
            commit_with_validation(state, &schema, &idl, &txn, &changes).await?;
            StatusCode::NO_CONTENT.into_response()
        }
        _ => return Err(Error::MethodNotAllowed),
    };

    let etag_for_response = if *method == Method::GET { current_etag.as_deref() } else { None };
    Ok(with_common_headers(response, etag_for_response))
}

/// Runs the registered validators over staged writes, then commits the
/// transaction (waiting through `INCOMPLETE` retries via the Connection
/// Manager). Validator failure discards the transaction without staging
/// its writes onto the replica.
pub(crate) async fn commit_with_validation(
    state: &AppState,
    schema: &crate::schema::Schema,
    idl: &crate::idl::MemoryIdl,
    txn: &std::sync::Arc<crate::idl::Transaction>,
    changes: &[write_engine::PendingChange],
) -> Result<()> {
    state.validators.run(schema, idl, txn, changes)?;
    state.cm.track(txn.clone());
    match txn.wait().await {
        CommitResult::Success => Ok(()),
        _ => Err(Error::TransactionFailed),
    }
}

fn with_common_headers(mut response: Response, etag: Option<&str>) -> Response {
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, http::HeaderValue::from_static("no-cache"));
    if let Some(etag) = etag {
        if let Ok(value) = http::HeaderValue::from_str(etag) {
            response.headers_mut().insert(header::ETAG, value);
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use http::HeaderValue;

    fn headers_with(name: header::HeaderName, value: &str) -> http::HeaderMap {
        let mut headers = http::HeaderMap::new();
        headers.insert(name, HeaderValue::from_str(value).unwrap());
        headers
    }

    async fn setup_bgp_router() -> (std::sync::Arc<AppState>, &'static str) {
        let state = testutil::app_state();
        let idl = state.cm.idl().clone();
        testutil::insert_vrf(&idl, "vrf_default");
        let schema = state.cm.schema().clone();
        let collection = uri::resolve("/rest/v1/system/vrfs/vrf_default/bgp_routers", &schema, &idl).unwrap();
        let txn = idl.open_transaction();
        let body = serde_json::json!({"configuration": {"asn": 6004, "router_id": "10.10.0.4", "deterministic_med": false}});
        write_engine::create(&schema, &idl, &txn, &collection, &body).unwrap();
        idl.commit(&txn);
        (state, "/rest/v1/system/vrfs/vrf_default/bgp_routers/6004")
    }

    /// Invariant 7: the same row's ETag is stable across identical GETs.
    #[tokio::test]
    async fn etag_is_stable_across_identical_gets() {
        let (state, path) = setup_bgp_router().await;
        let empty = HashMap::new();
        let no_headers = http::HeaderMap::new();

        let first = run_dispatch(&state, &Method::GET, path, &empty, &no_headers, b"").await.unwrap();
        let second = run_dispatch(&state, &Method::GET, path, &empty, &no_headers, b"").await.unwrap();
        assert!(first.headers().get(header::ETAG).is_some());
        assert_eq!(first.headers().get(header::ETAG), second.headers().get(header::ETAG));
    }

    /// Invariant 7: a PUT that changes a configuration value changes the ETag.
    #[tokio::test]
    async fn put_changing_configuration_changes_the_etag() {
        let (state, path) = setup_bgp_router().await;
        let empty = HashMap::new();
        let no_headers = http::HeaderMap::new();

        let before = run_dispatch(&state, &Method::GET, path, &empty, &no_headers, b"").await.unwrap();
        let etag_before = before.headers().get(header::ETAG).cloned().unwrap();

        let put_body = serde_json::json!({"configuration": {"asn": 6004, "router_id": "10.10.1.4", "deterministic_med": false}});
        let put_bytes = serde_json::to_vec(&put_body).unwrap();
        let put_response = run_dispatch(&state, &Method::PUT, path, &empty, &no_headers, &put_bytes).await.unwrap();
        assert_eq!(put_response.status(), StatusCode::OK);

        let after = run_dispatch(&state, &Method::GET, path, &empty, &no_headers, b"").await.unwrap();
        let etag_after = after.headers().get(header::ETAG).cloned().unwrap();
        assert_ne!(etag_before, etag_after);
    }

    /// Invariant 8: PUT with a body equal to current state is a 200 no-op
    /// even when `If-Match` doesn't match anything on record.
    #[tokio::test]
    async fn conditional_put_with_unchanged_body_ignores_if_match_mismatch() {
        let (state, path) = setup_bgp_router().await;
        let empty = HashMap::new();
        let mismatched = headers_with(header::IF_MATCH, "\"deadbeef\"");

        let exact_body = serde_json::json!({
            "configuration": {"asn": 6004, "router_id": "10.10.0.4", "deterministic_med": false},
            "status": {},
            "statistics": {}
        });
        let bytes = serde_json::to_vec(&exact_body).unwrap();
        let response = run_dispatch(&state, &Method::PUT, path, &empty, &mismatched, &bytes).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    /// An `If-Match` mismatch on a non-PUT method is a precondition failure.
    #[tokio::test]
    async fn if_match_mismatch_on_delete_is_rejected() {
        let (state, path) = setup_bgp_router().await;
        let empty = HashMap::new();
        let mismatched = headers_with(header::IF_MATCH, "\"deadbeef\"");

        let err = run_dispatch(&state, &Method::DELETE, path, &empty, &mismatched, b"").await.unwrap_err();
        assert!(matches!(err, Error::PreconditionFailed));
    }

    /// `If-None-Match` matching the current ETag on GET returns 304.
    #[tokio::test]
    async fn if_none_match_with_current_etag_is_not_modified() {
        let (state, path) = setup_bgp_router().await;
        let empty = HashMap::new();
        let no_headers = http::HeaderMap::new();

        let first = run_dispatch(&state, &Method::GET, path, &empty, &no_headers, b"").await.unwrap();
        let etag = first.headers().get(header::ETAG).unwrap().to_str().unwrap().to_owned();
        let headers = headers_with(header::IF_NONE_MATCH, &etag);

        let err = run_dispatch(&state, &Method::GET, path, &empty, &headers, b"").await.unwrap_err();
        assert!(matches!(err, Error::NotModified));
    }
}
