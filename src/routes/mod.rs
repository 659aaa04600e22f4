//! HTTP Front Door (spec.md §4.8): router composition and the per-request
//! pipeline steps that sit outside any single handler — path normalization,
//! the `force_https` redirect, the auth gate, and audit logging.

pub mod account;
pub mod full_configuration;
pub mod logs;
pub mod rest;
pub mod session;

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::Router;
use http::{StatusCode, Uri};

use crate::audit::{AuditClass, AuditLog};
use crate::auth::{PermissionCheck, SessionKeys};
use crate::cm::ConnectionManager;
use crate::config::Config;
use crate::notify::NotificationEngine;
use crate::routes::account::AccountStore;
use crate::validator::ValidatorRegistry;
use crate::ws;

pub struct AppState {
    pub cm: Arc<ConnectionManager>,
    pub notify: Arc<NotificationEngine>,
    pub validators: Arc<ValidatorRegistry>,
    pub session_keys: Arc<SessionKeys>,
    pub permissions: Arc<dyn PermissionCheck>,
    pub account: Arc<AccountStore>,
    pub audit_log: Arc<AuditLog>,
    pub force_https: bool,
}

/// Builds the full router: the generic `/rest/v1/system` tree, the
/// declarative full-configuration endpoint, session login/logout, the
/// custom `/account` and `/logs` routes, and the notifications WebSocket —
/// wrapped in the auth gate and audit-log middleware (spec.md §4.8 steps
/// 3-4 and 9).
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/rest/v1/system/full-configuration",
            get(full_configuration::get).put(full_configuration::put).patch(full_configuration::patch),
        )
        .route(
            "/rest/v1/system/*path",
            get(rest::dispatch).post(rest::dispatch).put(rest::dispatch).patch(rest::dispatch).delete(rest::dispatch),
        )
        .route("/rest/v1/ws/notifications", get(ws::notifications_ws))
        .route("/login", post(session::login))
        .route("/logout", post(session::logout))
        .route("/logs", get(logs::get))
        .route("/account", get(account::get).put(account::put))
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(state.clone(), audit_middleware))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .layer(middleware::from_fn_with_state(state, https_redirect_middleware))
        .layer(middleware::from_fn(normalize_middleware))
        // layer() wraps outward: path normalization runs first, then the
        // https redirect, then the auth gate, then (for requests the gate
        // admits) the audit log, then the route handler — matching
        // spec.md §4.8's step ordering.
}

/// spec.md §4.8 step 1: rewrite the request's URI to its normalized path
/// before anything downstream — routing, the auth gate, audit logging —
/// makes a decision based on it.
async fn normalize_middleware(mut request: Request, next: Next) -> Response {
    let normalized = normalize_path(request.uri().path());
    if normalized != request.uri().path() {
        let mut parts = request.uri().clone().into_parts();
        let rebuilt = match request.uri().query() {
            Some(query) => format!("{normalized}?{query}"),
            None => normalized,
        };
        if let Ok(path_and_query) = rebuilt.parse() {
            parts.path_and_query = Some(path_and_query);
            if let Ok(new_uri) = Uri::from_parts(parts) {
                *request.uri_mut() = new_uri;
            }
        }
    }
    next.run(request).await
}

/// spec.md §4.8 steps 3-4: delegates to `auth::apply_auth_gate`, which is
/// kept free of any concrete `AppState` dependency so it can be unit tested
/// on its own. `apply_auth_gate` short-circuits rejections without calling
/// `next`, so the audit-log layer below (which only sees requests that
/// made it past this gate) would never observe them; record those here
/// instead. `/login` itself always falls through to `next`, so its own
/// pass/fail outcome is still picked up exactly once by the inner layer.
async fn auth_middleware(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let is_login = path == "/login";

    let response = crate::auth::apply_auth_gate(&state.session_keys, state.permissions.as_ref(), request, next).await;

    if !is_login && matches!(response.status(), StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        state.audit_log.record(AuditClass::classify(&path), None, &method, &path, response.status());
    }
    response
}

/// spec.md §4.8 step 2: redirect plain HTTP to HTTPS when `force_https` is
/// set. The crate does not terminate TLS itself (spec.md §1 Non-goals:
/// certificate generation and TLS termination mechanics are carried
/// unchanged as an operator/proxy concern); this only decides whether to
/// redirect, based on the scheme the request arrived with.
async fn https_redirect_middleware(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    if !state.force_https {
        return next.run(request).await;
    }
    let is_https = request
        .headers()
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .map(|scheme| scheme.eq_ignore_ascii_case("https"))
        .unwrap_or(true);
    if is_https {
        return next.run(request).await;
    }

    let mut parts = request.uri().clone().into_parts();
    parts.scheme = Some(http::uri::Scheme::HTTPS);
    if parts.authority.is_none() {
        if let Some(host) = request.headers().get(http::header::HOST).and_then(|v| v.to_str().ok()) {
            if let Ok(authority) = host.parse() {
                parts.authority = Some(authority);
            }
        }
    }
    match Uri::from_parts(parts) {
        Ok(https_uri) => Redirect::permanent(&https_uri.to_string()).into_response(),
        Err(_) => next.run(request).await,
    }
}

/// spec.md §4.8 step 9: record every request that passed the auth gate,
/// once its handler has run, classified by path (`AuditClass::classify`).
async fn audit_middleware(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let username = request.extensions().get::<crate::auth::SessionAuth>().map(|a| a.username.clone());

    let response = next.run(request).await;
    state.audit_log.record(AuditClass::classify(&path), username.as_deref(), &method, &path, response.status());
    response
}

/// spec.md §4.8 step 1: collapse repeated slashes and strip a trailing
/// slash (except for the root path itself).
fn normalize_path(path: &str) -> String {
    let mut normalized = String::with_capacity(path.len());
    let mut last_was_slash = false;
    for c in path.chars() {
        if c == '/' {
            if last_was_slash {
                continue;
            }
            last_was_slash = true;
        } else {
            last_was_slash = false;
        }
        normalized.push(c);
    }
    if normalized.len() > 1 && normalized.ends_with('/') {
        normalized.pop();
    }
    normalized
}

impl AppState {
    pub fn new(
        cm: Arc<ConnectionManager>,
        notify: Arc<NotificationEngine>,
        validators: Arc<ValidatorRegistry>,
        session_keys: Arc<SessionKeys>,
        permissions: Arc<dyn PermissionCheck>,
        account: Arc<AccountStore>,
        config: &Config,
    ) -> Arc<Self> {
        Arc::new(Self {
            cm,
            notify,
            validators,
            session_keys,
            permissions,
            account,
            audit_log: Arc::new(AuditLog::default()),
            force_https: config.force_https,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use axum::body::Body;
    use tower::ServiceExt;

    #[test]
    fn collapses_repeated_and_trailing_slashes() {
        assert_eq!(normalize_path("/rest//v1///system/"), "/rest/v1/system");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path("/login"), "/login");
    }

    /// The normalized path, not the raw one, is what routing and the auth
    /// gate actually see: a doubled-slash request for an existing resource
    /// still resolves, proving the rewrite lands on `request.uri_mut()`
    /// before `next.run` rather than staying a local string.
    #[tokio::test]
    async fn doubled_slashes_still_route_to_the_normalized_resource() {
        let state = testutil::app_state();
        testutil::insert_vrf(state.cm.idl(), "vrf_default");
        let token = state.session_keys.issue("tester").unwrap();

        let router = build_router(state);
        let request = Request::builder()
            .method("GET")
            .uri("/rest//v1/system//vrfs/vrf_default")
            .header(http::header::COOKIE, format!("switchdb_session={token}"))
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
