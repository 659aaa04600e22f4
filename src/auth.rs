//! Session authentication and permission gating (spec.md §4.8 steps 3-4).
//!
//! Modeled on the teacher's bearer-JWT `SpacetimeAuth` (`src/auth.rs`): a
//! signed token carries the session's identity, verified on every request.
//! Here the token travels in a cookie instead of an `Authorization` header,
//! and there is no identity-issuing control plane — a session is created by
//! `/login` validating a username/password pair.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use axum::extract::{FromRequestParts, Request};
use axum::http::request::Parts;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use http::{header, HeaderValue, Method};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::Error;

pub const SESSION_COOKIE: &str = "switchdb_session";
const SESSION_TTL: Duration = Duration::from_secs(8 * 60 * 60);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    pub sub: String,
    pub exp: u64,
}

/// Signing/verification key for session cookies, generated once at startup
/// (spec.md §5 "Cookie secret ... initialized once at start; read-only
/// thereafter").
#[derive(Clone)]
pub struct SessionKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl SessionKeys {
    pub fn generate() -> Self {
        let secret: [u8; 64] = rand::random();
        Self {
            encoding: EncodingKey::from_secret(&secret),
            decoding: DecodingKey::from_secret(&secret),
        }
    }

    pub fn issue(&self, username: &str) -> anyhow::Result<String> {
        let exp = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() + SESSION_TTL.as_secs();
        let claims = SessionClaims { sub: username.to_owned(), exp };
        Ok(jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?)
    }

    pub fn verify(&self, token: &str) -> Option<SessionClaims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        jsonwebtoken::decode::<SessionClaims>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .ok()
    }
}

/// Extracted once per request by the auth gate; carries the authenticated
/// username forward to handlers and to the audit log.
#[derive(Clone, Debug)]
pub struct SessionAuth {
    pub username: String,
}

#[async_trait]
impl<S> FromRequestParts<S> for SessionAuth
where
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<SessionAuth>()
            .cloned()
            .ok_or(Error::NotAuthenticated)
    }
}

/// Credential submission for `POST /login` (spec.md §4.8: "form-encoded
/// `username`+`password`").
#[derive(Debug, Deserialize)]
pub struct LoginForm {
    pub username: String,
    pub password: String,
}

/// Pluggable credential check and RBAC decision point (spec.md §1 Non-goals:
/// "no authorization logic beyond a pluggable permission check"). The
/// default implementation accepts any non-empty username/password pair and
/// allows every method; a real deployment supplies its own.
#[async_trait]
pub trait PermissionCheck: Send + Sync {
    async fn authenticate(&self, username: &str, password: &str) -> bool;
    fn allow(&self, username: &str, method: &Method, path: &str) -> bool;
}

pub struct AllowAll;

#[async_trait]
impl PermissionCheck for AllowAll {
    async fn authenticate(&self, username: &str, password: &str) -> bool {
        !username.is_empty() && !password.is_empty()
    }

    fn allow(&self, _username: &str, _method: &Method, _path: &str) -> bool {
        true
    }
}

/// spec.md §4.8 steps 3-4: authentication gate, then permission gate. The
/// concrete middleware registered on the router wraps this with
/// `axum::middleware::from_fn_with_state`, supplying the shared state's
/// keys and permission object.
pub async fn apply_auth_gate(keys: &SessionKeys, permissions: &dyn PermissionCheck, mut request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        return next.run(request).await;
    }
    if request.uri().path() == "/login" {
        return next.run(request).await;
    }

    let token = request
        .headers()
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .and_then(|raw| find_cookie(raw, SESSION_COOKIE));

    let claims = token.as_deref().and_then(|t| keys.verify(t));
    let Some(claims) = claims else {
        return unauthenticated_response();
    };

    if !permissions.allow(&claims.sub, request.method(), request.uri().path()) {
        return Error::ForbiddenMethod.into_response();
    }

    request.extensions_mut().insert(SessionAuth { username: claims.sub });
    next.run(request).await
}

fn unauthenticated_response() -> Response {
    let mut response = Error::NotAuthenticated.into_response();
    response
        .headers_mut()
        .insert(header::LINK, HeaderValue::from_static("</login>; rel=\"login\""));
    response
}

fn find_cookie<'a>(header_value: &'a str, name: &str) -> Option<&'a str> {
    header_value.split(';').map(str::trim).find_map(|part| {
        let (k, v) = part.split_once('=')?;
        (k == name).then_some(v)
    })
}

/// Build the `Set-Cookie` value for a successful login. The cookie value
/// itself is a signed JWT (`SessionKeys::issue`), so the cookie needs no
/// separate signature — tampering invalidates the token, not just the
/// cookie framing.
pub fn session_cookie_header(keys: &SessionKeys, username: &str) -> anyhow::Result<HeaderValue> {
    let token = keys.issue(username)?;
    let value = format!(
        "{SESSION_COOKIE}={token}; Path=/; HttpOnly; SameSite=Strict; Max-Age={}",
        SESSION_TTL.as_secs()
    );
    Ok(HeaderValue::try_from(value)?)
}

pub fn expire_cookie_header() -> HeaderValue {
    HeaderValue::from_static("switchdb_session=; Path=/; HttpOnly; SameSite=Strict; Max-Age=0")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issues_and_verifies_session_tokens() {
        let keys = SessionKeys::generate();
        let token = keys.issue("admin").unwrap();
        let claims = keys.verify(&token).unwrap();
        assert_eq!(claims.sub, "admin");
    }

    #[test]
    fn rejects_tampered_tokens() {
        let keys = SessionKeys::generate();
        let token = keys.issue("admin").unwrap();
        let mut tampered = token.clone();
        tampered.push('x');
        assert!(keys.verify(&tampered).is_none());
    }

    #[test]
    fn finds_cookie_among_several() {
        let header = "foo=bar; switchdb_session=abc123; baz=qux";
        assert_eq!(find_cookie(header, SESSION_COOKIE), Some("abc123"));
        assert_eq!(find_cookie(header, "missing"), None);
    }
}
