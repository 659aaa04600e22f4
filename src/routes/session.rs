//! `/login` and `/logout` (spec.md §4.8).

use std::sync::Arc;

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Form;
use http::{header, StatusCode};

use crate::auth::{self, LoginForm};
use crate::routes::AppState;

pub async fn login(State(state): State<Arc<AppState>>, Form(form): Form<LoginForm>) -> Response {
    if !state.permissions.authenticate(&form.username, &form.password).await {
        return crate::error::Error::AuthenticationFailed.into_response();
    }

    match auth::session_cookie_header(&state.session_keys, &form.username) {
        Ok(cookie) => {
            let mut response = StatusCode::OK.into_response();
            response.headers_mut().insert(header::SET_COOKIE, cookie);
            response
        }
        Err(e) => crate::error::Error::Internal(e).into_response(),
    }
}

pub async fn logout() -> Response {
    let mut response = StatusCode::NO_CONTENT.into_response();
    response.headers_mut().insert(header::SET_COOKIE, auth::expire_cookie_header());
    response
}
