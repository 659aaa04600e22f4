//! Single error taxonomy for the whole gateway.
//!
//! Every component below the front door returns `Result<T, Error>`; the
//! front door is the only place that converts a kind into an HTTP status
//! (mirrors the teacher's single `log_and_500` conversion point, widened to
//! the full taxonomy this system needs).

use axum::response::{IntoResponse, Response};
use axum::Json;
use http::StatusCode;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not authenticated")]
    NotAuthenticated,
    #[error("authentication failed")]
    AuthenticationFailed,
    #[error("method forbidden by permission policy")]
    ForbiddenMethod,
    #[error("resource not found")]
    ResourceNotFound,
    #[error("method not allowed for this resource")]
    MethodNotAllowed,
    #[error("data validation failed: {0}")]
    DataValidationFailed(String),
    #[error("query parameter not allowed here: {0}")]
    ParameterNotAllowed(String),
    #[error("transaction failed")]
    TransactionFailed,
    #[error("precondition failed")]
    PreconditionFailed,
    #[error("not modified")]
    NotModified,
    #[error(transparent)]
    Schema(#[from] crate::schema::SchemaError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Business-level validator error codes, per spec.md §4.6/§7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u32)]
pub enum ValidatorCode {
    VerificationFailed = 10001,
    NoReferencedBy = 10002,
    FailedReferencedBy = 10003,
    ResourcesExceeded = 10004,
    MethodProhibited = 10005,
    DuplicateResource = 10006,
}

#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct ValidationError {
    pub code: ValidatorCode,
    pub fields: Vec<String>,
    pub message: String,
}

impl ValidationError {
    pub fn new(code: ValidatorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            fields: Vec::new(),
            message: message.into(),
        }
    }

    pub fn with_fields(mut self, fields: Vec<String>) -> Self {
        self.fields = fields;
        self
    }
}

#[derive(Serialize)]
struct ErrorBody {
    code: u32,
    fields: Vec<String>,
    message: String,
}

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Error::NotAuthenticated | Error::AuthenticationFailed => StatusCode::UNAUTHORIZED,
            Error::ForbiddenMethod => StatusCode::FORBIDDEN,
            Error::ResourceNotFound => StatusCode::NOT_FOUND,
            Error::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Error::DataValidationFailed(_) | Error::ParameterNotAllowed(_) | Error::Validation(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::TransactionFailed | Error::Internal(_) | Error::Schema(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Error::PreconditionFailed => StatusCode::PRECONDITION_FAILED,
            Error::NotModified => StatusCode::NOT_MODIFIED,
        }
    }

    fn body(&self) -> ErrorBody {
        let (code, fields) = match self {
            Error::Validation(v) => (v.code as u32, v.fields.clone()),
            _ => (0, Vec::new()),
        };
        ErrorBody {
            code,
            fields,
            message: self.to_string(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        if matches!(self, Error::TransactionFailed | Error::Internal(_) | Error::Schema(_)) {
            tracing::error!(error = %self, "request failed");
        }
        let status = self.status();
        if status == StatusCode::NOT_MODIFIED {
            return status.into_response();
        }
        (status, Json(self.body())).into_response()
    }
}

impl From<crate::uri::UriError> for Error {
    fn from(_: crate::uri::UriError) -> Self {
        Error::ResourceNotFound
    }
}

pub type Result<T> = std::result::Result<T, Error>;
