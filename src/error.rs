//! Crate-wide error type.
//!
//! Every fallible operation in the core returns [`Result<T>`]. The proxy and
//! the admin surface both map [`Error`] to a JSON `{"detail": ...}` body via
//! [`axum::response::IntoResponse`] so call sites can propagate with `?`
//! instead of hand-rolling a status code at every handler.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("unauthenticated")]
    Unauthenticated,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("validation: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("registry unreachable: {0}")]
    UpstreamUnreachable(String),

    #[error("registry request timed out")]
    UpstreamTimeout,

    #[error("tool failed: {0}")]
    ToolFailure(String),

    #[error("fatal internal error: {0}")]
    FatalInternal(String),

    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Serialize)]
struct ErrorBody {
    detail: String,
}

impl Error {
    fn status(&self) -> StatusCode {
        match self {
            Error::Unauthenticated => StatusCode::UNAUTHORIZED,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::UpstreamUnreachable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            Error::ToolFailure(_) => StatusCode::BAD_GATEWAY,
            Error::FatalInternal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Http(_) | Error::Io(_) | Error::Json(_) | Error::Join(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        if matches!(self, Error::FatalInternal(_)) {
            tracing::error!(error = %self, "fatal internal error");
        }
        let status = self.status();
        let mut response = (status, Json(ErrorBody { detail: self.to_string() })).into_response();
        if matches!(self, Error::Unauthenticated) {
            response.headers_mut().insert(
                axum::http::header::WWW_AUTHENTICATE,
                axum::http::HeaderValue::from_static("Basic realm=portalcrane-registry"),
            );
        }
        response
    }
}
