//! API error type and [`axum::response::IntoResponse`] implementation.

use axum::{
  Json,
  http::StatusCode,
  response::{IntoResponse, Response},
};
use roster_core::Error as CoreError;
use serde_json::json;
use thiserror::Error;

/// An error returned by an API handler.
#[derive(Debug, Error)]
pub enum ApiError {
  #[error(transparent)]
  Core(#[from] CoreError),

  #[error("bad request: {0}")]
  BadRequest(String),
}

impl ApiError {
  pub fn status(&self) -> StatusCode {
    match self {
      Self::BadRequest(_) => StatusCode::BAD_REQUEST,
      Self::Core(e) => match e {
        CoreError::InvalidRange(_) | CoreError::TooLong { .. } => StatusCode::BAD_REQUEST,
        CoreError::Forbidden { .. } => StatusCode::FORBIDDEN,
        CoreError::NotFound(_) | CoreError::NoActiveAfk(_) | CoreError::UnknownGroup(_) => {
          StatusCode::NOT_FOUND
        }
        CoreError::OverlapConflict { .. }
        | CoreError::AlreadyExpired(_)
        | CoreError::AlreadyEnded(..)
        | CoreError::ConcurrentUpdate(_)
        | CoreError::AlreadyOpen { .. }
        | CoreError::NoOpenInterval { .. } => StatusCode::CONFLICT,
        CoreError::StoreUnavailable(_) | CoreError::SnapshotUnavailable(_) => {
          StatusCode::SERVICE_UNAVAILABLE
        }
        CoreError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
      },
    }
  }

  fn kind(&self) -> &'static str {
    match self {
      Self::Core(e) => e.kind(),
      Self::BadRequest(_) => "bad_request",
    }
  }
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    let status = self.status();
    if status.is_server_error() {
      tracing::error!(error = %self, "request failed");
    }
    let body = json!({ "error": self.to_string(), "kind": self.kind() });
    (status, Json(body)).into_response()
  }
}
