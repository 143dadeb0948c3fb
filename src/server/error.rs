//! Control-plane error responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::error;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
  pub code: &'static str,
  pub message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
  #[error("bad request: {0}")]
  BadRequest(String),

  #[error("internal error: {0}")]
  Internal(String),
}

impl ApiError {
  pub fn bad_request(e: impl std::fmt::Display) -> Self {
    Self::BadRequest(e.to_string())
  }

  pub fn code(&self) -> &'static str {
    match self {
      Self::BadRequest(_) => "bad_request",
      Self::Internal(_) => "internal_error",
    }
  }

  pub fn status_code(&self) -> StatusCode {
    match self {
      Self::BadRequest(_) => StatusCode::BAD_REQUEST,
      Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
  }
}

impl From<color_eyre::Report> for ApiError {
  fn from(e: color_eyre::Report) -> Self {
    Self::Internal(format!("{:#}", e))
  }
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    if let Self::Internal(message) = &self {
      error!("control request failed: {}", message);
    }
    let status = self.status_code();
    let body = ErrorResponse {
      code: self.code(),
      message: self.to_string(),
    };
    (status, Json(body)).into_response()
  }
}

pub type ApiResult<T> = Result<T, ApiError>;
