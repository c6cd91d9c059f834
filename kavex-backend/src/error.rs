use axum::{
  Json,
  http::StatusCode,
  response::{IntoResponse, Response},
};
use serde::Serialize;

/// API error response structure
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
  pub error: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub details: Option<String>,
}

impl ErrorResponse {
  pub fn new(error: impl Into<String>) -> Self {
    Self {
      error: error.into(),
      details: None,
    }
  }

  pub fn with_details(error: impl Into<String>, details: impl Into<String>) -> Self {
    Self {
      error: error.into(),
      details: Some(details.into()),
    }
  }
}

/// Application error type
#[derive(Debug)]
pub enum AppError {
  DatabaseError(kavex_db::DbError),
  ValidationError(String),
  /// The presented token matches no link.
  Unauthorized,
}

impl IntoResponse for AppError {
  fn into_response(self) -> Response {
    match self {
      AppError::DatabaseError(db_err) => {
        let (status, message) = match db_err {
          kavex_db::DbError::ChannelAlreadyLinked | kavex_db::DbError::TokenAlreadyLinked => {
            tracing::warn!(?db_err, "link conflict");
            (StatusCode::CONFLICT, "Link conflict")
          }
          kavex_db::DbError::InvalidTokenHash => {
            (StatusCode::BAD_REQUEST, "Invalid token hash")
          }
          kavex_db::DbError::Sqlite(_)
          | kavex_db::DbError::Connection(_)
          | kavex_db::DbError::CorruptRow(_) => {
            // Don't expose internal database errors
            tracing::error!(?db_err, "Internal database error");
            (
              StatusCode::INTERNAL_SERVER_ERROR,
              "An internal error occurred. Please try again later.",
            )
          }
        };

        (status, Json(ErrorResponse::new(message))).into_response()
      }
      AppError::ValidationError(msg) => {
        tracing::warn!(validation_error = %msg, "Validation failed");
        let error_response = ErrorResponse::with_details("Invalid request", msg);
        (StatusCode::BAD_REQUEST, Json(error_response)).into_response()
      }
      AppError::Unauthorized => {
        let error_response = ErrorResponse::new("Token does not match any linked channel");
        (StatusCode::UNAUTHORIZED, Json(error_response)).into_response()
      }
    }
  }
}

impl From<kavex_db::DbError> for AppError {
  fn from(err: kavex_db::DbError) -> Self {
    AppError::DatabaseError(err)
  }
}

impl From<crate::validation::ValidationError> for AppError {
  fn from(err: crate::validation::ValidationError) -> Self {
    AppError::ValidationError(err.to_string())
  }
}
