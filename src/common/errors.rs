//! Error types that cross the handler/arbiter seam.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::transfer::TransferError;

/// Why one exchange attempt did not complete.
///
/// Every variant is recorded as a failed attempt by the arbiter. When the
/// handler returns before answering the client, the arbiter answers with
/// [`ExchangeError::status`] and the JSON body produced by `IntoResponse`.
#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("client disconnected: {0}")]
    Disconnected(String),

    #[error("upstream answered {0}")]
    Upstream(StatusCode),

    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ExchangeError {
    pub fn status(&self) -> StatusCode {
        match self {
            ExchangeError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ExchangeError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ExchangeError::Disconnected(_) => StatusCode::BAD_REQUEST,
            ExchangeError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ExchangeError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            ExchangeError::Transfer(_) | ExchangeError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ExchangeError::BadRequest(_) => "bad_request",
            ExchangeError::Unauthorized(_) => "unauthorized",
            ExchangeError::Disconnected(_) => "disconnected",
            ExchangeError::Upstream(_) => "upstream",
            ExchangeError::Cancelled => "cancelled",
            ExchangeError::Transfer(_) => "transfer",
            ExchangeError::Internal(_) => "internal",
        }
    }

    /// Shorthand for a peer that went away mid-exchange.
    pub fn disconnected(reason: impl std::fmt::Display) -> Self {
        ExchangeError::Disconnected(reason.to_string())
    }
}

impl IntoResponse for ExchangeError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({
            "error": {
                "type": self.kind(),
                "message": self.to_string(),
            }
        }));
        (status, body).into_response()
    }
}
