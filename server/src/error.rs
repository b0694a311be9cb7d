//! # Control Errors
//!
//! Errors a control request can fail with. Forwarding-path problems are not
//! errors; they are counted in [`crate::relay::RelayStats`].

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use fwd_protocol::{ErrorBody, ErrorDetail};

/// Convenient Result alias.
pub type FwdResult<T> = Result<T, FwdError>;

#[derive(Debug, thiserror::Error)]
pub enum FwdError {
    /// Malformed `ConnectToServer` argument; rejected before any side effect.
    #[error("Invalid url: {0}")]
    InvalidUrl(String),

    /// Malformed `AcceptClients` argument; rejected before any side effect.
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// The dial failed or timed out. State is unchanged.
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    /// The accept endpoint could not be bound. State is unchanged.
    #[error("Bind failed: {0}")]
    BindFailed(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl FwdError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidUrl(_) | Self::InvalidEndpoint(_) | Self::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::ConnectFailed(_) => StatusCode::BAD_GATEWAY,
            Self::BindFailed(_) => StatusCode::CONFLICT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for FwdError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorBody {
            error: ErrorDetail {
                code: status.as_u16(),
                message: self.to_string(),
            },
        };

        (status, axum::Json(body)).into_response()
    }
}
