//! Error types for the hall server.
//!
//! Every rejection leaves the server as a [`RejectionBody`] so terminals can
//! name the reason and, for `Unauthorized`, start the PIN flow.
//!
//! ```text
//! ┌──────────────────────────┬────────┬──────────────────────┐
//! │ Error                    │ Status │ code                 │
//! ├──────────────────────────┼────────┼──────────────────────┤
//! │ Conflict                 │ 409    │ conflict             │
//! │ InvalidTransition        │ 422    │ invalid_transition   │
//! │ InvalidTariff            │ 422    │ invalid_tariff       │
//! │ TooManyAttempts          │ 429    │ too_many_attempts    │
//! │ Unauthorized (elevation) │ 403    │ unauthorized         │
//! │ Unauthenticated          │ 401    │ unauthorized         │
//! │ NotFound                 │ 404    │ not_found            │
//! │ Validation / BadRequest  │ 400    │ validation           │
//! │ Persistence / Timeout    │ 503    │ network_failure      │
//! └──────────────────────────┴────────┴──────────────────────┘
//! ```

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::{debug, error};

use cue_core::{CoreError, RejectReason};
use cue_db::DbError;
use cue_sync::RejectionBody;

/// Hall server errors.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Persistence failed: {0}")]
    Persistence(DbError),

    #[error("Persistence did not finish within {0}ms")]
    Timeout(u64),

    #[error("Authentication failed: {0}")]
    Unauthenticated(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Constraint hits surface as domain errors; everything else is a storage
/// failure.
impl From<DbError> for ApiError {
    fn from(error: DbError) -> Self {
        match error {
            DbError::UniqueViolation { field, value } => {
                ApiError::Core(CoreError::conflict("table", value, format!("duplicate {field}")))
            }
            DbError::NotFound { entity, id } => ApiError::Core(CoreError::not_found(entity, id)),
            other => ApiError::Persistence(other),
        }
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Core(e) => match e.reason() {
                RejectReason::Conflict => StatusCode::CONFLICT,
                RejectReason::InvalidTransition | RejectReason::InvalidTariff => {
                    StatusCode::UNPROCESSABLE_ENTITY
                }
                RejectReason::TooManyAttempts => StatusCode::TOO_MANY_REQUESTS,
                RejectReason::Unauthorized => StatusCode::FORBIDDEN,
                RejectReason::NotFound => StatusCode::NOT_FOUND,
                RejectReason::Validation => StatusCode::BAD_REQUEST,
                RejectReason::NetworkFailure => StatusCode::SERVICE_UNAVAILABLE,
                RejectReason::Timeout => StatusCode::GATEWAY_TIMEOUT,
            },
            ApiError::Persistence(_) | ApiError::Timeout(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn body(&self) -> RejectionBody {
        match self {
            ApiError::Core(e) => RejectionBody::from(e),
            ApiError::Persistence(_) | ApiError::Timeout(_) | ApiError::Internal(_) => {
                rejection(RejectReason::NetworkFailure, self.to_string())
            }
            ApiError::Unauthenticated(_) => rejection(RejectReason::Unauthorized, self.to_string()),
            ApiError::BadRequest(_) => rejection(RejectReason::Validation, self.to_string()),
        }
    }
}

fn rejection(code: RejectReason, message: String) -> RejectionBody {
    RejectionBody {
        code,
        message,
        action: None,
        pending_id: None,
        retry_after_secs: None,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(%status, error = %self, "Request failed");
        } else {
            debug!(%status, error = %self, "Request rejected");
        }
        (status, Json(self.body())).into_response()
    }
}
