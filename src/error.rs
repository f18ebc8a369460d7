use axum::{Json, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;
use validator::ValidationErrors;

use crate::{
    dao::storage::StorageError,
    state::state_machine::{InvalidTransition, Rejection},
};

/// Why a ballot was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VoteRejection {
    /// The voter already cast a ballot in this round.
    #[error("already voted in this round")]
    AlreadyVoted,
    /// No round is accepting votes.
    #[error("no active round")]
    NoActiveRound,
}

/// Errors that can occur in service layer operations.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Storage backend is unavailable.
    #[error("storage unavailable")]
    Unavailable(#[source] StorageError),
    /// Application is running in degraded mode without storage.
    #[error("storage unavailable (degraded mode)")]
    Degraded,
    /// Unauthorized access attempt.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// Invalid input provided by the client.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Operation cannot be performed in the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// Requested resource was not found.
    #[error("not found: {0}")]
    NotFound(String),
    /// Ballot refused.
    #[error("vote rejected: {0}")]
    VoteRejected(VoteRejection),
    /// Operation exceeded its timeout limit.
    #[error("operation timed out")]
    Timeout,
}

/// Machine-readable category attached to every rejected command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Missing or malformed fields.
    Validation,
    /// Caller may not perform the command.
    Unauthorized,
    /// Battle, round or participant absent.
    NotFound,
    /// Command clashes with the current state.
    Conflict,
    /// Storage is unreachable.
    Unavailable,
    /// Persistence did not answer in time.
    Timeout,
}

impl ServiceError {
    /// Category reported to the originating caller.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServiceError::Unavailable(_) | ServiceError::Degraded => ErrorKind::Unavailable,
            ServiceError::Unauthorized(_) => ErrorKind::Unauthorized,
            ServiceError::InvalidInput(_) => ErrorKind::Validation,
            ServiceError::InvalidState(_) | ServiceError::VoteRejected(_) => ErrorKind::Conflict,
            ServiceError::NotFound(_) => ErrorKind::NotFound,
            ServiceError::Timeout => ErrorKind::Timeout,
        }
    }
}

impl From<StorageError> for ServiceError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Conflict { message } => ServiceError::InvalidState(message),
            other => ServiceError::Unavailable(other),
        }
    }
}

impl From<InvalidTransition> for ServiceError {
    fn from(err: InvalidTransition) -> Self {
        match err.reason {
            Rejection::NotStarted => ServiceError::Unauthorized(err.reason.to_string()),
            Rejection::RoundOutOfRange { .. } => ServiceError::InvalidInput(err.reason.to_string()),
            Rejection::AlreadyFinished
            | Rejection::RoundAlreadyRunning
            | Rejection::RoundNotRunning => ServiceError::InvalidState(err.reason.to_string()),
        }
    }
}

impl From<ValidationErrors> for ServiceError {
    fn from(err: ValidationErrors) -> Self {
        ServiceError::InvalidInput(format!("validation failed: {}", err))
    }
}

impl From<ValidationErrors> for AppError {
    fn from(err: ValidationErrors) -> Self {
        AppError::BadRequest(format!("validation failed: {}", err))
    }
}

/// Application-level errors that are converted to HTTP responses.
#[derive(Debug, Error)]
pub enum AppError {
    /// Bad request with invalid input.
    #[error("bad request: {0}")]
    BadRequest(String),
    /// Unauthorized access attempt.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// Requested resource not found.
    #[error("not found: {0}")]
    NotFound(String),
    /// Conflict with current state.
    #[error("conflict: {0}")]
    Conflict(String),
    /// Service unavailable or degraded.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Unavailable(source) => AppError::ServiceUnavailable(source.to_string()),
            ServiceError::Degraded => AppError::ServiceUnavailable("degraded mode".into()),
            ServiceError::Unauthorized(message) => AppError::Unauthorized(message),
            ServiceError::InvalidInput(message) => AppError::BadRequest(message),
            ServiceError::InvalidState(message) => AppError::Conflict(message),
            ServiceError::VoteRejected(reason) => AppError::Conflict(reason.to_string()),
            ServiceError::NotFound(message) => AppError::NotFound(message),
            ServiceError::Timeout => AppError::ServiceUnavailable("operation timed out".into()),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        };

        let payload = Json(ErrorBody {
            message: self.to_string(),
        });

        (status, payload).into_response()
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::state::{battle::Phase, state_machine::BattleEvent};

    fn transition_error(reason: Rejection) -> InvalidTransition {
        InvalidTransition {
            battle_state: Phase::Pending,
            round_state: Phase::Pending,
            event: BattleEvent::RoundStarted {
                round_number: 1,
                round_id: Uuid::nil(),
                duration_secs: 60,
            },
            reason,
        }
    }

    #[test]
    fn round_before_start_is_an_authorization_failure() {
        let err: ServiceError = transition_error(Rejection::NotStarted).into();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
        assert!(err.to_string().contains("start battle first"));
    }

    #[test]
    fn state_clashes_are_conflicts() {
        let err: ServiceError = transition_error(Rejection::RoundAlreadyRunning).into();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        let err = ServiceError::VoteRejected(VoteRejection::AlreadyVoted);
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn storage_conflicts_surface_as_conflicts() {
        let err: ServiceError = StorageError::conflict("slot taken").into();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn app_errors_map_to_http_statuses() {
        let cases = [
            (AppError::BadRequest("x".into()), StatusCode::BAD_REQUEST),
            (AppError::Unauthorized("x".into()), StatusCode::UNAUTHORIZED),
            (AppError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (AppError::Conflict("x".into()), StatusCode::CONFLICT),
            (
                AppError::ServiceUnavailable("x".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(err.into_response().status(), status);
        }

        let forbidden: AppError = ServiceError::Unauthorized("not the moderator".into()).into();
        assert_eq!(forbidden.into_response().status(), StatusCode::UNAUTHORIZED);
    }
}
