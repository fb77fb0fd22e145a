use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use thiserror::Error;

use crate::store::StoreError;

/// Errors surfaced to clients as a Matrix error envelope.
///
/// Every variant maps to exactly one `(status, errcode, error)` triple; the
/// message text is part of the wire contract, so tests assert on it.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Bad parameter: {0}")]
    InvalidParam(&'static str),
    #[error("Invalid username or password")]
    Forbidden,
    #[error("Bad login type.")]
    BadLoginType,
    #[error("Missing access token")]
    MissingToken,
    #[error("Invalid token")]
    UnknownToken,
    #[error("Room alias already taken")]
    RoomInUse,
    #[error("Room not found")]
    RoomNotFound,
    #[error("The target user_id is not a room member.")]
    NotMember,
    #[error("Unrecognized request")]
    Unrecognized,
    #[error("Method not allowed")]
    MethodNotAllowed,
    #[error("Session has not been provisioned for this account")]
    SessionNotProvisioned,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Serialize)]
struct ErrorBody {
    errcode: &'static str,
    error: String,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidParam(_) | ApiError::RoomInUse => StatusCode::BAD_REQUEST,
            ApiError::MissingToken | ApiError::UnknownToken => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden | ApiError::BadLoginType | ApiError::NotMember => {
                StatusCode::FORBIDDEN
            }
            ApiError::RoomNotFound | ApiError::Unrecognized => StatusCode::NOT_FOUND,
            ApiError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ApiError::SessionNotProvisioned | ApiError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn errcode(&self) -> &'static str {
        match self {
            ApiError::InvalidParam(_) => "M_INVALID_PARAM",
            ApiError::Forbidden => "M_FORBIDDEN",
            ApiError::BadLoginType => "M_UNKNOWN",
            ApiError::MissingToken => "M_MISSING_TOKEN",
            ApiError::UnknownToken => "M_UNKNOWN_TOKEN",
            ApiError::RoomInUse => "M_ROOM_IN_USE",
            ApiError::RoomNotFound => "M_NOT_FOUND",
            ApiError::NotMember => "M_NOT_MEMBER",
            ApiError::Unrecognized | ApiError::MethodNotAllowed => "M_UNRECOGNIZED",
            ApiError::SessionNotProvisioned | ApiError::Internal(_) => "M_UNKNOWN",
        }
    }

    fn message(&self) -> String {
        match self {
            // Never leak internal error chains to clients.
            ApiError::Internal(_) | ApiError::SessionNotProvisioned => {
                "Internal server error".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        if matches!(self, ApiError::Internal(_) | ApiError::SessionNotProvisioned) {
            tracing::error!(error = %self, "request failed");
        }

        let body = ErrorBody {
            errcode: self.errcode(),
            error: self.message(),
        };
        (self.status(), Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::AliasTaken => ApiError::RoomInUse,
            // Token collisions are retried by the session service; one that
            // escapes here means the retry budget ran out.
            StoreError::AccessTokenInUse => {
                ApiError::Internal(anyhow::anyhow!("token regeneration budget exhausted"))
            }
            StoreError::Backend(err) => ApiError::Internal(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_param_names_the_field() {
        let err = ApiError::InvalidParam("identifier");
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.errcode(), "M_INVALID_PARAM");
        assert_eq!(err.to_string(), "Bad parameter: identifier");
    }

    #[test]
    fn forbidden_merges_unknown_user_and_bad_password() {
        let err = ApiError::Forbidden;
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
        assert_eq!(err.errcode(), "M_FORBIDDEN");
        assert_eq!(err.to_string(), "Invalid username or password");
    }

    #[test]
    fn internal_errors_hide_their_cause() {
        let err = ApiError::Internal(anyhow::anyhow!("pool exhausted at 10.0.0.5"));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.errcode(), "M_UNKNOWN");
        assert_eq!(err.message(), "Internal server error");
    }

    #[test]
    fn alias_conflicts_become_room_in_use() {
        let err = ApiError::from(StoreError::AliasTaken);
        assert!(matches!(err, ApiError::RoomInUse));
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }
}
