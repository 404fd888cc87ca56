//! API error type and its JSON rendering (`{ "error": message }`).

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::service::TaskError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Access token required")]
    Unauthenticated,

    #[error("Invalid token")]
    Forbidden,

    #[error("Authentication failed")]
    LoginRejected,

    #[error("{0}")]
    Validation(String),

    #[error("Task not found")]
    TaskNotFound,

    #[error("User not found")]
    UserNotFound,

    #[error("Task already completed today")]
    AlreadyCompleted,

    #[error("Too many requests, please try again later.")]
    RateLimited,

    /// Identity provider or reward network failure. `cause` is logged, never returned.
    #[error("{message}")]
    Upstream { message: &'static str, cause: String },

    #[error("Internal server error")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthenticated | ApiError::LoginRejected => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::Validation(_) | ApiError::AlreadyCompleted => StatusCode::BAD_REQUEST,
            ApiError::TaskNotFound | ApiError::UserNotFound => StatusCode::NOT_FOUND,
            ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Upstream { .. } | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<TaskError> for ApiError {
    fn from(err: TaskError) -> Self {
        match err {
            TaskError::Validation(msg) => ApiError::Validation(msg),
            TaskError::TaskNotFound(_) => ApiError::TaskNotFound,
            TaskError::UserNotFound(_) => ApiError::UserNotFound,
            TaskError::AlreadyCompleted { .. } => ApiError::AlreadyCompleted,
            TaskError::Store(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match &self {
            ApiError::Upstream { message, cause } => {
                tracing::error!("{}: {}", message, cause);
            }
            ApiError::Internal(cause) => {
                tracing::error!("Internal error: {}", cause);
            }
            _ => {}
        }
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (self.status(), body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_task_errors_map_to_status() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let cases = [
            (TaskError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (TaskError::TaskNotFound("x".into()), StatusCode::NOT_FOUND),
            (TaskError::UserNotFound("x".into()), StatusCode::NOT_FOUND),
            (
                TaskError::AlreadyCompleted {
                    task_id: "tweet".into(),
                    date,
                },
                StatusCode::BAD_REQUEST,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
    }

    #[test]
    fn test_upstream_hides_cause() {
        let err = ApiError::Upstream {
            message: "Authentication failed",
            cause: "dns lookup failed".into(),
        };
        assert_eq!(err.to_string(), "Authentication failed");
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(ApiError::Internal("db".into()).to_string(), "Internal server error");
    }
}
