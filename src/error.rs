//! # Error Handling
//!
//! [`CoreError`] is the taxonomy every sync-core operation returns.
//! [`ApiError`] is its client-facing translation: a problem+json body with a
//! stable machine-readable code and the trace id of the active execution
//! context. Unexpected failures never leak their internals through it.

use axum::{
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use sea_orm::DbErr;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::telemetry;

/// Errors produced by the scheduler, orchestrator and run tracker.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Unknown job/session/run/instance id
    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    /// Operation not allowed in the current state
    #[error("conflict: {0}")]
    Conflict(String),

    /// A single instance could not be reached
    #[error("instance {instance_id} unreachable: {message}")]
    ConnectionFailure { instance_id: Uuid, message: String },

    /// Malformed input rejected at the write boundary
    #[error("validation failed: {0}")]
    Validation(String),

    /// Anything caught at a detached execution boundary
    #[error("unexpected failure: {0}")]
    Unexpected(String),

    #[error("database error: {0}")]
    Database(DbErr),
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        CoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Short category name used for metrics labels and audit context.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::NotFound { .. } => "not_found",
            CoreError::Conflict(_) => "conflict",
            CoreError::ConnectionFailure { .. } => "connection_failure",
            CoreError::Validation(_) => "validation",
            CoreError::Unexpected(_) => "unexpected",
            CoreError::Database(_) => "database",
        }
    }
}

impl From<DbErr> for CoreError {
    fn from(error: DbErr) -> Self {
        if is_unique_violation(&error) {
            tracing::debug!(?error, "unique constraint violation detected");
            return CoreError::Conflict("resource already exists".to_string());
        }
        match error {
            DbErr::RecordNotFound(record) => CoreError::NotFound {
                entity: "record",
                id: record,
            },
            other => CoreError::Database(other),
        }
    }
}

impl From<anyhow::Error> for CoreError {
    fn from(error: anyhow::Error) -> Self {
        CoreError::Unexpected(format!("{error:#}"))
    }
}

fn is_unique_violation(error: &DbErr) -> bool {
    use sea_orm::RuntimeErr;

    const PG_UNIQUE: &str = "23505";
    const SQLITE_DUPLICATE_CODES: &[&str] = &["1555", "2067"];

    let runtime_err = match error {
        DbErr::Query(RuntimeErr::SqlxError(sqlx_err))
        | DbErr::Exec(RuntimeErr::SqlxError(sqlx_err)) => sqlx_err,
        _ => return false,
    };

    let Some(db_error) = runtime_err.as_database_error() else {
        return false;
    };

    if db_error.is_unique_violation() {
        return true;
    }

    if let Some(code) = db_error.code() {
        let code_str = code.as_ref();
        return code_str == PG_UNIQUE || SQLITE_DUPLICATE_CODES.contains(&code_str);
    }

    false
}

/// Unified client-facing error structure
#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    /// HTTP status code for the response
    #[serde(skip_serializing)]
    pub status: StatusCode,
    /// Error code for programmatic handling
    pub code: Box<str>,
    /// Human-readable error message
    pub message: Box<str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Box<serde_json::Value>>,
    /// Correlation id of the execution context the error was raised in
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<Box<str>>,
}

impl ApiError {
    pub fn new<S: Into<String>>(status: StatusCode, code: S, message: S) -> Self {
        Self {
            status,
            code: code.into().into_boxed_str(),
            message: message.into().into_boxed_str(),
            details: None,
            trace_id: Self::current_trace_id(),
        }
    }

    pub fn with_details<V: Into<serde_json::Value>>(mut self, details: V) -> Self {
        self.details = Some(Box::new(details.into()));
        self
    }

    /// Trace id from the active execution context, or a generated correlation id
    fn current_trace_id() -> Option<Box<str>> {
        telemetry::current_trace_id()
            .map(|trace_id| trace_id.into_boxed_str())
            .or_else(|| Some(format!("corr-{}", &Uuid::new_v4().simple().to_string()[..8]).into()))
    }

    fn internal() -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_SERVER_ERROR",
            "An internal error occurred",
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(
            "content-type",
            HeaderValue::from_static("application/problem+json"),
        );

        (self.status, headers, axum::Json(self)).into_response()
    }
}

impl From<CoreError> for ApiError {
    fn from(error: CoreError) -> Self {
        match error {
            CoreError::NotFound { entity, id } => Self::new(
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                &format!("{entity} '{id}' not found"),
            )
            .with_details(serde_json::json!({ "entity": entity, "id": id })),
            CoreError::Conflict(message) => Self::new(StatusCode::CONFLICT, "CONFLICT", &message),
            CoreError::Validation(message) => {
                Self::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", &message)
            }
            CoreError::ConnectionFailure {
                instance_id,
                message,
            } => Self::new(
                StatusCode::BAD_GATEWAY,
                "INSTANCE_UNREACHABLE",
                &format!("instance {instance_id} could not be reached"),
            )
            .with_details(serde_json::json!({
                "instance_id": instance_id,
                "reason": message,
            })),
            CoreError::Unexpected(message) => {
                tracing::error!(error = %message, "unexpected failure");
                Self::internal()
            }
            CoreError::Database(db_err) => {
                tracing::error!(error = ?db_err, "database error");
                Self::internal()
            }
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        tracing::error!("Internal error: {:?}", error);
        Self::internal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_maps_to_stable_code() {
        let api: ApiError = CoreError::not_found("scheduler job", "sync_accounts").into();
        assert_eq!(api.status, StatusCode::NOT_FOUND);
        assert_eq!(api.code, Box::from("NOT_FOUND"));
        assert!(api.message.contains("sync_accounts"));
        assert!(api.trace_id.is_some());
    }

    #[test]
    fn conflict_and_validation_codes() {
        let conflict: ApiError = CoreError::Conflict("scheduler not running".into()).into();
        assert_eq!(conflict.status, StatusCode::CONFLICT);
        assert_eq!(conflict.code, Box::from("CONFLICT"));

        let invalid: ApiError = CoreError::Validation("bad cron".into()).into();
        assert_eq!(invalid.status, StatusCode::BAD_REQUEST);
        assert_eq!(invalid.code, Box::from("VALIDATION_FAILED"));
    }

    #[test]
    fn unexpected_failure_hides_internals() {
        let api: ApiError = CoreError::Unexpected("panicked at src/secret.rs:42".into()).into();
        assert_eq!(api.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(api.code, Box::from("INTERNAL_SERVER_ERROR"));
        assert!(!api.message.contains("secret"));
        assert!(api.details.is_none());
    }

    #[test]
    fn connection_failure_carries_instance() {
        let instance_id = Uuid::new_v4();
        let api: ApiError = CoreError::ConnectionFailure {
            instance_id,
            message: "refused".into(),
        }
        .into();
        assert_eq!(api.code, Box::from("INSTANCE_UNREACHABLE"));
        let details = api.details.expect("details");
        assert_eq!(details["instance_id"], serde_json::json!(instance_id));
    }

    #[test]
    fn responds_with_problem_json() {
        let response = ApiError::from(CoreError::Conflict("paused".into())).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/problem+json"
        );
    }

    #[test]
    fn record_not_found_becomes_not_found() {
        let err: CoreError = DbErr::RecordNotFound("sync_sessions".into()).into();
        assert!(matches!(err, CoreError::NotFound { .. }));
        assert_eq!(err.kind(), "not_found");
    }
}
