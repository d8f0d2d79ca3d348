use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use hostpulse_bus::{SinkError, ValidationError};
use serde::Serialize;

/// Failure while writing a metric
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Any sqlx failure; see [`StoreError::is_transient`] for which ones are retried
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Disk or network blob could not be encoded
    #[error("blob encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("invalid message: {0}")]
    Invalid(#[from] ValidationError),

    /// A value does not fit the column type
    #[error("value out of range: {0}")]
    OutOfRange(&'static str),

    #[error("store setup failed: {0}")]
    Setup(String),
}

impl StoreError {
    /// Whether the same write may succeed later.
    ///
    /// Pool, I/O and busy/locked/full database conditions are retried. SQL errors
    /// and constraint violations would fail the same way on every redelivery.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Database(err) => is_transient_sqlx(err),
            _ => false,
        }
    }
}

fn is_transient_sqlx(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => db.code().is_some_and(|code| is_transient_sqlite_code(&code)),
        _ => false,
    }
}

/// SQLite reports extended result codes; the low byte is the primary code
fn is_transient_sqlite_code(code: &str) -> bool {
    const BUSY: i64 = 5;
    const LOCKED: i64 = 6;
    const IOERR: i64 = 10;
    const FULL: i64 = 13;
    const CANTOPEN: i64 = 14;

    code.parse::<i64>()
        .map(|extended| matches!(extended & 0xff, BUSY | LOCKED | IOERR | FULL | CANTOPEN))
        .unwrap_or(false)
}

impl From<StoreError> for SinkError {
    fn from(err: StoreError) -> Self {
        if err.is_transient() {
            SinkError::Transient(err.to_string())
        } else {
            SinkError::Rejected(err.to_string())
        }
    }
}

/// Failure while reading metrics
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    /// Rejected before any query ran
    #[error("{0}")]
    InvalidArgument(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored row could not be turned back into a message
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl QueryError {
    pub fn invalid(message: impl Into<String>) -> Self {
        QueryError::InvalidArgument(message.into())
    }
}

impl From<serde_json::Error> for QueryError {
    fn from(err: serde_json::Error) -> Self {
        QueryError::Corrupt(err.to_string())
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    code: &'a str,
    message: String,
}

/// Error returned by HTTP handlers
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    InvalidArgument(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("missing or invalid API key")]
    Unauthorized,
    #[error("{0}")]
    Internal(String),
}

impl From<QueryError> for ApiError {
    fn from(err: QueryError) -> Self {
        match err {
            QueryError::InvalidArgument(message) => ApiError::InvalidArgument(message),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::InvalidArgument(message) => {
                (StatusCode::BAD_REQUEST, "invalid_argument", message.clone())
            }
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found", self.to_string()),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized", self.to_string()),
            ApiError::Internal(detail) => {
                tracing::error!(error = %detail, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal",
                    "internal error".to_string(),
                )
            }
        };
        (status, Json(ErrorBody { code, message })).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_database_errors_are_transient() {
        let db = StoreError::Database(sqlx::Error::PoolTimedOut);
        assert!(matches!(SinkError::from(db), SinkError::Transient(_)));

        let invalid = StoreError::Invalid(ValidationError::ZeroUptime);
        assert!(matches!(SinkError::from(invalid), SinkError::Rejected(_)));

        let range = StoreError::OutOfRange("uptime");
        assert!(matches!(SinkError::from(range), SinkError::Rejected(_)));
    }

    #[test]
    fn test_pool_failures_are_transient() {
        assert!(StoreError::Database(sqlx::Error::PoolClosed).is_transient());
        assert!(!StoreError::Database(sqlx::Error::RowNotFound).is_transient());
    }

    #[test]
    fn test_sqlite_result_codes() {
        // busy, busy_snapshot, locked, ioerr_write, full
        for code in ["5", "517", "6", "778", "13"] {
            assert!(is_transient_sqlite_code(code), "{code}");
        }
        // generic error, constraint_unique, readonly, garbage
        for code in ["1", "2067", "8", "busy"] {
            assert!(!is_transient_sqlite_code(code), "{code}");
        }
    }

    #[test]
    fn test_api_error_status_codes() {
        let resp = ApiError::InvalidArgument("hostname is required".into()).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = ApiError::NotFound("host".into()).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = ApiError::from(QueryError::Corrupt("bad disk blob".into())).into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
