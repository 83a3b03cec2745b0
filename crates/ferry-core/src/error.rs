//! Engine error taxonomy.
//!
//! Components return [`EngineError`] at their boundaries; internal glue
//! uses `anyhow` and folds into [`EngineError::Internal`] at the edge.

use uuid::Uuid;

use ferry_db::server::ServerKey;

/// Errors surfaced by the transfer engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid task configuration: {0}")]
    InvalidConfig(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("task {0} is already running")]
    AlreadyRunning(Uuid),

    #[error("task {0} cannot be triggered manually")]
    NotManual(Uuid),

    #[error("another scheduled transfer is running; try again later")]
    GlobalBusy,

    #[error("no connection available to {server} server: {message}")]
    ConnectionUnavailable { server: ServerKey, message: String },

    #[error("connection to {server} server lost: {message}")]
    ConnectionLost { server: ServerKey, message: String },

    #[error("query execution failed [{}]: {}", .sql_state.as_deref().unwrap_or("no-state"), .message)]
    QueryExecutionFailed {
        message: String,
        sql_state: Option<String>,
    },

    #[error("validation failed: {0}")]
    ValidationFailed(String),

    #[error("execution cancelled")]
    Cancelled,

    #[error("linked group {group:?} partially failed at member {failed_member:?}")]
    GroupPartiallyFailed {
        group: String,
        failed_member: String,
        /// Members whose transactions had already committed.
        committed: Vec<String>,
    },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    /// Stable code exposed to API callers.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig(_) => "INVALID_CONFIG",
            Self::NotFound(_) => "NOT_FOUND",
            Self::AlreadyRunning(_) => "ALREADY_RUNNING",
            Self::NotManual(_) => "NOT_MANUAL",
            Self::GlobalBusy => "GLOBAL_BUSY",
            Self::ConnectionUnavailable { .. } => "CONNECTION_UNAVAILABLE",
            Self::ConnectionLost { .. } => "CONNECTION_LOST",
            Self::QueryExecutionFailed { .. } => "QUERY_EXECUTION_FAILED",
            Self::ValidationFailed(_) => "VALIDATION_FAILED",
            Self::Cancelled => "CANCELLED",
            Self::GroupPartiallyFailed { .. } => "GROUP_PARTIALLY_FAILED",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Whether the retry executor may reattempt after this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ConnectionUnavailable { .. } | Self::ConnectionLost { .. } => true,
            Self::QueryExecutionFailed { message, .. } => {
                crate::retry::is_retryable_message(message)
            }
            _ => false,
        }
    }

    /// Classify a driver error raised while talking to one server.
    pub fn from_sqlx(server: ServerKey, err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut => Self::ConnectionUnavailable {
                server,
                message: "pool acquire timed out".to_owned(),
            },
            sqlx::Error::PoolClosed => Self::ConnectionUnavailable {
                server,
                message: "pool is closed".to_owned(),
            },
            sqlx::Error::Io(e) => Self::ConnectionLost {
                server,
                message: e.to_string(),
            },
            sqlx::Error::Protocol(msg) => Self::ConnectionLost {
                server,
                message: msg,
            },
            sqlx::Error::Database(db) => Self::QueryExecutionFailed {
                sql_state: db.code().map(|c| c.into_owned()),
                message: db.message().to_owned(),
            },
            other => {
                let message = other.to_string();
                if crate::retry::is_retryable_message(&message) {
                    Self::ConnectionLost { server, message }
                } else {
                    Self::QueryExecutionFailed {
                        message,
                        sql_state: None,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(EngineError::GlobalBusy.code(), "GLOBAL_BUSY");
        assert_eq!(EngineError::Cancelled.code(), "CANCELLED");
        assert_eq!(
            EngineError::InvalidConfig("x".into()).code(),
            "INVALID_CONFIG"
        );
    }

    #[test]
    fn cancelled_is_not_retryable() {
        assert!(!EngineError::Cancelled.is_retryable());
    }

    #[test]
    fn connection_errors_are_retryable() {
        let err = EngineError::ConnectionLost {
            server: ServerKey::Source,
            message: "broken pipe".into(),
        };
        assert!(err.is_retryable());

        let err = EngineError::ConnectionUnavailable {
            server: ServerKey::Target,
            message: "pool acquire timed out".into(),
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn pool_timeout_classification() {
        let err = EngineError::from_sqlx(ServerKey::Source, sqlx::Error::PoolTimedOut);
        assert!(matches!(err, EngineError::ConnectionUnavailable { .. }));
        assert_eq!(err.code(), "CONNECTION_UNAVAILABLE");
    }

    #[test]
    fn query_failure_with_transient_message_is_retryable() {
        let err = EngineError::QueryExecutionFailed {
            message: "terminating connection due to administrator command".into(),
            sql_state: Some("57P01".into()),
        };
        assert!(err.is_retryable());

        let err = EngineError::QueryExecutionFailed {
            message: "syntax error at or near \"FROM\"".into(),
            sql_state: Some("42601".into()),
        };
        assert!(!err.is_retryable());
    }
}
