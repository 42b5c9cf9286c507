//! Engine-wide error taxonomy.
//!
//! Every failure in the pipeline maps onto one of the closed error kinds
//! below, each with a stable engine code, a standard SQL-state class and a
//! retryability flag. Errors never carry passwords; connection details are
//! sanitised before they reach a message (see [`crate::sanitize`]).

use thiserror::Error;

/// Closed set of error kinds surfaced at every layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Syntax,
    Validation,
    Unsupported,
    SourceUnavailable,
    ConnectTimeout,
    QueryTimeout,
    Truncated,
    Cancelled,
    Internal,
}

/// Errors produced by the engine.
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    #[error("syntax error at line {line}, column {column}: {message}")]
    Syntax {
        line: usize,
        column: usize,
        /// Offending source line with a caret marker underneath.
        snippet: String,
        message: String,
        /// Nearest legal keyword by edit distance, when one is close enough.
        suggestion: Option<String>,
    },

    #[error("validation error at {node}: {reason}")]
    Validation {
        /// Plan node or clause the failure was detected in.
        node: String,
        column: Option<String>,
        reason: String,
    },

    #[error("unknown schema '{0}'")]
    UnknownSchema(String),

    #[error("unknown table '{0}'")]
    UnknownTable(String),

    #[error("ambiguous column reference '{0}'")]
    AmbiguousColumn(String),

    #[error("source '{source_name}' type '{native_type}' has no logical mapping")]
    TypeNotSupported { source_name: String, native_type: String },

    #[error("unsupported feature: {0}")]
    Unsupported(String),

    #[error("source '{source_name}' unavailable: {reason}")]
    SourceUnavailable { source_name: String, reason: String },

    #[error("connect timeout against source '{source_name}': {reason}")]
    ConnectTimeout { source_name: String, reason: String },

    #[error("query exceeded timeout of {seconds}s")]
    QueryTimeout { seconds: u64 },

    #[error("intermediate result cap of {cap} rows reached in {operator}")]
    Truncated { operator: String, cap: usize },

    #[error("query cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Syntax { .. } => ErrorKind::Syntax,
            EngineError::Validation { .. }
            | EngineError::UnknownSchema(_)
            | EngineError::UnknownTable(_)
            | EngineError::AmbiguousColumn(_)
            | EngineError::TypeNotSupported { .. } => ErrorKind::Validation,
            EngineError::Unsupported(_) => ErrorKind::Unsupported,
            EngineError::SourceUnavailable { .. } => ErrorKind::SourceUnavailable,
            EngineError::ConnectTimeout { .. } => ErrorKind::ConnectTimeout,
            EngineError::QueryTimeout { .. } => ErrorKind::QueryTimeout,
            EngineError::Truncated { .. } => ErrorKind::Truncated,
            EngineError::Cancelled => ErrorKind::Cancelled,
            EngineError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Stable engine-specific code, one per kind.
    pub fn code(&self) -> u16 {
        match self.kind() {
            ErrorKind::Syntax => 1001,
            ErrorKind::Validation => 1002,
            ErrorKind::Unsupported => 1003,
            ErrorKind::SourceUnavailable => 1004,
            ErrorKind::ConnectTimeout => 1005,
            ErrorKind::QueryTimeout => 1006,
            ErrorKind::Truncated => 1007,
            ErrorKind::Cancelled => 1008,
            ErrorKind::Internal => 1999,
        }
    }

    /// Standard SQL-state for the wire surface.
    pub fn sql_state(&self) -> &'static str {
        match self {
            EngineError::Syntax { .. } => "42000",
            EngineError::Validation { .. } => "42000",
            EngineError::UnknownSchema(_) | EngineError::UnknownTable(_) => "42S02",
            EngineError::AmbiguousColumn(_) => "42702",
            EngineError::TypeNotSupported { .. } => "0A000",
            EngineError::Unsupported(_) => "0A000",
            EngineError::SourceUnavailable { .. } => "08001",
            EngineError::ConnectTimeout { .. } => "HYT00",
            EngineError::QueryTimeout { .. } => "HYT00",
            EngineError::Truncated { .. } => "01000",
            EngineError::Cancelled => "57014",
            EngineError::Internal(_) => "58000",
        }
    }

    /// Whether the caller may retry the whole query.
    ///
    /// Computed from the kind, not the SQL-state class: `SourceUnavailable`
    /// is surfaced only after the data-source manager has exhausted its own
    /// retries, so re-issuing the query would not help.
    pub fn retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::ConnectTimeout)
    }

    /// Transient connector-level failure, eligible for manager retry.
    ///
    /// Matches SQL-state class `08` (connection exceptions) and `HYT00`
    /// (driver timeout).
    pub fn is_transient(&self) -> bool {
        match self {
            EngineError::ConnectTimeout { .. } => true,
            EngineError::SourceUnavailable { reason, .. } => {
                sql_state_is_transient(reason)
            }
            _ => false,
        }
    }
}

/// Check a database error message for a transient SQL-state marker.
pub fn sql_state_is_transient(message: &str) -> bool {
    if message.contains("HYT00") {
        return true;
    }
    // sqlx renders states as e.g. "error returned from database: 08S01 ..."
    // or embeds them as `(code: 2013, state: 08S01)`.
    for token in message.split(|c: char| !c.is_ascii_alphanumeric()) {
        if token.len() == 5 && token.starts_with("08") {
            return true;
        }
    }
    false
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut => EngineError::ConnectTimeout {
                source_name: "pool".to_string(),
                reason: "connection checkout timed out".to_string(),
            },
            sqlx::Error::Io(io) => EngineError::SourceUnavailable {
                source_name: "connection".to_string(),
                reason: io.to_string(),
            },
            sqlx::Error::Database(db) => {
                let state = db
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_default();
                EngineError::SourceUnavailable {
                    source_name: "database".to_string(),
                    reason: format!("{} (state: {state})", db.message()),
                }
            }
            _ => EngineError::Internal(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Internal(format!("serialization error: {err}"))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(EngineError::Cancelled, 1008, "57014", false)]
    #[case(EngineError::QueryTimeout { seconds: 300 }, 1006, "HYT00", false)]
    #[case(
        EngineError::ConnectTimeout { source_name: "db1".into(), reason: "t/o".into() },
        1005,
        "HYT00",
        true
    )]
    #[case(EngineError::UnknownTable("orders".into()), 1002, "42S02", false)]
    #[case(
        EngineError::Truncated { operator: "HashJoin".into(), cap: 100_000 },
        1007,
        "01000",
        false
    )]
    fn error_surface(
        #[case] err: EngineError,
        #[case] code: u16,
        #[case] state: &str,
        #[case] retryable: bool,
    ) {
        assert_eq!(err.code(), code);
        assert_eq!(err.sql_state(), state);
        assert_eq!(err.retryable(), retryable);
    }

    #[rstest]
    #[case("connection lost (state: 08S01)", true)]
    #[case("server closed connection, state 08006", true)]
    #[case("driver timeout HYT00", true)]
    #[case("duplicate key (state: 23505)", false)]
    #[case("syntax error (state: 42601)", false)]
    fn transient_state_detection(#[case] message: &str, #[case] transient: bool) {
        assert_eq!(sql_state_is_transient(message), transient);
    }

    #[test]
    fn source_unavailable_not_retryable_at_query_level() {
        let err = EngineError::SourceUnavailable {
            source_name: "es_logs".into(),
            reason: "probe failed".into(),
        };
        assert!(!err.retryable());
        assert_eq!(err.sql_state(), "08001");
    }

    #[test]
    fn validation_kinds_collapse_to_one_code() {
        let errors = [
            EngineError::UnknownSchema("s".into()),
            EngineError::UnknownTable("t".into()),
            EngineError::AmbiguousColumn("c".into()),
            EngineError::TypeNotSupported {
                source_name: "es".into(),
                native_type: "geo_point".into(),
            },
        ];
        for err in errors {
            assert_eq!(err.kind(), ErrorKind::Validation);
            assert_eq!(err.code(), 1002);
        }
    }
}
