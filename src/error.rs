//! Error types for Tollgate.

use thiserror::Error;

/// Main error type for Tollgate operations.
///
/// A rejected reservation is not an error: it comes back as a successful
/// [`Reservation`](crate::ratelimit::Reservation) whose `is_ok()` is false.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// The request can never be evaluated (empty key, zero rate, burst or
    /// tokens, tokens above burst, or arithmetic overflow).
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    /// The caller cancelled before or during the storage round trip.
    /// When it fires mid-flight the stored outcome is unknown.
    #[error("reservation for key {key:?} cancelled")]
    Cancelled { key: String },

    /// Relational store failure.
    #[error("sql store failed to {op} for key {key:?}: {source}")]
    Sql {
        op: &'static str,
        key: String,
        #[source]
        source: sqlx::Error,
    },

    /// Redis failure.
    #[error("redis store failed to {op} for key {key:?}: {source}")]
    Redis {
        op: &'static str,
        key: String,
        #[source]
        source: redis::RedisError,
    },

    /// The backing store could not be reached or configured.
    #[error("failed to connect to {store}: {source}")]
    Connect {
        store: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The stored time base could not be parsed.
    #[error("corrupt time base {value:?} stored for key {key:?}")]
    CorruptTimeBase { key: String, value: String },

    /// The rate limit script answered with something other than the
    /// fixed three-integer shape.
    #[error("unexpected script result for key {key:?}: {reason}")]
    UnexpectedScriptResult { key: String, reason: String },

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TollgateError {
    pub(crate) fn sql(op: &'static str, key: &str, source: sqlx::Error) -> Self {
        TollgateError::Sql {
            op,
            key: key.to_string(),
            source,
        }
    }

    pub(crate) fn redis(op: &'static str, key: &str, source: redis::RedisError) -> Self {
        TollgateError::Redis {
            op,
            key: key.to_string(),
            source,
        }
    }

    pub(crate) fn connect(
        store: &'static str,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        TollgateError::Connect {
            store,
            source: Box::new(source),
        }
    }

    /// Whether the request itself was malformed.
    pub fn is_invalid_parameters(&self) -> bool {
        matches!(self, TollgateError::InvalidParameters(_))
    }

    /// Whether the caller's cancellation fired.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TollgateError::Cancelled { .. })
    }

    /// Whether the backing store failed or returned something unusable.
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            TollgateError::Sql { .. }
                | TollgateError::Redis { .. }
                | TollgateError::Connect { .. }
                | TollgateError::CorruptTimeBase { .. }
                | TollgateError::UnexpectedScriptResult { .. }
        )
    }

    /// Whether this is a unique-constraint violation raised by the SQL store.
    pub(crate) fn is_unique_violation(&self) -> bool {
        match self {
            TollgateError::Sql {
                source: sqlx::Error::Database(db),
                ..
            } => db.is_unique_violation(),
            _ => false,
        }
    }
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
