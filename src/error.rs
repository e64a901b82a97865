//! Error types for txscope.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! Driver failures are carried through untouched so callers can inspect the original
//! `sqlx::Error`; every other variant describes a condition detected by this crate
//! before or after talking to the database.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    /// Primary or replica could not be opened or failed its liveness probe.
    #[error("Cannot reach {kind} database: {message}")]
    StartupUnreachable { kind: String, message: String },

    #[error("Transaction is not found inside the context")]
    MissingTransaction,

    #[error("Query rewrite failed: {message}")]
    Rewrite { message: String },

    #[error("Database error: {0}")]
    Driver(#[from] sqlx::Error),

    #[error("Scan error: {message}")]
    Scan { message: String },

    #[error("Transaction has already been committed or rolled back (transaction: {transaction_id})")]
    TransactionClosed { transaction_id: String },

    #[error("Timeout: {operation} exceeded the context deadline")]
    Timeout { operation: String },

    #[error("Cancelled: {operation} was cancelled by its context")]
    Cancelled { operation: String },

    #[error("Invalid configuration: {message}")]
    Config { message: String },
}

impl DbError {
    /// Create a startup connectivity error for the given pool kind (`main` or `replica`).
    pub fn startup_unreachable(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StartupUnreachable {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Create a rewrite error.
    pub fn rewrite(message: impl Into<String>) -> Self {
        Self::Rewrite {
            message: message.into(),
        }
    }

    /// Create a scan error.
    pub fn scan(message: impl Into<String>) -> Self {
        Self::Scan {
            message: message.into(),
        }
    }

    /// Create a closed transaction error.
    pub fn transaction_closed(transaction_id: impl Into<String>) -> Self {
        Self::TransactionClosed {
            transaction_id: transaction_id.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Create a cancellation error.
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Check if this error is retryable.
    ///
    /// Only deadline expiry qualifies; driver errors are returned verbatim and
    /// classifying them is left to the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Whether the statement may have reached the database before this error.
    ///
    /// `false` means no side effect can have happened and the call is safe to
    /// repeat once the input is fixed. `Timeout` and `Cancelled` always report
    /// `true`, even when the context had already expired before the driver was
    /// called, since the two cases are not told apart.
    pub fn sent_statement(&self) -> bool {
        !matches!(
            self,
            Self::MissingTransaction
                | Self::TransactionClosed { .. }
                | Self::Rewrite { .. }
                | Self::Config { .. }
                | Self::StartupUnreachable { .. }
        )
    }

    /// SQLSTATE (or vendor code) reported by the database, when there is one.
    pub fn sql_state(&self) -> Option<String> {
        match self {
            Self::Driver(sqlx::Error::Database(db_err)) => db_err.code().map(|c| c.to_string()),
            _ => None,
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_transaction_display() {
        let err = DbError::MissingTransaction;
        assert_eq!(
            err.to_string(),
            "Transaction is not found inside the context"
        );
    }

    #[test]
    fn test_startup_unreachable_display() {
        let err = DbError::startup_unreachable("replica", "connection refused");
        assert!(err.to_string().contains("replica"));
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn test_error_retryable() {
        assert!(DbError::timeout("execute").is_retryable());
        assert!(!DbError::cancelled("execute").is_retryable());
        assert!(!DbError::MissingTransaction.is_retryable());
        assert!(!DbError::Driver(sqlx::Error::RowNotFound).is_retryable());
    }

    #[test]
    fn test_sent_statement() {
        assert!(!DbError::MissingTransaction.sent_statement());
        assert!(!DbError::rewrite("missing parameter").sent_statement());
        assert!(DbError::scan("no rows").sent_statement());
        assert!(DbError::Driver(sqlx::Error::PoolTimedOut).sent_statement());
        assert!(!DbError::transaction_closed("tx_abc").sent_statement());
        assert!(DbError::timeout("execute").sent_statement());
    }

    #[test]
    fn test_driver_error_is_kept_verbatim() {
        let err: DbError = sqlx::Error::PoolClosed.into();
        assert!(matches!(err, DbError::Driver(sqlx::Error::PoolClosed)));
        assert!(err.sql_state().is_none());
    }

    #[test]
    fn test_transaction_closed_includes_id() {
        let err = DbError::transaction_closed("tx_abc");
        assert!(err.to_string().contains("tx_abc"));
    }
}
