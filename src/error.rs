//! Error types for email-outbox.
//!
//! Store failures are classified once, at the `sqlx::Error` boundary, so
//! callers can branch on [`ErrorClass`] instead of inspecting driver errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The caller broke the outbox contract (e.g. removed an email it never claimed).
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The store answered in a way the claim protocol rules out.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// Connection drops, deadlock victims, timeouts. Safe to retry.
    #[error("transient store failure: {0}")]
    Transient(sqlx::Error),

    #[error("store error: {0}")]
    Store(sqlx::Error),

    /// Any failure from the Oracle driver; `transient` carries its class.
    #[cfg(feature = "oracle")]
    #[error("oracle error: {error}")]
    Oracle { error: oracle::Error, transient: bool },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

/// How a caller should react to an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    ProtocolViolation,
    Fatal,
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Transient(_) => ErrorClass::Retryable,
            #[cfg(feature = "oracle")]
            Error::Oracle { transient: true, .. } => ErrorClass::Retryable,
            Error::ProtocolViolation(_) => ErrorClass::ProtocolViolation,
            _ => ErrorClass::Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        let transient = match &err {
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed => true,
            sqlx::Error::Database(db) => db.code().is_some_and(|code| is_transient_sqlstate(&code)),
            _ => false,
        };
        if transient {
            Error::Transient(err)
        } else {
            Error::Store(err)
        }
    }
}

/// SQLSTATEs worth retrying: connection exceptions, serialization and
/// deadlock failures, lock/statement timeouts, server shutdown.
fn is_transient_sqlstate(code: &str) -> bool {
    code.starts_with("08")
        || matches!(
            code,
            "40001" | "40P01" | "55P03" | "53300" | "57014" | "57P01" | "57P02" | "57P03"
        )
}

#[cfg(feature = "oracle")]
impl From<oracle::Error> for Error {
    fn from(error: oracle::Error) -> Self {
        let transient = error
            .db_error()
            .is_some_and(|db| is_transient_ora_code(db.code()));
        Error::Oracle { error, transient }
    }
}

/// ORA- codes worth retrying: deadlock victim, busy row, instance
/// startup/shutdown, lost or refused connections.
#[cfg(feature = "oracle")]
fn is_transient_ora_code(code: i32) -> bool {
    matches!(
        code,
        54 | 60 | 1033 | 1034 | 1089 | 3113 | 3114 | 3135 | 12170 | 12514 | 12537 | 12541 | 25408
    )
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_and_concurrency_states_are_transient() {
        for code in ["08006", "08001", "40001", "40P01", "55P03", "57P01"] {
            assert!(is_transient_sqlstate(code), "{code} should be transient");
        }
    }

    #[test]
    fn schema_and_permission_states_are_fatal() {
        for code in ["42P01", "42501", "23505", "XX001"] {
            assert!(!is_transient_sqlstate(code), "{code} should be fatal");
        }
    }

    #[test]
    fn pool_timeout_is_retryable() {
        let err = Error::from(sqlx::Error::PoolTimedOut);
        assert!(err.is_retryable());
    }

    #[test]
    fn row_not_found_is_fatal() {
        let err = Error::from(sqlx::Error::RowNotFound);
        assert_eq!(err.class(), ErrorClass::Fatal);
    }

    #[test]
    fn driver_message_appears_once_in_error_chain() {
        let err = anyhow::Error::from(Error::from(sqlx::Error::PoolTimedOut));
        let chain = format!("{err:#}");
        assert_eq!(chain.matches("pool timed out").count(), 1, "{chain}");
    }

    #[cfg(feature = "oracle")]
    #[test]
    fn oracle_connection_loss_is_transient() {
        assert!(is_transient_ora_code(3113));
        assert!(is_transient_ora_code(60));
        assert!(!is_transient_ora_code(942), "missing table is fatal");
        assert!(!is_transient_ora_code(1031), "missing privilege is fatal");
    }

    #[test]
    fn protocol_violation_has_its_own_class() {
        let err = Error::ProtocolViolation("remove without claim".to_string());
        assert_eq!(err.class(), ErrorClass::ProtocolViolation);
        assert!(!err.is_retryable());
    }
}
