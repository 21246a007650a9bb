//! Transaction error types.

use std::error::Error as StdError;
use std::fmt;

use thiserror::Error;

use crate::db::ConnectionError;

/// Result type for transaction operations.
pub type TransactionResult<T> = Result<T, TransactionError>;

/// The step of the transaction protocol an error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOperation {
    Begin,
    Savepoint,
    Commit,
    Rollback,
    RollbackToSavepoint,
    Release,
    /// Running caller code against the connection.
    Access,
}

impl fmt::Display for TxOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TxOperation::Begin => "begin",
            TxOperation::Savepoint => "savepoint",
            TxOperation::Commit => "commit",
            TxOperation::Rollback => "rollback",
            TxOperation::RollbackToSavepoint => "rollback to savepoint",
            TxOperation::Release => "release",
            TxOperation::Access => "connection access",
        };
        f.write_str(name)
    }
}

/// Errors that can occur during transaction operations.
///
/// Cleanup failures that happen while another error is already being
/// reported are never dropped: they ride along in `suppressed`.
#[derive(Debug, Error)]
pub enum TransactionError {
    /// Commit or rollback with no transaction in progress.
    #[error("{operation} attempted outside of a transaction")]
    InvalidState { operation: TxOperation },

    /// Opening or preparing the connection failed.
    #[error("failed to acquire connection: {source}")]
    Acquire {
        source: ConnectionError,
        suppressed: Vec<ConnectionError>,
    },

    /// The driver failed a commit, rollback or savepoint call.
    #[error("{operation} failed: {source}")]
    Database {
        operation: TxOperation,
        source: ConnectionError,
        suppressed: Vec<ConnectionError>,
    },

    /// Closing the connection failed after a clean commit or rollback.
    #[error("failed to release connection: {source}")]
    Release { source: ConnectionError },

    /// The blocking task running a driver call panicked or was cancelled.
    #[error("blocking task failed: {0}")]
    Blocking(String),
}

impl TransactionError {
    pub(crate) fn acquire(source: ConnectionError) -> Self {
        Self::Acquire {
            source,
            suppressed: Vec::new(),
        }
    }

    pub(crate) fn database(operation: TxOperation, source: ConnectionError) -> Self {
        Self::Database {
            operation,
            source,
            suppressed: Vec::new(),
        }
    }

    pub(crate) fn invalid_state(operation: TxOperation) -> Self {
        Self::InvalidState { operation }
    }

    /// Secondary errors recorded while this one was being reported.
    pub fn suppressed(&self) -> &[ConnectionError] {
        match self {
            Self::Acquire { suppressed, .. } | Self::Database { suppressed, .. } => suppressed,
            _ => &[],
        }
    }

    /// The protocol step that failed, if known.
    pub fn operation(&self) -> Option<TxOperation> {
        match self {
            Self::InvalidState { operation } | Self::Database { operation, .. } => {
                Some(*operation)
            }
            Self::Acquire { .. } => Some(TxOperation::Begin),
            Self::Release { .. } => Some(TxOperation::Release),
            Self::Blocking(_) => None,
        }
    }

    /// The driver error behind this failure, if any.
    pub fn connection_error(&self) -> Option<&ConnectionError> {
        match self {
            Self::Acquire { source, .. }
            | Self::Database { source, .. }
            | Self::Release { source } => Some(source),
            _ => None,
        }
    }

    pub fn is_invalid_state(&self) -> bool {
        matches!(self, Self::InvalidState { .. })
    }
}

/// Error returned by the `wrap` family.
///
/// `Failed` carries the wrapped computation's own error. If the rollback it
/// triggered also failed, that error sits in `suppressed` and `error` is
/// still the one reported.
#[derive(Debug)]
pub enum WrapError<E> {
    /// Begin or commit failed.
    Transaction(TransactionError),
    /// The wrapped computation failed and the scope was rolled back.
    Failed {
        error: E,
        suppressed: Option<TransactionError>,
    },
}

impl<E> WrapError<E> {
    /// Split into the computation's error or the transaction's.
    pub fn into_inner(self) -> Result<E, TransactionError> {
        match self {
            Self::Failed { error, .. } => Ok(error),
            Self::Transaction(err) => Err(err),
        }
    }

    /// The computation's error, if that is what failed.
    pub fn inner(&self) -> Option<&E> {
        match self {
            Self::Failed { error, .. } => Some(error),
            Self::Transaction(_) => None,
        }
    }

    /// A rollback failure hidden behind the computation's error.
    pub fn suppressed(&self) -> Option<&TransactionError> {
        match self {
            Self::Failed { suppressed, .. } => suppressed.as_ref(),
            Self::Transaction(_) => None,
        }
    }

    pub fn is_transaction(&self) -> bool {
        matches!(self, Self::Transaction(_))
    }

    /// Collapse into the caller's error type.
    pub fn flatten(self) -> E
    where
        E: From<TransactionError>,
    {
        match self {
            Self::Failed { error, .. } => error,
            Self::Transaction(err) => E::from(err),
        }
    }
}

impl<E> From<TransactionError> for WrapError<E> {
    fn from(err: TransactionError) -> Self {
        Self::Transaction(err)
    }
}

impl<E: fmt::Display> fmt::Display for WrapError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transaction(err) => write!(f, "transaction error: {err}"),
            Self::Failed { error, .. } => write!(f, "{error}"),
        }
    }
}

impl<E> StdError for WrapError<E>
where
    E: StdError + 'static,
{
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Transaction(err) => Some(err),
            Self::Failed { error, .. } => error.source(),
        }
    }
}
