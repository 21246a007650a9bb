//! Driver boundary: the raw connection and the factory that opens it.
//!
//! Every method here is blocking. The transaction layer only ever calls them
//! from tokio's blocking pool, so implementations are free to do network or
//! disk I/O directly.

use thiserror::Error;

use crate::transaction::IsolationLevel;

/// Result type for driver operations.
pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Errors reported by a driver.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// Could not open a connection (network, auth, configuration).
    #[error("connect failed: {0}")]
    Connect(String),

    /// The connection was already closed.
    #[error("connection is closed")]
    Closed,

    /// The driver does not support the requested operation.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// A savepoint could not be created or is no longer valid.
    #[error("savepoint error: {0}")]
    Savepoint(String),

    /// The database rejected a statement.
    #[error("sql error [{code}]: {message}")]
    Sql { code: String, message: String },

    /// Transport level failure.
    #[error("io error: {0}")]
    Io(String),
}

impl ConnectionError {
    /// Create a SQL error with the given state code.
    pub fn sql(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Sql {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for ConnectionError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// A live physical connection.
///
/// Transactions are started implicitly by turning auto-commit off, which is
/// how the transaction layer uses it.
pub trait Connection: Send + 'static {
    /// Opaque handle returned by [`Connection::set_savepoint`].
    type Savepoint: Send + 'static;

    /// Enable or disable auto-commit.
    fn set_auto_commit(&mut self, enabled: bool) -> ConnectionResult<()>;

    /// Set the isolation level for subsequent work.
    fn set_isolation(&mut self, level: IsolationLevel) -> ConnectionResult<()> {
        Err(ConnectionError::Unsupported(format!(
            "isolation level {level}"
        )))
    }

    /// Mark a savepoint in the current transaction.
    fn set_savepoint(&mut self) -> ConnectionResult<Self::Savepoint>;

    /// Commit the current transaction.
    fn commit(&mut self) -> ConnectionResult<()>;

    /// Roll back the whole current transaction.
    fn rollback(&mut self) -> ConnectionResult<()>;

    /// Undo everything done after `savepoint` was marked.
    fn rollback_to(&mut self, savepoint: &Self::Savepoint) -> ConnectionResult<()>;

    /// Release the connection.
    fn close(self) -> ConnectionResult<()>;
}

/// Something that can open connections.
pub trait ConnectionFactory: Send + Sync + 'static {
    type Connection: Connection;

    /// Open a ready-to-use connection.
    fn connect(&self) -> ConnectionResult<Self::Connection>;
}

impl<Func, C> ConnectionFactory for Func
where
    Func: Fn() -> ConnectionResult<C> + Send + Sync + 'static,
    C: Connection,
{
    type Connection = C;

    fn connect(&self) -> ConnectionResult<C> {
        self()
    }
}
