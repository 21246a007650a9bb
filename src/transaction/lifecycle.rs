//! Connection lifecycle: lazy acquisition and exactly-once disposal.

use chrono::{DateTime, Utc};

use crate::db::{Connection, ConnectionFactory, ConnectionResult};
use crate::transaction::error::{TransactionError, TransactionResult, TxOperation};
use crate::transaction::isolation::IsolationLevel;

/// Terminal action run against the connection before it is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Terminal {
    Commit,
    Rollback,
}

impl Terminal {
    fn operation(self) -> TxOperation {
        match self {
            Terminal::Commit => TxOperation::Commit,
            Terminal::Rollback => TxOperation::Rollback,
        }
    }
}

/// Owns the physical connection of the outermost scope.
pub(crate) struct ConnectionLifecycle<C> {
    connection: Option<C>,
    started_at: Option<DateTime<Utc>>,
    /// Completed acquire/dispose cycles.
    cycles: u64,
}

impl<C: Connection> ConnectionLifecycle<C> {
    pub(crate) fn new() -> Self {
        Self {
            connection: None,
            started_at: None,
            cycles: 0,
        }
    }

    pub(crate) fn is_held(&self) -> bool {
        self.connection.is_some()
    }

    pub(crate) fn connection(&self) -> Option<&C> {
        self.connection.as_ref()
    }

    pub(crate) fn connection_mut(&mut self) -> Option<&mut C> {
        self.connection.as_mut()
    }

    pub(crate) fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub(crate) fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Open a connection and start a transaction on it.
    ///
    /// If preparing the connection fails it is closed before returning, so a
    /// half-acquired connection is never kept.
    pub(crate) fn acquire<F>(
        &mut self,
        factory: &F,
        isolation: Option<IsolationLevel>,
    ) -> TransactionResult<()>
    where
        F: ConnectionFactory<Connection = C>,
    {
        debug_assert!(self.connection.is_none());

        let mut conn = factory.connect().map_err(TransactionError::acquire)?;

        if let Err(source) = prepare(&mut conn, isolation) {
            return Err(TransactionError::Acquire {
                source,
                suppressed: conn.close().err().into_iter().collect(),
            });
        }

        self.connection = Some(conn);
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Run `terminal` and release the connection.
    ///
    /// The connection is taken out first, so it is gone afterwards whatever
    /// fails. A terminal failure wins over a release failure, which is then
    /// kept as suppressed.
    pub(crate) fn dispose(&mut self, terminal: Terminal) -> TransactionResult<()> {
        let Some(mut conn) = self.connection.take() else {
            return Ok(());
        };
        self.started_at = None;
        self.cycles += 1;

        let outcome = match terminal {
            Terminal::Commit => conn.commit(),
            Terminal::Rollback => conn.rollback(),
        };
        let released = conn.close();

        match (outcome, released) {
            (Ok(()), Ok(())) => Ok(()),
            (Ok(()), Err(source)) => Err(TransactionError::Release { source }),
            (Err(source), released) => Err(TransactionError::Database {
                operation: terminal.operation(),
                source,
                suppressed: released.err().into_iter().collect(),
            }),
        }
    }
}

fn prepare<C: Connection>(conn: &mut C, isolation: Option<IsolationLevel>) -> ConnectionResult<()> {
    conn.set_auto_commit(false)?;
    if let Some(level) = isolation {
        conn.set_isolation(level)?;
    }
    Ok(())
}
