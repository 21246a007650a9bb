//! Execution context carrying the current transaction.
//!
//! Instead of a hidden per-task slot, code that wants "the current
//! transaction" receives an [`ExecContext`] value. Binding a transaction
//! produces a new context and leaves the original untouched, so unbinding is
//! just letting the augmented context go out of scope.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::db::ConnectionFactory;
use crate::transaction::state::Transaction;

#[derive(Clone)]
struct Bound {
    id: String,
    transaction: Arc<dyn Any + Send + Sync>,
}

/// Immutable context passed down an async chain.
#[derive(Clone, Default)]
pub struct ExecContext {
    bound: Option<Bound>,
}

impl ExecContext {
    /// An empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of this context carrying `tx`.
    pub fn with_transaction<F: ConnectionFactory>(&self, tx: &Transaction<F>) -> Self {
        Self {
            bound: Some(Bound {
                id: tx.id().to_string(),
                transaction: Arc::new(tx.clone()),
            }),
        }
    }

    /// A copy of this context with no transaction.
    pub fn without_transaction(&self) -> Self {
        Self { bound: None }
    }

    /// The bound transaction, if there is one driven by factory type `F`.
    pub fn transaction<F: ConnectionFactory>(&self) -> Option<Transaction<F>> {
        self.bound
            .as_ref()
            .and_then(|bound| bound.transaction.downcast_ref::<Transaction<F>>())
            .cloned()
    }

    pub fn has_transaction(&self) -> bool {
        self.bound.is_some()
    }

    /// Id of the bound transaction, whatever its factory type.
    pub fn transaction_id(&self) -> Option<&str> {
        self.bound.as_ref().map(|bound| bound.id.as_str())
    }
}

impl fmt::Debug for ExecContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecContext")
            .field("transaction", &self.transaction_id())
            .finish()
    }
}
