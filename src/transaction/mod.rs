//! Transaction management.
//!
//! A [`Transaction`] owns at most one physical connection at a time. The
//! first `begin` opens it, nested `begin`s push savepoints, and the
//! outermost commit or rollback releases it again.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  wrap / wrap_in (combinator)                │
//! │   begin → computation → commit | rollback (+ suppressed)    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Transaction (state machine)                 │
//! │        UNBOUND ⇄ ACTIVE, steps run on the blocking pool     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!        ┌─────────────────────┼─────────────────────┐
//!        │                     │                     │
//!        ▼                     ▼                     ▼
//!  ┌─────────────┐       ┌─────────────┐       ┌─────────────┐
//!  │  Savepoint  │       │ Connection  │       │ ExecContext │
//!  │    Stack    │       │  Lifecycle  │       │  (binding)  │
//!  └─────────────┘       └─────────────┘       └─────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use txscope::db::MemoryDatabase;
//! use txscope::transaction::Transaction;
//!
//! let tx = Transaction::new(MemoryDatabase::new());
//! let conn = tx.clone();
//!
//! let id = tx
//!     .wrap(async move {
//!         conn.run(|c| c.put("user:1", "alice")).await?;
//!         Ok::<_, TransactionError>(1)
//!     })
//!     .await?;
//! ```

mod config;
mod context;
mod error;
mod isolation;
mod lifecycle;
mod savepoint;
mod state;
mod wrap;

pub use config::{CancelPolicy, TransactionConfig};
pub use context::ExecContext;
pub use error::{TransactionError, TransactionResult, TxOperation, WrapError};
pub use isolation::IsolationLevel;
pub use state::{Transaction, TransactionStatus};
