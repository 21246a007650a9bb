//! txscope - nested, savepoint-aware database transactions for async code.
//!
//! A transaction acquires its connection lazily on the first `begin`, turns
//! nested scopes into savepoints, and releases the connection exactly once
//! when the outermost scope commits or rolls back. Driver calls are blocking
//! and always run on tokio's blocking pool.
//!
//! # Example
//!
//! ```no_run
//! use txscope::db::MemoryDatabase;
//! use txscope::transaction::{Transaction, TransactionError};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let db = MemoryDatabase::new();
//! let tx = Transaction::new(db.clone());
//! let conn = tx.clone();
//!
//! tx.wrap(async move {
//!     conn.run(|c| c.put("users:1", "Alice")).await?;
//!     Ok::<_, TransactionError>(())
//! })
//! .await?;
//!
//! assert_eq!(db.get("users:1").as_deref(), Some("Alice"));
//! # Ok(())
//! # }
//! ```

pub mod db;
pub mod transaction;
