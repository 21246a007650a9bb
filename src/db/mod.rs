//! Database driver boundary.
//!
//! The transaction layer talks to databases only through the traits in
//! [`connection`]. [`memory`] is a complete in-process driver used by the
//! tests and by anything that wants transactional scratch state.

mod connection;
mod memory;

pub use connection::{Connection, ConnectionError, ConnectionFactory, ConnectionResult};
pub use memory::{MemoryConnection, MemoryDatabase, MemorySavepoint, Op};
