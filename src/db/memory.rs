//! In-memory reference driver.
//!
//! A tiny key/value store with real transaction semantics: writes made with
//! auto-commit off are buffered per connection, savepoints mark a position in
//! that buffer, and commit publishes the buffer to the shared store.
//!
//! Every driver call is appended to a journal and any call can be made to
//! fail on demand, which is what the transaction tests are built on.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use ulid::Ulid;

use super::connection::{Connection, ConnectionError, ConnectionFactory, ConnectionResult};
use crate::transaction::IsolationLevel;

/// Driver calls recorded in the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Connect,
    SetAutoCommit,
    SetIsolation,
    Savepoint,
    Commit,
    Rollback,
    RollbackTo,
    Close,
}

struct MemoryInner {
    data: RwLock<BTreeMap<String, String>>,
    journal: Mutex<Vec<Op>>,
    /// Remaining forced failures per operation.
    faults: Mutex<HashMap<Op, usize>>,
    next_id: AtomicU64,
    connects: AtomicUsize,
    open: AtomicUsize,
}

impl MemoryInner {
    fn record(&self, op: Op) -> ConnectionResult<()> {
        self.journal.lock().push(op);

        let mut faults = self.faults.lock();
        match faults.get_mut(&op) {
            Some(remaining) if *remaining > 0 => {
                if *remaining != usize::MAX {
                    *remaining -= 1;
                }
                Err(ConnectionError::Io(format!("injected {op:?} failure")))
            }
            _ => Ok(()),
        }
    }
}

/// Shared in-memory database. Clones point at the same store.
#[derive(Clone)]
pub struct MemoryDatabase {
    inner: Arc<MemoryInner>,
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDatabase {
    /// Create an empty database.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                data: RwLock::new(BTreeMap::new()),
                journal: Mutex::new(Vec::new()),
                faults: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                connects: AtomicUsize::new(0),
                open: AtomicUsize::new(0),
            }),
        }
    }

    /// Open a new connection. Auto-commit starts enabled.
    pub fn open(&self) -> ConnectionResult<MemoryConnection> {
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        self.inner.record(Op::Connect)?;
        self.inner.open.fetch_add(1, Ordering::SeqCst);

        Ok(MemoryConnection {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            db: Arc::clone(&self.inner),
            auto_commit: true,
            isolation: IsolationLevel::default(),
            writes: Vec::new(),
        })
    }

    /// Read a committed value.
    pub fn get(&self, key: &str) -> Option<String> {
        self.inner.data.read().get(key).cloned()
    }

    /// Number of committed keys.
    pub fn len(&self) -> usize {
        self.inner.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make the next `times` calls of `op` fail.
    pub fn fail(&self, op: Op, times: usize) {
        self.inner.faults.lock().insert(op, times);
    }

    /// Make every call of `op` fail until [`MemoryDatabase::heal`].
    pub fn fail_always(&self, op: Op) {
        self.fail(op, usize::MAX);
    }

    /// Stop injecting failures for `op`.
    pub fn heal(&self, op: Op) {
        self.inner.faults.lock().remove(&op);
    }

    /// Snapshot of every driver call so far.
    pub fn journal(&self) -> Vec<Op> {
        self.inner.journal.lock().clone()
    }

    /// How many times `op` was called.
    pub fn count(&self, op: Op) -> usize {
        self.inner.journal.lock().iter().filter(|o| **o == op).count()
    }

    pub fn clear_journal(&self) {
        self.inner.journal.lock().clear();
    }

    /// Number of connect attempts, including failed ones.
    pub fn connects(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    /// Connections currently open.
    pub fn open_connections(&self) -> usize {
        self.inner.open.load(Ordering::SeqCst)
    }
}

impl ConnectionFactory for MemoryDatabase {
    type Connection = MemoryConnection;

    fn connect(&self) -> ConnectionResult<MemoryConnection> {
        self.open()
    }
}

/// A savepoint: a named position in the connection's write buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemorySavepoint {
    name: String,
    mark: usize,
}

impl MemorySavepoint {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A connection to a [`MemoryDatabase`].
pub struct MemoryConnection {
    id: u64,
    db: Arc<MemoryInner>,
    auto_commit: bool,
    isolation: IsolationLevel,
    /// Uncommitted writes in order; `None` is a delete.
    writes: Vec<(String, Option<String>)>,
}

impl MemoryConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_auto_commit(&self) -> bool {
        self.auto_commit
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    /// Number of buffered, uncommitted writes.
    pub fn pending(&self) -> usize {
        self.writes.len()
    }

    /// Read a key, seeing this connection's own uncommitted writes.
    pub fn get(&self, key: &str) -> Option<String> {
        if let Some((_, value)) = self.writes.iter().rev().find(|(k, _)| k == key) {
            return value.clone();
        }
        self.db.data.read().get(key).cloned()
    }

    pub fn put(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.write(key.into(), Some(value.into()));
    }

    pub fn delete(&mut self, key: impl Into<String>) {
        self.write(key.into(), None);
    }

    fn write(&mut self, key: String, value: Option<String>) {
        self.writes.push((key, value));
        if self.auto_commit {
            self.publish();
        }
    }

    fn publish(&mut self) {
        let mut data = self.db.data.write();
        for (key, value) in self.writes.drain(..) {
            match value {
                Some(value) => {
                    data.insert(key, value);
                }
                None => {
                    data.remove(&key);
                }
            }
        }
    }
}

impl Connection for MemoryConnection {
    type Savepoint = MemorySavepoint;

    fn set_auto_commit(&mut self, enabled: bool) -> ConnectionResult<()> {
        self.db.record(Op::SetAutoCommit)?;
        // Turning auto-commit back on commits, as JDBC drivers do.
        if enabled && !self.auto_commit {
            self.publish();
        }
        self.auto_commit = enabled;
        Ok(())
    }

    fn set_isolation(&mut self, level: IsolationLevel) -> ConnectionResult<()> {
        self.db.record(Op::SetIsolation)?;
        self.isolation = level;
        Ok(())
    }

    fn set_savepoint(&mut self) -> ConnectionResult<MemorySavepoint> {
        self.db.record(Op::Savepoint)?;
        if self.auto_commit {
            return Err(ConnectionError::Savepoint(
                "savepoints require auto-commit off".into(),
            ));
        }
        Ok(MemorySavepoint {
            name: format!("sp_{}", Ulid::new().to_string().to_lowercase()),
            mark: self.writes.len(),
        })
    }

    fn commit(&mut self) -> ConnectionResult<()> {
        self.db.record(Op::Commit)?;
        self.publish();
        Ok(())
    }

    fn rollback(&mut self) -> ConnectionResult<()> {
        self.db.record(Op::Rollback)?;
        self.writes.clear();
        Ok(())
    }

    fn rollback_to(&mut self, savepoint: &MemorySavepoint) -> ConnectionResult<()> {
        self.db.record(Op::RollbackTo)?;
        if savepoint.mark > self.writes.len() {
            return Err(ConnectionError::Savepoint(format!(
                "{} is no longer valid",
                savepoint.name
            )));
        }
        self.writes.truncate(savepoint.mark);
        Ok(())
    }

    fn close(self) -> ConnectionResult<()> {
        // Uncommitted writes are discarded when `self` drops.
        self.db.record(Op::Close)
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.db.open.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_commit_writes_are_visible() {
        let db = MemoryDatabase::new();
        let mut conn = db.open().unwrap();

        conn.put("a", "1");
        assert_eq!(db.get("a"), Some("1".to_string()));
        assert_eq!(conn.pending(), 0);
    }

    #[test]
    fn test_commit_and_rollback() {
        let db = MemoryDatabase::new();
        let mut conn = db.open().unwrap();
        conn.set_auto_commit(false).unwrap();

        conn.put("a", "1");
        assert_eq!(conn.get("a"), Some("1".to_string()));
        assert!(db.get("a").is_none());
        conn.commit().unwrap();
        assert_eq!(db.get("a"), Some("1".to_string()));

        conn.delete("a");
        conn.rollback().unwrap();
        assert_eq!(db.get("a"), Some("1".to_string()));
    }

    #[test]
    fn test_rollback_to_savepoint() {
        let db = MemoryDatabase::new();
        let mut conn = db.open().unwrap();
        conn.set_auto_commit(false).unwrap();

        conn.put("outer", "1");
        let sp = conn.set_savepoint().unwrap();
        assert!(sp.name().starts_with("sp_"));
        conn.put("inner", "2");
        conn.rollback_to(&sp).unwrap();
        conn.commit().unwrap();

        assert_eq!(db.get("outer"), Some("1".to_string()));
        assert!(db.get("inner").is_none());
    }

    #[test]
    fn test_savepoint_needs_transaction() {
        let db = MemoryDatabase::new();
        let mut conn = db.open().unwrap();
        assert!(matches!(
            conn.set_savepoint(),
            Err(ConnectionError::Savepoint(_))
        ));
    }

    #[test]
    fn test_stale_savepoint_rejected() {
        let db = MemoryDatabase::new();
        let mut conn = db.open().unwrap();
        conn.set_auto_commit(false).unwrap();

        conn.put("a", "1");
        let sp = conn.set_savepoint().unwrap();
        conn.put("b", "2");
        conn.rollback().unwrap();
        assert!(conn.rollback_to(&sp).is_err());
    }

    #[test]
    fn test_fault_injection() {
        let db = MemoryDatabase::new();
        db.fail(Op::Connect, 1);
        assert!(db.open().is_err());
        assert_eq!(db.open_connections(), 0);

        let mut conn = db.open().unwrap();
        db.fail_always(Op::Commit);
        assert!(conn.commit().is_err());
        assert!(conn.commit().is_err());
        db.heal(Op::Commit);
        assert!(conn.commit().is_ok());

        assert_eq!(db.connects(), 2);
        assert_eq!(db.count(Op::Commit), 3);
    }

    #[test]
    fn test_open_count_tracks_close() {
        let db = MemoryDatabase::new();
        let conn = db.open().unwrap();
        assert_eq!(db.open_connections(), 1);
        conn.close().unwrap();
        assert_eq!(db.open_connections(), 0);
        assert_eq!(db.journal(), vec![Op::Connect, Op::Close]);
    }
}
