//! Savepoint stack for nested scopes.

/// LIFO stack of driver savepoint handles, one per nested `begin`.
#[derive(Debug)]
pub(crate) struct SavepointStack<S> {
    entries: Vec<S>,
}

impl<S> Default for SavepointStack<S> {
    fn default() -> Self {
        Self {
            entries: Vec::with_capacity(1),
        }
    }
}

impl<S> SavepointStack<S> {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, savepoint: S) {
        self.entries.push(savepoint);
    }

    /// Remove the innermost savepoint. `None` means the next commit or
    /// rollback belongs to the outermost scope.
    pub(crate) fn pop(&mut self) -> Option<S> {
        self.entries.pop()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Drop every entry; the savepoints died with their connection.
    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}
