//! The transaction state machine.
//!
//! A [`Transaction`] is UNBOUND until its first `begin` acquires a
//! connection, and ACTIVE until the outermost scope commits or rolls back.
//! Nested `begin`s while ACTIVE push savepoints instead of opening new
//! connections.
//!
//! Every step locks the state and does its driver work inside one
//! `spawn_blocking` call, so a step is atomic with respect to the handle and
//! never blocks the async scheduler.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::db::{Connection, ConnectionFactory};
use crate::transaction::config::TransactionConfig;
use crate::transaction::context::ExecContext;
use crate::transaction::error::{TransactionError, TransactionResult, TxOperation};
use crate::transaction::lifecycle::{ConnectionLifecycle, Terminal};
use crate::transaction::savepoint::SavepointStack;

pub(crate) type ConnOf<F> = <F as ConnectionFactory>::Connection;

/// No pending unwind.
const NO_UNWIND: usize = usize::MAX;

/// Mutable state, only ever touched under the lock.
pub(crate) struct TxState<C: Connection> {
    lifecycle: ConnectionLifecycle<C>,
    savepoints: SavepointStack<C::Savepoint>,
}

impl<C: Connection> TxState<C> {
    /// 0 when UNBOUND, otherwise one for the outermost scope plus one per
    /// savepoint.
    fn depth(&self) -> usize {
        if self.lifecycle.is_held() {
            1 + self.savepoints.len()
        } else {
            0
        }
    }
}

/// Cancellation handshake between a wrapped scope and its `begin` step.
#[derive(Default)]
pub(crate) struct ScopeToken {
    begun: AtomicBool,
    cancelled: AtomicBool,
    /// Depth before this scope's `begin`.
    base: AtomicUsize,
}

pub(crate) struct Inner<F: ConnectionFactory> {
    id: String,
    factory: F,
    config: TransactionConfig,
    auto_bind: AtomicBool,
    state: Mutex<TxState<ConnOf<F>>>,
    /// Mirror of `TxState::depth` readable without the lock.
    depth: AtomicUsize,
    /// Lowest depth an abandoned scope asked to unwind to.
    unwind_to: AtomicUsize,
}

/// A database transaction over connections from `F`.
///
/// Cheap to clone; all clones share one state. Calls on one transaction must
/// be sequential, which is what [`Transaction::wrap`] does by construction.
pub struct Transaction<F: ConnectionFactory> {
    pub(crate) inner: Arc<Inner<F>>,
}

impl<F: ConnectionFactory> Clone for Transaction<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Point-in-time view of a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionStatus {
    pub id: String,
    pub active: bool,
    pub depth: usize,
    pub auto_bind: bool,
    pub cycles: u64,
    pub started_at: Option<DateTime<Utc>>,
}

impl<F: ConnectionFactory> Transaction<F> {
    /// Create a transaction with the default configuration.
    pub fn new(factory: F) -> Self {
        Self::with_config(factory, TransactionConfig::default())
    }

    /// Create a transaction with custom configuration.
    pub fn with_config(factory: F, config: TransactionConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: Ulid::new().to_string().to_lowercase(),
                factory,
                auto_bind: AtomicBool::new(config.auto_bind),
                config,
                state: Mutex::new(TxState {
                    lifecycle: ConnectionLifecycle::new(),
                    savepoints: SavepointStack::new(),
                }),
                depth: AtomicUsize::new(0),
                unwind_to: AtomicUsize::new(NO_UNWIND),
            }),
        }
    }

    /// Get the transaction ID.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn config(&self) -> &TransactionConfig {
        &self.inner.config
    }

    /// Set whether wrapped computations get a context carrying this
    /// transaction.
    pub fn auto_bind(self, enabled: bool) -> Self {
        self.inner.auto_bind.store(enabled, Ordering::Relaxed);
        self
    }

    pub fn is_auto_bind(&self) -> bool {
        self.inner.auto_bind.load(Ordering::Relaxed)
    }

    /// Number of open scopes: 0 when UNBOUND, 1 for the outermost scope,
    /// plus one per savepoint.
    pub fn depth(&self) -> usize {
        self.inner.depth.load(Ordering::Acquire)
    }

    pub fn is_active(&self) -> bool {
        self.depth() > 0
    }

    /// Check if a physical connection is currently held.
    ///
    /// Reads the depth mirror, so it never waits on a running step.
    pub fn has_connection(&self) -> bool {
        self.depth() > 0
    }

    /// Inspect the connection, if one is held.
    ///
    /// Locks on the calling thread; use between steps, not from inside one.
    pub fn with_connection<R>(&self, f: impl FnOnce(&ConnOf<F>) -> R) -> Option<R> {
        let state = self.inner.state.lock();
        state.lifecycle.connection().map(f)
    }

    /// Run blocking work against the connection on the blocking pool.
    ///
    /// Fails with an invalid-state error when no transaction is active.
    pub async fn run<R, Func>(&self, f: Func) -> TransactionResult<R>
    where
        Func: FnOnce(&mut ConnOf<F>) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.blocking(move |_, state| match state.lifecycle.connection_mut() {
            Some(conn) => Ok(f(conn)),
            None => Err(TransactionError::invalid_state(TxOperation::Access)),
        })
        .await
    }

    /// Snapshot of the current state.
    ///
    /// Locks on the calling thread and waits for a running step, including a
    /// cancellation settle; use between steps.
    pub fn status(&self) -> TransactionStatus {
        let state = self.inner.state.lock();
        TransactionStatus {
            id: self.inner.id.clone(),
            active: state.lifecycle.is_held(),
            depth: state.depth(),
            auto_bind: self.is_auto_bind(),
            cycles: state.lifecycle.cycles(),
            started_at: state.lifecycle.started_at(),
        }
    }

    /// The transaction bound to `cx`, if it is one of this type.
    pub fn current(cx: &ExecContext) -> Option<Self> {
        cx.transaction::<F>()
    }

    /// `cx` augmented with this transaction when auto-bind is on, otherwise
    /// `cx` unchanged.
    pub fn bind(&self, cx: &ExecContext) -> ExecContext {
        if self.is_auto_bind() {
            cx.with_transaction(self)
        } else {
            cx.clone()
        }
    }

    /// Open a scope: acquire the connection if UNBOUND, otherwise push a
    /// savepoint.
    pub async fn begin(&self) -> TransactionResult<()> {
        self.begin_scope(None).await
    }

    pub(crate) async fn begin_scope(&self, token: Option<Arc<ScopeToken>>) -> TransactionResult<()> {
        self.blocking(move |inner, state| {
            let base = state.depth();
            inner.begin_locked(state)?;

            if let Some(token) = token {
                token.base.store(base, Ordering::SeqCst);
                token.begun.store(true, Ordering::SeqCst);
                if token.cancelled.load(Ordering::SeqCst) {
                    debug!(tx = %inner.id, depth = base + 1, "scope abandoned during begin");
                    inner.unwind_locked(state, base);
                }
            }
            Ok(())
        })
        .await
    }

    /// Close the innermost scope, keeping its work. The outermost scope
    /// commits and releases the connection.
    pub async fn commit(&self) -> TransactionResult<()> {
        self.blocking(|inner, state| inner.commit_locked(state)).await
    }

    /// Close the innermost scope, discarding its work. The outermost scope
    /// rolls back and releases the connection.
    pub async fn rollback(&self) -> TransactionResult<()> {
        self.blocking(|inner, state| inner.rollback_locked(state)).await
    }

    /// Apply rollbacks for scopes abandoned by cancelled `wrap` futures.
    ///
    /// Every step does this on its own; call it to settle without starting
    /// another step.
    pub async fn reconcile(&self) -> TransactionResult<()> {
        self.blocking(|_, _| Ok(())).await
    }

    async fn blocking<R, Func>(&self, f: Func) -> TransactionResult<R>
    where
        Func: FnOnce(&Inner<F>, &mut TxState<ConnOf<F>>) -> TransactionResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || inner.step(f))
            .await
            .map_err(|err| TransactionError::Blocking(err.to_string()))?
    }
}

impl<F: ConnectionFactory> Inner<F> {
    /// Run one step under the lock, settling abandoned scopes around it.
    fn step<R>(
        &self,
        f: impl FnOnce(&Self, &mut TxState<ConnOf<F>>) -> TransactionResult<R>,
    ) -> TransactionResult<R> {
        let mut state = self.state.lock();
        self.drain_locked(&mut state);
        let result = f(self, &mut *state);
        self.drain_locked(&mut state);
        self.depth.store(state.depth(), Ordering::Release);
        result
    }

    fn begin_locked(&self, state: &mut TxState<ConnOf<F>>) -> TransactionResult<()> {
        match state.lifecycle.connection_mut() {
            Some(conn) => {
                let savepoint = conn
                    .set_savepoint()
                    .map_err(|source| TransactionError::database(TxOperation::Savepoint, source))?;
                state.savepoints.push(savepoint);
                debug!(tx = %self.id, depth = state.depth(), "savepoint created");
            }
            None => {
                state.lifecycle.acquire(&self.factory, self.config.isolation)?;
                debug!(tx = %self.id, "transaction started");
            }
        }
        Ok(())
    }

    fn commit_locked(&self, state: &mut TxState<ConnOf<F>>) -> TransactionResult<()> {
        if !state.lifecycle.is_held() {
            return Err(TransactionError::invalid_state(TxOperation::Commit));
        }
        match state.savepoints.pop() {
            // Released savepoints keep their work in the enclosing scope.
            Some(_) => {
                debug!(tx = %self.id, depth = state.depth(), "savepoint released");
                Ok(())
            }
            None => self.dispose_locked(state, Terminal::Commit),
        }
    }

    fn rollback_locked(&self, state: &mut TxState<ConnOf<F>>) -> TransactionResult<()> {
        if !state.lifecycle.is_held() {
            return Err(TransactionError::invalid_state(TxOperation::Rollback));
        }
        match state.savepoints.pop() {
            Some(savepoint) => {
                let result = match state.lifecycle.connection_mut() {
                    Some(conn) => conn.rollback_to(&savepoint).map_err(|source| {
                        TransactionError::database(TxOperation::RollbackToSavepoint, source)
                    }),
                    None => Err(TransactionError::invalid_state(TxOperation::Rollback)),
                };
                debug!(tx = %self.id, depth = state.depth(), "rolled back to savepoint");
                result
            }
            None => self.dispose_locked(state, Terminal::Rollback),
        }
    }

    fn dispose_locked(&self, state: &mut TxState<ConnOf<F>>, terminal: Terminal) -> TransactionResult<()> {
        state.savepoints.clear();
        let result = state.lifecycle.dispose(terminal);
        match &result {
            Ok(()) => debug!(tx = %self.id, ?terminal, "transaction finished"),
            Err(err) => warn!(tx = %self.id, ?terminal, error = %err, "transaction finished with error"),
        }
        result
    }

    /// Roll back scopes until the depth is at most `target`.
    fn unwind_locked(&self, state: &mut TxState<ConnOf<F>>, target: usize) {
        // Each rollback pops or disposes even when the driver fails, so the
        // depth strictly decreases.
        while state.depth() > target {
            if let Err(err) = self.rollback_locked(state) {
                warn!(tx = %self.id, error = %err, "rollback of abandoned scope failed");
            }
        }
    }

    fn drain_locked(&self, state: &mut TxState<ConnOf<F>>) {
        let target = self.unwind_to.swap(NO_UNWIND, Ordering::AcqRel);
        if target != NO_UNWIND && state.depth() > target {
            debug!(tx = %self.id, from = state.depth(), to = target, "unwinding abandoned scopes");
            self.unwind_locked(state, target);
        }
    }

    /// Called from `Drop` of an abandoned scope. Never blocks.
    pub(crate) fn abandon(self: &Arc<Self>, token: &ScopeToken) {
        token.cancelled.store(true, Ordering::SeqCst);
        if !token.begun.load(Ordering::SeqCst) {
            // The begin step sees the flag and undoes itself.
            return;
        }
        let base = token.base.load(Ordering::SeqCst);
        self.unwind_to.fetch_min(base, Ordering::AcqRel);
        warn!(tx = %self.id, depth = base + 1, "scope dropped before completion, rolling back");

        let inner = Arc::clone(self);
        let settle = move || {
            let _ = inner.step(|_, _| Ok(()));
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(settle);
            }
            Err(_) => settle(),
        }
    }
}

impl<F: ConnectionFactory> Drop for Inner<F> {
    /// Rolls back a transaction whose last handle went away while ACTIVE.
    /// Inside a runtime the driver calls go to the blocking pool.
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if !state.lifecycle.is_held() {
            return;
        }
        warn!(tx = %self.id, depth = state.depth(), "transaction dropped while active, rolling back");
        state.savepoints.clear();
        let mut lifecycle = std::mem::replace(&mut state.lifecycle, ConnectionLifecycle::new());

        let id = self.id.clone();
        let mut dispose = move || {
            if let Err(err) = lifecycle.dispose(Terminal::Rollback) {
                warn!(tx = %id, error = %err, "rollback on drop failed");
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(dispose);
            }
            Err(_) => dispose(),
        }
    }
}
