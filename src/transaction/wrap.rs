//! Bracketing async computations with begin / commit / rollback.

use std::future::Future;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::db::ConnectionFactory;
use crate::transaction::config::CancelPolicy;
use crate::transaction::context::ExecContext;
use crate::transaction::error::WrapError;
use crate::transaction::state::{Inner, ScopeToken, Transaction};

/// Rolls back a scope whose `wrap` future is dropped between `begin` and
/// the matching commit or rollback.
struct ScopeGuard<F: ConnectionFactory> {
    inner: Arc<Inner<F>>,
    token: Option<Arc<ScopeToken>>,
}

impl<F: ConnectionFactory> ScopeGuard<F> {
    fn arm(tx: &Transaction<F>) -> Self {
        let token = match tx.config().cancel_policy {
            CancelPolicy::Rollback => Some(Arc::new(ScopeToken::default())),
            CancelPolicy::Ignore => None,
        };
        Self {
            inner: Arc::clone(&tx.inner),
            token,
        }
    }

    fn token(&self) -> Option<Arc<ScopeToken>> {
        self.token.clone()
    }

    /// From here on the scope is closed by an explicit step.
    fn disarm(&mut self) {
        self.token = None;
    }
}

impl<F: ConnectionFactory> Drop for ScopeGuard<F> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            self.inner.abandon(&token);
        }
    }
}

impl<F: ConnectionFactory> Transaction<F> {
    /// Run `fut` inside a scope of this transaction.
    ///
    /// `begin` runs before `fut` is first polled; if it fails `fut` never
    /// runs. On `Ok` the scope commits, and a commit failure replaces the
    /// value. On `Err` the scope rolls back and the computation's error is
    /// returned even if the rollback fails too; the rollback error is kept
    /// in [`WrapError::suppressed`].
    pub async fn wrap<T, E, Fut>(&self, fut: Fut) -> Result<T, WrapError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        let mut guard = ScopeGuard::arm(self);
        if let Err(err) = self.begin_scope(guard.token()).await {
            guard.disarm();
            return Err(WrapError::Transaction(err));
        }

        let outcome = fut.await;
        guard.disarm();

        match outcome {
            Ok(value) => {
                self.commit().await?;
                Ok(value)
            }
            Err(error) => {
                debug!(tx = %self.id(), "wrapped computation failed, rolling back");
                let suppressed = match self.rollback().await {
                    Ok(()) => None,
                    Err(rollback_err) => {
                        warn!(tx = %self.id(), error = %rollback_err, "rollback failed after error");
                        Some(rollback_err)
                    }
                };
                Err(WrapError::Failed { error, suppressed })
            }
        }
    }

    /// [`Transaction::wrap`] for computations that only signal completion.
    pub async fn wrap_action<E, Fut>(&self, fut: Fut) -> Result<(), WrapError<E>>
    where
        Fut: Future<Output = Result<(), E>>,
    {
        self.wrap(fut).await
    }

    /// Like [`Transaction::wrap`], handing the computation `cx` bound to this
    /// transaction (see [`Transaction::bind`]).
    pub async fn wrap_in<T, E, Fut, G>(&self, cx: &ExecContext, f: G) -> Result<T, WrapError<E>>
    where
        G: FnOnce(ExecContext) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let scoped = self.bind(cx);
        self.wrap(async move { f(scoped).await }).await
    }

    /// [`Transaction::wrap_in`] for computations that only signal completion.
    pub async fn wrap_action_in<E, Fut, G>(&self, cx: &ExecContext, f: G) -> Result<(), WrapError<E>>
    where
        G: FnOnce(ExecContext) -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        self.wrap_in(cx, f).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use thiserror::Error;

    use crate::db::{ConnectionResult, MemoryConnection, MemoryDatabase, Op};
    use crate::transaction::config::TransactionConfig;
    use crate::transaction::error::{TransactionError, TxOperation};

    #[derive(Debug, Error)]
    enum AppError {
        #[error("insufficient funds")]
        InsufficientFunds,
        #[error(transparent)]
        Tx(#[from] TransactionError),
    }

    fn setup() -> (MemoryDatabase, Transaction<MemoryDatabase>) {
        let db = MemoryDatabase::new();
        let tx = Transaction::new(db.clone());
        (db, tx)
    }

    #[tokio::test]
    async fn test_wrap_success_commits() {
        let (db, tx) = setup();
        let conn = tx.clone();

        let value = tx
            .wrap(async move {
                conn.run(|c| c.put("account:1", "100")).await?;
                Ok::<_, AppError>(42)
            })
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(db.get("account:1"), Some("100".to_string()));
        assert!(!tx.has_connection());
        assert_eq!(
            db.journal(),
            vec![Op::Connect, Op::SetAutoCommit, Op::Commit, Op::Close]
        );
    }

    #[tokio::test]
    async fn test_wrap_failure_rolls_back() {
        let (db, tx) = setup();
        let conn = tx.clone();

        let err = tx
            .wrap(async move {
                conn.run(|c| c.put("account:1", "-5")).await?;
                Err::<(), _>(AppError::InsufficientFunds)
            })
            .await
            .unwrap_err();

        assert!(matches!(err.inner(), Some(AppError::InsufficientFunds)));
        assert!(err.suppressed().is_none());
        assert!(db.get("account:1").is_none());
        assert_eq!(db.count(Op::Rollback), 1);
        assert_eq!(db.count(Op::Commit), 0);
        assert!(!tx.has_connection());
    }

    #[tokio::test]
    async fn test_rollback_failure_does_not_mask_error() {
        let (db, tx) = setup();
        db.fail(Op::Rollback, 1);

        let err = tx
            .wrap(async { Err::<(), _>(AppError::InsufficientFunds) })
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "insufficient funds");
        let suppressed = err.suppressed().unwrap();
        assert_eq!(suppressed.operation(), Some(TxOperation::Rollback));
        assert!(matches!(err.into_inner(), Ok(AppError::InsufficientFunds)));
        assert!(!tx.has_connection());
        assert_eq!(db.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_commit_failure_overrides_value() {
        let (db, tx) = setup();
        db.fail(Op::Commit, 1);

        let err = tx.wrap(async { Ok::<_, AppError>("done") }).await.unwrap_err();
        assert!(err.is_transaction());
        assert_eq!(
            err.into_inner().unwrap_err().operation(),
            Some(TxOperation::Commit)
        );
        assert!(!tx.has_connection());
    }

    #[tokio::test]
    async fn test_begin_failure_skips_computation() {
        let (db, tx) = setup();
        db.fail(Op::Connect, 1);
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);

        let err = tx
            .wrap(async move {
                flag.store(true, Ordering::SeqCst);
                Ok::<_, AppError>(())
            })
            .await
            .unwrap_err();

        assert!(err.is_transaction());
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(db.connects(), 1);
        assert!(!tx.has_connection());
    }

    #[tokio::test]
    async fn test_wrap_action() {
        let (db, tx) = setup();
        let conn = tx.clone();

        tx.wrap_action(async move {
            conn.run(|c| c.put("flag", "on")).await?;
            Ok::<_, AppError>(())
        })
        .await
        .unwrap();

        assert_eq!(db.get("flag"), Some("on".to_string()));
    }

    #[tokio::test]
    async fn test_nested_wrap_uses_savepoint() {
        let (db, tx) = setup();
        let outer = tx.clone();

        tx.wrap(async move {
            outer.run(|c| c.put("order:1", "placed")).await?;

            let inner = outer.clone();
            let nested = outer
                .wrap(async move {
                    inner.run(|c| c.put("order:1:discount", "50%")).await?;
                    Err::<(), _>(AppError::InsufficientFunds)
                })
                .await;
            assert!(nested.is_err());
            assert_eq!(outer.depth(), 1);

            Ok::<_, AppError>(())
        })
        .await
        .unwrap();

        assert_eq!(db.get("order:1"), Some("placed".to_string()));
        assert!(db.get("order:1:discount").is_none());
        assert_eq!(db.connects(), 1);
        assert_eq!(db.count(Op::Savepoint), 1);
        assert_eq!(db.count(Op::RollbackTo), 1);
    }

    #[tokio::test]
    async fn test_wrap_in_binds_context() {
        let (db, tx) = setup();
        let cx = ExecContext::new();

        tx.wrap_action_in(&cx, |cx| async move {
            let current = Transaction::<MemoryDatabase>::current(&cx).expect("bound");
            current.run(|c| c.put("k", "v")).await?;
            Ok::<_, AppError>(())
        })
        .await
        .unwrap();

        assert!(!cx.has_transaction());
        assert_eq!(db.get("k"), Some("v".to_string()));
    }

    #[tokio::test]
    async fn test_wrap_in_without_auto_bind() {
        let (_db, tx) = setup();
        let tx = tx.auto_bind(false);

        let bound = tx
            .wrap_in(&ExecContext::new(), |cx| async move {
                Ok::<_, AppError>(cx.has_transaction())
            })
            .await
            .unwrap();
        assert!(!bound);
    }

    #[tokio::test]
    async fn test_cancelled_outermost_scope_rolls_back() {
        let (db, tx) = setup();
        let conn = tx.clone();

        let result = tokio::time::timeout(
            Duration::from_millis(50),
            tx.wrap(async move {
                conn.run(|c| c.put("k", "v")).await?;
                std::future::pending::<Result<(), AppError>>().await
            }),
        )
        .await;
        assert!(result.is_err());

        tx.reconcile().await.unwrap();
        assert!(!tx.has_connection());
        assert_eq!(tx.depth(), 0);
        assert!(db.get("k").is_none());
        assert_eq!(db.count(Op::Rollback), 1);
        assert_eq!(db.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_nested_scope_rolls_back_to_savepoint() {
        let (db, tx) = setup();
        let outer = tx.clone();

        tx.wrap(async move {
            outer.run(|c| c.put("outer", "1")).await?;

            let inner = outer.clone();
            let timed_out = tokio::time::timeout(
                Duration::from_millis(50),
                outer.wrap(async move {
                    inner.run(|c| c.put("inner", "2")).await?;
                    std::future::pending::<Result<(), AppError>>().await
                }),
            )
            .await;
            assert!(timed_out.is_err());

            outer.run(|c| c.put("after", "3")).await?;
            Ok::<_, AppError>(())
        })
        .await
        .unwrap();

        assert_eq!(db.get("outer"), Some("1".to_string()));
        assert_eq!(db.get("after"), Some("3".to_string()));
        assert!(db.get("inner").is_none());
        assert_eq!(db.count(Op::RollbackTo), 1);
        assert_eq!(db.count(Op::Commit), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_scope_dropped_during_begin_rolls_back() {
        let db = MemoryDatabase::new();
        let slow = db.clone();
        let factory = move || -> ConnectionResult<MemoryConnection> {
            std::thread::sleep(Duration::from_millis(200));
            slow.connect()
        };
        let tx = Transaction::new(factory);
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);

        let result = tokio::time::timeout(
            Duration::from_millis(20),
            tx.wrap(async move {
                flag.store(true, Ordering::SeqCst);
                Ok::<_, AppError>(())
            }),
        )
        .await;
        assert!(result.is_err());

        // Queued behind the begin step, which undoes itself.
        tx.reconcile().await.unwrap();
        assert!(!ran.load(Ordering::SeqCst));
        assert!(!tx.has_connection());
        assert_eq!(tx.depth(), 0);
        assert_eq!(db.open_connections(), 0);
        assert_eq!(db.count(Op::Commit), 0);
        assert!(db.journal().ends_with(&[Op::Rollback, Op::Close]));
    }

    #[tokio::test]
    async fn test_cancel_policy_ignore_keeps_scope_open() {
        let db = MemoryDatabase::new();
        let config = TransactionConfig::new().cancel_policy(CancelPolicy::Ignore);
        let tx = Transaction::with_config(db.clone(), config);

        let result = tokio::time::timeout(
            Duration::from_millis(50),
            tx.wrap(std::future::pending::<Result<(), AppError>>()),
        )
        .await;
        assert!(result.is_err());

        tx.reconcile().await.unwrap();
        assert!(tx.has_connection());
        assert_eq!(tx.depth(), 1);

        tx.rollback().await.unwrap();
        assert_eq!(db.open_connections(), 0);
    }
}
