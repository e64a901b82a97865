//! Request-scoped context carrier.
//!
//! A [`Context`] is an immutable value threaded down a call chain. It carries at
//! most one bound transaction plus an optional deadline and cancellation token.
//! Every `with_*` method returns a new child value; the receiver is never changed,
//! so sibling branches derived from the same parent cannot observe each other's
//! bindings. Children inherit everything their parent carries.

use crate::db::transaction::TxRef;
use crate::error::{DbError, DbResult};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Default)]
pub struct Context {
    transaction: Option<TxRef>,
    deadline: Option<Instant>,
    cancel: Option<CancellationToken>,
}

impl Context {
    /// An empty root context: no transaction, no deadline, never cancelled.
    pub fn background() -> Self {
        Self::default()
    }

    /// Derive a context bound to `tx`, replacing any binding inherited from `self`.
    pub fn with_transaction(&self, tx: TxRef) -> Self {
        Self {
            transaction: Some(tx),
            ..self.clone()
        }
    }

    /// The transaction bound to this context, if any.
    pub fn transaction(&self) -> Option<&TxRef> {
        self.transaction.as_ref()
    }

    pub fn has_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    /// Derive a context that expires at `deadline`.
    ///
    /// A child can only tighten its parent's deadline, never extend it.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(current) if current < deadline => current,
            _ => deadline,
        };
        Self {
            deadline: Some(deadline),
            ..self.clone()
        }
    }

    /// Derive a context that expires `timeout` from now.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a cancellable context.
    ///
    /// Cancelling the returned token cancels the child and its descendants only;
    /// cancelling an ancestor still reaches the child.
    pub fn with_cancel(&self) -> (Self, CancellationToken) {
        let token = match &self.cancel {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        let ctx = Self {
            cancel: Some(token.clone()),
            ..self.clone()
        };
        (ctx, token)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|t| t.is_cancelled())
    }

    /// Drive a driver call to completion unless the context expires or is cancelled first.
    ///
    /// An already-cancelled or already-expired context fails before polling `fut`.
    pub(crate) async fn bound<F, T>(&self, operation: &str, fut: F) -> DbResult<T>
    where
        F: Future<Output = DbResult<T>>,
    {
        if self.is_cancelled() {
            return Err(DbError::cancelled(operation));
        }
        if self.deadline.is_some_and(|d| d <= Instant::now()) {
            return Err(DbError::timeout(operation));
        }

        let timed = async {
            match self.deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, fut)
                    .await
                    .map_err(|_| DbError::timeout(operation))?,
                None => fut.await,
            }
        };

        match &self.cancel {
            Some(token) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => Err(DbError::cancelled(operation)),
                    result = timed => result,
                }
            }
            None => timed.await,
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("transaction", &self.transaction.as_ref().map(|t| t.id()))
            .field("deadline", &self.deadline)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_background_is_empty() {
        let ctx = Context::background();
        assert!(!ctx.has_transaction());
        assert!(ctx.deadline().is_none());
        assert!(!ctx.is_cancelled());
    }

    #[tokio::test]
    async fn test_child_cannot_extend_deadline() {
        let parent = Context::background().with_timeout(Duration::from_secs(1));
        let child = parent.with_timeout(Duration::from_secs(60));
        assert_eq!(child.deadline(), parent.deadline());

        let tighter = parent.with_timeout(Duration::from_millis(10));
        assert!(tighter.deadline() < parent.deadline());
    }

    #[tokio::test]
    async fn test_cancel_reaches_children_not_parent() {
        let (parent, parent_token) = Context::background().with_cancel();
        let (child, child_token) = parent.with_cancel();

        child_token.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());

        let (other_child, _) = parent.with_cancel();
        parent_token.cancel();
        assert!(other_child.is_cancelled());
    }

    #[tokio::test]
    async fn test_bound_passes_through_result() {
        let ctx = Context::background();
        let value = ctx.bound("op", async { Ok::<_, DbError>(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_bound_rejects_cancelled_context_without_polling() {
        let (ctx, token) = Context::background().with_cancel();
        token.cancel();
        let polled = AtomicBool::new(false);
        let result: DbResult<()> = ctx
            .bound("execute", async {
                polled.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(DbError::Cancelled { .. })));
        assert!(!polled.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_bound_times_out() {
        let ctx = Context::background().with_timeout(Duration::from_millis(20));
        let result: DbResult<()> = ctx
            .bound("execute", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(DbError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_bound_aborts_on_cancel_mid_flight() {
        let (ctx, token) = Context::background().with_cancel();
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });
        let result: DbResult<()> = ctx
            .bound("query_row", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        canceller.await.unwrap();
        assert!(matches!(result, Err(DbError::Cancelled { .. })));
    }
}
