// Executor combinators: deferred work composed into a plan's control-flow
// graph. An Executor is one-shot work given a cancellation Scope; then /
// finally / parallel / when / unless are the only sequencing primitives the
// plan executor uses.

use std::future::Future;
use std::pin::Pin;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio_util::sync::CancellationToken;

/// Error returned when an executor is invoked under an already-cancelled
/// scope, or when a branch is cancelled mid-flight.
#[derive(Debug, Clone, thiserror::Error)]
#[error("execution cancelled")]
pub struct Cancelled;

/// The execution scope threaded through every combinator: a cancellation
/// token plus invocation-wide flags.
#[derive(Debug, Clone)]
pub struct Scope {
    cancel: CancellationToken,
    dryrun: bool,
}

impl Scope {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            dryrun: false,
        }
    }

    pub fn with_dryrun(dryrun: bool) -> Self {
        Self {
            cancel: CancellationToken::new(),
            dryrun,
        }
    }

    /// A scope whose cancellation follows this one, but which can be
    /// cancelled independently without affecting the parent.
    pub fn child(&self) -> Scope {
        Scope {
            cancel: self.cancel.child_token(),
            dryrun: self.dryrun,
        }
    }

    /// A scope detached from this one's cancellation, used for best-effort
    /// teardown after the parent has been cancelled.
    pub fn detached(&self) -> Scope {
        Scope {
            cancel: CancellationToken::new(),
            dryrun: self.dryrun,
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn dryrun(&self) -> bool {
        self.dryrun
    }

    /// The underlying token, for handing to I/O operations.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

type BoxFut = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// A deferred effect: work that will be done when given a scope.
///
/// Executors are one-shot. Composition happens before execution; nothing in
/// the composed graph runs until `execute` is called on the root.
pub struct Executor {
    run: Box<dyn FnOnce(Scope) -> BoxFut + Send>,
}

impl Executor {
    /// Wrap an async closure as an executor.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: FnOnce(Scope) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            run: Box::new(move |scope| Box::pin(f(scope))),
        }
    }

    /// An executor that does nothing.
    pub fn nop() -> Self {
        Executor::new(|_| async { Ok(()) })
    }

    /// Run the deferred work. Fails immediately with [`Cancelled`] if the
    /// scope is already cancelled; no work starts.
    pub async fn execute(self, scope: Scope) -> anyhow::Result<()> {
        if scope.cancelled() {
            return Err(Cancelled.into());
        }
        (self.run)(scope).await
    }

    /// Sequential composition: `next` runs only if `self` succeeds.
    pub fn then(self, next: Executor) -> Executor {
        Executor::new(move |scope| async move {
            self.execute(scope.clone()).await?;
            next.execute(scope).await
        })
    }

    /// `cleanup` runs regardless of the primary's result, even after
    /// cancellation (under a detached scope). The primary's error is
    /// preserved; a cleanup error only surfaces when the primary succeeded.
    pub fn finally(self, cleanup: Executor) -> Executor {
        Executor::new(move |scope| async move {
            let result = self.execute(scope.clone()).await;
            let cleanup_scope = if scope.cancelled() {
                scope.detached()
            } else {
                scope
            };
            match (result, cleanup.execute(cleanup_scope).await) {
                (Err(primary), Err(suppressed)) => {
                    tracing::debug!(
                        target: "plan",
                        "cleanup error suppressed by primary failure: {:#}",
                        suppressed
                    );
                    Err(primary)
                }
                (Err(primary), Ok(())) => Err(primary),
                (Ok(()), cleanup_result) => cleanup_result,
            }
        })
    }

    /// Run all executors concurrently under a shared child scope. The first
    /// failure cancels the remaining branches and becomes the aggregate
    /// error; later branch errors are logged, not surfaced.
    pub fn parallel(executors: Vec<Executor>) -> Executor {
        Executor::new(move |scope| async move {
            let group = scope.child();
            let mut branches: FuturesUnordered<_> = executors
                .into_iter()
                .map(|executor| {
                    let branch_scope = group.clone();
                    async move { executor.execute(branch_scope).await }
                })
                .collect();

            let mut first_error = None;
            while let Some(result) = branches.next().await {
                if let Err(err) = result {
                    if first_error.is_none() {
                        group.cancel();
                        first_error = Some(err);
                    } else {
                        tracing::debug!(
                            target: "plan",
                            "parallel branch failed after cancellation: {:#}",
                            err
                        );
                    }
                }
            }

            match first_error {
                Some(err) => Err(err),
                None => Ok(()),
            }
        })
    }

    /// Run `inner` only when the predicate holds for the scope at execution
    /// time (e.g. [`Scope::dryrun`]).
    pub fn when<P>(predicate: P, inner: Executor) -> Executor
    where
        P: Fn(&Scope) -> bool + Send + 'static,
    {
        Executor::new(move |scope| async move {
            if predicate(&scope) {
                inner.execute(scope).await
            } else {
                Ok(())
            }
        })
    }

    /// Run `inner` only when the predicate does NOT hold.
    pub fn unless<P>(predicate: P, inner: Executor) -> Executor
    where
        P: Fn(&Scope) -> bool + Send + 'static,
    {
        Executor::new(move |scope| async move {
            if predicate(&scope) {
                Ok(())
            } else {
                inner.execute(scope).await
            }
        })
    }
}

/// Whether an error chain bottoms out in a cancellation.
pub fn is_cancellation(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.is::<Cancelled>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting(counter: Arc<AtomicUsize>) -> Executor {
        Executor::new(move |_| async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn failing(message: &'static str) -> Executor {
        Executor::new(move |_| async move { anyhow::bail!(message) })
    }

    #[tokio::test]
    async fn test_then_runs_in_order() {
        let counter = Arc::new(AtomicUsize::new(0));
        let first = counting(Arc::clone(&counter));
        let second = counting(Arc::clone(&counter));
        first.then(second).execute(Scope::new()).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_then_stops_on_failure() {
        let counter = Arc::new(AtomicUsize::new(0));
        let second = counting(Arc::clone(&counter));
        let result = failing("boom").then(second).execute(Scope::new()).await;
        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_finally_runs_after_failure() {
        let cleaned = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cleaned);
        let cleanup = Executor::new(move |_| async move {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });
        let result = failing("boom").finally(cleanup).execute(Scope::new()).await;
        assert!(result.is_err());
        assert_eq!(format!("{}", result.unwrap_err()), "boom");
        assert!(cleaned.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_finally_preserves_primary_error() {
        let result = failing("primary")
            .finally(failing("cleanup"))
            .execute(Scope::new())
            .await;
        assert_eq!(format!("{}", result.unwrap_err()), "primary");
    }

    #[tokio::test]
    async fn test_parallel_all_succeed() {
        let counter = Arc::new(AtomicUsize::new(0));
        let executors = (0..4).map(|_| counting(Arc::clone(&counter))).collect();
        Executor::parallel(executors)
            .execute(Scope::new())
            .await
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_parallel_first_failure_cancels_rest() {
        let slow_ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&slow_ran);
        let slow = Executor::new(move |scope| async move {
            let cancellation = scope.cancellation();
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_secs(30)) => {
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                }
                _ = cancellation.cancelled() => Err(Cancelled.into()),
            }
        });
        let result = Executor::parallel(vec![failing("boom"), slow])
            .execute(Scope::new())
            .await;
        assert_eq!(format!("{}", result.unwrap_err()), "boom");
        assert!(!slow_ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cancelled_scope_refuses_work() {
        let counter = Arc::new(AtomicUsize::new(0));
        let scope = Scope::new();
        scope.cancel();
        let result = counting(Arc::clone(&counter)).execute(scope).await;
        assert!(is_cancellation(&result.unwrap_err()));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_when_and_unless() {
        let counter = Arc::new(AtomicUsize::new(0));
        let scope = Scope::with_dryrun(true);
        Executor::when(|s: &Scope| s.dryrun(), counting(Arc::clone(&counter)))
            .execute(scope.clone())
            .await
            .unwrap();
        Executor::unless(|s: &Scope| s.dryrun(), counting(Arc::clone(&counter)))
            .execute(scope)
            .await
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_finally_cleanup_runs_after_cancellation() {
        let cleaned = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cleaned);
        let primary = Executor::new(|scope: Scope| async move {
            scope.cancel();
            Err(Cancelled.into())
        });
        let cleanup = Executor::new(move |_| async move {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });
        let result = primary.finally(cleanup).execute(Scope::new()).await;
        assert!(result.is_err());
        assert!(cleaned.load(Ordering::SeqCst));
    }
}
