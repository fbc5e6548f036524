//! Explicit cancellation and deadline propagation for step execution.

use crate::error::WorkflowError;
use crate::step::RetryPolicy;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Details of a retry a [`BaseStep`](crate::BaseStep) is about to make.
#[derive(Debug)]
pub struct RetryNotice<'a> {
    /// The step being retried
    pub step_id: &'a str,
    /// 1-based number of the retry about to run
    pub attempt: u32,
    /// How long the step sleeps before retrying
    pub delay: Duration,
    /// The error that triggered the retry
    pub error: &'a WorkflowError,
}

/// Callback invoked for every retry made under a context.
pub type RetryObserver = Arc<dyn Fn(&RetryNotice<'_>) + Send + Sync>;

/// Cancellation token and deadline passed by parameter through every step.
///
/// A context is cheap to clone; clones share the same token. [`child`]
/// and [`with_timeout`] derive contexts that are cancelled together with
/// their parent but can also end on their own.
///
/// [`child`]: StepContext::child
/// [`with_timeout`]: StepContext::with_timeout
///
/// # Examples
///
/// ```
/// use taskweave::{StepContext, WorkflowError};
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() {
/// let root = StepContext::new();
/// let child = root.with_timeout(Duration::from_secs(5));
///
/// root.cancel();
/// assert!(child.is_done());
/// assert!(matches!(child.check(), Err(WorkflowError::Cancelled)));
/// # }
/// ```
#[derive(Clone, Default)]
pub struct StepContext {
    token: CancellationToken,
    deadline: Option<Instant>,
    default_retry: Option<RetryPolicy>,
    retry_observer: Option<RetryObserver>,
}

impl fmt::Debug for StepContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepContext")
            .field("cancelled", &self.token.is_cancelled())
            .field("deadline", &self.deadline)
            .field("default_retry", &self.default_retry)
            .finish()
    }
}

impl StepContext {
    /// Creates a root context that never expires on its own.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a root context driven by an existing token.
    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            token,
            ..Self::default()
        }
    }

    /// Derives a context that is cancelled with `self` but can also be
    /// cancelled independently.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
            default_retry: self.default_retry.clone(),
            retry_observer: self.retry_observer.clone(),
        }
    }

    /// Derives a child context whose deadline is at most `timeout` from now.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let mut child = self.child();
        let candidate = Instant::now() + timeout;
        child.deadline = Some(match self.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        });
        child
    }

    /// Sets the policy used by steps that declare none of their own.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.default_retry = Some(policy);
        self
    }

    /// Sets the callback notified before each retry.
    pub fn with_retry_observer(mut self, observer: RetryObserver) -> Self {
        self.retry_observer = Some(observer);
        self
    }

    /// Cancels this context and every context derived from it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// The underlying cancellation token.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Returns `true` once the deadline has passed.
    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Returns `true` if the context was cancelled or its deadline passed.
    pub fn is_done(&self) -> bool {
        self.is_cancelled() || self.is_expired()
    }

    /// The reason the context ended, if it has.
    ///
    /// Cancellation wins over deadline expiry when both apply.
    pub fn error(&self) -> Option<WorkflowError> {
        if self.is_cancelled() {
            Some(WorkflowError::Cancelled)
        } else if self.is_expired() {
            Some(WorkflowError::DeadlineExceeded)
        } else {
            None
        }
    }

    /// Returns the context's error if it has already ended.
    pub fn check(&self) -> Result<(), WorkflowError> {
        match self.error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn done(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }

    /// Sleeps for `duration` unless the context ends first.
    pub async fn sleep(&self, duration: Duration) -> Result<(), WorkflowError> {
        tokio::select! {
            biased;
            _ = self.done() => Err(self.error().unwrap_or(WorkflowError::Cancelled)),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    /// Drives `fut` to completion unless the context ends first, in which
    /// case `fut` is dropped and the context's error returned.
    pub async fn run<T, F>(&self, fut: F) -> Result<T, WorkflowError>
    where
        F: Future<Output = Result<T, WorkflowError>>,
    {
        self.check()?;
        tokio::select! {
            biased;
            _ = self.done() => Err(self.error().unwrap_or(WorkflowError::Cancelled)),
            result = fut => result,
        }
    }

    /// The policy inherited from the workflow, if any.
    pub fn default_retry_policy(&self) -> Option<&RetryPolicy> {
        self.default_retry.as_ref()
    }

    pub(crate) fn notify_retry(&self, notice: &RetryNotice<'_>) {
        if let Some(observer) = &self.retry_observer {
            observer(notice);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_child_is_cancelled_with_parent() {
        let parent = StepContext::new();
        let child = parent.child();
        assert!(!child.is_done());

        parent.cancel();
        assert!(child.is_cancelled());
        assert!(matches!(child.error(), Some(WorkflowError::Cancelled)));
    }

    #[tokio::test]
    async fn test_child_cancel_leaves_parent_running() {
        let parent = StepContext::new();
        let child = parent.child();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn test_timeout_reports_deadline_exceeded() {
        let ctx = StepContext::new().with_timeout(Duration::from_millis(10));
        ctx.done().await;
        assert!(ctx.is_expired());
        assert!(matches!(ctx.check(), Err(WorkflowError::DeadlineExceeded)));
    }

    #[tokio::test]
    async fn test_nested_timeout_keeps_earlier_deadline() {
        let outer = StepContext::new().with_timeout(Duration::from_millis(20));
        let inner = outer.with_timeout(Duration::from_secs(60));
        assert_eq!(inner.deadline(), outer.deadline());
    }

    #[test]
    fn test_done_wakes_waiter_on_cancel() {
        let ctx = StepContext::new();
        let mut done = tokio_test::task::spawn(ctx.done());
        tokio_test::assert_pending!(done.poll());

        ctx.cancel();
        assert!(done.is_woken());
        tokio_test::assert_ready!(done.poll());
    }

    #[tokio::test]
    async fn test_sleep_is_interrupted_by_cancel() {
        let ctx = StepContext::new();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });
        let started = std::time::Instant::now();
        let result = ctx.sleep(Duration::from_secs(10)).await;
        assert!(matches!(result, Err(WorkflowError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_run_drops_future_on_deadline() {
        let ctx = StepContext::new().with_timeout(Duration::from_millis(10));
        let result: Result<(), _> = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(WorkflowError::DeadlineExceeded)));
    }

    #[test]
    fn test_retry_observer_is_inherited_by_children() {
        let seen = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&seen);
        let ctx = StepContext::new().with_retry_observer(Arc::new(move |notice: &RetryNotice<'_>| {
            counter.fetch_add(notice.attempt, Ordering::SeqCst);
        }));
        let error = WorkflowError::step("flaky");
        ctx.child().notify_retry(&RetryNotice {
            step_id: "a",
            attempt: 2,
            delay: Duration::ZERO,
            error: &error,
        });
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }
}
