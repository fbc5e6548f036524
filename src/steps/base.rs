use crate::context::{RetryNotice, StepContext};
use crate::error::WorkflowError;
use crate::step::{validate_identity, RetryPolicy, Step, StepInput, StepOutput, StepType};
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Boxed future returned by a [`StepFn`].
pub type StepFuture = Pin<Box<dyn Future<Output = Result<StepOutput, WorkflowError>> + Send>>;

/// A type-erased step function.
pub type StepFn = Arc<dyn Fn(StepContext, StepInput) -> StepFuture + Send + Sync>;

/// Boxes an async closure into a [`StepFn`].
///
/// ```
/// use taskweave::{step_fn, StepOutput};
///
/// let double = step_fn(|_ctx, input| async move {
///     let n = input.data.as_i64().unwrap_or(0);
///     Ok(StepOutput::new(n * 2))
/// });
/// # let _ = double;
/// ```
pub fn step_fn<F, Fut>(f: F) -> StepFn
where
    F: Fn(StepContext, StepInput) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<StepOutput, WorkflowError>> + Send + 'static,
{
    Arc::new(move |ctx, input| -> StepFuture { Box::pin(f(ctx, input)) })
}

/// A leaf step backed by an async function.
///
/// The function runs under the step's optional timeout and is retried
/// according to the step's [`RetryPolicy`], or the workflow default when
/// the step has none.
///
/// # Examples
///
/// ```
/// use taskweave::{BaseStep, RetryPolicy, StepOutput};
/// use std::time::Duration;
///
/// let step = BaseStep::new("fetch", "Fetch data", |_ctx, _input| async move {
///     Ok(StepOutput::new("payload"))
/// })
/// .with_timeout(Duration::from_secs(10))
/// .with_retry_policy(RetryPolicy::exponential(3, Duration::from_millis(50)))
/// .depends_on("login");
///
/// assert_eq!(step.dependency_ids(), ["login".to_string()]);
/// ```
#[derive(Clone)]
pub struct BaseStep {
    id: String,
    name: String,
    description: String,
    func: Option<StepFn>,
    timeout: Option<Duration>,
    retry_policy: Option<RetryPolicy>,
    dependencies: Vec<String>,
}

impl fmt::Debug for BaseStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BaseStep")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field("retry_policy", &self.retry_policy)
            .field("dependencies", &self.dependencies)
            .finish()
    }
}

impl BaseStep {
    pub fn new<F, Fut>(id: impl Into<String>, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(StepContext, StepInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<StepOutput, WorkflowError>> + Send + 'static,
    {
        Self::from_fn(id, name, step_fn(f))
    }

    /// Creates a step from an already boxed function.
    pub fn from_fn(id: impl Into<String>, name: impl Into<String>, func: StepFn) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            func: Some(func),
            timeout: None,
            retry_policy: None,
            dependencies: Vec::new(),
        }
    }

    /// Creates a step with no function. It fails validation until
    /// [`with_fn`](Self::with_fn) is called.
    pub fn unbound(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            func: None,
            timeout: None,
            retry_policy: None,
            dependencies: Vec::new(),
        }
    }

    pub fn with_fn(mut self, func: StepFn) -> Self {
        self.func = Some(func);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Declares a step that must have a result before this one runs.
    pub fn depends_on(mut self, step_id: impl Into<String>) -> Self {
        self.dependencies.push(step_id.into());
        self
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn retry_policy(&self) -> Option<&RetryPolicy> {
        self.retry_policy.as_ref()
    }

    pub fn dependency_ids(&self) -> &[String] {
        &self.dependencies
    }
}

#[async_trait]
impl Step for BaseStep {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn step_type(&self) -> StepType {
        StepType::Base
    }

    async fn execute(
        &self,
        ctx: &StepContext,
        input: StepInput,
    ) -> Result<StepOutput, WorkflowError> {
        let func = self.func.as_ref().ok_or_else(|| {
            WorkflowError::Validation(format!("step '{}' has no function", self.id))
        })?;

        let scope = match self.timeout {
            Some(timeout) => ctx.with_timeout(timeout),
            None => ctx.clone(),
        };
        let policy = self
            .retry_policy
            .clone()
            .or_else(|| ctx.default_retry_policy().cloned())
            .unwrap_or_default();

        let mut attempt = 0;
        loop {
            let result = scope.run(func(scope.clone(), input.clone())).await;
            let error = match result {
                Ok(output) => {
                    if attempt > 0 {
                        debug!(step_id = %self.id, attempt, "step succeeded after retry");
                    }
                    return Ok(output);
                }
                Err(error) => error,
            };

            if attempt >= policy.max_retries || scope.is_done() {
                return Err(error);
            }

            let delay = policy.backoff(attempt);
            attempt += 1;
            warn!(
                step_id = %self.id,
                attempt,
                max_retries = policy.max_retries,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "step failed, retrying"
            );
            scope.notify_retry(&RetryNotice {
                step_id: &self.id,
                attempt,
                delay,
                error: &error,
            });
            scope.sleep(delay).await?;
        }
    }

    fn validate(&self) -> Result<(), WorkflowError> {
        validate_identity(&self.id, &self.name, StepType::Base)?;
        if self.func.is_none() {
            return Err(WorkflowError::Validation(format!(
                "base step '{}' has no function",
                self.id
            )));
        }
        Ok(())
    }

    fn dependencies(&self) -> &[String] {
        &self.dependencies
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn flaky(failures: u32, calls: Arc<AtomicU32>) -> BaseStep {
        BaseStep::new("flaky", "Flaky", move |_ctx, _input| {
            let calls = Arc::clone(&calls);
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < failures {
                    Err(WorkflowError::step(format!("failure #{n}")))
                } else {
                    Ok(StepOutput::new(n))
                }
            }
        })
    }

    #[tokio::test]
    async fn test_executes_function() {
        let step = BaseStep::new("echo", "Echo", |_ctx, input| async move {
            Ok(StepOutput::new(input.data))
        });
        let output = step
            .execute(&StepContext::new(), StepInput::new("hi"))
            .await
            .unwrap();
        assert_eq!(output.data, "hi");
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let step = flaky(2, Arc::clone(&calls))
            .with_retry_policy(RetryPolicy::fixed(3, Duration::from_millis(1)));

        let output = step
            .execute(&StepContext::new(), StepInput::default())
            .await
            .unwrap();
        assert_eq!(output.data, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_returns_last_error_when_retries_exhausted() {
        let calls = Arc::new(AtomicU32::new(0));
        let step = flaky(10, Arc::clone(&calls))
            .with_retry_policy(RetryPolicy::fixed(2, Duration::from_millis(1)));

        let err = step
            .execute(&StepContext::new(), StepInput::default())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "failure #2");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_uses_context_default_policy() {
        let calls = Arc::new(AtomicU32::new(0));
        let retries = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&retries);
        let ctx = StepContext::new()
            .with_retry_policy(RetryPolicy::fixed(1, Duration::from_millis(1)))
            .with_retry_observer(Arc::new(move |_notice: &RetryNotice<'_>| {
                seen.fetch_add(1, Ordering::SeqCst);
            }));

        let output = flaky(1, Arc::clone(&calls))
            .execute(&ctx, StepInput::default())
            .await
            .unwrap();
        assert_eq!(output.data, 1);
        assert_eq!(retries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_is_enforced() {
        let step = BaseStep::new("slow", "Slow", |_ctx, _input| async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(StepOutput::default())
        })
        .with_timeout(Duration::from_millis(20));

        let err = step
            .execute(&StepContext::new(), StepInput::default())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_backoff() {
        let ctx = StepContext::new();
        let step = flaky(10, Arc::new(AtomicU32::new(0)))
            .with_retry_policy(RetryPolicy::fixed(5, Duration::from_secs(30)));

        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let err = step.execute(&ctx, StepInput::default()).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Cancelled));
    }

    #[test]
    fn test_validate() {
        let ok = BaseStep::new("a", "A", |_ctx, _input| async { Ok(StepOutput::default()) });
        assert!(ok.validate().is_ok());

        assert!(BaseStep::unbound("a", "A").validate().is_err());
        let no_id = BaseStep::new("", "A", |_ctx, _input| async { Ok(StepOutput::default()) });
        assert!(no_id.validate().is_err());
    }
}
