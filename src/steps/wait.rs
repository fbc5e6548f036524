use crate::context::StepContext;
use crate::error::WorkflowError;
use crate::step::{validate_identity, Step, StepInput, StepOutput, StepType};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Default interval between predicate polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Predicate polled by [`WaitStep::until`].
pub type WaitPredicate = Arc<dyn Fn(&StepInput) -> bool + Send + Sync>;

/// Pauses the workflow for a fixed duration or until a predicate holds.
///
/// Exactly one of the two modes must be configured. Both honour
/// cancellation and deadlines. The step passes its input data and
/// variables through unchanged.
pub struct WaitStep {
    id: String,
    name: String,
    duration: Option<Duration>,
    predicate: Option<WaitPredicate>,
    poll_interval: Duration,
}

impl std::fmt::Debug for WaitStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitStep")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("duration", &self.duration)
            .field("has_predicate", &self.predicate.is_some())
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

impl WaitStep {
    /// Creates an unconfigured wait. Call [`for_duration`](Self::for_duration)
    /// or [`until`](Self::until) before use.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            duration: None,
            predicate: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Sleeps for `duration`.
    pub fn for_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    /// Polls `predicate` until it returns `true`.
    pub fn until<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&StepInput) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    async fn poll(
        &self,
        ctx: &StepContext,
        predicate: &WaitPredicate,
        input: &StepInput,
    ) -> Result<u64, WorkflowError> {
        // The first check happens one interval in, not immediately.
        let start = tokio::time::Instant::now() + self.poll_interval;
        let mut ticker = tokio::time::interval_at(start, self.poll_interval);
        let mut polls = 0;
        loop {
            tokio::select! {
                biased;
                _ = ctx.done() => return Err(ctx.error().unwrap_or(WorkflowError::Cancelled)),
                _ = ticker.tick() => {}
            }
            polls += 1;
            if predicate(input) {
                debug!(step_id = %self.id, polls, "wait condition satisfied");
                return Ok(polls);
            }
        }
    }
}

#[async_trait]
impl Step for WaitStep {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn step_type(&self) -> StepType {
        StepType::Wait
    }

    async fn execute(
        &self,
        ctx: &StepContext,
        input: StepInput,
    ) -> Result<StepOutput, WorkflowError> {
        let mut output = match (&self.duration, &self.predicate) {
            (Some(duration), None) => {
                ctx.sleep(*duration).await?;
                StepOutput::default().with_metadata(
                    "waited_ms",
                    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
                )
            }
            (None, Some(predicate)) => {
                let polls = self.poll(ctx, predicate, &input).await?;
                StepOutput::default().with_metadata("polls", polls)
            }
            _ => {
                return Err(WorkflowError::Validation(format!(
                    "wait step '{}' needs exactly one of duration or predicate",
                    self.id
                )))
            }
        };
        output.data = input.data;
        output.variables = input.variables;
        Ok(output)
    }

    fn validate(&self) -> Result<(), WorkflowError> {
        validate_identity(&self.id, &self.name, StepType::Wait)?;
        match (&self.duration, &self.predicate) {
            (Some(_), None) | (None, Some(_)) => {}
            _ => {
                return Err(WorkflowError::Validation(format!(
                    "wait step '{}' needs exactly one of duration or predicate",
                    self.id
                )))
            }
        }
        if self.predicate.is_some() && self.poll_interval.is_zero() {
            return Err(WorkflowError::Validation(format!(
                "wait step '{}' has a zero poll interval",
                self.id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_fixed_duration_passes_input_through() {
        let step = WaitStep::new("pause", "Pause").for_duration(Duration::from_millis(10));
        let started = std::time::Instant::now();
        let output = step
            .execute(&StepContext::new(), StepInput::new("keep").with_variable("k", 1))
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(10));
        assert_eq!(output.data, "keep");
        assert_eq!(output.variables.get("k"), Some(&serde_json::Value::from(1)));
        assert_eq!(output.metadata["waited_ms"], 10);
    }

    #[tokio::test]
    async fn test_predicate_polls_until_true() {
        let polls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&polls);
        let step = WaitStep::new("ready", "Ready")
            .until(move |_input| counter.fetch_add(1, Ordering::SeqCst) >= 2)
            .poll_interval(Duration::from_millis(5));

        step.execute(&StepContext::new(), StepInput::default())
            .await
            .unwrap();
        assert_eq!(polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_first_check_waits_one_interval() {
        let polls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&polls);
        let step = WaitStep::new("ready", "Ready")
            .until(move |_input| {
                counter.fetch_add(1, Ordering::SeqCst);
                true
            })
            .poll_interval(Duration::from_millis(40));

        let started = std::time::Instant::now();
        let output = step
            .execute(&StepContext::new(), StepInput::default())
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(40));
        assert_eq!(polls.load(Ordering::SeqCst), 1);
        assert_eq!(output.metadata["polls"], 1);
    }

    #[tokio::test]
    async fn test_predicate_wait_respects_deadline() {
        let step = WaitStep::new("never", "Never")
            .until(|_input| false)
            .poll_interval(Duration::from_millis(5));
        let ctx = StepContext::new().with_timeout(Duration::from_millis(30));

        let err = step.execute(&ctx, StepInput::default()).await.unwrap_err();
        assert!(matches!(err, WorkflowError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_sleep() {
        let ctx = StepContext::new();
        ctx.cancel();
        let step = WaitStep::new("pause", "Pause").for_duration(Duration::from_secs(60));
        let err = step.execute(&ctx, StepInput::default()).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Cancelled));
    }

    #[test]
    fn test_validate_requires_exactly_one_mode() {
        assert!(WaitStep::new("w", "W").validate().is_err());
        assert!(WaitStep::new("w", "W")
            .for_duration(Duration::from_secs(1))
            .until(|_| true)
            .validate()
            .is_err());
        assert!(WaitStep::new("w", "W")
            .for_duration(Duration::from_secs(1))
            .validate()
            .is_ok());
        assert!(WaitStep::new("w", "W").until(|_| true).validate().is_ok());
    }
}
