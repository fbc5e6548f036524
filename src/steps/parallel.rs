use crate::context::StepContext;
use crate::error::WorkflowError;
use crate::step::{validate_identity, Step, StepInput, StepOutput, StepType};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

const NO_FAILURE: usize = usize::MAX;

/// Runs several steps concurrently and aggregates their outputs.
///
/// At most `max_parallel` sub-steps run at a time (all of them when unset).
/// Every sub-step runs to completion; with `fail_fast` the first failure
/// cancels the shared child context so that cooperative sub-steps can stop
/// early, and the error is returned without any partial output. Without
/// `fail_fast` the error carries the aggregated output of the sub-steps
/// that succeeded (see [`WorkflowError::partial_output`]).
///
/// The aggregated output data is an object keyed by sub-step ID.
pub struct ParallelStep {
    id: String,
    name: String,
    steps: Vec<Arc<dyn Step>>,
    max_parallel: Option<usize>,
    fail_fast: bool,
}

impl std::fmt::Debug for ParallelStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelStep")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("steps", &self.steps)
            .field("max_parallel", &self.max_parallel)
            .field("fail_fast", &self.fail_fast)
            .finish()
    }
}

impl ParallelStep {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            steps: Vec::new(),
            max_parallel: None,
            fail_fast: false,
        }
    }

    /// Adds a sub-step.
    pub fn add(mut self, step: impl Step + 'static) -> Self {
        self.steps.push(Arc::new(step));
        self
    }

    /// Adds an already shared sub-step.
    pub fn add_shared(mut self, step: Arc<dyn Step>) -> Self {
        self.steps.push(step);
        self
    }

    /// Limits how many sub-steps run at once. `0` means unbounded.
    pub fn max_parallel(mut self, limit: usize) -> Self {
        self.max_parallel = (limit > 0).then_some(limit);
        self
    }

    pub fn fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn steps(&self) -> &[Arc<dyn Step>] {
        &self.steps
    }

    fn permits(&self) -> usize {
        self.max_parallel
            .unwrap_or(self.steps.len())
            .clamp(1, Semaphore::MAX_PERMITS)
    }
}

#[async_trait]
impl Step for ParallelStep {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn step_type(&self) -> StepType {
        StepType::Parallel
    }

    async fn execute(
        &self,
        ctx: &StepContext,
        input: StepInput,
    ) -> Result<StepOutput, WorkflowError> {
        let scope = ctx.child();
        let semaphore = Arc::new(Semaphore::new(self.permits()));
        let first_failure = Arc::new(AtomicUsize::new(NO_FAILURE));

        let handles: Vec<_> = self
            .steps
            .iter()
            .enumerate()
            .map(|(index, step)| {
                let step = Arc::clone(step);
                let scope = scope.clone();
                let semaphore = Arc::clone(&semaphore);
                let first_failure = Arc::clone(&first_failure);
                let input = input.clone();
                let fail_fast = self.fail_fast;
                tokio::spawn(async move {
                    let result = match semaphore.acquire_owned().await {
                        Ok(_permit) => step.execute(&scope, input).await,
                        Err(_) => Err(WorkflowError::Cancelled),
                    };
                    if result.is_err()
                        && first_failure
                            .compare_exchange(NO_FAILURE, index, Ordering::SeqCst, Ordering::SeqCst)
                            .is_ok()
                        && fail_fast
                    {
                        debug!(step_id = %step.id(), "cancelling parallel siblings after failure");
                        scope.cancel();
                    }
                    result
                })
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for (index, handle) in handles.into_iter().enumerate() {
            let result = match handle.await {
                Ok(result) => result,
                Err(join_error) => {
                    let _ = first_failure.compare_exchange(
                        NO_FAILURE,
                        index,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    );
                    Err(WorkflowError::step(format!("sub-step task failed: {join_error}")))
                }
            };
            results.push(result);
        }
        let first_failure = first_failure.load(Ordering::SeqCst);

        let mut data = Map::new();
        let mut output = StepOutput::default();
        let mut failure: Option<(String, WorkflowError)> = None;
        for (index, (step, result)) in self.steps.iter().zip(results).enumerate() {
            match result {
                Ok(sub) => {
                    output.variables.extend(sub.variables);
                    data.insert(step.id().to_string(), sub.data);
                }
                Err(error) if index == first_failure => {
                    failure = Some((step.id().to_string(), error));
                }
                Err(_) => {}
            }
        }
        output.data = Value::Object(data);
        output
            .metadata
            .insert("parallel_count".to_string(), Value::from(self.steps.len()));

        match failure {
            None => Ok(output),
            Some((step_id, source)) => {
                warn!(step_id = %self.id, failed = %step_id, error = %source, "parallel sub-step failed");
                let partial = (!self.fail_fast).then(|| Box::new(output));
                Err(WorkflowError::ParallelFailed {
                    step_id,
                    source: Box::new(source),
                    partial,
                })
            }
        }
    }

    fn validate(&self) -> Result<(), WorkflowError> {
        validate_identity(&self.id, &self.name, StepType::Parallel)?;
        if self.steps.is_empty() {
            return Err(WorkflowError::Validation(format!(
                "parallel step '{}' has no sub-steps",
                self.id
            )));
        }
        for step in &self.steps {
            step.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::BaseStep;
    use std::time::Duration;

    fn ok_step(id: &'static str, value: i64) -> BaseStep {
        BaseStep::new(id, id, move |_ctx, _input| async move {
            Ok(StepOutput::new(value).with_variable(id, true))
        })
    }

    fn failing_step(id: &'static str) -> BaseStep {
        BaseStep::new(id, id, |_ctx, _input| async move {
            Err(WorkflowError::step("boom"))
        })
    }

    #[tokio::test]
    async fn test_aggregates_outputs_by_id() {
        let step = ParallelStep::new("fanout", "Fan out")
            .add(ok_step("a", 1))
            .add(ok_step("b", 2));

        let output = step
            .execute(&StepContext::new(), StepInput::default())
            .await
            .unwrap();
        assert_eq!(output.data, serde_json::json!({"a": 1, "b": 2}));
        assert_eq!(output.variables.get("a"), Some(&Value::Bool(true)));
        assert_eq!(output.variables.get("b"), Some(&Value::Bool(true)));
    }

    #[tokio::test]
    async fn test_partial_output_without_fail_fast() {
        let step = ParallelStep::new("fanout", "Fan out")
            .add(failing_step("bad"))
            .add(ok_step("good", 7));

        let err = step
            .execute(&StepContext::new(), StepInput::default())
            .await
            .unwrap_err();
        match &err {
            WorkflowError::ParallelFailed { step_id, .. } => assert_eq!(step_id, "bad"),
            other => panic!("unexpected error: {other}"),
        }
        let partial = err.partial_output().expect("partial output");
        assert_eq!(partial.data, serde_json::json!({"good": 7}));
    }

    #[tokio::test]
    async fn test_fail_fast_cancels_siblings_and_drops_partial() {
        let slow = BaseStep::new("slow", "Slow", |ctx, _input| async move {
            ctx.sleep(Duration::from_secs(10)).await?;
            Ok(StepOutput::new("finished"))
        });
        let step = ParallelStep::new("fanout", "Fan out")
            .add(failing_step("bad"))
            .add(slow)
            .fail_fast(true);

        let started = std::time::Instant::now();
        let err = step
            .execute(&StepContext::new(), StepInput::default())
            .await
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(err.partial_output().is_none());
        assert!(matches!(err, WorkflowError::ParallelFailed { .. }));
    }

    #[tokio::test]
    async fn test_max_parallel_bounds_concurrency() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut step = ParallelStep::new("bounded", "Bounded").max_parallel(2);
        for id in ["a", "b", "c", "d", "e"] {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            step = step.add(BaseStep::new(id, id, move |_ctx, _input| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(StepOutput::default())
                }
            }));
        }

        step.execute(&StepContext::new(), StepInput::default())
            .await
            .unwrap();
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn test_validate_requires_sub_steps() {
        assert!(ParallelStep::new("p", "P").validate().is_err());
        let invalid_child = ParallelStep::new("p", "P").add(BaseStep::unbound("x", "X"));
        assert!(invalid_child.validate().is_err());
        assert!(ParallelStep::new("p", "P").add(ok_step("a", 1)).validate().is_ok());
    }
}
