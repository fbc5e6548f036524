use crate::context::StepContext;
use crate::error::WorkflowError;
use crate::step::{validate_identity, Step, StepInput, StepOutput, StepType};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// Default bound on loop iterations.
pub const DEFAULT_MAX_ITERATIONS: usize = 100;

/// What a loop condition asks for next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopControl {
    Continue,
    Break,
}

impl From<bool> for LoopControl {
    /// `true` keeps looping.
    fn from(keep_going: bool) -> Self {
        if keep_going {
            LoopControl::Continue
        } else {
            LoopControl::Break
        }
    }
}

/// Decides, before each iteration, whether the loop continues.
///
/// Receives the running input and the 0-based iteration number.
pub type LoopCondition = Arc<dyn Fn(&StepInput, usize) -> LoopControl + Send + Sync>;

/// Repeats a body step until its condition breaks or `max_iterations` runs
/// have happened.
///
/// Each iteration receives the previous iteration's output data and
/// variables. With `collect_output` (the default) the final data is an
/// array of every iteration's data; otherwise it is the last iteration's
/// data.
///
/// # Examples
///
/// ```
/// use taskweave::steps::LoopControl;
/// use taskweave::{BaseStep, LoopStep, StepOutput};
///
/// let increment = BaseStep::new("inc", "Increment", |_ctx, input| async move {
///     Ok(StepOutput::new(input.data.as_i64().unwrap_or(0) + 1))
/// });
///
/// let count_to_three = LoopStep::new("count", "Count", increment, |input, _iteration| {
///     if input.data.as_i64().unwrap_or(0) >= 3 {
///         LoopControl::Break
///     } else {
///         LoopControl::Continue
///     }
/// })
/// .max_iterations(10)
/// .collect_output(false);
/// # let _ = count_to_three;
/// ```
pub struct LoopStep {
    id: String,
    name: String,
    body: Option<Arc<dyn Step>>,
    condition: Option<LoopCondition>,
    max_iterations: usize,
    collect_output: bool,
}

impl std::fmt::Debug for LoopStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopStep")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("body", &self.body)
            .field("max_iterations", &self.max_iterations)
            .field("collect_output", &self.collect_output)
            .finish()
    }
}

impl LoopStep {
    pub fn new<F>(
        id: impl Into<String>,
        name: impl Into<String>,
        body: impl Step + 'static,
        condition: F,
    ) -> Self
    where
        F: Fn(&StepInput, usize) -> LoopControl + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            name: name.into(),
            body: Some(Arc::new(body)),
            condition: Some(Arc::new(condition)),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            collect_output: true,
        }
    }

    /// Creates a loop with neither body nor condition. It fails validation
    /// until both are set.
    pub fn empty(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            body: None,
            condition: None,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            collect_output: true,
        }
    }

    pub fn body(mut self, body: Arc<dyn Step>) -> Self {
        self.body = Some(body);
        self
    }

    pub fn condition(mut self, condition: LoopCondition) -> Self {
        self.condition = Some(condition);
        self
    }

    /// Caps the number of iterations. `0` restores the default.
    pub fn max_iterations(mut self, max: usize) -> Self {
        self.max_iterations = if max == 0 { DEFAULT_MAX_ITERATIONS } else { max };
        self
    }

    pub fn collect_output(mut self, collect: bool) -> Self {
        self.collect_output = collect;
        self
    }
}

#[async_trait]
impl Step for LoopStep {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn step_type(&self) -> StepType {
        StepType::Loop
    }

    async fn execute(
        &self,
        ctx: &StepContext,
        input: StepInput,
    ) -> Result<StepOutput, WorkflowError> {
        let (body, condition) = match (&self.body, &self.condition) {
            (Some(body), Some(condition)) => (body, condition),
            _ => {
                return Err(WorkflowError::Validation(format!(
                    "loop step '{}' needs a body and a condition",
                    self.id
                )))
            }
        };

        let mut current = input;
        let mut collected = Vec::new();
        let mut iterations = 0;

        while iterations < self.max_iterations {
            ctx.check()?;
            if condition(&current, iterations) == LoopControl::Break {
                debug!(step_id = %self.id, iterations, "loop condition broke");
                break;
            }

            let output = body.execute(ctx, current.clone()).await?;
            iterations += 1;

            current.variables.extend(output.variables);
            current.data = output.data;
            if self.collect_output {
                collected.push(current.data.clone());
            }
        }

        if iterations == self.max_iterations {
            warn!(step_id = %self.id, max = self.max_iterations, "loop reached its iteration limit");
        }

        let data = if self.collect_output {
            Value::Array(collected)
        } else {
            current.data
        };
        Ok(StepOutput {
            data,
            variables: current.variables,
            ..StepOutput::default()
        }
        .with_metadata("iterations", iterations))
    }

    fn validate(&self) -> Result<(), WorkflowError> {
        validate_identity(&self.id, &self.name, StepType::Loop)?;
        if self.condition.is_none() {
            return Err(WorkflowError::Validation(format!(
                "loop step '{}' has no condition",
                self.id
            )));
        }
        match &self.body {
            Some(body) => body.validate(),
            None => Err(WorkflowError::Validation(format!(
                "loop step '{}' has no body",
                self.id
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::BaseStep;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_increment(calls: Arc<AtomicUsize>) -> BaseStep {
        BaseStep::new("inc", "Increment", move |_ctx, input| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(StepOutput::new(input.data.as_i64().unwrap_or(0) + 1))
            }
        })
    }

    fn until_three(input: &StepInput, _iteration: usize) -> LoopControl {
        if input.data.as_i64().unwrap_or(0) >= 3 {
            LoopControl::Break
        } else {
            LoopControl::Continue
        }
    }

    #[tokio::test]
    async fn test_breaks_before_max_iterations() {
        let calls = Arc::new(AtomicUsize::new(0));
        let step = LoopStep::new("loop", "Loop", counting_increment(Arc::clone(&calls)), until_three)
            .max_iterations(10);

        let output = step
            .execute(&StepContext::new(), StepInput::new(0))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(output.data, serde_json::json!([1, 2, 3]));
        assert_eq!(output.metadata.get("iterations"), Some(&Value::from(3)));
    }

    #[tokio::test]
    async fn test_last_data_without_collection() {
        let calls = Arc::new(AtomicUsize::new(0));
        let step = LoopStep::new("loop", "Loop", counting_increment(calls), until_three)
            .collect_output(false);

        let output = step
            .execute(&StepContext::new(), StepInput::new(0))
            .await
            .unwrap();
        assert_eq!(output.data, 3);
    }

    #[tokio::test]
    async fn test_stops_at_max_iterations() {
        let calls = Arc::new(AtomicUsize::new(0));
        let step = LoopStep::new(
            "loop",
            "Loop",
            counting_increment(Arc::clone(&calls)),
            |_input, _iteration| LoopControl::Continue,
        )
        .max_iterations(5);

        step.execute(&StepContext::new(), StepInput::new(0))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_body_variables_carry_between_iterations() {
        let body = BaseStep::new("acc", "Accumulate", |_ctx, input| async move {
            let total = input.variable("total").and_then(Value::as_i64).unwrap_or(0);
            Ok(StepOutput::new(Value::Null).with_variable("total", total + 10))
        });
        let step = LoopStep::new("loop", "Loop", body, |_input, iteration| {
            LoopControl::from(iteration < 4)
        });

        let output = step
            .execute(&StepContext::new(), StepInput::default())
            .await
            .unwrap();
        assert_eq!(output.variables.get("total"), Some(&Value::from(40)));
    }

    #[test]
    fn test_validate() {
        assert!(LoopStep::empty("l", "L").validate().is_err());
        let body: Arc<dyn Step> = Arc::new(BaseStep::unbound("x", "X"));
        let step = LoopStep::empty("l", "L")
            .body(body)
            .condition(Arc::new(|_input: &StepInput, _iteration: usize| LoopControl::Break));
        assert!(step.validate().is_err());
    }
}
