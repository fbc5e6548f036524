use crate::context::StepContext;
use crate::error::WorkflowError;
use crate::execution::WorkflowStatus;
use crate::executor::WorkflowRunner;
use crate::step::{validate_identity, Step, StepInput, StepOutput, StepType};
use crate::workflow::{Workflow, WorkflowInput};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

/// Runs another workflow as a single step.
///
/// The nested run goes through the injected [`WorkflowRunner`], usually
/// the executor running the parent. The step input becomes the nested
/// workflow input, and the nested output data and variables become the
/// step output. The nested execution ID is recorded in the output metadata
/// under `execution_id`.
///
/// If the parent context ends first the nested execution is cancelled.
/// Note that the nested run takes its own slot when the runner limits
/// concurrent executions.
pub struct SubWorkflowStep {
    id: String,
    name: String,
    workflow: Arc<Workflow>,
    runner: Arc<dyn WorkflowRunner>,
}

impl std::fmt::Debug for SubWorkflowStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubWorkflowStep")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("workflow", &self.workflow.id())
            .finish()
    }
}

impl SubWorkflowStep {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        workflow: Arc<Workflow>,
        runner: Arc<dyn WorkflowRunner>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            workflow,
            runner,
        }
    }

    pub fn workflow(&self) -> &Arc<Workflow> {
        &self.workflow
    }
}

#[async_trait]
impl Step for SubWorkflowStep {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn step_type(&self) -> StepType {
        StepType::SubWorkflow
    }

    async fn execute(
        &self,
        ctx: &StepContext,
        input: StepInput,
    ) -> Result<StepOutput, WorkflowError> {
        ctx.check()?;
        let execution_id = self
            .runner
            .run_async(Arc::clone(&self.workflow), WorkflowInput::from(input))
            .await?;
        debug!(
            step_id = %self.id,
            workflow_id = %self.workflow.id(),
            execution_id = %execution_id,
            "started nested workflow"
        );

        let execution = tokio::select! {
            biased;
            _ = ctx.done() => {
                if let Err(e) = self.runner.cancel(&execution_id).await {
                    warn!(execution_id = %execution_id, error = %e, "failed to cancel nested workflow");
                }
                return Err(ctx.error().unwrap_or(WorkflowError::Cancelled));
            }
            result = self.runner.wait_for_completion(&execution_id, None) => result?,
        };

        match execution.status {
            WorkflowStatus::Completed => Ok(StepOutput {
                data: execution.output,
                variables: execution.context.variables,
                ..StepOutput::default()
            }
            .with_metadata("execution_id", execution.id)
            .with_metadata("workflow_id", execution.workflow_id)),
            WorkflowStatus::Cancelled => Err(WorkflowError::Cancelled),
            status => Err(WorkflowError::Step(format!(
                "nested workflow '{}' ended {status}: {}",
                self.workflow.id(),
                execution.error.as_deref().unwrap_or("no error recorded")
            ))),
        }
    }

    fn validate(&self) -> Result<(), WorkflowError> {
        validate_identity(&self.id, &self.name, StepType::SubWorkflow)?;
        self.workflow.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Executor;
    use crate::steps::BaseStep;
    use serde_json::Value;
    use std::time::Duration;

    fn nested() -> Arc<Workflow> {
        Arc::new(
            Workflow::builder("nested")
                .id("nested")
                .add(BaseStep::new("shout", "Shout", |_ctx, input| async move {
                    let text = input.data.as_str().unwrap_or_default().to_uppercase();
                    Ok(StepOutput::new(text).with_variable("shouted", true))
                }))
                .build()
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_maps_nested_output() {
        let executor = Arc::new(Executor::new());
        let step = SubWorkflowStep::new("sub", "Sub", nested(), executor);

        let output = step
            .execute(&StepContext::new(), StepInput::new("quiet"))
            .await
            .unwrap();
        assert_eq!(output.data, "QUIET");
        assert_eq!(output.variables.get("shouted"), Some(&Value::Bool(true)));
        assert!(output.metadata.contains_key("execution_id"));
    }

    #[tokio::test]
    async fn test_nested_failure_is_step_error() {
        let failing = Arc::new(
            Workflow::builder("failing")
                .add(BaseStep::new("boom", "Boom", |_ctx, _input| async {
                    Err(WorkflowError::step("kaboom"))
                }))
                .build()
                .unwrap(),
        );
        let step = SubWorkflowStep::new("sub", "Sub", failing, Arc::new(Executor::new()));

        let err = step
            .execute(&StepContext::new(), StepInput::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("kaboom"));
    }

    #[tokio::test]
    async fn test_parent_cancel_cancels_nested() {
        let slow = Arc::new(
            Workflow::builder("slow")
                .wait("Nap", Duration::from_secs(30))
                .build()
                .unwrap(),
        );
        let executor = Arc::new(Executor::new());
        let step = SubWorkflowStep::new("sub", "Sub", slow, executor.clone());

        let ctx = StepContext::new();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            canceller.cancel();
        });

        let err = step.execute(&ctx, StepInput::default()).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Cancelled));

        let executions = executor.list_executions(&Default::default());
        assert_eq!(executions.len(), 1);
        let finished = executor
            .wait_for_completion(&executions[0].id, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(finished.status, WorkflowStatus::Cancelled);
    }
}
