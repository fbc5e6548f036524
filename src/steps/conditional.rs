use crate::context::StepContext;
use crate::error::WorkflowError;
use crate::step::{validate_identity, Step, StepInput, StepOutput, StepType};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Picks a branch name from the step input.
pub type ConditionFn = Arc<dyn Fn(&StepInput) -> String + Send + Sync>;

/// Branch name used by [`ConditionalStep::then`].
pub const THEN_BRANCH: &str = "true";
/// Branch name used by [`ConditionalStep::otherwise`].
pub const ELSE_BRANCH: &str = "false";

/// Dispatches to one of several branches based on a condition.
///
/// When the condition names a branch that has no registered step, the step
/// does not fail: it returns an output with `null` data and
/// `next_step_id` set to the branch name, so callers can route on it.
///
/// # Examples
///
/// ```
/// use taskweave::{BaseStep, ConditionalStep, StepOutput};
///
/// let approve = BaseStep::new("approve", "Approve", |_ctx, _input| async {
///     Ok(StepOutput::new("approved"))
/// });
/// let reject = BaseStep::new("reject", "Reject", |_ctx, _input| async {
///     Ok(StepOutput::new("rejected"))
/// });
///
/// let review = ConditionalStep::when("review", "Review", |input| {
///     input.data.as_i64().unwrap_or(0) > 10
/// })
/// .then(approve)
/// .otherwise(reject);
/// # let _ = review;
/// ```
pub struct ConditionalStep {
    id: String,
    name: String,
    condition: Option<ConditionFn>,
    branches: BTreeMap<String, Arc<dyn Step>>,
}

impl std::fmt::Debug for ConditionalStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConditionalStep")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("branches", &self.branches)
            .finish()
    }
}

impl ConditionalStep {
    /// Creates a step whose condition returns a branch name.
    pub fn new<F>(id: impl Into<String>, name: impl Into<String>, condition: F) -> Self
    where
        F: Fn(&StepInput) -> String + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            name: name.into(),
            condition: Some(Arc::new(condition)),
            branches: BTreeMap::new(),
        }
    }

    /// Creates a step driven by a boolean predicate, dispatching to the
    /// [`then`](Self::then) or [`otherwise`](Self::otherwise) branch.
    pub fn when<F>(id: impl Into<String>, name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&StepInput) -> bool + Send + Sync + 'static,
    {
        Self::new(id, name, move |input| {
            let branch = if predicate(input) { THEN_BRANCH } else { ELSE_BRANCH };
            branch.to_string()
        })
    }

    /// Creates a step with no condition. It fails validation.
    pub fn unconditioned(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            condition: None,
            branches: BTreeMap::new(),
        }
    }

    pub fn then(self, step: impl Step + 'static) -> Self {
        self.branch(THEN_BRANCH, step)
    }

    pub fn otherwise(self, step: impl Step + 'static) -> Self {
        self.branch(ELSE_BRANCH, step)
    }

    /// Registers a step under an arbitrary branch name.
    pub fn branch(mut self, name: impl Into<String>, step: impl Step + 'static) -> Self {
        self.branches.insert(name.into(), Arc::new(step));
        self
    }

    /// Registers an already shared step under a branch name.
    pub fn branch_shared(mut self, name: impl Into<String>, step: Arc<dyn Step>) -> Self {
        self.branches.insert(name.into(), step);
        self
    }

    pub fn branch_names(&self) -> impl Iterator<Item = &str> {
        self.branches.keys().map(String::as_str)
    }
}

#[async_trait]
impl Step for ConditionalStep {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn step_type(&self) -> StepType {
        StepType::Conditional
    }

    async fn execute(
        &self,
        ctx: &StepContext,
        input: StepInput,
    ) -> Result<StepOutput, WorkflowError> {
        ctx.check()?;
        let condition = self.condition.as_ref().ok_or_else(|| {
            WorkflowError::Validation(format!("conditional step '{}' has no condition", self.id))
        })?;
        let branch = condition(&input);

        match self.branches.get(&branch) {
            Some(step) => {
                debug!(step_id = %self.id, branch = %branch, target = %step.id(), "taking branch");
                let output = step.execute(ctx, input).await?;
                Ok(output.with_metadata("branch", branch))
            }
            None => {
                debug!(step_id = %self.id, branch = %branch, "no step for branch, routing by id");
                Ok(StepOutput {
                    data: Value::Null,
                    next_step_id: Some(branch.clone()),
                    ..StepOutput::default()
                }
                .with_metadata("branch", branch))
            }
        }
    }

    fn validate(&self) -> Result<(), WorkflowError> {
        validate_identity(&self.id, &self.name, StepType::Conditional)?;
        if self.condition.is_none() {
            return Err(WorkflowError::Validation(format!(
                "conditional step '{}' has no condition",
                self.id
            )));
        }
        if self.branches.is_empty() {
            return Err(WorkflowError::Validation(format!(
                "conditional step '{}' has no branches",
                self.id
            )));
        }
        for step in self.branches.values() {
            step.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::BaseStep;

    fn constant(id: &'static str) -> BaseStep {
        BaseStep::new(id, id, move |_ctx, _input| async move { Ok(StepOutput::new(id)) })
    }

    #[tokio::test]
    async fn test_then_and_otherwise() {
        let step = ConditionalStep::when("check", "Check", |input| input.data == true)
            .then(constant("yes"))
            .otherwise(constant("no"));

        let ctx = StepContext::new();
        let output = step.execute(&ctx, StepInput::new(true)).await.unwrap();
        assert_eq!(output.data, "yes");
        let output = step.execute(&ctx, StepInput::new(false)).await.unwrap();
        assert_eq!(output.data, "no");
        assert_eq!(output.metadata.get("branch"), Some(&Value::from("false")));
    }

    #[tokio::test]
    async fn test_named_branch() {
        let step = ConditionalStep::new("route", "Route", |input| {
            input.data.as_str().unwrap_or_default().to_string()
        })
        .branch("email", constant("send_email"))
        .branch("sms", constant("send_sms"));

        let output = step
            .execute(&StepContext::new(), StepInput::new("sms"))
            .await
            .unwrap();
        assert_eq!(output.data, "send_sms");
    }

    #[tokio::test]
    async fn test_unmapped_branch_routes_by_id() {
        let step = ConditionalStep::new("route", "Route", |_input| "archive".to_string())
            .branch("email", constant("send_email"));

        let output = step
            .execute(&StepContext::new(), StepInput::new("payload"))
            .await
            .unwrap();
        assert_eq!(output.next_step_id.as_deref(), Some("archive"));
        assert_eq!(output.data, Value::Null);
    }

    #[test]
    fn test_validate() {
        assert!(ConditionalStep::unconditioned("c", "C")
            .then(constant("a"))
            .validate()
            .is_err());
        assert!(ConditionalStep::when("c", "C", |_| true).validate().is_err());
        assert!(ConditionalStep::when("c", "C", |_| true)
            .then(BaseStep::unbound("x", "X"))
            .validate()
            .is_err());
        assert!(ConditionalStep::when("c", "C", |_| true)
            .then(constant("a"))
            .validate()
            .is_ok());
    }
}
