use crate::context::StepContext;
use crate::error::WorkflowError;
use crate::execution::{WorkflowExecution, WorkflowStatus};
use crate::executor::WorkflowRunner;
use crate::step::{RetryPolicy, Step, StepInput, StepOutput, Variables};
use crate::steps::{
    BaseStep, ConditionalStep, LoopControl, LoopStep, ParallelStep, StepFn, SubWorkflowStep,
    WaitStep,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// An ordered list of steps plus run-wide defaults.
///
/// Workflows are immutable once built and are shared between executions
/// behind an [`Arc`].
pub struct Workflow {
    pub(crate) id: String,
    pub(crate) name: String,
    pub(crate) version: String,
    pub(crate) description: String,
    pub(crate) steps: Vec<Arc<dyn Step>>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) retry_policy: RetryPolicy,
    pub(crate) metadata: HashMap<String, Value>,
}

impl fmt::Debug for Workflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workflow")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("version", &self.version)
            .field(
                "steps",
                &self.steps.iter().map(|s| s.id()).collect::<Vec<_>>(),
            )
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Workflow {
    pub fn builder(name: impl Into<String>) -> WorkflowBuilder {
        WorkflowBuilder::new(name)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn steps(&self) -> &[Arc<dyn Step>] {
        &self.steps
    }

    /// Looks up a top-level step by ID.
    pub fn step(&self, step_id: &str) -> Option<&Arc<dyn Step>> {
        self.steps.iter().find(|s| s.id() == step_id)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// The policy applied to base steps that declare none.
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    pub fn metadata(&self) -> &HashMap<String, Value> {
        &self.metadata
    }

    /// Checks that the workflow has steps, that every step is valid and
    /// that top-level step IDs are unique.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        if self.id.trim().is_empty() {
            return Err(WorkflowError::Validation("workflow id is empty".to_string()));
        }
        if self.steps.is_empty() {
            return Err(WorkflowError::Validation(format!(
                "workflow '{}' has no steps",
                self.name
            )));
        }
        let mut seen = HashSet::new();
        for step in &self.steps {
            step.validate()?;
            if !seen.insert(step.id()) {
                return Err(WorkflowError::Validation(format!(
                    "workflow '{}' has duplicate step id '{}'",
                    self.name,
                    step.id()
                )));
            }
        }
        Ok(())
    }
}

/// Input handed to a workflow run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInput {
    pub data: Value,
    #[serde(default)]
    pub variables: Variables,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl WorkflowInput {
    pub fn new(data: impl Into<Value>) -> Self {
        Self {
            data: data.into(),
            ..Self::default()
        }
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

impl From<StepInput> for WorkflowInput {
    fn from(input: StepInput) -> Self {
        Self {
            data: input.data,
            variables: input.variables,
            metadata: input.metadata,
        }
    }
}

/// Result of a finished workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowOutput {
    pub execution_id: String,
    pub status: WorkflowStatus,
    pub data: Value,
    #[serde(default)]
    pub variables: Variables,
    #[serde(with = "crate::execution::duration_nanos")]
    pub duration: Duration,
    #[serde(default)]
    pub error: Option<String>,
}

impl From<&WorkflowExecution> for WorkflowOutput {
    fn from(execution: &WorkflowExecution) -> Self {
        Self {
            execution_id: execution.id.clone(),
            status: execution.status,
            data: execution.output.clone(),
            variables: execution.context.variables.clone(),
            duration: execution.duration,
            error: execution.error.clone(),
        }
    }
}

/// Builds a [`Workflow`], validating every step on [`build`](Self::build).
///
/// Step adders that take a name derive the step ID from it: `"Load CSV"`
/// becomes `load_csv`.
///
/// # Examples
///
/// ```
/// use taskweave::prelude::*;
/// use std::time::Duration;
///
/// let workflow = Workflow::builder("ingest")
///     .version("2.1.0")
///     .timeout(Duration::from_secs(300))
///     .add_func("Fetch", |_ctx, _input| async { Ok(StepOutput::new("raw")) })
///     .add_func("Store", |_ctx, input| async move { Ok(StepOutput::new(input.data)) })
///     .build()
///     .unwrap();
///
/// assert_eq!(workflow.steps().len(), 2);
/// assert_eq!(workflow.steps()[0].id(), "fetch");
/// ```
pub struct WorkflowBuilder {
    id: Option<String>,
    name: String,
    version: String,
    description: String,
    steps: Vec<Arc<dyn Step>>,
    timeout: Option<Duration>,
    retry_policy: RetryPolicy,
    metadata: HashMap<String, Value>,
}

impl WorkflowBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            version: "1.0.0".to_string(),
            description: String::new(),
            steps: Vec::new(),
            timeout: None,
            retry_policy: RetryPolicy::default(),
            metadata: HashMap::new(),
        }
    }

    /// Sets the workflow ID. Defaults to a slug of the name plus a random
    /// suffix.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Bounds the whole run.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the policy for base steps that declare none of their own.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Appends any step.
    pub fn add(mut self, step: impl Step + 'static) -> Self {
        self.steps.push(Arc::new(step));
        self
    }

    /// Appends an already shared step.
    pub fn add_shared(mut self, step: Arc<dyn Step>) -> Self {
        self.steps.push(step);
        self
    }

    /// Appends a [`BaseStep`] running `f`.
    pub fn add_func<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(StepContext, StepInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<StepOutput, WorkflowError>> + Send + 'static,
    {
        let name = name.into();
        self.add(BaseStep::new(slug(&name), name, f))
    }

    /// Appends several steps in order.
    pub fn sequential(mut self, steps: impl IntoIterator<Item = Arc<dyn Step>>) -> Self {
        self.steps.extend(steps);
        self
    }

    /// Appends a [`ParallelStep`] over `steps` with default settings.
    pub fn parallel(
        self,
        name: impl Into<String>,
        steps: impl IntoIterator<Item = Arc<dyn Step>>,
    ) -> Self {
        let name = name.into();
        let parallel = steps
            .into_iter()
            .fold(ParallelStep::new(slug(&name), name), ParallelStep::add_shared);
        self.add(parallel)
    }

    /// Appends a [`ParallelStep`] over named functions.
    pub fn parallel_funcs<N>(
        self,
        name: impl Into<String>,
        funcs: impl IntoIterator<Item = (N, StepFn)>,
    ) -> Self
    where
        N: Into<String>,
    {
        let name = name.into();
        let parallel = funcs.into_iter().fold(
            ParallelStep::new(slug(&name), name),
            |parallel, (func_name, func)| {
                let func_name = func_name.into();
                parallel.add(BaseStep::from_fn(slug(&func_name), func_name, func))
            },
        );
        self.add(parallel)
    }

    /// Appends a [`ConditionalStep`] routing on the branch name returned by
    /// `condition`.
    pub fn conditional<F, K>(
        self,
        name: impl Into<String>,
        condition: F,
        branches: impl IntoIterator<Item = (K, Arc<dyn Step>)>,
    ) -> Self
    where
        F: Fn(&StepInput) -> String + Send + Sync + 'static,
        K: Into<String>,
    {
        let name = name.into();
        let conditional = branches.into_iter().fold(
            ConditionalStep::new(slug(&name), name, condition),
            |step, (branch, target)| step.branch_shared(branch, target),
        );
        self.add(conditional)
    }

    /// Appends a [`LoopStep`] collecting every iteration's data.
    pub fn loop_step<F>(
        self,
        name: impl Into<String>,
        body: impl Step + 'static,
        condition: F,
        max_iterations: usize,
    ) -> Self
    where
        F: Fn(&StepInput, usize) -> LoopControl + Send + Sync + 'static,
    {
        let name = name.into();
        self.add(LoopStep::new(slug(&name), name, body, condition).max_iterations(max_iterations))
    }

    /// Appends a [`WaitStep`] sleeping for `duration`.
    pub fn wait(self, name: impl Into<String>, duration: Duration) -> Self {
        let name = name.into();
        self.add(WaitStep::new(slug(&name), name).for_duration(duration))
    }

    /// Appends a [`WaitStep`] polling `predicate` every `poll_interval`.
    pub fn wait_until<F>(
        self,
        name: impl Into<String>,
        predicate: F,
        poll_interval: Duration,
    ) -> Self
    where
        F: Fn(&StepInput) -> bool + Send + Sync + 'static,
    {
        let name = name.into();
        self.add(
            WaitStep::new(slug(&name), name)
                .until(predicate)
                .poll_interval(poll_interval),
        )
    }

    /// Appends a [`SubWorkflowStep`] running `workflow` through `runner`.
    pub fn sub_workflow(
        self,
        name: impl Into<String>,
        workflow: Arc<Workflow>,
        runner: Arc<dyn WorkflowRunner>,
    ) -> Self {
        let name = name.into();
        self.add(SubWorkflowStep::new(slug(&name), name, workflow, runner))
    }

    /// Builds and validates the workflow.
    pub fn build(self) -> Result<Workflow, WorkflowError> {
        let id = self.id.unwrap_or_else(|| generated_id(&self.name));
        let workflow = Workflow {
            id,
            name: self.name,
            version: self.version,
            description: self.description,
            steps: self.steps,
            timeout: self.timeout,
            retry_policy: self.retry_policy,
            metadata: self.metadata,
        };
        workflow.validate()?;
        Ok(workflow)
    }

    /// Builds the workflow, panicking if it is invalid.
    ///
    /// Meant for workflows assembled once at startup.
    ///
    /// # Panics
    ///
    /// Panics with the validation error.
    #[allow(clippy::panic)]
    pub fn must_build(self) -> Workflow {
        match self.build() {
            Ok(workflow) => workflow,
            Err(e) => panic!("invalid workflow: {e}"),
        }
    }
}

/// Lowercases `name` and joins its alphanumeric runs with underscores.
pub(crate) fn slug(name: &str) -> String {
    name.split(|c: char| !c.is_alphanumeric())
        .filter(|part| !part.is_empty())
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join("_")
}

fn generated_id(name: &str) -> String {
    // the tail of a v7 UUID is random; the head is a timestamp
    let uuid = Uuid::now_v7().simple().to_string();
    let base = slug(name);
    let base = if base.is_empty() { "workflow" } else { base.as_str() };
    format!("{base}-{}", &uuid[uuid.len() - 8..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::step_fn;

    fn echo(id: &str) -> Arc<dyn Step> {
        Arc::new(BaseStep::new(id, id, |_ctx, input| async move {
            Ok(StepOutput::new(input.data))
        }))
    }

    #[test]
    fn test_slug() {
        assert_eq!(slug("Load CSV"), "load_csv");
        assert_eq!(slug("  fetch--data! "), "fetch_data");
        assert_eq!(slug("!!!"), "");
    }

    #[test]
    fn test_generated_id() {
        let workflow = Workflow::builder("Nightly Sync")
            .sequential([echo("a")])
            .build()
            .unwrap();
        assert!(workflow.id().starts_with("nightly_sync-"));
        assert_eq!(workflow.id().len(), "nightly_sync-".len() + 8);
    }

    #[test]
    fn test_builder_adds_every_step_kind() {
        let inner = Arc::new(
            Workflow::builder("inner")
                .sequential([echo("x")])
                .build()
                .unwrap(),
        );
        let runner: Arc<dyn WorkflowRunner> = Arc::new(crate::Executor::new());

        let workflow = Workflow::builder("all")
            .id("all")
            .description("every step type")
            .metadata("owner", "data-team")
            .add_func("Start", |_ctx, input| async move { Ok(StepOutput::new(input.data)) })
            .sequential([echo("one"), echo("two")])
            .parallel("Fan Out", [echo("p1"), echo("p2")])
            .parallel_funcs(
                "Funcs",
                [("f1", step_fn(|_ctx, _input| async { Ok(StepOutput::new(1)) }))],
            )
            .conditional("Route", |_input| "a".to_string(), [("a", echo("branch_a"))])
            .loop_step(
                "Repeat",
                BaseStep::new("body", "Body", |_ctx, _input| async { Ok(StepOutput::default()) }),
                |_input, iteration| LoopControl::from(iteration < 2),
                5,
            )
            .wait("Pause", Duration::from_millis(1))
            .wait_until("Ready", |_input| true, Duration::from_millis(1))
            .sub_workflow("Nested", inner, runner)
            .build()
            .unwrap();

        let ids: Vec<_> = workflow.steps().iter().map(|s| s.id().to_string()).collect();
        assert_eq!(
            ids,
            [
                "start", "one", "two", "fan_out", "funcs", "route", "repeat", "pause", "ready",
                "nested"
            ]
        );
        assert_eq!(workflow.metadata().get("owner"), Some(&Value::from("data-team")));
    }

    #[test]
    fn test_build_rejects_empty_workflow() {
        let err = Workflow::builder("empty").build().unwrap_err();
        assert!(matches!(err, WorkflowError::Validation(_)));
    }

    #[test]
    fn test_build_rejects_duplicate_ids() {
        let err = Workflow::builder("dup")
            .sequential([echo("same"), echo("same")])
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("duplicate step id 'same'"));
    }

    #[test]
    fn test_build_rejects_invalid_step() {
        let err = Workflow::builder("bad")
            .add(BaseStep::unbound("orphan", "Orphan"))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("orphan"));
    }

    #[test]
    #[should_panic(expected = "invalid workflow")]
    fn test_must_build_panics_on_invalid() {
        Workflow::builder("empty").must_build();
    }

    #[test]
    fn test_output_from_execution() {
        let input = WorkflowInput::new("in").with_variable("k", "v");
        let mut execution = WorkflowExecution::new("wf", &input);
        execution.output = Value::from("out");
        let output = WorkflowOutput::from(&execution);
        assert_eq!(output.execution_id, execution.id);
        assert_eq!(output.data, "out");
        assert_eq!(output.variables.get("k"), Some(&Value::from("v")));
    }
}
