use crate::context::StepContext;
use crate::error::WorkflowError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Run-scoped key/value scratch space shared between steps.
pub type Variables = HashMap<String, Value>;

/// The data handed to a step when it executes.
///
/// `data` is the output of the previous step (or the workflow input for the
/// first step). `variables` accumulates every variable merged by earlier
/// steps of the same run, and `previous_outputs` holds each earlier step's
/// output data keyed by step ID.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepInput {
    pub data: Value,
    #[serde(default)]
    pub variables: Variables,
    #[serde(default)]
    pub previous_outputs: HashMap<String, Value>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl StepInput {
    /// Creates an input carrying only `data`.
    pub fn new(data: impl Into<Value>) -> Self {
        Self {
            data: data.into(),
            ..Self::default()
        }
    }

    /// Adds a variable.
    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    /// Returns a variable by key.
    pub fn variable(&self, key: &str) -> Option<&Value> {
        self.variables.get(key)
    }

    /// Returns the output data of an earlier step.
    pub fn previous_output(&self, step_id: &str) -> Option<&Value> {
        self.previous_outputs.get(step_id)
    }
}

/// The result a step hands back to the executor.
///
/// `variables` are merged into the running context after the step succeeds.
/// `next_step_id` is only set by conditional steps whose branch name has no
/// registered step, so that callers can route on it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepOutput {
    pub data: Value,
    #[serde(default)]
    pub variables: Variables,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_step_id: Option<String>,
}

impl StepOutput {
    /// Creates an output carrying only `data`.
    pub fn new(data: impl Into<Value>) -> Self {
        Self {
            data: data.into(),
            ..Self::default()
        }
    }

    /// Adds a variable to merge into the running context.
    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    /// Adds a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// The behaviour a step implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Base,
    Parallel,
    Conditional,
    Loop,
    Wait,
    SubWorkflow,
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepType::Base => "base",
            StepType::Parallel => "parallel",
            StepType::Conditional => "conditional",
            StepType::Loop => "loop",
            StepType::Wait => "wait",
            StepType::SubWorkflow => "sub_workflow",
        };
        f.write_str(s)
    }
}

/// Exponential-backoff retry configuration.
///
/// The delay before retry `attempt` (0-indexed) is
/// `initial_interval * multiplier^attempt`, capped at `max_interval`.
///
/// # Examples
///
/// ```
/// use taskweave::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy {
///     max_retries: 3,
///     initial_interval: Duration::from_millis(100),
///     max_interval: Duration::from_millis(500),
///     multiplier: 2.0,
/// };
///
/// assert_eq!(policy.backoff(0), Duration::from_millis(100));
/// assert_eq!(policy.backoff(1), Duration::from_millis(200));
/// assert_eq!(policy.backoff(2), Duration::from_millis(400));
/// assert_eq!(policy.backoff(3), Duration::from_millis(500));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_interval: Duration,
    /// Upper bound for any delay
    pub max_interval: Duration,
    /// Growth factor applied per attempt
    pub multiplier: f64,
}

/// Error returned when [`RetryPolicy`] configuration is invalid.
///
/// # Examples
///
/// ```
/// use taskweave::RetryPolicy;
/// use std::time::Duration;
///
/// // Invalid: multiplier below 1
/// let result = RetryPolicy::exponential_backoff(
///     3,
///     Duration::from_millis(100),
///     Duration::from_secs(10),
///     0.5,
/// );
/// assert!(result.is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicyError(pub &'static str);

impl fmt::Display for RetryPolicyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for RetryPolicyError {}

impl Default for RetryPolicy {
    /// No retries; the intervals only matter once `max_retries` is raised.
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self::default()
    }

    /// Retries `max_retries` times with a constant `delay`.
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            initial_interval: delay,
            max_interval: delay,
            multiplier: 1.0,
        }
    }

    /// Exponential backoff doubling from `initial_interval`, capped at 60s.
    pub fn exponential(max_retries: u32, initial_interval: Duration) -> Self {
        Self {
            max_retries,
            initial_interval,
            max_interval: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }

    /// Creates an exponential backoff policy with custom settings.
    ///
    /// # Errors
    ///
    /// Returns [`RetryPolicyError`] if:
    /// - `multiplier` is below 1 or not finite
    /// - `max_interval` is less than `initial_interval`
    pub fn exponential_backoff(
        max_retries: u32,
        initial_interval: Duration,
        max_interval: Duration,
        multiplier: f64,
    ) -> Result<Self, RetryPolicyError> {
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(RetryPolicyError("multiplier must be a finite value >= 1"));
        }
        if max_interval < initial_interval {
            return Err(RetryPolicyError("max_interval must be >= initial_interval"));
        }
        Ok(Self {
            max_retries,
            initial_interval,
            max_interval,
            multiplier,
        })
    }

    /// Returns the delay to wait before retry `attempt` (0-indexed).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let nanos = self.initial_interval.as_nanos() as f64 * self.multiplier.powi(exponent);
        let cap = self.max_interval.as_nanos() as f64;
        if !nanos.is_finite() || nanos >= cap {
            return self.max_interval;
        }
        Duration::from_nanos(nanos.max(0.0) as u64)
    }
}

/// A unit of work in a workflow.
///
/// Implementations receive the run's [`StepContext`] explicitly and must
/// stop early once [`StepContext::done`] resolves. Composite steps
/// (parallel, conditional, loop, sub-workflow) implement this trait too,
/// so any step can nest inside any other.
///
/// # Examples
///
/// ```
/// use taskweave::prelude::*;
/// use taskweave::StepType;
/// use async_trait::async_trait;
///
/// struct Greet;
///
/// #[async_trait]
/// impl Step for Greet {
///     fn id(&self) -> &str { "greet" }
///     fn name(&self) -> &str { "Greet" }
///     fn step_type(&self) -> StepType { StepType::Base }
///
///     async fn execute(&self, ctx: &StepContext, input: StepInput) -> Result<StepOutput, WorkflowError> {
///         ctx.check()?;
///         let who = input.data.as_str().unwrap_or("world");
///         Ok(StepOutput::new(format!("hello, {who}")))
///     }
///
///     fn validate(&self) -> Result<(), WorkflowError> { Ok(()) }
/// }
/// ```
#[async_trait]
pub trait Step: Send + Sync {
    /// Unique ID of the step within its workflow.
    fn id(&self) -> &str;

    /// Human-readable name.
    fn name(&self) -> &str;

    /// The behaviour this step implements.
    fn step_type(&self) -> StepType;

    /// Runs the step.
    async fn execute(&self, ctx: &StepContext, input: StepInput)
        -> Result<StepOutput, WorkflowError>;

    /// Checks the step's configuration. Called by the workflow builder.
    fn validate(&self) -> Result<(), WorkflowError>;

    /// IDs of steps that must have a result before this one runs.
    fn dependencies(&self) -> &[String] {
        &[]
    }
}

impl fmt::Debug for dyn Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("type", &self.step_type())
            .finish()
    }
}

/// Fails unless both `id` and `name` are non-empty.
pub(crate) fn validate_identity(id: &str, name: &str, kind: StepType) -> Result<(), WorkflowError> {
    if id.trim().is_empty() {
        return Err(WorkflowError::Validation(format!(
            "{kind} step '{name}' has an empty id"
        )));
    }
    if name.trim().is_empty() {
        return Err(WorkflowError::Validation(format!(
            "{kind} step '{id}' has an empty name"
        )));
    }
    Ok(())
}
