//! Execution records: the persisted state of one workflow run.

use crate::error::WorkflowError;
use crate::step::Variables;
use crate::workflow::WorkflowInput;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Lifecycle state of a workflow execution.
///
/// ```text
/// Pending -> Running <-> Paused
/// Running | Paused -> Completed | Failed | Cancelled
/// ```
///
/// Completed, Failed and Cancelled are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    /// Returns `true` for states no execution ever leaves.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }

    /// Returns `true` if the state machine allows moving to `next`.
    pub fn can_transition_to(self, next: WorkflowStatus) -> bool {
        use WorkflowStatus::*;
        match (self, next) {
            (Pending, Running | Failed | Cancelled) => true,
            (Running, Paused | Completed | Failed | Cancelled) => true,
            (Paused, Running | Failed | Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Paused => "paused",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// State of a single step within an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// Progress bookkeeping carried by an execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    #[serde(default)]
    pub variables: Variables,
    #[serde(default)]
    pub current_step_id: Option<String>,
    #[serde(default)]
    pub completed_steps: Vec<String>,
    #[serde(default)]
    pub pending_steps: Vec<String>,
    #[serde(default)]
    pub skipped_steps: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

/// Outcome of one top-level step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub status: StepStatus,
    #[serde(default)]
    pub output: Value,
    #[serde(default)]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(with = "duration_nanos")]
    pub duration: Duration,
    #[serde(default)]
    pub retry_count: u32,
}

impl StepResult {
    /// A result for a step that has just started.
    pub fn started(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Running,
            output: Value::Null,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
            duration: Duration::ZERO,
            retry_count: 0,
        }
    }

    pub(crate) fn finish(&mut self, status: StepStatus, elapsed: Duration) {
        self.status = status;
        self.completed_at = Some(Utc::now());
        self.duration = elapsed;
    }
}

/// The record of one workflow run.
///
/// Only the executor task that owns the run mutates it; everything else
/// reads clones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: String,
    pub workflow_id: String,
    pub status: WorkflowStatus,
    /// The [`WorkflowInput`] the run was started with, as JSON.
    #[serde(default)]
    pub input: Value,
    /// Data produced by the last step once the run completes.
    #[serde(default)]
    pub output: Value,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub context: ExecutionContext,
    #[serde(default)]
    pub step_results: HashMap<String, StepResult>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub paused_at: Option<DateTime<Utc>>,
    #[serde(with = "duration_nanos", default)]
    pub duration: Duration,
}

impl WorkflowExecution {
    /// Creates a pending execution with a fresh time-ordered ID.
    pub fn new(workflow_id: impl Into<String>, input: &WorkflowInput) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            workflow_id: workflow_id.into(),
            status: WorkflowStatus::Pending,
            input: serde_json::to_value(input).unwrap_or(Value::Null),
            output: Value::Null,
            error: None,
            context: ExecutionContext {
                variables: input.variables.clone(),
                metadata: input.metadata.clone(),
                ..ExecutionContext::default()
            },
            step_results: HashMap::new(),
            started_at: Utc::now(),
            completed_at: None,
            paused_at: None,
            duration: Duration::ZERO,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Moves the execution to `next`, stamping `completed_at` and
    /// `duration` for terminal states and `paused_at` for Paused.
    ///
    /// # Errors
    ///
    /// Returns [`WorkflowError::InvalidState`] if the state machine does
    /// not allow the move.
    pub fn transition(
        &mut self,
        next: WorkflowStatus,
        operation: &'static str,
    ) -> Result<(), WorkflowError> {
        if !self.status.can_transition_to(next) {
            return Err(WorkflowError::InvalidState {
                execution_id: self.id.clone(),
                status: self.status,
                operation,
            });
        }
        self.status = next;
        let now = Utc::now();
        match next {
            WorkflowStatus::Paused => self.paused_at = Some(now),
            WorkflowStatus::Running => self.paused_at = None,
            status if status.is_terminal() => {
                self.completed_at = Some(now);
                self.duration = (now - self.started_at).to_std().unwrap_or_default();
            }
            _ => {}
        }
        Ok(())
    }

    /// Decodes the [`WorkflowInput`] the run was started with.
    pub fn workflow_input(&self) -> Result<WorkflowInput, WorkflowError> {
        if self.input.is_null() {
            return Ok(WorkflowInput::default());
        }
        Ok(serde_json::from_value(self.input.clone())?)
    }
}

/// Serializes a [`Duration`] as integer nanoseconds.
pub(crate) mod duration_nanos {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        serializer.serialize_u64(nanos)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_nanos)
    }
}
