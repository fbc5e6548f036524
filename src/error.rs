use crate::step::StepOutput;
use thiserror::Error;

/// The type of lifecycle hook that failed.
///
/// Used in [`WorkflowError::HookError`] to identify which hook caused the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookType {
    /// Called before an execution task is spawned.
    OnStart,
    /// Called when an execution completes successfully.
    OnComplete,
    /// Called when an execution fails or is cancelled.
    OnError,
    /// Called before each top-level step runs.
    OnStepStart,
    /// Called after a top-level step succeeds.
    OnStepComplete,
    /// Called after a top-level step fails.
    OnStepError,
}

impl std::fmt::Display for HookType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HookType::OnStart => write!(f, "on_start"),
            HookType::OnComplete => write!(f, "on_complete"),
            HookType::OnError => write!(f, "on_error"),
            HookType::OnStepStart => write!(f, "on_step_start"),
            HookType::OnStepComplete => write!(f, "on_step_complete"),
            HookType::OnStepError => write!(f, "on_step_error"),
        }
    }
}

/// Errors that can occur while building or running a workflow.
///
/// Step functions return this type too: [`WorkflowError::step`] is the
/// shortcut for a plain failure message.
///
/// # Non-Exhaustive
///
/// This enum is marked `#[non_exhaustive]` to allow adding new variants
/// in future versions without breaking downstream code. When matching
/// on this error, always include a wildcard pattern:
///
/// ```
/// use taskweave::WorkflowError;
///
/// fn handle_error(error: WorkflowError) {
///     match error {
///         WorkflowError::StepFailed { step_id, source } => {
///             eprintln!("Step {} failed: {}", step_id, source);
///         }
///         WorkflowError::Cancelled => eprintln!("cancelled"),
///         WorkflowError::Validation(msg) => {
///             eprintln!("Invalid workflow: {}", msg);
///         }
///         _ => eprintln!("Unknown error: {}", error),
///     }
/// }
/// ```
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum WorkflowError {
    /// A step function reported a failure.
    #[error("{0}")]
    Step(String),

    /// A top-level step failed and stopped the execution.
    #[error("step '{step_id}' failed: {source}")]
    StepFailed {
        /// ID of the step that failed
        step_id: String,
        /// The underlying cause
        #[source]
        source: Box<WorkflowError>,
    },

    /// At least one sub-step of a parallel step failed.
    ///
    /// `partial` holds the aggregated output of the sub-steps that
    /// succeeded, unless the parallel step runs in fail-fast mode.
    #[error("parallel sub-step '{step_id}' failed: {source}")]
    ParallelFailed {
        /// ID of the first sub-step observed failing
        step_id: String,
        /// The sub-step's error
        #[source]
        source: Box<WorkflowError>,
        /// Aggregated output of the successful sub-steps
        partial: Option<Box<StepOutput>>,
    },

    /// A declared prerequisite step has no result yet.
    #[error("step '{step_id}' depends on '{dependency}', which has not run")]
    DependencyMissing {
        /// The step that declared the dependency
        step_id: String,
        /// The prerequisite step ID
        dependency: String,
    },

    /// The execution's context was cancelled.
    #[error("workflow cancelled")]
    Cancelled,

    /// A step or workflow deadline expired.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The workflow or one of its steps is misconfigured.
    #[error("invalid workflow configuration: {0}")]
    Validation(String),

    /// A lifecycle hook failed.
    #[error("hook '{hook_type}' failed: {details}")]
    HookError {
        /// Which hook failed
        hook_type: HookType,
        /// Details about the failure
        details: String,
    },

    /// No execution is registered under the given ID.
    #[error("execution not found: {0}")]
    ExecutionNotFound(String),

    /// No workflow definition is registered under the given ID.
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    /// The execution is not in a state that allows the operation.
    #[error("cannot {operation} execution '{execution_id}' in status {status}")]
    InvalidState {
        /// The execution ID
        execution_id: String,
        /// The status the execution was in
        status: crate::execution::WorkflowStatus,
        /// The rejected operation (e.g. "pause")
        operation: &'static str,
    },

    /// A pause request is already pending for the execution.
    #[error("execution '{0}' is already pausing")]
    AlreadyPausing(String),

    /// `wait_for_completion` gave up before the execution finished.
    #[error("timed out waiting for execution '{0}'")]
    WaitTimeout(String),

    /// The executor is running as many executions as it allows.
    #[error("concurrent execution limit reached")]
    ConcurrencyLimitReached,

    /// A workflow store operation failed.
    #[error("store error: {0}")]
    Store(String),

    /// Serializing or deserializing an execution record failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem access failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkflowError {
    /// Creates a [`WorkflowError::Step`] from any displayable message.
    pub fn step(message: impl std::fmt::Display) -> Self {
        WorkflowError::Step(message.to_string())
    }

    /// Returns `true` if the error, or the cause it wraps, is a
    /// cancellation or deadline expiry.
    pub fn is_cancellation(&self) -> bool {
        match self {
            WorkflowError::Cancelled | WorkflowError::DeadlineExceeded => true,
            WorkflowError::StepFailed { source, .. }
            | WorkflowError::ParallelFailed { source, .. } => source.is_cancellation(),
            _ => false,
        }
    }

    /// Returns the partial output carried by a parallel failure, looking
    /// through [`WorkflowError::StepFailed`] wrappers.
    pub fn partial_output(&self) -> Option<&StepOutput> {
        match self {
            WorkflowError::ParallelFailed { partial, .. } => partial.as_deref(),
            WorkflowError::StepFailed { source, .. } => source.partial_output(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = WorkflowError::StepFailed {
            step_id: "extract".to_string(),
            source: Box::new(WorkflowError::step("connection refused")),
        };
        assert_eq!(
            error.to_string(),
            "step 'extract' failed: connection refused"
        );

        let error = WorkflowError::DependencyMissing {
            step_id: "load".to_string(),
            dependency: "transform".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "step 'load' depends on 'transform', which has not run"
        );
    }

    #[test]
    fn test_hook_error_display() {
        let error = WorkflowError::HookError {
            hook_type: HookType::OnStart,
            details: "quota exhausted".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "hook 'on_start' failed: quota exhausted"
        );
    }

    #[test]
    fn test_hook_type_display() {
        assert_eq!(HookType::OnStart.to_string(), "on_start");
        assert_eq!(HookType::OnStepError.to_string(), "on_step_error");
    }

    #[test]
    fn test_is_cancellation_looks_through_wrappers() {
        let error = WorkflowError::StepFailed {
            step_id: "wait".to_string(),
            source: Box::new(WorkflowError::Cancelled),
        };
        assert!(error.is_cancellation());
        assert!(WorkflowError::DeadlineExceeded.is_cancellation());
        assert!(!WorkflowError::step("boom").is_cancellation());
    }

    #[test]
    fn test_partial_output_through_step_failed() {
        let partial = StepOutput::new(serde_json::json!({"ok": 1}));
        let error = WorkflowError::StepFailed {
            step_id: "fanout".to_string(),
            source: Box::new(WorkflowError::ParallelFailed {
                step_id: "bad".to_string(),
                source: Box::new(WorkflowError::step("boom")),
                partial: Some(Box::new(partial)),
            }),
        };
        let output = error.partial_output().expect("partial output");
        assert_eq!(output.data, serde_json::json!({"ok": 1}));
    }
}
