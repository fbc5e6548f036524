use crate::error::WorkflowError;
use crate::execution::WorkflowExecution;
use crate::step::{StepInput, StepOutput};
use crate::workflow::{Workflow, WorkflowInput};

/// Synchronous lifecycle callbacks.
///
/// Every method defaults to doing nothing. An error from [`on_start`]
/// aborts the run before it is spawned and is returned to the caller as
/// [`WorkflowError::HookError`]. Errors from the other hooks are logged and
/// otherwise ignored.
///
/// [`on_start`]: WorkflowHooks::on_start
///
/// # Examples
///
/// ```
/// use taskweave::prelude::*;
///
/// struct RejectEmpty;
///
/// impl WorkflowHooks for RejectEmpty {
///     fn on_start(&self, _workflow: &Workflow, input: &WorkflowInput) -> Result<(), WorkflowError> {
///         if input.data.is_null() {
///             return Err(WorkflowError::Validation("input is empty".into()));
///         }
///         Ok(())
///     }
/// }
/// ```
pub trait WorkflowHooks: Send + Sync {
    /// Called before the execution task is spawned.
    fn on_start(&self, _workflow: &Workflow, _input: &WorkflowInput) -> Result<(), WorkflowError> {
        Ok(())
    }

    /// Called once an execution completes.
    fn on_complete(&self, _execution: &WorkflowExecution) -> Result<(), WorkflowError> {
        Ok(())
    }

    /// Called once an execution fails or is cancelled.
    fn on_error(
        &self,
        _execution: &WorkflowExecution,
        _error: &WorkflowError,
    ) -> Result<(), WorkflowError> {
        Ok(())
    }

    fn on_step_start(&self, _step_id: &str, _input: &StepInput) -> Result<(), WorkflowError> {
        Ok(())
    }

    fn on_step_complete(&self, _step_id: &str, _output: &StepOutput) -> Result<(), WorkflowError> {
        Ok(())
    }

    fn on_step_error(&self, _step_id: &str, _error: &WorkflowError) -> Result<(), WorkflowError> {
        Ok(())
    }
}

/// Hooks that do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl WorkflowHooks for NoopHooks {}
