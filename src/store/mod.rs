//! Persistence of workflow definitions and execution records.
//!
//! Two stores ship with the crate: [`MemoryStore`] keeps everything in
//! process, [`FileStore`] writes each execution record to its own JSON file
//! so that runs survive a restart and can be picked up by
//! [`ExecutionRecovery`](crate::ExecutionRecovery).

mod file;
mod memory;
mod snapshot;

pub use file::FileStore;
pub use memory::MemoryStore;
pub use snapshot::{create_snapshot, restore_from_snapshot, ExecutionSnapshot};

use crate::error::WorkflowError;
use crate::execution::{WorkflowExecution, WorkflowStatus};
use crate::workflow::Workflow;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;

/// Storage for workflow definitions and execution records.
///
/// Workflow definitions hold step closures and are therefore kept as
/// shared [`Workflow`] handles; execution records are plain data.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Inserts or replaces a workflow definition.
    async fn save_workflow(&self, workflow: Arc<Workflow>) -> Result<(), WorkflowError>;

    /// Returns [`WorkflowError::WorkflowNotFound`] if there is none.
    async fn get_workflow(&self, workflow_id: &str) -> Result<Arc<Workflow>, WorkflowError>;

    async fn list_workflows(&self) -> Result<Vec<Arc<Workflow>>, WorkflowError>;

    async fn delete_workflow(&self, workflow_id: &str) -> Result<(), WorkflowError>;

    /// Inserts or replaces an execution record.
    async fn save_execution(&self, execution: &WorkflowExecution) -> Result<(), WorkflowError>;

    /// Returns [`WorkflowError::ExecutionNotFound`] if there is none.
    async fn get_execution(&self, execution_id: &str) -> Result<WorkflowExecution, WorkflowError>;

    /// Lists executions, oldest first, optionally only those of one
    /// workflow.
    async fn list_executions(
        &self,
        workflow_id: Option<&str>,
    ) -> Result<Vec<WorkflowExecution>, WorkflowError>;

    async fn delete_execution(&self, execution_id: &str) -> Result<(), WorkflowError>;

    /// Overwrites the stored status, stamping `completed_at` for terminal
    /// states and `paused_at` for Paused.
    async fn update_execution_status(
        &self,
        execution_id: &str,
        status: WorkflowStatus,
    ) -> Result<(), WorkflowError> {
        let mut execution = self.get_execution(execution_id).await?;
        apply_status(&mut execution, status);
        self.save_execution(&execution).await
    }

    /// Executions that were running or paused when last saved.
    async fn get_pending_executions(&self) -> Result<Vec<WorkflowExecution>, WorkflowError> {
        Ok(self
            .list_executions(None)
            .await?
            .into_iter()
            .filter(|e| matches!(e.status, WorkflowStatus::Running | WorkflowStatus::Paused))
            .collect())
    }
}

/// Sets `status` without consulting the state machine.
pub(crate) fn apply_status(execution: &mut WorkflowExecution, status: WorkflowStatus) {
    let now = Utc::now();
    execution.status = status;
    if status == WorkflowStatus::Paused {
        execution.paused_at = Some(now);
    }
    if status.is_terminal() {
        execution.completed_at = Some(now);
        execution.duration = (now - execution.started_at).to_std().unwrap_or_default();
    }
}

fn sort_oldest_first(executions: &mut [WorkflowExecution]) {
    executions.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
}
