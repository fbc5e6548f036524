use super::WorkflowStore;
use crate::error::WorkflowError;
use crate::execution::{ExecutionContext, StepResult, WorkflowExecution, WorkflowStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

/// A point-in-time copy of an execution's progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSnapshot {
    pub execution_id: String,
    pub workflow_id: String,
    pub status: WorkflowStatus,
    pub context: ExecutionContext,
    pub step_results: HashMap<String, StepResult>,
    pub input: Value,
    pub created_at: DateTime<Utc>,
}

impl ExecutionSnapshot {
    pub fn from_execution(execution: &WorkflowExecution) -> Self {
        Self {
            execution_id: execution.id.clone(),
            workflow_id: execution.workflow_id.clone(),
            status: execution.status,
            context: execution.context.clone(),
            step_results: execution.step_results.clone(),
            input: execution.input.clone(),
            created_at: Utc::now(),
        }
    }

    /// Rebuilds an execution record from the snapshot. Output, error and
    /// timing fields start empty; `started_at` is the snapshot time.
    pub fn to_execution(&self) -> WorkflowExecution {
        WorkflowExecution {
            id: self.execution_id.clone(),
            workflow_id: self.workflow_id.clone(),
            status: self.status,
            input: self.input.clone(),
            output: Value::Null,
            error: None,
            context: self.context.clone(),
            step_results: self.step_results.clone(),
            started_at: self.created_at,
            completed_at: None,
            paused_at: None,
            duration: Duration::ZERO,
        }
    }

    pub fn to_json(&self) -> Result<String, WorkflowError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, WorkflowError> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Captures the stored execution `execution_id`.
pub async fn create_snapshot(
    store: &dyn WorkflowStore,
    execution_id: &str,
) -> Result<ExecutionSnapshot, WorkflowError> {
    let execution = store.get_execution(execution_id).await?;
    Ok(ExecutionSnapshot::from_execution(&execution))
}

/// Writes the execution described by `snapshot` back into `store` and
/// returns it.
pub async fn restore_from_snapshot(
    store: &dyn WorkflowStore,
    snapshot: &ExecutionSnapshot,
) -> Result<WorkflowExecution, WorkflowError> {
    let execution = snapshot.to_execution();
    store.save_execution(&execution).await?;
    Ok(execution)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::StepStatus;
    use crate::store::MemoryStore;
    use crate::workflow::WorkflowInput;

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let source = MemoryStore::new();
        let mut execution =
            WorkflowExecution::new("etl", &WorkflowInput::new("apple, banana"));
        execution.status = WorkflowStatus::Paused;
        execution.context.completed_steps.push("extract".to_string());
        let mut result = StepResult::started("extract");
        result.finish(StepStatus::Completed, Duration::from_millis(5));
        execution.step_results.insert("extract".to_string(), result);
        source.save_execution(&execution).await.unwrap();

        let snapshot = create_snapshot(&source, &execution.id).await.unwrap();
        let json = snapshot.to_json().unwrap();
        let decoded = ExecutionSnapshot::from_json(&json).unwrap();
        assert_eq!(decoded, snapshot);

        let target = MemoryStore::new();
        let restored = restore_from_snapshot(&target, &decoded).await.unwrap();
        assert_eq!(restored.id, execution.id);
        assert_eq!(restored.workflow_id, "etl");
        assert_eq!(restored.status, WorkflowStatus::Paused);
        assert_eq!(restored.step_results.len(), 1);
        assert_eq!(restored.input, execution.input);
        assert_eq!(restored.context, execution.context);
        assert_eq!(target.get_execution(&execution.id).await.unwrap(), restored);
    }

    #[tokio::test]
    async fn test_snapshot_of_missing_execution() {
        let store = MemoryStore::new();
        assert!(matches!(
            create_snapshot(&store, "missing").await,
            Err(WorkflowError::ExecutionNotFound(_))
        ));
    }
}
