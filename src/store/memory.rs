use super::{sort_oldest_first, WorkflowStore};
use crate::error::WorkflowError;
use crate::execution::WorkflowExecution;
use crate::workflow::Workflow;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;

/// An in-process [`WorkflowStore`].
///
/// Execution records are stored as JSON values, so every save and every
/// read hands out an independent deep copy.
#[derive(Debug, Default)]
pub struct MemoryStore {
    workflows: DashMap<String, Arc<Workflow>>,
    executions: DashMap<String, Value>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored execution records.
    pub fn execution_count(&self) -> usize {
        self.executions.len()
    }
}

#[async_trait]
impl WorkflowStore for MemoryStore {
    async fn save_workflow(&self, workflow: Arc<Workflow>) -> Result<(), WorkflowError> {
        self.workflows.insert(workflow.id().to_string(), workflow);
        Ok(())
    }

    async fn get_workflow(&self, workflow_id: &str) -> Result<Arc<Workflow>, WorkflowError> {
        self.workflows
            .get(workflow_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| WorkflowError::WorkflowNotFound(workflow_id.to_string()))
    }

    async fn list_workflows(&self) -> Result<Vec<Arc<Workflow>>, WorkflowError> {
        let mut workflows: Vec<_> = self
            .workflows
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        workflows.sort_by(|a, b| a.id().cmp(b.id()));
        Ok(workflows)
    }

    async fn delete_workflow(&self, workflow_id: &str) -> Result<(), WorkflowError> {
        self.workflows
            .remove(workflow_id)
            .map(|_| ())
            .ok_or_else(|| WorkflowError::WorkflowNotFound(workflow_id.to_string()))
    }

    async fn save_execution(&self, execution: &WorkflowExecution) -> Result<(), WorkflowError> {
        let value = serde_json::to_value(execution)?;
        self.executions.insert(execution.id.clone(), value);
        Ok(())
    }

    async fn get_execution(&self, execution_id: &str) -> Result<WorkflowExecution, WorkflowError> {
        let value = self
            .executions
            .get(execution_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| WorkflowError::ExecutionNotFound(execution_id.to_string()))?;
        Ok(serde_json::from_value(value)?)
    }

    async fn list_executions(
        &self,
        workflow_id: Option<&str>,
    ) -> Result<Vec<WorkflowExecution>, WorkflowError> {
        let values: Vec<Value> = self
            .executions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        let mut executions = Vec::with_capacity(values.len());
        for value in values {
            let execution: WorkflowExecution = serde_json::from_value(value)?;
            if workflow_id.map_or(true, |id| execution.workflow_id == id) {
                executions.push(execution);
            }
        }
        sort_oldest_first(&mut executions);
        Ok(executions)
    }

    async fn delete_execution(&self, execution_id: &str) -> Result<(), WorkflowError> {
        self.executions
            .remove(execution_id)
            .map(|_| ())
            .ok_or_else(|| WorkflowError::ExecutionNotFound(execution_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::WorkflowStatus;
    use crate::steps::BaseStep;
    use crate::step::StepOutput;
    use crate::workflow::WorkflowInput;

    fn workflow(id: &str) -> Arc<Workflow> {
        Arc::new(
            Workflow::builder(id)
                .id(id)
                .add(BaseStep::new("noop", "Noop", |_ctx, _input| async {
                    Ok(StepOutput::default())
                }))
                .build()
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_workflow_crud() {
        let store = MemoryStore::new();
        store.save_workflow(workflow("b")).await.unwrap();
        store.save_workflow(workflow("a")).await.unwrap();

        assert_eq!(store.get_workflow("a").await.unwrap().id(), "a");
        let ids: Vec<_> = store
            .list_workflows()
            .await
            .unwrap()
            .iter()
            .map(|w| w.id().to_string())
            .collect();
        assert_eq!(ids, ["a", "b"]);

        store.delete_workflow("a").await.unwrap();
        assert!(matches!(
            store.get_workflow("a").await,
            Err(WorkflowError::WorkflowNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_saved_execution_is_a_copy() {
        let store = MemoryStore::new();
        let mut execution = WorkflowExecution::new("wf", &WorkflowInput::new("in"));
        store.save_execution(&execution).await.unwrap();

        execution.context.completed_steps.push("mutated".to_string());
        let stored = store.get_execution(&execution.id).await.unwrap();
        assert!(stored.context.completed_steps.is_empty());
    }

    #[tokio::test]
    async fn test_status_update_and_pending_query() {
        let store = MemoryStore::new();
        let mut running = WorkflowExecution::new("wf", &WorkflowInput::default());
        running.status = WorkflowStatus::Running;
        let mut done = WorkflowExecution::new("other", &WorkflowInput::default());
        done.status = WorkflowStatus::Completed;
        store.save_execution(&running).await.unwrap();
        store.save_execution(&done).await.unwrap();

        let pending = store.get_pending_executions().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, running.id);

        store
            .update_execution_status(&running.id, WorkflowStatus::Paused)
            .await
            .unwrap();
        let paused = store.get_execution(&running.id).await.unwrap();
        assert!(paused.paused_at.is_some());

        store
            .update_execution_status(&running.id, WorkflowStatus::Failed)
            .await
            .unwrap();
        assert!(store.get_pending_executions().await.unwrap().is_empty());
        assert!(store
            .get_execution(&running.id)
            .await
            .unwrap()
            .completed_at
            .is_some());

        assert_eq!(store.list_executions(Some("other")).await.unwrap().len(), 1);
        store.delete_execution(&done.id).await.unwrap();
        assert_eq!(store.execution_count(), 1);
    }
}
