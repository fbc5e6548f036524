use super::{sort_oldest_first, WorkflowStore};
use crate::error::WorkflowError;
use crate::execution::WorkflowExecution;
use crate::workflow::Workflow;
use async_trait::async_trait;
use dashmap::DashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// A [`WorkflowStore`] that keeps each execution record in
/// `<dir>/<execution-id>.json`.
///
/// Records are written to a temporary file and renamed into place, so a
/// crash never leaves a half-written record behind. Workflow definitions
/// contain step closures and cannot be written to disk; they live in an
/// in-process map and must be registered again after a restart.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
    workflows: DashMap<String, Arc<Workflow>>,
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Opens a store rooted at `dir`, creating the directory if needed.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, WorkflowError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            workflows: DashMap::new(),
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, execution_id: &str) -> Result<PathBuf, WorkflowError> {
        let valid = !execution_id.is_empty()
            && execution_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(WorkflowError::Store(format!(
                "invalid execution id '{execution_id}'"
            )));
        }
        Ok(self.dir.join(format!("{execution_id}.json")))
    }

    async fn read_record(path: &Path) -> Result<WorkflowExecution, WorkflowError> {
        let bytes = fs::read(path).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl WorkflowStore for FileStore {
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
        let path = self.record_path(&execution.id)?;
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(execution)?;

        let _guard = self.write_lock.lock().await;
        fs::write(&tmp, &bytes).await?;
        fs::rename(&tmp, &path).await?;
        debug!(execution_id = %execution.id, path = %path.display(), "saved execution record");
        Ok(())
    }

    async fn get_execution(&self, execution_id: &str) -> Result<WorkflowExecution, WorkflowError> {
        let path = self.record_path(execution_id)?;
        match Self::read_record(&path).await {
            Err(WorkflowError::Io(e)) if e.kind() == ErrorKind::NotFound => {
                Err(WorkflowError::ExecutionNotFound(execution_id.to_string()))
            }
            other => other,
        }
    }

    async fn list_executions(
        &self,
        workflow_id: Option<&str>,
    ) -> Result<Vec<WorkflowExecution>, WorkflowError> {
        let mut entries = fs::read_dir(&self.dir).await?;
        let mut executions = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            match Self::read_record(&path).await {
                Ok(execution) => {
                    if workflow_id.map_or(true, |id| execution.workflow_id == id) {
                        executions.push(execution);
                    }
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable execution record");
                }
            }
        }
        sort_oldest_first(&mut executions);
        Ok(executions)
    }

    async fn delete_execution(&self, execution_id: &str) -> Result<(), WorkflowError> {
        let path = self.record_path(execution_id)?;
        let _guard = self.write_lock.lock().await;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(WorkflowError::ExecutionNotFound(execution_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}
