//! Restarting executions that were interrupted mid-run.
//!
//! A process that dies while executions are running leaves their records in
//! the store as Running or Paused. [`ExecutionRecovery`] finds those records
//! and starts each workflow again from its first step with the recorded
//! input, so steps must tolerate being run twice.

use crate::error::WorkflowError;
use crate::execution::{WorkflowExecution, WorkflowStatus};
use crate::executor::Executor;
use crate::store::{apply_status, WorkflowStore};
use crate::workflow::{Workflow, WorkflowInput};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

/// Metadata key under which a recovered run records the execution it
/// replaces.
pub const RECOVERED_FROM_KEY: &str = "recovered_from";

/// Workflow definitions known to the process, by workflow ID.
///
/// Definitions hold step closures and cannot be read back from disk, so a
/// restarted process registers them here before recovering.
#[derive(Debug, Default)]
pub struct WorkflowRegistry {
    workflows: DashMap<String, Arc<Workflow>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `workflow`, replacing any definition with the same ID.
    pub fn register(&self, workflow: Arc<Workflow>) {
        self.workflows.insert(workflow.id().to_string(), workflow);
    }

    pub fn get(&self, workflow_id: &str) -> Option<Arc<Workflow>> {
        self.workflows
            .get(workflow_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn remove(&self, workflow_id: &str) -> Option<Arc<Workflow>> {
        self.workflows.remove(workflow_id).map(|(_, workflow)| workflow)
    }

    /// Registered workflows sorted by ID.
    pub fn list(&self) -> Vec<Arc<Workflow>> {
        let mut workflows: Vec<_> = self
            .workflows
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        workflows.sort_by(|a, b| a.id().cmp(b.id()));
        workflows
    }

    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }
}

/// A stored execution that was restarted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredExecution {
    /// The interrupted execution, now marked Failed
    pub previous_id: String,
    /// The execution started in its place
    pub execution_id: String,
}

/// A stored execution that could not be restarted.
#[derive(Debug)]
pub struct RecoveryFailure {
    pub execution_id: String,
    pub error: WorkflowError,
}

/// Outcome of [`ExecutionRecovery::recover_pending`].
#[derive(Debug, Default)]
pub struct RecoveryReport {
    pub recovered: Vec<RecoveredExecution>,
    pub failed: Vec<RecoveryFailure>,
}

impl RecoveryReport {
    /// Total number of pending executions looked at.
    pub fn total(&self) -> usize {
        self.recovered.len() + self.failed.len()
    }
}

/// Restarts interrupted executions found in a store.
///
/// # Examples
///
/// ```no_run
/// use taskweave::prelude::*;
/// use std::sync::Arc;
///
/// # async fn restart(workflow: Arc<Workflow>) -> Result<(), WorkflowError> {
/// let store: Arc<dyn WorkflowStore> = Arc::new(FileStore::open("/var/lib/weave").await?);
/// let executor = Executor::builder().store(Arc::clone(&store)).build();
///
/// let registry = Arc::new(WorkflowRegistry::new());
/// registry.register(workflow);
///
/// let report = ExecutionRecovery::new(executor, store, registry)
///     .recover_pending()
///     .await?;
/// for failure in &report.failed {
///     eprintln!("{}: {}", failure.execution_id, failure.error);
/// }
/// # Ok(())
/// # }
/// ```
pub struct ExecutionRecovery {
    executor: Executor,
    store: Arc<dyn WorkflowStore>,
    registry: Arc<WorkflowRegistry>,
}

impl ExecutionRecovery {
    pub fn new(
        executor: Executor,
        store: Arc<dyn WorkflowStore>,
        registry: Arc<WorkflowRegistry>,
    ) -> Self {
        Self {
            executor,
            store,
            registry,
        }
    }

    /// Restarts every Running or Paused execution in the store that the
    /// executor is not already driving.
    ///
    /// Failures to restart individual executions are collected in the
    /// report; only a failure to query the store is returned as an error.
    pub async fn recover_pending(&self) -> Result<RecoveryReport, WorkflowError> {
        let pending = self.store.get_pending_executions().await?;
        let mut report = RecoveryReport::default();

        for execution in pending {
            if self.executor.is_running(&execution.id) {
                continue;
            }
            let previous_id = execution.id.clone();
            match self.restart(execution).await {
                Ok(execution_id) => report.recovered.push(RecoveredExecution {
                    previous_id,
                    execution_id,
                }),
                Err(error) => {
                    warn!(execution_id = %previous_id, error = %error, "failed to recover execution");
                    report.failed.push(RecoveryFailure {
                        execution_id: previous_id,
                        error,
                    });
                }
            }
        }

        info!(
            recovered = report.recovered.len(),
            failed = report.failed.len(),
            "recovery finished"
        );
        Ok(report)
    }

    /// Restarts one stored execution and returns the new execution ID.
    ///
    /// # Errors
    ///
    /// [`WorkflowError::InvalidState`] if the record is not Running or
    /// Paused, or if this executor is still running it.
    pub async fn recover_execution(&self, execution_id: &str) -> Result<String, WorkflowError> {
        let execution = self.store.get_execution(execution_id).await?;
        let recoverable = matches!(
            execution.status,
            WorkflowStatus::Running | WorkflowStatus::Paused
        );
        if !recoverable || self.executor.is_running(execution_id) {
            return Err(WorkflowError::InvalidState {
                execution_id: execution_id.to_string(),
                status: execution.status,
                operation: "recover",
            });
        }
        self.restart(execution).await
    }

    async fn restart(&self, mut execution: WorkflowExecution) -> Result<String, WorkflowError> {
        let workflow = self.resolve_workflow(&execution.workflow_id).await?;
        let input = recovered_input(&execution)?;

        let execution_id = self.executor.run_async(workflow, input).await?;

        apply_status(&mut execution, WorkflowStatus::Failed);
        execution.error = Some(format!("superseded by {execution_id}"));
        if let Err(e) = self.store.save_execution(&execution).await {
            warn!(
                execution_id = %execution.id,
                error = %e,
                "failed to mark recovered execution as superseded"
            );
        }

        info!(
            previous_id = %execution.id,
            execution_id = %execution_id,
            workflow_id = %execution.workflow_id,
            "execution recovered"
        );
        Ok(execution_id)
    }

    async fn resolve_workflow(&self, workflow_id: &str) -> Result<Arc<Workflow>, WorkflowError> {
        match self.registry.get(workflow_id) {
            Some(workflow) => Ok(workflow),
            None => self.store.get_workflow(workflow_id).await,
        }
    }
}

/// The input a restarted run begins with: the original data, the original
/// variables overlaid with those the run had accumulated, and the original
/// metadata tagged with the superseded execution's ID.
fn recovered_input(execution: &WorkflowExecution) -> Result<WorkflowInput, WorkflowError> {
    let mut input = execution.workflow_input()?;
    input.variables.extend(
        execution
            .context
            .variables
            .iter()
            .map(|(k, v)| (k.clone(), v.clone())),
    );
    input.metadata.insert(
        RECOVERED_FROM_KEY.to_string(),
        Value::String(execution.id.clone()),
    );
    Ok(input)
}
