//! Runs workflow executions and owns their state machine.
//!
//! Every execution runs on its own tokio task, which owns the execution
//! record. The only outside write is [`Executor::resume`] moving a paused
//! record back to Running. Readers such as [`Executor::get_execution`] take
//! clones under a short-held lock, so status queries never wait on a
//! running step.

use crate::context::{RetryNotice, StepContext};
use crate::error::{HookType, WorkflowError};
use crate::event::{EventBroadcaster, EventType, WorkflowEvent, WorkflowEventHandler};
use crate::execution::{StepResult, StepStatus, WorkflowExecution, WorkflowStatus};
use crate::hooks::{NoopHooks, WorkflowHooks};
use crate::step::{Step, StepInput};
use crate::store::WorkflowStore;
use crate::workflow::{Workflow, WorkflowInput, WorkflowOutput};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::json;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch, Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

/// Default capacity of the executor's event broadcast channel.
pub const DEFAULT_EVENT_BUFFER: usize = 256;

/// The contract for starting and controlling workflow runs.
///
/// [`Executor`] implements it; [`SubWorkflowStep`](crate::SubWorkflowStep)
/// depends on it so nested runs can go through any runner.
#[async_trait]
pub trait WorkflowRunner: Send + Sync {
    /// Runs `workflow` to the end and returns its output, or the error
    /// that stopped it.
    async fn run(
        &self,
        workflow: Arc<Workflow>,
        input: WorkflowInput,
    ) -> Result<WorkflowOutput, WorkflowError>;

    /// Starts `workflow` in the background and returns the execution ID.
    async fn run_async(
        &self,
        workflow: Arc<Workflow>,
        input: WorkflowInput,
    ) -> Result<String, WorkflowError>;

    /// Asks a running execution to stop at the next step boundary.
    async fn pause(&self, execution_id: &str) -> Result<(), WorkflowError>;

    /// Continues a paused execution.
    async fn resume(&self, execution_id: &str) -> Result<(), WorkflowError>;

    /// Cancels a running or paused execution.
    async fn cancel(&self, execution_id: &str) -> Result<(), WorkflowError>;

    /// Returns a snapshot of the execution record.
    async fn get_execution(&self, execution_id: &str) -> Result<WorkflowExecution, WorkflowError>;

    /// Waits until the execution reaches a terminal state.
    async fn wait_for_completion(
        &self,
        execution_id: &str,
        timeout: Option<Duration>,
    ) -> Result<WorkflowExecution, WorkflowError>;
}

/// Executor settings.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Save execution records to the store at every step boundary.
    pub enable_persistence: bool,
    /// Upper bound on executions in flight. `None` means unbounded.
    pub max_concurrent_executions: Option<usize>,
    /// Capacity of the channel behind [`Executor::subscribe`].
    pub event_buffer: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            enable_persistence: true,
            max_concurrent_executions: None,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

/// Selects executions in [`Executor::list_executions`].
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    /// Keep only executions of this workflow.
    pub workflow_id: Option<String>,
    /// Keep only executions in this status.
    pub status: Option<WorkflowStatus>,
}

impl ExecutionFilter {
    pub fn workflow(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }

    pub fn status(mut self, status: WorkflowStatus) -> Self {
        self.status = Some(status);
        self
    }

    fn matches(&self, execution: &WorkflowExecution) -> bool {
        self.workflow_id
            .as_deref()
            .map_or(true, |id| execution.workflow_id == id)
            && self.status.map_or(true, |status| execution.status == status)
    }
}

/// Builds an [`Executor`].
///
/// # Examples
///
/// ```
/// use taskweave::prelude::*;
/// use std::sync::Arc;
///
/// let executor = Executor::builder()
///     .config(ExecutorConfig {
///         max_concurrent_executions: Some(8),
///         ..ExecutorConfig::default()
///     })
///     .store(Arc::new(MemoryStore::new()))
///     .event_handler(LoggingEventHandler)
///     .build();
/// # let _ = executor;
/// ```
#[derive(Default)]
pub struct ExecutorBuilder {
    config: ExecutorConfig,
    store: Option<Arc<dyn WorkflowStore>>,
    hooks: Option<Arc<dyn WorkflowHooks>>,
    handlers: Vec<Arc<dyn WorkflowEventHandler>>,
}

impl ExecutorBuilder {
    pub fn config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(mut self, store: Arc<dyn WorkflowStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn hooks(mut self, hooks: Arc<dyn WorkflowHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Registers a handler. May be called several times.
    pub fn event_handler(mut self, handler: impl WorkflowEventHandler + 'static) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    pub fn build(self) -> Executor {
        let broadcaster = EventBroadcaster::new(self.config.event_buffer);
        let mut handlers = self.handlers;
        handlers.push(Arc::new(broadcaster.clone()));
        let limiter = self
            .config
            .max_concurrent_executions
            .map(|max| Arc::new(Semaphore::new(max)));

        Executor {
            inner: Arc::new(Inner {
                config: self.config,
                store: self.store,
                hooks: self.hooks.unwrap_or_else(|| Arc::new(NoopHooks)),
                handlers: handlers.into(),
                broadcaster,
                executions: DashMap::new(),
                limiter,
            }),
        }
    }
}

/// Runs workflows.
///
/// Cloning an executor is cheap; clones share their executions.
///
/// # Examples
///
/// ```
/// use taskweave::prelude::*;
/// use std::sync::Arc;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), WorkflowError> {
/// let workflow = Arc::new(
///     Workflow::builder("greet")
///         .add_func("Hello", |_ctx, input| async move {
///             Ok(StepOutput::new(format!("hello, {}", input.data.as_str().unwrap_or("world"))))
///         })
///         .build()?,
/// );
///
/// let executor = Executor::new();
/// let output = executor.run(workflow, WorkflowInput::new("weaver")).await?;
/// assert_eq!(output.data, "hello, weaver");
/// assert_eq!(output.status, WorkflowStatus::Completed);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Executor {
    inner: Arc<Inner>,
}

struct Inner {
    config: ExecutorConfig,
    store: Option<Arc<dyn WorkflowStore>>,
    hooks: Arc<dyn WorkflowHooks>,
    handlers: Arc<[Arc<dyn WorkflowEventHandler>]>,
    broadcaster: EventBroadcaster,
    executions: DashMap<String, Arc<ExecutionHandle>>,
    limiter: Option<Arc<Semaphore>>,
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("config", &self.inner.config)
            .field("executions", &self.inner.executions.len())
            .field("has_store", &self.inner.store.is_some())
            .finish()
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared state of one in-flight execution.
struct ExecutionHandle {
    record: RwLock<WorkflowExecution>,
    ctx: StepContext,
    pause_requested: AtomicBool,
    resume: Notify,
    done: watch::Sender<bool>,
    failure: Mutex<Option<WorkflowError>>,
}

impl ExecutionHandle {
    fn snapshot(&self) -> WorkflowExecution {
        self.record
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn status(&self) -> WorkflowStatus {
        self.record
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .status
    }

    fn update<R>(&self, f: impl FnOnce(&mut WorkflowExecution) -> R) -> R {
        let mut record = self.record.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut record)
    }

    fn take_failure(&self) -> Option<WorkflowError> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// Sends events for one execution to every handler.
#[derive(Clone)]
struct Emitter {
    handlers: Arc<[Arc<dyn WorkflowEventHandler>]>,
    execution_id: String,
    workflow_id: String,
}

impl Emitter {
    fn event(&self, event_type: EventType) -> WorkflowEvent {
        WorkflowEvent::new(event_type, &self.execution_id, &self.workflow_id)
    }

    fn emit(&self, event: WorkflowEvent) {
        for handler in self.handlers.iter() {
            handler.handle(&event);
        }
    }
}

/// Everything the execution task owns.
struct Run {
    inner: Arc<Inner>,
    handle: Arc<ExecutionHandle>,
    workflow: Arc<Workflow>,
    emitter: Emitter,
    retries: Arc<AtomicU32>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl Executor {
    pub fn new() -> Self {
        ExecutorBuilder::default().build()
    }

    pub fn builder() -> ExecutorBuilder {
        ExecutorBuilder::default()
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.inner.config
    }

    pub fn store(&self) -> Option<&Arc<dyn WorkflowStore>> {
        self.inner.store.as_ref()
    }

    /// Subscribes to every event of every execution started afterwards.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.inner.broadcaster.subscribe()
    }

    /// Runs `workflow` to the end.
    ///
    /// Returns the output when the execution completes, otherwise the error
    /// that failed or cancelled it.
    pub async fn run(
        &self,
        workflow: Arc<Workflow>,
        input: WorkflowInput,
    ) -> Result<WorkflowOutput, WorkflowError> {
        let execution_id = self.run_async(workflow, input).await?;
        let execution = self.wait_for_completion(&execution_id, None).await?;
        if execution.status == WorkflowStatus::Completed {
            return Ok(WorkflowOutput::from(&execution));
        }

        let recorded = self
            .inner
            .executions
            .get(&execution_id)
            .and_then(|handle| handle.take_failure());
        Err(recorded.unwrap_or_else(|| match execution.status {
            WorkflowStatus::Cancelled => WorkflowError::Cancelled,
            _ => WorkflowError::Step(execution.error.unwrap_or_else(|| "workflow failed".into())),
        }))
    }

    /// Starts `workflow` on a new task and returns the execution ID.
    ///
    /// # Errors
    ///
    /// Fails without starting anything if the workflow is invalid, the
    /// concurrency limit is reached, or the `on_start` hook rejects the run.
    /// The hook is not called for runs turned away by the limit.
    pub async fn run_async(
        &self,
        workflow: Arc<Workflow>,
        input: WorkflowInput,
    ) -> Result<String, WorkflowError> {
        workflow.validate()?;
        let permit = match &self.inner.limiter {
            Some(limiter) => Some(
                Arc::clone(limiter)
                    .try_acquire_owned()
                    .map_err(|_| WorkflowError::ConcurrencyLimitReached)?,
            ),
            None => None,
        };

        self.inner
            .hooks
            .on_start(&workflow, &input)
            .map_err(|e| WorkflowError::HookError {
                hook_type: HookType::OnStart,
                details: e.to_string(),
            })?;

        let mut execution = WorkflowExecution::new(workflow.id(), &input);
        execution.context.pending_steps =
            workflow.steps().iter().map(|s| s.id().to_string()).collect();
        execution.transition(WorkflowStatus::Running, "start")?;
        let execution_id = execution.id.clone();

        let emitter = Emitter {
            handlers: Arc::clone(&self.inner.handlers),
            execution_id: execution_id.clone(),
            workflow_id: workflow.id().to_string(),
        };
        let retries = Arc::new(AtomicU32::new(0));
        let ctx = root_context(&workflow, emitter.clone(), Arc::clone(&retries));

        let (done, _) = watch::channel(false);
        let handle = Arc::new(ExecutionHandle {
            record: RwLock::new(execution),
            ctx,
            pause_requested: AtomicBool::new(false),
            resume: Notify::new(),
            done,
            failure: Mutex::new(None),
        });
        self.inner
            .executions
            .insert(execution_id.clone(), Arc::clone(&handle));

        if let (true, Some(store)) = (self.inner.config.enable_persistence, &self.inner.store) {
            if let Err(e) = store.save_workflow(Arc::clone(&workflow)).await {
                warn!(workflow_id = %workflow.id(), error = %e, "failed to save workflow definition");
            }
        }

        let run = Run {
            inner: Arc::clone(&self.inner),
            handle,
            workflow,
            emitter,
            retries,
            _permit: permit,
        };
        run.persist().await;
        tokio::spawn(run.execute_workflow(input));

        Ok(execution_id)
    }

    /// Asks a running execution to pause before its next step.
    ///
    /// # Errors
    ///
    /// [`WorkflowError::AlreadyPausing`] if a pause is already pending and
    /// [`WorkflowError::InvalidState`] unless the execution is running.
    pub async fn pause(&self, execution_id: &str) -> Result<(), WorkflowError> {
        let handle = self.handle(execution_id)?;
        handle.update(|record| {
            if record.status != WorkflowStatus::Running {
                return Err(WorkflowError::InvalidState {
                    execution_id: record.id.clone(),
                    status: record.status,
                    operation: "pause",
                });
            }
            handle
                .pause_requested
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .map(|_| ())
                .map_err(|_| WorkflowError::AlreadyPausing(record.id.clone()))
        })?;
        debug!(execution_id, "pause requested");
        Ok(())
    }

    /// Resumes a paused execution, or withdraws a pause that has not taken
    /// effect yet.
    pub async fn resume(&self, execution_id: &str) -> Result<(), WorkflowError> {
        let handle = self.handle(execution_id)?;
        handle.update(|record| match record.status {
            WorkflowStatus::Paused => {
                record.transition(WorkflowStatus::Running, "resume")?;
                handle.resume.notify_one();
                Ok(())
            }
            WorkflowStatus::Running if handle.pause_requested.swap(false, Ordering::SeqCst) => {
                Ok(())
            }
            status => Err(WorkflowError::InvalidState {
                execution_id: record.id.clone(),
                status,
                operation: "resume",
            }),
        })?;
        debug!(execution_id, "resume requested");
        Ok(())
    }

    /// Cancels the execution's root context.
    ///
    /// Steps observe the cancellation at their next suspension point; the
    /// execution then ends as Cancelled.
    pub async fn cancel(&self, execution_id: &str) -> Result<(), WorkflowError> {
        let handle = self.handle(execution_id)?;
        let status = handle.status();
        if status.is_terminal() {
            return Err(WorkflowError::InvalidState {
                execution_id: execution_id.to_string(),
                status,
                operation: "cancel",
            });
        }
        handle.ctx.cancel();
        info!(execution_id, "execution cancel requested");
        Ok(())
    }

    /// Returns the execution from this executor, falling back to the store.
    pub async fn get_execution(&self, execution_id: &str) -> Result<WorkflowExecution, WorkflowError> {
        let live = self
            .inner
            .executions
            .get(execution_id)
            .map(|handle| handle.snapshot());
        if let Some(execution) = live {
            return Ok(execution);
        }
        match &self.inner.store {
            Some(store) => store.get_execution(execution_id).await,
            None => Err(WorkflowError::ExecutionNotFound(execution_id.to_string())),
        }
    }

    /// Waits until the execution is terminal.
    ///
    /// # Errors
    ///
    /// [`WorkflowError::WaitTimeout`] when `timeout` elapses first, and
    /// [`WorkflowError::InvalidState`] for a stored execution that is not
    /// terminal but is not run by this executor either.
    pub async fn wait_for_completion(
        &self,
        execution_id: &str,
        timeout: Option<Duration>,
    ) -> Result<WorkflowExecution, WorkflowError> {
        let live = self
            .inner
            .executions
            .get(execution_id)
            .map(|entry| Arc::clone(entry.value()));
        let handle = match live {
            Some(handle) => handle,
            None => {
                let execution = self.get_execution(execution_id).await?;
                if execution.is_terminal() {
                    return Ok(execution);
                }
                return Err(WorkflowError::InvalidState {
                    execution_id: execution_id.to_string(),
                    status: execution.status,
                    operation: "wait for",
                });
            }
        };

        let mut done = handle.done.subscribe();
        let finished = async {
            done.wait_for(|finished| *finished)
                .await
                .map(|_| ())
                .map_err(|_| WorkflowError::ExecutionNotFound(execution_id.to_string()))
        };
        match timeout {
            Some(limit) => tokio::time::timeout(limit, finished)
                .await
                .map_err(|_| WorkflowError::WaitTimeout(execution_id.to_string()))??,
            None => finished.await?,
        }
        Ok(handle.snapshot())
    }

    /// Lists the executions tracked by this executor, oldest first.
    pub fn list_executions(&self, filter: &ExecutionFilter) -> Vec<WorkflowExecution> {
        let mut executions: Vec<_> = self
            .inner
            .executions
            .iter()
            .map(|entry| entry.value().snapshot())
            .filter(|execution| filter.matches(execution))
            .collect();
        executions.sort_by(|a, b| a.id.cmp(&b.id));
        executions
    }

    /// Forgets terminal executions that finished more than `older_than`
    /// ago and returns how many were removed. Stored records are kept.
    pub fn cleanup_completed(&self, older_than: Duration) -> usize {
        let cutoff = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age));
        let Some(cutoff) = cutoff else {
            return 0;
        };
        let before = self.inner.executions.len();
        self.inner.executions.retain(|_, handle| {
            let record = handle.snapshot();
            !(record.is_terminal() && record.completed_at.is_some_and(|at| at <= cutoff))
        });
        let removed = before.saturating_sub(self.inner.executions.len());
        if removed > 0 {
            debug!(removed, "cleaned up finished executions");
        }
        removed
    }

    /// Returns `true` if this executor is still driving the execution.
    pub fn is_running(&self, execution_id: &str) -> bool {
        self.inner
            .executions
            .get(execution_id)
            .is_some_and(|handle| !handle.status().is_terminal())
    }

    fn handle(&self, execution_id: &str) -> Result<Arc<ExecutionHandle>, WorkflowError> {
        self.inner
            .executions
            .get(execution_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| WorkflowError::ExecutionNotFound(execution_id.to_string()))
    }
}

/// Root context of a run: the workflow timeout, its default retry policy
/// and a retry observer that counts retries and emits `step_retrying`.
fn root_context(workflow: &Workflow, emitter: Emitter, retries: Arc<AtomicU32>) -> StepContext {
    let base = StepContext::new();
    let ctx = match workflow.timeout() {
        Some(timeout) => base.with_timeout(timeout),
        None => base,
    };
    ctx.with_retry_policy(workflow.retry_policy().clone())
        .with_retry_observer(Arc::new(move |notice: &RetryNotice<'_>| {
            retries.fetch_add(1, Ordering::SeqCst);
            emitter.emit(
                emitter
                    .event(EventType::StepRetrying)
                    .with_step(notice.step_id)
                    .with_data(json!({
                        "attempt": notice.attempt,
                        "delay_ms": u64::try_from(notice.delay.as_millis()).unwrap_or(u64::MAX),
                    }))
                    .with_error(notice.error),
            );
        }))
}

impl Run {
    fn execution_id(&self) -> &str {
        &self.emitter.execution_id
    }

    async fn execute_workflow(self, input: WorkflowInput) {
        let ctx = self.handle.ctx.clone();
        info!(
            execution_id = %self.execution_id(),
            workflow_id = %self.workflow.id(),
            steps = self.workflow.steps().len(),
            "workflow started"
        );
        self.emitter.emit(self.emitter.event(EventType::WorkflowStarted));

        let mut current = StepInput {
            data: input.data,
            variables: input.variables,
            previous_outputs: Default::default(),
            metadata: input.metadata,
        };
        let steps = self.workflow.steps().to_vec();
        let mut failure = None;

        for (index, step) in steps.iter().enumerate() {
            if let Err(e) = ctx.check() {
                self.skip_remaining(&steps[index..]);
                failure = Some(e);
                break;
            }
            if self.handle.pause_requested.load(Ordering::SeqCst) {
                if let Err(e) = self.wait_while_paused(&ctx).await {
                    self.skip_remaining(&steps[index..]);
                    failure = Some(e);
                    break;
                }
            }
            if let Err(e) = self.check_dependencies(step.as_ref()) {
                self.record_step_failure(step.id(), &e, Duration::ZERO);
                self.skip_remaining(&steps[index + 1..]);
                failure = Some(e);
                break;
            }

            match self.run_step(step, &ctx, &mut current).await {
                Ok(()) => self.persist().await,
                Err(e) => {
                    self.skip_remaining(&steps[index + 1..]);
                    failure = Some(WorkflowError::StepFailed {
                        step_id: step.id().to_string(),
                        source: Box::new(e),
                    });
                    break;
                }
            }
        }

        self.finish(failure, current).await;
    }

    async fn run_step(
        &self,
        step: &Arc<dyn Step>,
        ctx: &StepContext,
        current: &mut StepInput,
    ) -> Result<(), WorkflowError> {
        let step_id = step.id().to_string();
        self.handle.update(|record| {
            record.context.current_step_id = Some(step_id.clone());
            record.context.pending_steps.retain(|id| id != &step_id);
            record
                .step_results
                .insert(step_id.clone(), StepResult::started(&step_id));
        });
        debug!(execution_id = %self.execution_id(), step_id = %step_id, step_type = %step.step_type(), "step started");
        self.emitter
            .emit(self.emitter.event(EventType::StepStarted).with_step(&step_id));
        if let Err(e) = self.inner.hooks.on_step_start(&step_id, current) {
            self.hook_failed(HookType::OnStepStart, &e);
        }

        self.retries.store(0, Ordering::SeqCst);
        let started = Instant::now();
        // A panic inside the step must not take the run's task down with it.
        let task_step = Arc::clone(step);
        let task_ctx = ctx.clone();
        let task_input = current.clone();
        let result =
            match tokio::spawn(async move { task_step.execute(&task_ctx, task_input).await }).await
            {
                Ok(result) => result,
                Err(join_error) => Err(WorkflowError::step(format!(
                    "step task failed: {join_error}"
                ))),
            };
        let elapsed = started.elapsed();
        let retry_count = self.retries.load(Ordering::SeqCst);

        let output = match result {
            Ok(output) => output,
            Err(e) => {
                self.handle.update(|record| {
                    if let Some(result) = record.step_results.get_mut(&step_id) {
                        result.retry_count = retry_count;
                    }
                });
                self.record_step_failure(&step_id, &e, elapsed);
                return Err(e);
            }
        };

        self.handle.update(|record| {
            if let Some(result) = record.step_results.get_mut(&step_id) {
                result.output = output.data.clone();
                result.retry_count = retry_count;
                result.finish(StepStatus::Completed, elapsed);
            }
            record
                .context
                .variables
                .extend(output.variables.iter().map(|(k, v)| (k.clone(), v.clone())));
            record.context.completed_steps.push(step_id.clone());
        });
        debug!(
            execution_id = %self.execution_id(),
            step_id = %step_id,
            elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            retry_count,
            "step completed"
        );
        self.emitter.emit(
            self.emitter
                .event(EventType::StepCompleted)
                .with_step(&step_id)
                .with_data(output.data.clone()),
        );
        if let Err(e) = self.inner.hooks.on_step_complete(&step_id, &output) {
            self.hook_failed(HookType::OnStepComplete, &e);
        }

        current
            .previous_outputs
            .insert(step_id, output.data.clone());
        current.variables.extend(output.variables);
        current.data = output.data;
        Ok(())
    }

    fn check_dependencies(&self, step: &dyn Step) -> Result<(), WorkflowError> {
        let record = self.handle.snapshot();
        let missing = step.dependencies().iter().find(|dependency| {
            !record
                .step_results
                .get(dependency.as_str())
                .is_some_and(|result| result.status == StepStatus::Completed)
        });
        match missing {
            Some(dependency) => Err(WorkflowError::DependencyMissing {
                step_id: step.id().to_string(),
                dependency: dependency.clone(),
            }),
            None => Ok(()),
        }
    }

    fn record_step_failure(&self, step_id: &str, error: &WorkflowError, elapsed: Duration) {
        self.handle.update(|record| {
            record.context.pending_steps.retain(|id| id != step_id);
            let result = record
                .step_results
                .entry(step_id.to_string())
                .or_insert_with(|| StepResult::started(step_id));
            result.error = Some(error.to_string());
            if let Some(partial) = error.partial_output() {
                result.output = partial.data.clone();
            }
            result.finish(StepStatus::Failed, elapsed);
        });
        warn!(execution_id = %self.execution_id(), step_id, error = %error, "step failed");
        self.emitter.emit(
            self.emitter
                .event(EventType::StepFailed)
                .with_step(step_id)
                .with_error(error),
        );
        if let Err(e) = self.inner.hooks.on_step_error(step_id, error) {
            self.hook_failed(HookType::OnStepError, &e);
        }
    }

    fn skip_remaining(&self, steps: &[Arc<dyn Step>]) {
        if steps.is_empty() {
            return;
        }
        self.handle.update(|record| {
            for step in steps {
                let id = step.id().to_string();
                record.context.pending_steps.retain(|pending| pending != &id);
                let mut result = StepResult::started(&id);
                result.finish(StepStatus::Skipped, Duration::ZERO);
                record.step_results.insert(id.clone(), result);
                record.context.skipped_steps.push(id);
            }
        });
        for step in steps {
            self.emitter
                .emit(self.emitter.event(EventType::StepSkipped).with_step(step.id()));
        }
    }

    /// Pause rendezvous. Returns once resumed, or with the context's error
    /// if it ends while paused.
    async fn wait_while_paused(&self, ctx: &StepContext) -> Result<(), WorkflowError> {
        let paused = self.handle.update(|record| {
            if self.handle.pause_requested.swap(false, Ordering::SeqCst) {
                record.transition(WorkflowStatus::Paused, "pause").is_ok()
            } else {
                false
            }
        });
        if !paused {
            return Ok(());
        }

        info!(execution_id = %self.execution_id(), "workflow paused");
        self.emitter.emit(self.emitter.event(EventType::WorkflowPaused));
        self.persist().await;

        tokio::select! {
            biased;
            _ = ctx.done() => return Err(ctx.error().unwrap_or(WorkflowError::Cancelled)),
            _ = self.handle.resume.notified() => {}
        }

        info!(execution_id = %self.execution_id(), "workflow resumed");
        self.emitter.emit(self.emitter.event(EventType::WorkflowResumed));
        self.persist().await;
        Ok(())
    }

    async fn finish(self, failure: Option<WorkflowError>, current: StepInput) {
        match failure {
            None => {
                let transitioned = self.handle.update(|record| {
                    record.output = current.data.clone();
                    record.context.current_step_id = None;
                    record.transition(WorkflowStatus::Completed, "complete")
                });
                if let Err(e) = transitioned {
                    warn!(execution_id = %self.execution_id(), error = %e, "could not mark execution completed");
                }
                let record = self.handle.snapshot();
                info!(
                    execution_id = %self.execution_id(),
                    workflow_id = %self.workflow.id(),
                    duration_ms = u64::try_from(record.duration.as_millis()).unwrap_or(u64::MAX),
                    "workflow completed"
                );
                self.emitter
                    .emit(self.emitter.event(EventType::WorkflowCompleted).with_data(current.data));
                if let Err(e) = self.inner.hooks.on_complete(&record) {
                    self.hook_failed(HookType::OnComplete, &e);
                }
            }
            Some(error) => {
                let status = if self.handle.ctx.is_cancelled() {
                    WorkflowStatus::Cancelled
                } else {
                    WorkflowStatus::Failed
                };
                let transitioned = self.handle.update(|record| {
                    record.error = Some(error.to_string());
                    record.transition(status, "finish")
                });
                if let Err(e) = transitioned {
                    warn!(execution_id = %self.execution_id(), error = %e, "could not mark execution finished");
                }
                let record = self.handle.snapshot();
                let event_type = if status == WorkflowStatus::Cancelled {
                    info!(execution_id = %self.execution_id(), "workflow cancelled");
                    EventType::WorkflowCancelled
                } else {
                    warn!(execution_id = %self.execution_id(), error = %error, "workflow failed");
                    EventType::WorkflowFailed
                };
                self.emitter
                    .emit(self.emitter.event(event_type).with_error(&error));
                if let Err(e) = self.inner.hooks.on_error(&record, &error) {
                    self.hook_failed(HookType::OnError, &e);
                }
                *self
                    .handle
                    .failure
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(error);
            }
        }

        self.persist().await;
        self.handle.done.send_replace(true);
    }

    async fn persist(&self) {
        if !self.inner.config.enable_persistence {
            return;
        }
        let Some(store) = &self.inner.store else {
            return;
        };
        let record = self.handle.snapshot();
        match store.save_execution(&record).await {
            Ok(()) => debug!(execution_id = %record.id, status = %record.status, "execution persisted"),
            Err(e) => warn!(execution_id = %record.id, error = %e, "failed to persist execution"),
        }
    }

    fn hook_failed(&self, hook_type: HookType, error: &WorkflowError) {
        warn!(
            execution_id = %self.execution_id(),
            hook = %hook_type,
            error = %error,
            "hook failed"
        );
    }
}

#[async_trait]
impl WorkflowRunner for Executor {
    async fn run(
        &self,
        workflow: Arc<Workflow>,
        input: WorkflowInput,
    ) -> Result<WorkflowOutput, WorkflowError> {
        Executor::run(self, workflow, input).await
    }

    async fn run_async(
        &self,
        workflow: Arc<Workflow>,
        input: WorkflowInput,
    ) -> Result<String, WorkflowError> {
        Executor::run_async(self, workflow, input).await
    }

    async fn pause(&self, execution_id: &str) -> Result<(), WorkflowError> {
        Executor::pause(self, execution_id).await
    }

    async fn resume(&self, execution_id: &str) -> Result<(), WorkflowError> {
        Executor::resume(self, execution_id).await
    }

    async fn cancel(&self, execution_id: &str) -> Result<(), WorkflowError> {
        Executor::cancel(self, execution_id).await
    }

    async fn get_execution(&self, execution_id: &str) -> Result<WorkflowExecution, WorkflowError> {
        Executor::get_execution(self, execution_id).await
    }

    async fn wait_for_completion(
        &self,
        execution_id: &str,
        timeout: Option<Duration>,
    ) -> Result<WorkflowExecution, WorkflowError> {
        Executor::wait_for_completion(self, execution_id, timeout).await
    }
}
