//! # Taskweave
//!
//! A multi-step task orchestration engine for Rust.
//!
//! A [`Workflow`] is an ordered list of steps. The [`Executor`] runs each
//! workflow on its own tokio task, threading data and variables from step to
//! step, and lets callers pause, resume and cancel the run while it is in
//! flight. Execution records can be persisted to a [`WorkflowStore`] and
//! picked up again by [`ExecutionRecovery`] after a restart.
//!
//! ## Features
//!
//! - **Composable steps**: plain async functions ([`BaseStep`]), fan-out
//!   ([`ParallelStep`]), branching ([`ConditionalStep`]), loops
//!   ([`LoopStep`]), waits ([`WaitStep`]) and nested workflows
//!   ([`SubWorkflowStep`])
//! - **Explicit cancellation**: every step receives a [`StepContext`]
//!   carrying the run's cancellation token and deadline
//! - **Retry Support**: fixed delay and exponential backoff policies, per
//!   step or as a workflow default
//! - **Observability**: lifecycle [`WorkflowHooks`], a [`WorkflowEvent`]
//!   stream and `tracing` spans throughout
//! - **Error Handling**: structured errors with `thiserror`
//!
//! ## Quick Start
//!
//! ```rust
//! use taskweave::prelude::*;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), WorkflowError> {
//! let workflow = Workflow::builder("word count")
//!     .add_func("Split", |_ctx, input| async move {
//!         let words: Vec<String> = input
//!             .data
//!             .as_str()
//!             .unwrap_or_default()
//!             .split_whitespace()
//!             .map(str::to_string)
//!             .collect();
//!         Ok(StepOutput::new(words))
//!     })
//!     .add_func("Count", |_ctx, input| async move {
//!         let count = input.data.as_array().map_or(0, Vec::len);
//!         Ok(StepOutput::new(count).with_variable("count", count))
//!     })
//!     .build()?;
//!
//! let executor = Executor::new();
//! let output = executor
//!     .run(Arc::new(workflow), WorkflowInput::new("to spin and to weave"))
//!     .await?;
//!
//! assert_eq!(output.data, 4);
//! assert_eq!(output.variables["count"], 4);
//! # Ok(())
//! # }
//! ```
//!
//! ## Controlling a Run
//!
//! ```rust
//! use taskweave::prelude::*;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), WorkflowError> {
//! let workflow = Arc::new(
//!     Workflow::builder("nightly")
//!         .wait("Settle", Duration::from_secs(60))
//!         .build()?,
//! );
//!
//! let executor = Executor::new();
//! let id = executor.run_async(workflow, WorkflowInput::default()).await?;
//! executor.cancel(&id).await?;
//!
//! let execution = executor.wait_for_completion(&id, None).await?;
//! assert_eq!(execution.status, WorkflowStatus::Cancelled);
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! ```rust
//! use taskweave::prelude::*;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() {
//! # let workflow = Arc::new(
//! #     Workflow::builder("fails")
//! #         .add_func("Boom", |_ctx, _input| async { Err(WorkflowError::step("boom")) })
//! #         .must_build(),
//! # );
//! match Executor::new().run(workflow, WorkflowInput::default()).await {
//!     Ok(output) => println!("done: {}", output.data),
//!     Err(WorkflowError::StepFailed { step_id, source }) => {
//!         eprintln!("Step {} failed: {}", step_id, source);
//!     }
//!     Err(WorkflowError::Cancelled) => eprintln!("cancelled"),
//!     Err(error) => eprintln!("Error: {}", error),
//! }
//! # }
//! ```

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

mod context;
mod error;
mod event;
mod execution;
mod executor;
mod hooks;
mod recovery;
mod step;
mod workflow;

pub mod prelude;
pub mod steps;
pub mod store;

pub use context::{RetryNotice, RetryObserver, StepContext};
pub use error::{HookType, WorkflowError};
pub use event::{
    EventBroadcaster, EventType, LoggingEventHandler, WorkflowEvent, WorkflowEventHandler,
};
pub use execution::{
    ExecutionContext, StepResult, StepStatus, WorkflowExecution, WorkflowStatus,
};
pub use executor::{
    ExecutionFilter, Executor, ExecutorBuilder, ExecutorConfig, WorkflowRunner,
    DEFAULT_EVENT_BUFFER,
};
pub use hooks::{NoopHooks, WorkflowHooks};
pub use recovery::{
    ExecutionRecovery, RecoveredExecution, RecoveryFailure, RecoveryReport, WorkflowRegistry,
    RECOVERED_FROM_KEY,
};
pub use step::{
    RetryPolicy, RetryPolicyError, Step, StepInput, StepOutput, StepType, Variables,
};
pub use steps::{
    step_fn, BaseStep, ConditionalStep, LoopStep, ParallelStep, SubWorkflowStep, WaitStep,
};
pub use store::{ExecutionSnapshot, FileStore, MemoryStore, WorkflowStore};
pub use workflow::{Workflow, WorkflowBuilder, WorkflowInput, WorkflowOutput};
