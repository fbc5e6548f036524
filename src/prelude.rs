//! Commonly used types and traits

pub use crate::context::StepContext;
pub use crate::error::WorkflowError;
pub use crate::event::{EventType, LoggingEventHandler, WorkflowEvent};
pub use crate::execution::{StepStatus, WorkflowExecution, WorkflowStatus};
pub use crate::executor::{Executor, ExecutorConfig, WorkflowRunner};
pub use crate::hooks::WorkflowHooks;
pub use crate::recovery::{ExecutionRecovery, WorkflowRegistry};
pub use crate::step::{RetryPolicy, Step, StepInput, StepOutput};
pub use crate::steps::{step_fn, BaseStep};
pub use crate::store::{FileStore, MemoryStore, WorkflowStore};
pub use crate::workflow::{Workflow, WorkflowInput, WorkflowOutput};
