//! The concrete step behaviours.

mod base;
mod conditional;
mod loop_step;
mod parallel;
mod sub_workflow;
mod wait;

pub use base::{step_fn, BaseStep, StepFn, StepFuture};
pub use conditional::{ConditionFn, ConditionalStep, ELSE_BRANCH, THEN_BRANCH};
pub use loop_step::{LoopCondition, LoopControl, LoopStep, DEFAULT_MAX_ITERATIONS};
pub use parallel::ParallelStep;
pub use sub_workflow::SubWorkflowStep;
pub use wait::{WaitPredicate, WaitStep, DEFAULT_POLL_INTERVAL};
