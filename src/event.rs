//! Lifecycle events emitted by the executor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    WorkflowStarted,
    WorkflowCompleted,
    WorkflowFailed,
    WorkflowPaused,
    WorkflowResumed,
    WorkflowCancelled,
    StepStarted,
    StepCompleted,
    StepFailed,
    StepSkipped,
    StepRetrying,
}

impl EventType {
    /// Returns `true` for events about a single step.
    pub fn is_step_event(self) -> bool {
        matches!(
            self,
            EventType::StepStarted
                | EventType::StepCompleted
                | EventType::StepFailed
                | EventType::StepSkipped
                | EventType::StepRetrying
        )
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventType::WorkflowStarted => "workflow_started",
            EventType::WorkflowCompleted => "workflow_completed",
            EventType::WorkflowFailed => "workflow_failed",
            EventType::WorkflowPaused => "workflow_paused",
            EventType::WorkflowResumed => "workflow_resumed",
            EventType::WorkflowCancelled => "workflow_cancelled",
            EventType::StepStarted => "step_started",
            EventType::StepCompleted => "step_completed",
            EventType::StepFailed => "step_failed",
            EventType::StepSkipped => "step_skipped",
            EventType::StepRetrying => "step_retrying",
        };
        f.write_str(s)
    }
}

/// A lifecycle event of one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub event_type: EventType,
    pub execution_id: String,
    pub workflow_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkflowEvent {
    pub fn new(
        event_type: EventType,
        execution_id: impl Into<String>,
        workflow_id: impl Into<String>,
    ) -> Self {
        Self {
            event_type,
            execution_id: execution_id.into(),
            workflow_id: workflow_id.into(),
            step_id: None,
            timestamp: Utc::now(),
            data: Value::Null,
            error: None,
        }
    }

    pub fn with_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    pub fn with_data(mut self, data: impl Into<Value>) -> Self {
        self.data = data.into();
        self
    }

    pub fn with_error(mut self, error: impl fmt::Display) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

/// Receives every event of every execution run by an executor.
///
/// Handlers are called inline on the execution task and must not block.
/// Any `Fn(&WorkflowEvent)` closure is a handler.
pub trait WorkflowEventHandler: Send + Sync {
    fn handle(&self, event: &WorkflowEvent);
}

impl<F> WorkflowEventHandler for F
where
    F: Fn(&WorkflowEvent) + Send + Sync,
{
    fn handle(&self, event: &WorkflowEvent) {
        self(event)
    }
}

/// Fans events out to async subscribers over a broadcast channel.
///
/// Publishing with no subscribers is a no-op. Slow subscribers that fall
/// more than `capacity` events behind observe a lag error on receive.
#[derive(Clone)]
pub struct EventBroadcaster {
    sender: broadcast::Sender<WorkflowEvent>,
}

impl EventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Creates a subscriber that receives every later event.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl WorkflowEventHandler for EventBroadcaster {
    fn handle(&self, event: &WorkflowEvent) {
        let _ = self.sender.send(event.clone());
    }
}

impl fmt::Debug for EventBroadcaster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBroadcaster")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}

/// Writes every event to `tracing`.
///
/// Failures are logged at `warn`, everything else at `info`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingEventHandler;

impl WorkflowEventHandler for LoggingEventHandler {
    fn handle(&self, event: &WorkflowEvent) {
        let step_id = event.step_id.as_deref().unwrap_or("-");
        match &event.error {
            Some(error) => warn!(
                event = %event.event_type,
                execution_id = %event.execution_id,
                workflow_id = %event.workflow_id,
                step_id,
                error = %error,
                "workflow event"
            ),
            None => info!(
                event = %event.event_type,
                execution_id = %event.execution_id,
                workflow_id = %event.workflow_id,
                step_id,
                "workflow event"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn sample(event_type: EventType) -> WorkflowEvent {
        WorkflowEvent::new(event_type, "exec-1", "wf-1")
    }

    #[test]
    fn test_closure_is_handler() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler = move |event: &WorkflowEvent| {
            sink.lock().unwrap().push(event.event_type);
        };
        handler.handle(&sample(EventType::WorkflowStarted));
        handler.handle(&sample(EventType::StepStarted));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![EventType::WorkflowStarted, EventType::StepStarted]
        );
    }

    #[tokio::test]
    async fn test_broadcaster_delivers_to_every_subscriber() {
        let broadcaster = EventBroadcaster::new(16);
        let mut first = broadcaster.subscribe();
        let mut second = broadcaster.subscribe();

        broadcaster.handle(&sample(EventType::WorkflowCompleted).with_data(42));

        assert_eq!(first.recv().await.unwrap().data, 42);
        assert_eq!(
            second.recv().await.unwrap().event_type,
            EventType::WorkflowCompleted
        );
    }

    #[test]
    fn test_broadcaster_without_subscribers_is_noop() {
        let broadcaster = EventBroadcaster::new(4);
        broadcaster.handle(&sample(EventType::StepSkipped));
        assert_eq!(broadcaster.receiver_count(), 0);
    }

    #[test]
    fn test_event_serializes_snake_case() {
        let event = sample(EventType::StepRetrying)
            .with_step("fetch")
            .with_error("timeout");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "step_retrying");
        assert_eq!(json["step_id"], "fetch");
        assert_eq!(json["error"], "timeout");
        assert_eq!(EventType::WorkflowPaused.to_string(), "workflow_paused");
        assert!(EventType::StepSkipped.is_step_event());
        assert!(!EventType::WorkflowCancelled.is_step_event());
    }

    #[test]
    fn test_logging_handler_accepts_all_events() {
        LoggingEventHandler.handle(&sample(EventType::WorkflowFailed).with_error("boom"));
        LoggingEventHandler.handle(&sample(EventType::WorkflowStarted));
    }
}
