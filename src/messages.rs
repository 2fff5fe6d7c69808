//! Typed message envelopes exchanged between agents and the scheduler.
//!
//! Messages flow through per-recipient channels, which gives in-order
//! delivery per (sender, recipient) pair. The scheduler is the sole router;
//! specialists never hold references to each other.

use crate::error::ErrorKind;
use crate::events::Stage;
use crate::models::{AgentKind, Priority, SourceFragment, TaskOutput};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Addressable endpoints inside the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "name")]
pub enum Endpoint {
    Manager,
    Scheduler,
    Agent(AgentKind),
}

/// Envelope carried by every inter-agent message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    pub message_id: String,
    pub sender: Endpoint,
    pub recipient: Endpoint,
    pub priority: Priority,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub payload: MessagePayload,
}

/// Interrupt addressing: either a single task or everything an agent is
/// currently running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptTarget {
    Task(String),
    Agent(AgentKind),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum MessagePayload {
    TaskAssignment {
        task_id: String,
        description: String,
        input: HashMap<String, String>,
        priority: Priority,
    },
    AgentStarted {
        task_id: String,
    },
    StatusUpdate {
        task_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        progress: Option<f32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        stage: Option<Stage>,
    },
    AgentCompleted {
        task_id: String,
        result: TaskOutput,
    },
    AgentFailed {
        task_id: String,
        kind: ErrorKind,
        detail: String,
    },
    Interrupt {
        target: InterruptTarget,
    },
    RagResult {
        task_id: String,
        sources: Vec<SourceFragment>,
    },
}

impl AgentMessage {
    pub fn new(sender: Endpoint, recipient: Endpoint, payload: MessagePayload) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            sender,
            recipient,
            priority: Priority::default(),
            timestamp: chrono::Utc::now(),
            payload,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// The task this message concerns, when it concerns exactly one.
    pub fn task_id(&self) -> Option<&str> {
        match &self.payload {
            MessagePayload::TaskAssignment { task_id, .. }
            | MessagePayload::AgentStarted { task_id }
            | MessagePayload::StatusUpdate { task_id, .. }
            | MessagePayload::AgentCompleted { task_id, .. }
            | MessagePayload::AgentFailed { task_id, .. }
            | MessagePayload::RagResult { task_id, .. } => Some(task_id),
            MessagePayload::Interrupt {
                target: InterruptTarget::Task(task_id),
            } => Some(task_id),
            MessagePayload::Interrupt { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_tags_are_snake_case() {
        let msg = AgentMessage::new(
            Endpoint::Scheduler,
            Endpoint::Agent(AgentKind::Knowledge),
            MessagePayload::AgentFailed {
                task_id: "t1".into(),
                kind: ErrorKind::StoreError,
                detail: "backend unavailable".into(),
            },
        );
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["payload"]["type"], "agent_failed");
        assert_eq!(json["payload"]["kind"], "store_error");
        assert_eq!(json["recipient"]["kind"], "agent");
    }

    #[test]
    fn task_id_extraction() {
        let msg = AgentMessage::new(
            Endpoint::Manager,
            Endpoint::Scheduler,
            MessagePayload::Interrupt {
                target: InterruptTarget::Task("t9".into()),
            },
        );
        assert_eq!(msg.task_id(), Some("t9"));

        let msg = AgentMessage::new(
            Endpoint::Manager,
            Endpoint::Scheduler,
            MessagePayload::Interrupt {
                target: InterruptTarget::Agent(AgentKind::Compute),
            },
        );
        assert_eq!(msg.task_id(), None);
    }
}
