//! Unified event schema and broadcast fabric.
//!
//! Every observable state change in the engine is an immutable
//! [`UnifiedEvent`] pushed through the [`bus::EventBus`]. The JSON shape and
//! the stage→UI defaults table are external contracts; changing either breaks
//! deployed clients.

pub mod bus;

pub use bus::{EventBus, EventSink};

use crate::models::{AgentKind, SourceFragment, TokenUsage};
use serde::{Deserialize, Serialize};

/// Event type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Init,
    Thinking,
    Status,
    Progress,
    Stream,
    Result,
    Error,
}

/// Coarse processing phase surfaced to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Init,
    Classifying,
    Planning,
    Retrieval,
    Executing,
    Synthesis,
    Complete,
    Failed,
}

impl Stage {
    /// Stage→UI defaults table. Colors and icons are bit-exact contract
    /// values; clients key timeline rendering off them.
    pub fn ui_defaults(&self) -> UiHints {
        let (color, icon, priority, animate) = match self {
            Stage::Init => ("#6b7280", "inbox", 2, false),
            Stage::Classifying => ("#8b5cf6", "tag", 3, true),
            Stage::Planning => ("#f59e0b", "clipboard-list", 4, true),
            Stage::Retrieval => ("#10b981", "search", 4, true),
            Stage::Executing => ("#3b82f6", "cog", 5, true),
            Stage::Synthesis => ("#6366f1", "sparkles", 5, true),
            Stage::Complete => ("#22c55e", "check-circle", 8, false),
            Stage::Failed => ("#ef4444", "x-circle", 9, false),
        };
        UiHints {
            color: color.to_string(),
            icon: icon.to_string(),
            priority,
            dismissible: !matches!(self, Stage::Complete | Stage::Failed),
            show_in_timeline: true,
            animate,
        }
    }
}

/// Reference to the agent that produced an event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentRef {
    pub name: String,
    pub role: String,
    pub icon: String,
}

impl AgentRef {
    pub fn system() -> Self {
        Self {
            name: "manager".to_string(),
            role: "Orchestration manager".to_string(),
            icon: "workflow".to_string(),
        }
    }
}

impl From<AgentKind> for AgentRef {
    fn from(kind: AgentKind) -> Self {
        Self {
            name: kind.as_str().to_string(),
            role: kind.role().to_string(),
            icon: kind.icon().to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EventContent {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub sources: Vec<SourceFragment>,
    pub tokens: Option<TokenUsage>,
    pub answer: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UiHints {
    pub color: String,
    pub icon: String,
    pub priority: u8,
    pub dismissible: bool,
    pub show_in_timeline: bool,
    pub animate: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EventMetadata {
    pub intent: Option<String>,
    pub handler: Option<String>,
    pub duration_ms: Option<u64>,
    pub step_index: Option<usize>,
    pub total_steps: Option<usize>,
}

/// Immutable record of a state change observable by subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedEvent {
    pub event_id: String,
    pub session_id: String,
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub stage: Stage,
    pub agent: AgentRef,
    pub content: EventContent,
    pub ui: UiHints,
    pub metadata: EventMetadata,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl UnifiedEvent {
    pub fn new(
        session_id: impl Into<String>,
        task_id: impl Into<String>,
        event_type: EventType,
        stage: Stage,
        agent: AgentRef,
    ) -> Self {
        Self {
            event_id: format!("evt_{}", ulid::Ulid::new()),
            session_id: session_id.into(),
            task_id: task_id.into(),
            conversation_id: None,
            event_type,
            stage,
            agent,
            content: EventContent::default(),
            ui: stage.ui_defaults(),
            metadata: EventMetadata::default(),
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.content.message = message.into();
        self
    }

    pub fn with_answer(mut self, answer: impl Into<String>) -> Self {
        self.content.answer = Some(answer.into());
        self
    }

    pub fn with_sources(mut self, sources: Vec<SourceFragment>) -> Self {
        self.content.sources = sources;
        self
    }

    pub fn with_tokens(mut self, tokens: TokenUsage) -> Self {
        self.content.tokens = Some(tokens);
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.content.data = Some(data);
        self
    }

    pub fn with_conversation(mut self, conversation_id: Option<String>) -> Self {
        self.conversation_id = conversation_id;
        self
    }

    pub fn with_intent(mut self, intent: impl Into<String>) -> Self {
        self.metadata.intent = Some(intent.into());
        self
    }

    pub fn with_handler(mut self, handler: impl Into<String>) -> Self {
        self.metadata.handler = Some(handler.into());
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.metadata.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_step(mut self, step_index: usize, total_steps: usize) -> Self {
        self.metadata.step_index = Some(step_index);
        self.metadata.total_steps = Some(total_steps);
        self
    }

    /// Whether this event closes its task's lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(
            (self.event_type, self.stage),
            (EventType::Result, Stage::Complete) | (EventType::Error, Stage::Failed)
        )
    }
}
