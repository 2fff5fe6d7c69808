use serde::{Deserialize, Serialize};
use std::{collections::HashMap, str::FromStr};
use uuid::Uuid;

/// Represents a unit of scheduled work assigned to exactly one agent.
///
/// Tasks are the fundamental unit of work in Chorus Core. Each task targets a
/// specific agent kind, carries a free-form key/value input payload, and
/// moves strictly forward through its lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub session_id: String,
    pub agent: AgentKind,
    pub input: HashMap<String, String>,
    pub priority: Priority,
    pub state: TaskState,
    pub parent_id: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub ended_at: Option<chrono::DateTime<chrono::Utc>>,
    pub retry_count: u32,
}

/// Task priority in [1..10]; higher is more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(u8);

impl Priority {
    pub const MIN: Priority = Priority(1);
    pub const MAX: Priority = Priority(10);

    pub fn new(value: u8) -> Option<Self> {
        (1..=10).contains(&value).then_some(Priority(value))
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority(5)
    }
}

/// Task lifecycle states. Transitions are strictly forward; a terminal state
/// (`Succeeded`, `Failed`, `Interrupted`) is never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Interrupted,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Interrupted
        )
    }
}

/// The specialist agents available in the system. Each kind has a declared
/// capability set and a stable wire name.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    CasualChat,
    Knowledge,
    Compute,
    Translate,
    Summarize,
    ToolUse,
}

/// Declared agent capabilities; the scheduler matches tasks against these
/// instead of probing agents with string checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Chat,
    Retrieval,
    Synthesis,
    Arithmetic,
    Translation,
    Summarization,
    ToolInvocation,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::CasualChat => "casual_chat",
            AgentKind::Knowledge => "knowledge",
            AgentKind::Compute => "compute",
            AgentKind::Translate => "translate",
            AgentKind::Summarize => "summarize",
            AgentKind::ToolUse => "tool_use",
        }
    }

    /// Human-readable role description surfaced in agent references on events.
    pub fn role(&self) -> &'static str {
        match self {
            AgentKind::CasualChat => "Conversational assistant",
            AgentKind::Knowledge => "Knowledge retrieval and synthesis",
            AgentKind::Compute => "Expression evaluation",
            AgentKind::Translate => "Translation",
            AgentKind::Summarize => "Summarization",
            AgentKind::ToolUse => "External tool invocation",
        }
    }

    pub fn icon(&self) -> &'static str {
        match self {
            AgentKind::CasualChat => "message-circle",
            AgentKind::Knowledge => "book-open",
            AgentKind::Compute => "calculator",
            AgentKind::Translate => "languages",
            AgentKind::Summarize => "file-text",
            AgentKind::ToolUse => "wrench",
        }
    }
}

impl FromStr for AgentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "casual_chat" => Ok(AgentKind::CasualChat),
            "knowledge" => Ok(AgentKind::Knowledge),
            "compute" => Ok(AgentKind::Compute),
            "translate" => Ok(AgentKind::Translate),
            "summarize" => Ok(AgentKind::Summarize),
            "tool_use" => Ok(AgentKind::ToolUse),
            _ => Err(format!("Unknown agent kind: {s}")),
        }
    }
}

/// Classifier output drawn from the fixed intent set.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    CasualChat,
    KnowledgeLookup,
    Compute,
    Translate,
    Summarize,
    ToolUse,
    PlanAndExecute,
    Unknown,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::CasualChat => "casual_chat",
            Intent::KnowledgeLookup => "knowledge_lookup",
            Intent::Compute => "compute",
            Intent::Translate => "translate",
            Intent::Summarize => "summarize",
            Intent::ToolUse => "tool_use",
            Intent::PlanAndExecute => "plan_and_execute",
            Intent::Unknown => "unknown",
        }
    }

    /// Intents handled by dispatching a single specialist task.
    pub fn is_direct(&self) -> bool {
        matches!(
            self,
            Intent::CasualChat
                | Intent::Translate
                | Intent::Summarize
                | Intent::Compute
                | Intent::ToolUse
        )
    }

    /// The specialist that serves a direct intent.
    pub fn direct_agent(&self) -> Option<AgentKind> {
        match self {
            Intent::CasualChat => Some(AgentKind::CasualChat),
            Intent::Compute => Some(AgentKind::Compute),
            Intent::Translate => Some(AgentKind::Translate),
            Intent::Summarize => Some(AgentKind::Summarize),
            Intent::ToolUse => Some(AgentKind::ToolUse),
            _ => None,
        }
    }
}

impl FromStr for Intent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "casual_chat" => Ok(Intent::CasualChat),
            "knowledge_lookup" => Ok(Intent::KnowledgeLookup),
            "compute" => Ok(Intent::Compute),
            "translate" => Ok(Intent::Translate),
            "summarize" => Ok(Intent::Summarize),
            "tool_use" => Ok(Intent::ToolUse),
            "plan_and_execute" => Ok(Intent::PlanAndExecute),
            "unknown" => Ok(Intent::Unknown),
            _ => Err(format!("Unknown intent: {s}")),
        }
    }
}

/// A retrieved document chunk with relevance score and provenance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceFragment {
    pub store: String,
    pub document_id: String,
    pub score: f64,
    pub text: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

/// Token usage for a single generation plus its computed cost.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TokenUsage {
    pub prompt: u64,
    pub completion: u64,
    pub total: u64,
    pub cost: f64,
}

/// One conversation turn inside a session. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: TurnRole,
    pub text: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<SourceFragment>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    User,
    Assistant,
}

/// Result payload produced by a specialist handler.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskOutput {
    pub answer: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<SourceFragment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Task {
    /// Creates a new queued task for the given agent and session.
    pub fn new(session_id: impl Into<String>, agent: AgentKind, priority: Priority) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            agent,
            input: HashMap::new(),
            priority,
            state: TaskState::Queued,
            parent_id: None,
            created_at: chrono::Utc::now(),
            started_at: None,
            ended_at: None,
            retry_count: 0,
        }
    }

    pub fn with_input(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.input.insert(key.into(), value.into());
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    /// The user-facing query carried by this task, if any.
    pub fn query(&self) -> &str {
        self.input.get("query").map(String::as_str).unwrap_or("")
    }
}
