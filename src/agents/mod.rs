//! Specialist agents.
//!
//! Each specialist is a thin handler over the LLM gateway and retrieval
//! layer. Specialists declare their capability set up front; the scheduler
//! routes by declared capability, never by probing.

pub mod chat;
pub mod compute;
pub mod knowledge;
pub mod text;
pub mod tool;

pub use chat::ChatAgent;
pub use compute::ComputeAgent;
pub use knowledge::KnowledgeAgent;
pub use text::{SummarizeAgent, TranslateAgent};
pub use tool::{EchoAdapter, ToolAdapter, ToolAgent};

use crate::events::EventBus;
use crate::models::{AgentKind, Capability, Task, TaskOutput};
use crate::{ChorusError, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation flag shared between the scheduler and a running
/// handler. Handlers check it before and after every suspension point.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Returns `Interrupted` once the flag is set, so handlers can bail with
    /// `?` at each checkpoint.
    pub fn ensure_active(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(ChorusError::Interrupted)
        } else {
            Ok(())
        }
    }
}

/// Per-task execution context handed to a specialist by the scheduler.
#[derive(Clone)]
pub struct TaskContext {
    pub session_id: String,
    pub task_id: String,
    pub cancel: CancelFlag,
    pub bus: Arc<EventBus>,
}

#[async_trait]
pub trait Agent: Send + Sync {
    fn kind(&self) -> AgentKind;
    fn capabilities(&self) -> &'static [Capability];

    /// Process one task to completion. Implementations must observe
    /// `ctx.cancel` around every suspension point and must route all model
    /// and store access through the gateway and retrieval layer.
    async fn handle(&self, task: &Task, ctx: &TaskContext) -> Result<TaskOutput>;
}
