use super::{Agent, TaskContext};
use crate::llm::{GenerationRequest, LlmGateway};
use crate::models::{AgentKind, Capability, Task, TaskOutput};
use crate::prompts::{keys, PromptRegistry};
use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Conversational specialist. One gateway call, no retrieval.
pub struct ChatAgent {
    gateway: Arc<LlmGateway>,
    prompts: Arc<PromptRegistry>,
}

impl ChatAgent {
    pub fn new(gateway: Arc<LlmGateway>, prompts: Arc<PromptRegistry>) -> Self {
        Self { gateway, prompts }
    }
}

#[async_trait]
impl Agent for ChatAgent {
    fn kind(&self) -> AgentKind {
        AgentKind::CasualChat
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::Chat]
    }

    async fn handle(&self, task: &Task, ctx: &TaskContext) -> Result<TaskOutput> {
        let template = self.prompts.get(keys::CHAT)?;
        let mut values = HashMap::new();
        values.insert("query".to_string(), task.query().to_string());

        ctx.cancel.ensure_active()?;
        let generation = self
            .gateway
            .generate(
                GenerationRequest::from_template(template, &values)?
                    .with_session(&task.session_id)
                    .cached(),
            )
            .await?;
        ctx.cancel.ensure_active()?;

        debug!(task_id = %task.id, cached = generation.cached, "Chat response ready");
        Ok(TaskOutput {
            answer: generation.content,
            sources: Vec::new(),
            tokens: Some(generation.usage),
            data: None,
        })
    }
}
