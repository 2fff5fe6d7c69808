//! Translation and summarization specialists. Both are single gateway calls
//! with dedicated templates; they exist as separate agents so the scheduler
//! can track and bound them independently.

use super::{Agent, TaskContext};
use crate::llm::{GenerationRequest, LlmGateway};
use crate::models::{AgentKind, Capability, Task, TaskOutput};
use crate::prompts::{keys, PromptRegistry};
use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

async fn run_template(
    gateway: &LlmGateway,
    prompts: &PromptRegistry,
    template_key: &str,
    task: &Task,
    ctx: &TaskContext,
) -> Result<TaskOutput> {
    let template = prompts.get(template_key)?;
    let mut values = HashMap::new();
    // Plan steps carry the previous step's output as context; it becomes
    // part of the material to work on.
    let query = match task.input.get("context") {
        Some(context) => format!("{}\n\n{}", task.query(), context),
        None => task.query().to_string(),
    };
    values.insert("query".to_string(), query);

    ctx.cancel.ensure_active()?;
    let generation = gateway
        .generate(
            GenerationRequest::from_template(template, &values)?.with_session(&task.session_id),
        )
        .await?;
    ctx.cancel.ensure_active()?;

    Ok(TaskOutput {
        answer: generation.content,
        tokens: Some(generation.usage),
        ..TaskOutput::default()
    })
}

pub struct TranslateAgent {
    gateway: Arc<LlmGateway>,
    prompts: Arc<PromptRegistry>,
}

impl TranslateAgent {
    pub fn new(gateway: Arc<LlmGateway>, prompts: Arc<PromptRegistry>) -> Self {
        Self { gateway, prompts }
    }
}

#[async_trait]
impl Agent for TranslateAgent {
    fn kind(&self) -> AgentKind {
        AgentKind::Translate
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::Translation]
    }

    async fn handle(&self, task: &Task, ctx: &TaskContext) -> Result<TaskOutput> {
        run_template(&self.gateway, &self.prompts, keys::TRANSLATE, task, ctx).await
    }
}

pub struct SummarizeAgent {
    gateway: Arc<LlmGateway>,
    prompts: Arc<PromptRegistry>,
}

impl SummarizeAgent {
    pub fn new(gateway: Arc<LlmGateway>, prompts: Arc<PromptRegistry>) -> Self {
        Self { gateway, prompts }
    }
}

#[async_trait]
impl Agent for SummarizeAgent {
    fn kind(&self) -> AgentKind {
        AgentKind::Summarize
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::Summarization]
    }

    async fn handle(&self, task: &Task, ctx: &TaskContext) -> Result<TaskOutput> {
        run_template(&self.gateway, &self.prompts, keys::SUMMARIZE, task, ctx).await
    }
}
