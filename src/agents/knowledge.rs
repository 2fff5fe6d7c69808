use super::{Agent, TaskContext};
use crate::llm::{GenerationRequest, LlmGateway};
use crate::models::{AgentKind, Capability, SourceFragment, Task, TaskOutput};
use crate::prompts::{keys, PromptRegistry};
use crate::retrieval::RetrievalLayer;
use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

const DEFAULT_TOP_K: usize = 5;

/// Retrieval specialist: fan out across knowledge stores, then synthesize an
/// answer grounded in the retrieved fragments.
pub struct KnowledgeAgent {
    retrieval: Arc<RetrievalLayer>,
    gateway: Arc<LlmGateway>,
    prompts: Arc<PromptRegistry>,
}

impl KnowledgeAgent {
    pub fn new(
        retrieval: Arc<RetrievalLayer>,
        gateway: Arc<LlmGateway>,
        prompts: Arc<PromptRegistry>,
    ) -> Self {
        Self {
            retrieval,
            gateway,
            prompts,
        }
    }

    fn format_context(fragments: &[SourceFragment]) -> String {
        fragments
            .iter()
            .map(|f| format!("[{}] {}", f.document_id, f.text))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

#[async_trait]
impl Agent for KnowledgeAgent {
    fn kind(&self) -> AgentKind {
        AgentKind::Knowledge
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::Retrieval, Capability::Synthesis]
    }

    async fn handle(&self, task: &Task, ctx: &TaskContext) -> Result<TaskOutput> {
        let query = task.query().to_string();
        let k = task
            .input
            .get("top_k")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_TOP_K);

        // Explicit store list in the task input wins; otherwise the router
        // picks from store descriptions.
        ctx.cancel.ensure_active()?;
        let sources = match task.input.get("stores") {
            Some(raw) => {
                let names: Vec<String> = raw
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
                self.retrieval.query_multi(&names, &query, k).await?
            }
            None => self.retrieval.query_auto(&query, k).await?,
        };
        ctx.cancel.ensure_active()?;

        ctx.bus
            .emit_retrieval(
                &ctx.session_id,
                &ctx.task_id,
                self.kind().into(),
                sources.clone(),
                format!("retrieved {} fragment(s)", sources.len()),
            )
            .await;

        if sources.is_empty() {
            debug!(task_id = %task.id, "No fragments retrieved, answering without context");
        }

        let template = self.prompts.get(keys::RAG_SYNTHESIS)?;
        let mut values = HashMap::new();
        values.insert("context".to_string(), Self::format_context(&sources));
        values.insert("query".to_string(), query);
        if let Some(feedback) = task.input.get("feedback") {
            // Carry validator feedback into the regeneration attempt.
            values.insert(
                "query".to_string(),
                format!("{}\n\nRevise to address: {}", task.query(), feedback),
            );
        }

        ctx.cancel.ensure_active()?;
        let generation = self
            .gateway
            .generate(
                GenerationRequest::from_template(template, &values)?
                    .with_session(&task.session_id),
            )
            .await?;
        ctx.cancel.ensure_active()?;

        Ok(TaskOutput {
            answer: generation.content,
            sources,
            tokens: Some(generation.usage),
            data: None,
        })
    }
}
