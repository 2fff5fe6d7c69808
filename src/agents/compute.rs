use super::{Agent, TaskContext};
use crate::llm::{GenerationRequest, LlmGateway};
use crate::models::{AgentKind, Capability, Task, TaskOutput};
use crate::{ChorusError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Expression evaluation specialist.
///
/// Tries the raw query as an expression first; if that fails to parse, asks
/// the gateway to extract a bare expression from the natural-language query
/// and evaluates the extraction. Evaluation itself is local and
/// deterministic.
pub struct ComputeAgent {
    gateway: Arc<LlmGateway>,
}

impl ComputeAgent {
    pub fn new(gateway: Arc<LlmGateway>) -> Self {
        Self { gateway }
    }

    fn evaluate(expression: &str) -> Result<String> {
        match evalexpr::eval(expression) {
            Ok(value) => Ok(value.to_string()),
            Err(e) => Err(ChorusError::BadInput(format!(
                "cannot evaluate expression: {e}"
            ))),
        }
    }
}

#[async_trait]
impl Agent for ComputeAgent {
    fn kind(&self) -> AgentKind {
        AgentKind::Compute
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::Arithmetic]
    }

    async fn handle(&self, task: &Task, ctx: &TaskContext) -> Result<TaskOutput> {
        let query = task
            .input
            .get("expression")
            .cloned()
            .unwrap_or_else(|| task.query().to_string());

        if let Ok(value) = Self::evaluate(&query) {
            debug!(task_id = %task.id, "Evaluated expression directly");
            return Ok(TaskOutput {
                answer: value,
                ..TaskOutput::default()
            });
        }

        // Natural-language input: extract a bare expression through the
        // gateway so the call is accounted like every other generation.
        ctx.cancel.ensure_active()?;
        let generation = self
            .gateway
            .generate(GenerationRequest {
                prompt: format!(
                    "Extract the arithmetic expression from this request and output ONLY \
                     the expression, nothing else: {query}"
                ),
                system: None,
                temperature: 0.0,
                max_tokens: 100,
                session_id: Some(task.session_id.clone()),
                use_cache: true,
            })
            .await?;
        ctx.cancel.ensure_active()?;

        let expression = generation.content.trim().to_string();
        let value = Self::evaluate(&expression)?;
        Ok(TaskOutput {
            answer: value,
            tokens: Some(generation.usage),
            data: Some(serde_json::json!({ "expression": expression })),
            ..TaskOutput::default()
        })
    }
}
