use super::{Agent, TaskContext};
use crate::models::{AgentKind, Capability, Task, TaskOutput};
use crate::{ChorusError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use tracing::debug;

/// External tool adapter seam. Spreadsheet, email, and web-search adapters
/// plug in here; the engine only sees named adapters taking and returning
/// JSON.
#[async_trait]
pub trait ToolAdapter: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    async fn invoke(&self, args: &serde_json::Value) -> Result<serde_json::Value>;
}

/// Tool specialist: dispatches to a registered adapter by name.
pub struct ToolAgent {
    adapters: HashMap<String, Box<dyn ToolAdapter>>,
}

impl ToolAgent {
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    pub fn with_adapter(mut self, adapter: Box<dyn ToolAdapter>) -> Self {
        self.adapters.insert(adapter.name().to_string(), adapter);
        self
    }

    pub fn adapter_names(&self) -> Vec<&str> {
        self.adapters.keys().map(String::as_str).collect()
    }
}

impl Default for ToolAgent {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Agent for ToolAgent {
    fn kind(&self) -> AgentKind {
        AgentKind::ToolUse
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::ToolInvocation]
    }

    async fn handle(&self, task: &Task, ctx: &TaskContext) -> Result<TaskOutput> {
        let tool_name = task
            .input
            .get("tool")
            .ok_or_else(|| ChorusError::BadInput("task input missing 'tool'".to_string()))?;
        let adapter = self
            .adapters
            .get(tool_name)
            .ok_or_else(|| ChorusError::NotFound(format!("tool: {tool_name}")))?;

        let args: serde_json::Value = match task.input.get("args") {
            Some(raw) => serde_json::from_str(raw)
                .map_err(|e| ChorusError::BadInput(format!("tool args are not JSON: {e}")))?,
            None => serde_json::json!({}),
        };

        ctx.cancel.ensure_active()?;
        let output = adapter.invoke(&args).await?;
        ctx.cancel.ensure_active()?;

        debug!(task_id = %task.id, tool = %tool_name, "Tool invocation complete");
        Ok(TaskOutput {
            answer: output
                .get("summary")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| output.to_string()),
            data: Some(output),
            ..TaskOutput::default()
        })
    }
}

/// Trivial adapter that reflects its arguments back. Useful as a smoke-test
/// target and as the reference adapter implementation.
pub struct EchoAdapter;

#[async_trait]
impl ToolAdapter for EchoAdapter {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Returns its arguments unchanged"
    }

    async fn invoke(&self, args: &serde_json::Value) -> Result<serde_json::Value> {
        Ok(serde_json::json!({ "summary": args.to_string(), "echo": args }))
    }
}
