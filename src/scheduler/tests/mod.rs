mod integration;

use crate::agents::{Agent, TaskContext};
use crate::models::{AgentKind, Capability, Task, TaskOutput, TokenUsage};
use crate::{ChorusError, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Completes immediately with a canned answer.
pub(crate) struct InstantAgent {
    pub kind: AgentKind,
}

#[async_trait]
impl Agent for InstantAgent {
    fn kind(&self) -> AgentKind {
        self.kind
    }
    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::Chat]
    }
    async fn handle(&self, task: &Task, _ctx: &TaskContext) -> Result<TaskOutput> {
        Ok(TaskOutput {
            answer: format!("done: {}", task.query()),
            tokens: Some(TokenUsage {
                prompt: 5,
                completion: 5,
                total: 10,
                cost: 0.0,
            }),
            ..TaskOutput::default()
        })
    }
}

/// Blocks until the shared gate hands out a permit. Observes cancellation
/// while waiting.
pub(crate) struct GatedAgent {
    pub kind: AgentKind,
    pub gate: Arc<Semaphore>,
}

#[async_trait]
impl Agent for GatedAgent {
    fn kind(&self) -> AgentKind {
        self.kind
    }
    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::Chat]
    }
    async fn handle(&self, _task: &Task, ctx: &TaskContext) -> Result<TaskOutput> {
        loop {
            ctx.cancel.ensure_active()?;
            match tokio::time::timeout(
                std::time::Duration::from_millis(20),
                self.gate.acquire(),
            )
            .await
            {
                Ok(permit) => {
                    permit.expect("gate never closed").forget();
                    ctx.cancel.ensure_active()?;
                    return Ok(TaskOutput {
                        answer: "released".to_string(),
                        ..TaskOutput::default()
                    });
                }
                Err(_) => continue,
            }
        }
    }
}

/// Fails the first `failures` invocations, then succeeds.
pub(crate) struct FlakyAgent {
    pub kind: AgentKind,
    pub failures: AtomicU32,
    pub transient: bool,
    pub calls: AtomicU32,
}

impl FlakyAgent {
    pub fn new(kind: AgentKind, failures: u32, transient: bool) -> Self {
        Self {
            kind,
            failures: AtomicU32::new(failures),
            transient,
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl Agent for FlakyAgent {
    fn kind(&self) -> AgentKind {
        self.kind
    }
    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::Chat]
    }
    async fn handle(&self, _task: &Task, _ctx: &TaskContext) -> Result<TaskOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failures.load(Ordering::SeqCst) > 0 {
            self.failures.fetch_sub(1, Ordering::SeqCst);
            return Err(ChorusError::Llm {
                message: "upstream hiccup".to_string(),
                transient: self.transient,
            });
        }
        Ok(TaskOutput {
            answer: "recovered".to_string(),
            ..TaskOutput::default()
        })
    }
}
