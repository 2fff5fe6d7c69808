//! Manager orchestrator: the top-level control loop binding classifier,
//! planner, scheduler, specialists, quality control, and synthesis.
//!
//! Per request the manager walks
//! `RECEIVED → CLASSIFIED → {DIRECT | PLANNED} → EXECUTING → VALIDATING →
//! {COMPLETE | RETRYING | FAILED}`, emitting a stage event at every
//! transition. Specialist failures and interruptions are announced by the
//! scheduler; the manager announces everything else, including the single
//! terminal `result` event of a request.

pub mod planner;

pub use planner::{PlanStep, Planner};

use crate::classifier::{Classification, QueryClassifier};
use crate::constants;
use crate::events::{AgentRef, EventBus, EventType, Stage, UnifiedEvent};
use crate::llm::{GenerationRequest, LlmGateway};
use crate::messages::InterruptTarget;
use crate::models::{
    AgentKind, Intent, Priority, SourceFragment, Task, TaskOutput, TaskState, TokenUsage,
};
use crate::prompts::{keys, PromptRegistry};
use crate::quality::QualityController;
use crate::scheduler::{Scheduler, TaskCompletion};
use crate::session::SessionStore;
use crate::{ChorusError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Client-supplied options accompanying a message.
#[derive(Debug, Clone, Default)]
pub struct MessageOptions {
    pub conversation_id: Option<String>,
    /// Restrict retrieval to these stores instead of auto-routing.
    pub stores: Option<Vec<String>>,
    pub top_k: Option<usize>,
    pub priority: Option<Priority>,
}

enum StepOutcome {
    Done(TaskOutput, Task),
    /// Scheduler already announced the terminal event for this task.
    Halted(TaskState),
}

#[derive(Clone)]
pub struct Manager {
    scheduler: Scheduler,
    classifier: Arc<QueryClassifier>,
    planner: Arc<Planner>,
    quality: Arc<QualityController>,
    sessions: Arc<SessionStore>,
    bus: Arc<EventBus>,
    gateway: Arc<LlmGateway>,
    prompts: Arc<PromptRegistry>,
    synthesize_plans: bool,
}

impl Manager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        scheduler: Scheduler,
        classifier: Arc<QueryClassifier>,
        planner: Arc<Planner>,
        quality: Arc<QualityController>,
        sessions: Arc<SessionStore>,
        bus: Arc<EventBus>,
        gateway: Arc<LlmGateway>,
        prompts: Arc<PromptRegistry>,
        synthesize_plans: bool,
    ) -> Self {
        Self {
            scheduler,
            classifier,
            planner,
            quality,
            sessions,
            bus,
            gateway,
            prompts,
            synthesize_plans,
        }
    }

    /// Accept a user message: returns the request's task id immediately and
    /// processes the request in the background, streaming events to the
    /// session's subscribers.
    pub async fn submit_message(
        &self,
        session_id: &str,
        text: &str,
        options: MessageOptions,
    ) -> Result<String> {
        let request_id = Uuid::new_v4().to_string();
        let manager = self.clone();
        let session_id = session_id.to_string();
        let text = text.to_string();
        let id = request_id.clone();
        tokio::spawn(async move {
            if let Err(e) = manager.run_request(&session_id, &id, &text, options).await {
                // Pipeline errors happen strictly before the terminal result
                // is announced, so this is the request's one terminal event.
                warn!(request_id = %id, "Request pipeline error: {}", e);
                manager
                    .bus
                    .emit_error(
                        &session_id,
                        &id,
                        AgentRef::system(),
                        e.kind(),
                        e.client_message(),
                        None,
                        true,
                    )
                    .await;
            }
        });
        Ok(request_id)
    }

    pub async fn interrupt_task(&self, task_id: &str) -> Result<()> {
        self.scheduler
            .interrupt(InterruptTarget::Task(task_id.to_string()))
            .await
    }

    pub async fn interrupt_session(&self, session_id: &str) -> Vec<String> {
        self.scheduler.interrupt_session(session_id).await
    }

    /// Delete a session: interrupt descendants, wait for them to settle,
    /// then remove all state.
    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        let interrupted = self.scheduler.interrupt_session(session_id).await;
        for task_id in &interrupted {
            let _ = self.scheduler.wait(task_id).await;
        }
        self.scheduler.forget_session(session_id).await;
        self.bus.drop_session(session_id).await;
        self.gateway.forget_session(session_id).await;
        self.sessions.delete(session_id).await
    }

    /// Run the full request state machine. Public so callers that need the
    /// final state (tests, synchronous tooling) can await it directly.
    pub async fn run_request(
        &self,
        session_id: &str,
        request_id: &str,
        text: &str,
        options: MessageOptions,
    ) -> Result<()> {
        let clock = Instant::now();

        // RECEIVED
        self.sessions.append_user_turn(session_id, text).await?;
        self.bus
            .emit(
                UnifiedEvent::new(
                    session_id,
                    request_id,
                    EventType::Init,
                    Stage::Init,
                    AgentRef::system(),
                )
                .with_message("request received")
                .with_conversation(options.conversation_id.clone()),
            )
            .await;

        // CLASSIFIED
        let classification = self.classify(text, session_id).await?;
        self.bus
            .emit(
                UnifiedEvent::new(
                    session_id,
                    request_id,
                    EventType::Status,
                    Stage::Classifying,
                    AgentRef::system(),
                )
                .with_message(classification.reason.clone())
                .with_intent(classification.intent.as_str())
                .with_conversation(options.conversation_id.clone()),
            )
            .await;

        // Unclassifiable queries take the conversational path rather than
        // dead-ending the request.
        let intent = match classification.intent {
            Intent::Unknown => Intent::CasualChat,
            other => other,
        };

        if intent.is_direct() {
            self.run_direct(session_id, request_id, text, intent, &options, clock)
                .await
        } else {
            self.run_planned(session_id, request_id, text, intent, &options, clock)
                .await
        }
    }

    // ── Classification ──────────────────────────────────────────────────

    async fn classify(&self, text: &str, session_id: &str) -> Result<Classification> {
        // Greeting fast path: trivial queries never reach the model.
        if Self::is_greeting(text) {
            return Ok(Classification {
                intent: Intent::CasualChat,
                confidence: 1.0,
                reason: "greeting fast path".to_string(),
            });
        }

        let classification = self.classifier.classify(text, None, session_id).await?;
        if classification.confidence < constants::CLASSIFIER_CONFIDENCE_FLOOR
            && (Self::token_count(text) <= constants::GREETING_MAX_TOKENS
                || Self::is_greeting(text))
        {
            debug!("Low-confidence short query, forcing casual chat");
            return Ok(Classification {
                intent: Intent::CasualChat,
                confidence: classification.confidence,
                reason: "short low-confidence query".to_string(),
            });
        }
        Ok(classification)
    }

    fn token_count(text: &str) -> usize {
        text.split_whitespace().count()
    }

    fn is_greeting(text: &str) -> bool {
        let normalized = text
            .trim()
            .trim_end_matches(['!', '.', '?', ','])
            .to_lowercase();
        constants::GREETINGS.contains(&normalized.as_str())
    }

    // ── Execution paths ─────────────────────────────────────────────────

    async fn run_direct(
        &self,
        session_id: &str,
        request_id: &str,
        text: &str,
        intent: Intent,
        options: &MessageOptions,
        clock: Instant,
    ) -> Result<()> {
        let agent = intent
            .direct_agent()
            .expect("direct intents always map to an agent");
        let task = self.build_task(request_id, session_id, agent, text, options);

        match self.execute_step(task).await? {
            StepOutcome::Done(output, task) => {
                // Small talk is not quality-gated; substantive intents are.
                let validate = intent != Intent::CasualChat;
                self.validate_and_complete(
                    session_id, request_id, text, intent, output, task, clock, validate,
                )
                .await
            }
            StepOutcome::Halted(state) => {
                info!(request_id = %request_id, ?state, "Request halted during execution");
                Ok(())
            }
        }
    }

    async fn run_planned(
        &self,
        session_id: &str,
        request_id: &str,
        text: &str,
        intent: Intent,
        options: &MessageOptions,
        clock: Instant,
    ) -> Result<()> {
        let steps = self.planner.plan(text, intent, session_id).await?;
        self.bus
            .emit(
                UnifiedEvent::new(
                    session_id,
                    request_id,
                    EventType::Status,
                    Stage::Planning,
                    AgentRef::system(),
                )
                .with_message(format!("plan with {} step(s)", steps.len()))
                .with_intent(intent.as_str()),
            )
            .await;

        let total = steps.len();
        let mut outputs: Vec<(AgentKind, TaskOutput)> = Vec::with_capacity(total);
        let mut all_sources: Vec<SourceFragment> = Vec::new();
        let mut last_task: Option<Task> = None;

        for (index, step) in steps.into_iter().enumerate() {
            self.bus
                .emit_progress(
                    session_id,
                    request_id,
                    AgentRef::system(),
                    index + 1,
                    total,
                    format!("step {} of {}: {}", index + 1, total, step.agent.as_str()),
                )
                .await;

            // Single-step plans reuse the request id so the whole event
            // stream shares one task id; multi-step plans get child tasks.
            let mut task = if total == 1 {
                self.build_task(request_id, session_id, step.agent, &step.input, options)
            } else {
                let mut child = Task::new(session_id, step.agent, self.priority_of(options))
                    .with_parent(request_id);
                child = child.with_input("query", step.input.clone());
                self.apply_retrieval_options(child, options)
            };
            if let Some((_, previous)) = outputs.last() {
                task = task.with_input("context", previous.answer.clone());
            }

            match self.execute_step(task).await? {
                StepOutcome::Done(output, task) => {
                    all_sources.extend(output.sources.clone());
                    outputs.push((step.agent, output));
                    last_task = Some(task);
                }
                StepOutcome::Halted(state) => {
                    self.halt_planned_request(session_id, request_id, state)
                        .await;
                    return Ok(());
                }
            }
        }

        let (_, last_output) = outputs
            .last()
            .cloned()
            .ok_or_else(|| ChorusError::Internal(anyhow::anyhow!("plan produced no steps")))?;

        let (answer, synth_tokens) = if self.synthesize_plans && outputs.len() > 1 {
            self.synthesize(session_id, request_id, text, &outputs).await?
        } else {
            (last_output.answer.clone(), None)
        };

        let mut output = last_output;
        output.answer = answer;
        output.sources = dedupe_sources(all_sources);
        if let Some(tokens) = synth_tokens {
            output.tokens = Some(merge_tokens(output.tokens.take(), tokens));
        }

        let task = last_task
            .ok_or_else(|| ChorusError::Internal(anyhow::anyhow!("plan produced no tasks")))?;
        self.validate_and_complete(
            session_id, request_id, text, intent, output, task, clock, true,
        )
        .await
    }

    async fn synthesize(
        &self,
        session_id: &str,
        request_id: &str,
        text: &str,
        outputs: &[(AgentKind, TaskOutput)],
    ) -> Result<(String, Option<TokenUsage>)> {
        self.bus
            .emit_thinking(
                session_id,
                request_id,
                AgentRef::system(),
                Stage::Synthesis,
                "combining step outputs",
            )
            .await;

        let listing = outputs
            .iter()
            .enumerate()
            .map(|(i, (agent, output))| {
                format!("{}. [{}] {}", i + 1, agent.as_str(), output.answer)
            })
            .collect::<Vec<_>>()
            .join("\n");
        let template = self.prompts.get(keys::PLAN_SYNTHESIS)?;
        let mut values = HashMap::new();
        values.insert("query".to_string(), text.to_string());
        values.insert("steps".to_string(), listing);

        let generation = self
            .gateway
            .generate(GenerationRequest::from_template(template, &values)?.with_session(session_id))
            .await?;
        Ok((generation.content, Some(generation.usage)))
    }

    // ── Validation & completion ─────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    async fn validate_and_complete(
        &self,
        session_id: &str,
        request_id: &str,
        query: &str,
        intent: Intent,
        mut output: TaskOutput,
        mut task: Task,
        clock: Instant,
        validate: bool,
    ) -> Result<()> {
        let mut low_confidence = false;

        while validate {
            let report = self
                .quality
                .validate(query, &output.answer, &output.sources, session_id)
                .await?;
            if report.ok {
                break;
            }

            let Some(retry) = self.quality.retry_with_feedback(&task, &report.issues) else {
                // Budget exhausted: the last answer ships, flagged.
                low_confidence = true;
                break;
            };

            self.bus
                .emit(
                    UnifiedEvent::new(
                        session_id,
                        request_id,
                        EventType::Status,
                        Stage::Executing,
                        task.agent.into(),
                    )
                    .with_message("retrying")
                    .with_data(serde_json::json!({ "issues": report.issues })),
                )
                .await;

            match self.execute_step(retry).await? {
                StepOutcome::Done(new_output, new_task) => {
                    // Retrieval-seen sources accumulate across attempts so
                    // the final result only ever cites observed fragments.
                    let mut sources = output.sources;
                    sources.extend(new_output.sources.clone());
                    output = new_output;
                    output.sources = dedupe_sources(sources);
                    task = new_task;
                }
                StepOutcome::Halted(state) => {
                    self.halt_planned_request(session_id, request_id, state)
                        .await;
                    return Ok(());
                }
            }
        }

        let duration_ms = clock.elapsed().as_millis() as u64;
        let mut result = UnifiedEvent::new(
            session_id,
            request_id,
            EventType::Result,
            Stage::Complete,
            task.agent.into(),
        )
        .with_message("completed")
        .with_answer(output.answer.clone())
        .with_sources(output.sources.clone())
        .with_intent(intent.as_str())
        .with_handler(task.agent.as_str())
        .with_duration_ms(duration_ms);
        if let Some(tokens) = output.tokens.clone() {
            result = result.with_tokens(tokens);
        }
        if low_confidence {
            result = result.with_data(serde_json::json!({ "low_confidence": true }));
        }
        self.bus.emit(result).await;

        // The result is already announced; a persistence hiccup on the turn
        // must not surface as a second terminal event.
        if let Err(e) = self
            .sessions
            .append_assistant_turn(session_id, &output.answer, output.sources)
            .await
        {
            warn!(session_id = %session_id, "Failed to persist assistant turn: {}", e);
        }
        info!(request_id = %request_id, duration_ms, "Request complete");
        Ok(())
    }

    // ── Plumbing ────────────────────────────────────────────────────────

    async fn execute_step(&self, task: Task) -> Result<StepOutcome> {
        let task_id = self.scheduler.submit_deferred(task).await?;
        let completion: TaskCompletion = self.scheduler.wait(&task_id).await?;
        match completion.state {
            TaskState::Succeeded => {
                let output = completion.output.ok_or_else(|| {
                    ChorusError::Internal(anyhow::anyhow!("succeeded task without output"))
                })?;
                let task = self
                    .scheduler
                    .get_task(&task_id)
                    .await
                    .ok_or_else(|| ChorusError::NotFound(format!("task: {task_id}")))?;
                Ok(StepOutcome::Done(output, task))
            }
            state => Ok(StepOutcome::Halted(state)),
        }
    }

    /// Emit the request-level terminal event for a halted plan, unless the
    /// halted step already was the request task itself.
    async fn halt_planned_request(&self, session_id: &str, request_id: &str, state: TaskState) {
        let request_task_settled = self.scheduler.get_task(request_id).await.is_some();
        if request_task_settled {
            return;
        }
        match state {
            TaskState::Interrupted => {
                self.bus
                    .emit(
                        UnifiedEvent::new(
                            session_id,
                            request_id,
                            EventType::Status,
                            Stage::Executing,
                            AgentRef::system(),
                        )
                        .with_message("interrupted")
                        .with_data(serde_json::json!({ "kind": "interrupted" })),
                    )
                    .await;
            }
            _ => {
                self.bus
                    .emit_error(
                        session_id,
                        request_id,
                        AgentRef::system(),
                        crate::error::ErrorKind::Internal,
                        "a plan step failed",
                        None,
                        true,
                    )
                    .await;
            }
        }
    }

    fn priority_of(&self, options: &MessageOptions) -> Priority {
        options.priority.unwrap_or_default()
    }

    fn build_task(
        &self,
        request_id: &str,
        session_id: &str,
        agent: AgentKind,
        query: &str,
        options: &MessageOptions,
    ) -> Task {
        let mut task = Task::new(session_id, agent, self.priority_of(options));
        task.id = request_id.to_string();
        task = task.with_input("query", query);
        self.apply_retrieval_options(task, options)
    }

    fn apply_retrieval_options(&self, mut task: Task, options: &MessageOptions) -> Task {
        if task.agent == AgentKind::Knowledge {
            if let Some(stores) = &options.stores {
                task = task.with_input("stores", stores.join(","));
            }
            if let Some(top_k) = options.top_k {
                task = task.with_input("top_k", top_k.to_string());
            }
        }
        task
    }
}

fn dedupe_sources(sources: Vec<SourceFragment>) -> Vec<SourceFragment> {
    let mut seen = std::collections::HashSet::new();
    sources
        .into_iter()
        .filter(|s| seen.insert(s.document_id.clone()))
        .collect()
}

fn merge_tokens(existing: Option<TokenUsage>, extra: TokenUsage) -> TokenUsage {
    let base = existing.unwrap_or_default();
    TokenUsage {
        prompt: base.prompt + extra.prompt,
        completion: base.completion + extra.completion,
        total: base.total + extra.total,
        cost: base.cost + extra.cost,
    }
}
