//! Agent registry and concurrency-bounded scheduler.
//!
//! The scheduler owns the task lifecycle: submission, priority dispatch
//! under a global semaphore, cooperative interruption, bounded retries, and
//! completion fan-out to waiters. Specialists never see each other; all
//! routing and interrupt propagation flows through here.

pub mod queue;
pub mod registry;

#[cfg(test)]
mod tests;

pub use queue::TaskQueue;
pub use registry::{AgentRecord, AgentRegistry, AgentState};

use crate::agents::{CancelFlag, TaskContext};
use crate::config::SchedulerConfig;
use crate::constants;
use crate::error::ErrorKind;
use crate::events::{EventBus, EventType, Stage, UnifiedEvent};
use crate::messages::{AgentMessage, Endpoint, InterruptTarget, MessagePayload};
use crate::models::{Task, TaskOutput, TaskState};
use crate::{ChorusError, Result};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Mutex, Notify, Semaphore};
use tracing::{debug, error, info, warn};

/// Terminal outcome of a task, delivered to waiters.
#[derive(Debug, Clone)]
pub struct TaskCompletion {
    pub task_id: String,
    pub state: TaskState,
    pub output: Option<TaskOutput>,
    pub error: Option<TaskError>,
    pub retry_count: u32,
}

#[derive(Debug, Clone)]
pub struct TaskError {
    pub kind: ErrorKind,
    pub message: String,
}

/// Point-in-time scheduler health, exposed through the system status API.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub total_agents: usize,
    pub running: usize,
    pub queued: usize,
    pub agents: Vec<AgentRecord>,
    pub oldest_queued_at: Option<chrono::DateTime<chrono::Utc>>,
    pub uptime_secs: f64,
}

struct SchedulerState {
    tasks: HashMap<String, Task>,
    completions: HashMap<String, TaskCompletion>,
    waiters: HashMap<String, Vec<oneshot::Sender<TaskCompletion>>>,
    cancels: HashMap<String, CancelFlag>,
    children: HashMap<String, Vec<String>>,
    /// Tasks whose terminal `result` event is emitted by the submitter
    /// (the manager validates before announcing completion).
    deferred: HashSet<String>,
}

#[derive(Clone)]
pub struct Scheduler {
    registry: Arc<AgentRegistry>,
    queue: TaskQueue,
    bus: Arc<EventBus>,
    semaphore: Arc<Semaphore>,
    notify: Arc<Notify>,
    state: Arc<Mutex<SchedulerState>>,
    config: SchedulerConfig,
    message_tx: mpsc::UnboundedSender<AgentMessage>,
    message_rx: Arc<std::sync::Mutex<Option<mpsc::UnboundedReceiver<AgentMessage>>>>,
    started: Arc<Instant>,
}

impl Scheduler {
    pub fn new(registry: Arc<AgentRegistry>, bus: Arc<EventBus>, config: SchedulerConfig) -> Self {
        let (message_tx, message_rx) = mpsc::unbounded_channel();
        Self {
            registry,
            queue: TaskQueue::new(config.max_queue_size),
            bus,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_tasks)),
            notify: Arc::new(Notify::new()),
            state: Arc::new(Mutex::new(SchedulerState {
                tasks: HashMap::new(),
                completions: HashMap::new(),
                waiters: HashMap::new(),
                cancels: HashMap::new(),
                children: HashMap::new(),
                deferred: HashSet::new(),
            })),
            config,
            message_tx,
            message_rx: Arc::new(std::sync::Mutex::new(Some(message_rx))),
            started: Arc::new(Instant::now()),
        }
    }

    /// The inter-agent message stream. Can be taken once; later calls
    /// return `None`.
    pub fn take_message_stream(&self) -> Option<mpsc::UnboundedReceiver<AgentMessage>> {
        self.message_rx.lock().expect("message stream lock").take()
    }

    /// Run the dispatch and cleanup loops until the surrounding runtime
    /// shuts down.
    pub async fn run(&self) -> Result<()> {
        info!(
            max_concurrent = self.config.max_concurrent_tasks,
            "Scheduler started"
        );
        let dispatcher = self.clone();
        let dispatch = tokio::spawn(async move { dispatcher.dispatch_loop().await });
        let cleaner = self.clone();
        let cleanup = tokio::spawn(async move { cleaner.cleanup_loop().await });

        tokio::select! {
            result = dispatch => {
                if let Err(e) = result {
                    error!("Dispatch loop failed: {}", e);
                }
            }
            result = cleanup => {
                if let Err(e) = result {
                    error!("Cleanup loop failed: {}", e);
                }
            }
        }
        Ok(())
    }

    /// Submit a task for execution. The scheduler announces the terminal
    /// `result` event itself when the handler succeeds.
    pub async fn submit(&self, task: Task) -> Result<String> {
        self.submit_inner(task, false).await
    }

    /// Submit a task whose terminal `result` event the caller emits after
    /// its own validation step. Failure and interruption events are still
    /// the scheduler's responsibility.
    pub async fn submit_deferred(&self, task: Task) -> Result<String> {
        self.submit_inner(task, true).await
    }

    async fn submit_inner(&self, mut task: Task, deferred: bool) -> Result<String> {
        if !self.registry.is_registered(task.agent).await {
            return Err(ChorusError::NotFound(format!(
                "agent: {}",
                task.agent.as_str()
            )));
        }
        task.state = TaskState::Queued;
        let task_id = task.id.clone();

        {
            let mut state = self.state.lock().await;
            // Re-submission of a settled task (retry-with-feedback) starts a
            // fresh lifecycle under the same id; a live task id is refused.
            if let Some(existing) = state.tasks.get(&task_id) {
                if !existing.state.is_terminal() {
                    return Err(ChorusError::BadInput(format!(
                        "task already live: {task_id}"
                    )));
                }
                state.completions.remove(&task_id);
            }
            if deferred {
                state.deferred.insert(task_id.clone());
            }
            // The cancellation flag lives from submission so an interrupt
            // can never fall between dequeue and dispatch.
            state.cancels.insert(task_id.clone(), CancelFlag::new());
            if let Some(parent) = &task.parent_id {
                state
                    .children
                    .entry(parent.clone())
                    .or_default()
                    .push(task_id.clone());
            }
            state.tasks.insert(task_id.clone(), task.clone());
        }

        if let Err(e) = self.queue.enqueue(task.clone()).await {
            let mut state = self.state.lock().await;
            state.tasks.remove(&task_id);
            state.deferred.remove(&task_id);
            state.cancels.remove(&task_id);
            return Err(e);
        }

        self.send_message(
            Endpoint::Scheduler,
            Endpoint::Agent(task.agent),
            MessagePayload::TaskAssignment {
                task_id: task_id.clone(),
                description: task.query().to_string(),
                input: task.input.clone(),
                priority: task.priority,
            },
        );
        self.notify.notify_one();
        Ok(task_id)
    }

    /// Wait for a task to reach a terminal state.
    pub async fn wait(&self, task_id: &str) -> Result<TaskCompletion> {
        let receiver = {
            let mut state = self.state.lock().await;
            if let Some(completion) = state.completions.get(task_id) {
                return Ok(completion.clone());
            }
            if !state.tasks.contains_key(task_id) {
                return Err(ChorusError::NotFound(format!("task: {task_id}")));
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.entry(task_id.to_string()).or_default().push(tx);
            rx
        };
        receiver
            .await
            .map_err(|_| ChorusError::Internal(anyhow::anyhow!("scheduler dropped waiter")))
    }

    pub async fn get_task(&self, task_id: &str) -> Option<Task> {
        let state = self.state.lock().await;
        state.tasks.get(task_id).cloned()
    }

    pub async fn get_completion(&self, task_id: &str) -> Option<TaskCompletion> {
        let state = self.state.lock().await;
        state.completions.get(task_id).cloned()
    }

    /// Interrupt a task or everything an agent is running. Propagates
    /// through the task graph to descendants.
    pub async fn interrupt(&self, target: InterruptTarget) -> Result<()> {
        self.send_message(
            Endpoint::Manager,
            Endpoint::Scheduler,
            MessagePayload::Interrupt {
                target: target.clone(),
            },
        );
        match target {
            InterruptTarget::Task(task_id) => self.interrupt_task(&task_id).await,
            InterruptTarget::Agent(kind) => {
                let record = self
                    .registry
                    .record(kind)
                    .await
                    .ok_or_else(|| ChorusError::NotFound(format!("agent: {}", kind.as_str())))?;
                if let Some(task_id) = record.current_task_id {
                    self.interrupt_task(&task_id).await
                } else {
                    Ok(())
                }
            }
        }
    }

    async fn interrupt_task(&self, task_id: &str) -> Result<()> {
        let (running_cancel, children, known) = {
            let state = self.state.lock().await;
            // A request id may exist only as a parent of child tasks.
            let known =
                state.tasks.contains_key(task_id) || state.children.contains_key(task_id);
            (
                state.cancels.get(task_id).cloned(),
                state.children.get(task_id).cloned().unwrap_or_default(),
                known,
            )
        };
        if !known {
            return Err(ChorusError::NotFound(format!("task: {task_id}")));
        }

        // Set the flag first so a concurrently dispatching worker observes
        // it even if the queue removal below races with its dequeue.
        if let Some(cancel) = running_cancel {
            cancel.cancel();
        }
        if let Some(task) = self.queue.remove(task_id).await {
            // Not yet dispatched: terminal immediately.
            self.finalize_interrupted(&task).await;
        }

        for child in children {
            if let Err(e) = Box::pin(self.interrupt_task(&child)).await {
                debug!(child = %child, "Child interrupt skipped: {}", e);
            }
        }
        Ok(())
    }

    /// Interrupt every live task of a session (session deletion cascade).
    /// Returns the ids that were interrupted.
    pub async fn interrupt_session(&self, session_id: &str) -> Vec<String> {
        let live: Vec<String> = {
            let state = self.state.lock().await;
            state
                .tasks
                .values()
                .filter(|t| t.session_id == session_id && !t.state.is_terminal())
                .map(|t| t.id.clone())
                .collect()
        };
        for task_id in &live {
            if let Err(e) = self.interrupt_task(task_id).await {
                debug!(task_id = %task_id, "Session interrupt skipped: {}", e);
            }
        }
        live
    }

    /// Drop all terminal tasks and completions belonging to a session.
    pub async fn forget_session(&self, session_id: &str) {
        self.queue.remove_session(session_id).await;
        let mut state = self.state.lock().await;
        let ids: Vec<String> = state
            .tasks
            .values()
            .filter(|t| t.session_id == session_id)
            .map(|t| t.id.clone())
            .collect();
        for id in ids {
            state.tasks.remove(&id);
            state.completions.remove(&id);
            state.children.remove(&id);
            state.deferred.remove(&id);
        }
    }

    pub async fn snapshot(&self) -> HealthSnapshot {
        let queued = self.queue.len().await;
        let oldest_queued_at = self.queue.oldest_queued_at().await;
        let agents = self.registry.all_records().await;
        let state = self.state.lock().await;
        let running = state
            .tasks
            .values()
            .filter(|t| t.state == TaskState::Running)
            .count();
        HealthSnapshot {
            total_agents: agents.len(),
            running,
            queued,
            agents,
            oldest_queued_at,
            uptime_secs: self.started.elapsed().as_secs_f64(),
        }
    }

    // ── Dispatch ────────────────────────────────────────────────────────

    async fn dispatch_loop(&self) {
        loop {
            let permit = self
                .semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("task semaphore never closed");

            let task = loop {
                let busy = self.registry.busy_set().await;
                if let Some(task) = self.queue.pop_admissible(&busy).await {
                    break task;
                }
                tokio::select! {
                    _ = self.notify.notified() => {}
                    _ = tokio::time::sleep(Duration::from_millis(
                        constants::TASK_POLL_INTERVAL_MS,
                    )) => {}
                }
            };

            let worker = self.clone();
            tokio::spawn(async move {
                worker.run_task(task, permit).await;
            });
        }
    }

    async fn run_task(&self, mut task: Task, permit: tokio::sync::OwnedSemaphorePermit) {
        let (cancel, deferred) = {
            let mut state = self.state.lock().await;
            if state.completions.contains_key(&task.id) {
                // Interrupted while queued and already settled.
                return;
            }
            let cancel = state
                .cancels
                .entry(task.id.clone())
                .or_insert_with(CancelFlag::new)
                .clone();
            (cancel, state.deferred.contains(&task.id))
        };
        if cancel.is_cancelled() {
            // Interrupt landed between dequeue and dispatch.
            self.finalize_interrupted(&task).await;
            return;
        }

        if let Err(e) = self.registry.mark_busy(task.agent, &task.id).await {
            // Lost the idle check race; put the task back for a later slot.
            debug!(task_id = %task.id, "Agent busy at dispatch, re-queueing: {}", e);
            if self.queue.enqueue(task).await.is_err() {
                warn!("Queue full while re-queueing displaced task");
            }
            self.notify.notify_one();
            return;
        }

        task.state = TaskState::Running;
        task.started_at = Some(chrono::Utc::now());
        {
            let mut state = self.state.lock().await;
            state.tasks.insert(task.id.clone(), task.clone());
        }

        self.bus
            .emit(
                UnifiedEvent::new(
                    &task.session_id,
                    &task.id,
                    EventType::Status,
                    Stage::Executing,
                    task.agent.into(),
                )
                .with_message(format!("executing on {}", task.agent.as_str()))
                .with_handler(task.agent.as_str()),
            )
            .await;
        self.send_message(
            Endpoint::Agent(task.agent),
            Endpoint::Scheduler,
            MessagePayload::AgentStarted {
                task_id: task.id.clone(),
            },
        );

        let agent = match self.registry.lookup(task.agent).await {
            Some(agent) => agent,
            None => {
                self.registry.mark_idle(task.agent, 0, true).await;
                self.finalize_failure(
                    &task,
                    &ChorusError::NotFound(format!("agent: {}", task.agent.as_str())),
                    0,
                )
                .await;
                return;
            }
        };

        let ctx = TaskContext {
            session_id: task.session_id.clone(),
            task_id: task.id.clone(),
            cancel: cancel.clone(),
            bus: self.bus.clone(),
        };

        let clock = Instant::now();
        let outcome = tokio::time::timeout(
            Duration::from_secs(self.config.task_timeout_secs),
            agent.handle(&task, &ctx),
        )
        .await;
        drop(permit);
        self.notify.notify_one();
        let duration_ms = clock.elapsed().as_millis() as u64;

        let timed_out = outcome.is_err();
        let result = match outcome {
            Ok(result) => result,
            Err(_) => Err(ChorusError::Timeout {
                message: format!(
                    "task exceeded {}s budget",
                    self.config.task_timeout_secs
                ),
            }),
        };

        // An interrupt observed anywhere discards the handler outcome.
        if cancel.is_cancelled() || matches!(result, Err(ChorusError::Interrupted)) {
            self.registry.mark_idle(task.agent, 0, false).await;
            self.finalize_interrupted(&task).await;
            return;
        }

        match result {
            Ok(output) => {
                let tokens = output.tokens.as_ref().map(|t| t.total).unwrap_or(0);
                self.registry.mark_idle(task.agent, tokens, false).await;
                self.finalize_success(&task, output, duration_ms, deferred)
                    .await;
            }
            Err(e) => {
                self.registry.mark_idle(task.agent, 0, true).await;
                // Task-level timeouts are terminal: bounded retries for
                // timeouts live at the call sites, not here.
                let retryable = !timed_out
                    && e.is_retryable()
                    && task.retry_count < self.config.retry_ceiling;
                if retryable {
                    self.retry_task(task, &e).await;
                } else {
                    self.finalize_failure(&task, &e, duration_ms).await;
                }
            }
        }
    }

    async fn retry_task(&self, mut task: Task, err: &ChorusError) {
        warn!(
            task_id = %task.id,
            retry = task.retry_count + 1,
            "Retryable task failure: {}", err
        );
        self.bus
            .emit_error(
                &task.session_id,
                &task.id,
                task.agent.into(),
                err.kind(),
                err.client_message(),
                None,
                false,
            )
            .await;
        self.send_message(
            Endpoint::Agent(task.agent),
            Endpoint::Scheduler,
            MessagePayload::AgentFailed {
                task_id: task.id.clone(),
                kind: err.kind(),
                detail: err.client_message(),
            },
        );

        task.retry_count += 1;
        task.state = TaskState::Queued;
        task.started_at = None;
        {
            let mut state = self.state.lock().await;
            // Fresh lifecycle, fresh cancellation flag.
            state.cancels.insert(task.id.clone(), CancelFlag::new());
            state.tasks.insert(task.id.clone(), task.clone());
        }
        if let Err(e) = self.queue.enqueue(task.clone()).await {
            warn!(task_id = %task.id, "Re-enqueue failed: {}", e);
            self.finalize_failure(&task, &e, 0).await;
            return;
        }
        self.notify.notify_one();
    }

    // ── Terminal transitions ────────────────────────────────────────────

    async fn finalize_success(
        &self,
        task: &Task,
        output: TaskOutput,
        duration_ms: u64,
        deferred: bool,
    ) {
        if !self
            .settle(task, TaskState::Succeeded, Some(output.clone()), None)
            .await
        {
            return;
        }

        if !output.sources.is_empty() {
            self.send_message(
                Endpoint::Agent(task.agent),
                Endpoint::Scheduler,
                MessagePayload::RagResult {
                    task_id: task.id.clone(),
                    sources: output.sources.clone(),
                },
            );
        }
        self.send_message(
            Endpoint::Agent(task.agent),
            Endpoint::Scheduler,
            MessagePayload::AgentCompleted {
                task_id: task.id.clone(),
                result: output.clone(),
            },
        );

        if !deferred {
            self.bus
                .emit_result(
                    &task.session_id,
                    &task.id,
                    task.agent.into(),
                    output.answer.clone(),
                    output.sources.clone(),
                    output.tokens.clone(),
                    duration_ms,
                )
                .await;
        }
        info!(task_id = %task.id, duration_ms, "Task succeeded");
    }

    async fn finalize_failure(&self, task: &Task, err: &ChorusError, duration_ms: u64) {
        let settled = self
            .settle(
                task,
                TaskState::Failed,
                None,
                Some(TaskError {
                    kind: err.kind(),
                    message: err.client_message(),
                }),
            )
            .await;
        if !settled {
            return;
        }

        self.bus
            .emit_error(
                &task.session_id,
                &task.id,
                task.agent.into(),
                err.kind(),
                err.client_message(),
                Some(format!("after {duration_ms}ms")),
                true,
            )
            .await;
        self.send_message(
            Endpoint::Agent(task.agent),
            Endpoint::Scheduler,
            MessagePayload::AgentFailed {
                task_id: task.id.clone(),
                kind: err.kind(),
                detail: err.client_message(),
            },
        );
        error!(task_id = %task.id, kind = err.kind().as_str(), "Task failed: {}", err);
    }

    async fn finalize_interrupted(&self, task: &Task) {
        let settled = self
            .settle(
                task,
                TaskState::Interrupted,
                None,
                Some(TaskError {
                    kind: ErrorKind::Interrupted,
                    message: "interrupted".to_string(),
                }),
            )
            .await;
        if !settled {
            return;
        }

        self.bus
            .emit(
                UnifiedEvent::new(
                    &task.session_id,
                    &task.id,
                    EventType::Status,
                    Stage::Executing,
                    task.agent.into(),
                )
                .with_message("interrupted")
                .with_data(serde_json::json!({ "kind": ErrorKind::Interrupted.as_str() })),
            )
            .await;
        self.send_message(
            Endpoint::Agent(task.agent),
            Endpoint::Scheduler,
            MessagePayload::AgentFailed {
                task_id: task.id.clone(),
                kind: ErrorKind::Interrupted,
                detail: "interrupted".to_string(),
            },
        );
        info!(task_id = %task.id, "Task interrupted");
    }

    /// Record the terminal state and wake waiters. Returns false when the
    /// task already settled; terminal states are never overwritten, so a
    /// caller racing here must not announce anything.
    async fn settle(
        &self,
        task: &Task,
        new_state: TaskState,
        output: Option<TaskOutput>,
        error: Option<TaskError>,
    ) -> bool {
        let mut state = self.state.lock().await;
        if let Some(stored) = state.tasks.get_mut(&task.id) {
            if stored.state.is_terminal() {
                return false;
            }
            stored.state = new_state;
            stored.ended_at = Some(chrono::Utc::now());
            stored.retry_count = task.retry_count;
        } else if state.completions.contains_key(&task.id) {
            return false;
        }
        state.cancels.remove(&task.id);
        let completion = TaskCompletion {
            task_id: task.id.clone(),
            state: new_state,
            output,
            error,
            retry_count: task.retry_count,
        };
        state
            .completions
            .insert(task.id.clone(), completion.clone());
        if let Some(waiters) = state.waiters.remove(&task.id) {
            for waiter in waiters {
                let _ = waiter.send(completion.clone());
            }
        }
        true
    }

    fn send_message(&self, sender: Endpoint, recipient: Endpoint, payload: MessagePayload) {
        let _ = self
            .message_tx
            .send(AgentMessage::new(sender, recipient, payload));
    }

    // ── Retention ───────────────────────────────────────────────────────

    async fn cleanup_loop(&self) {
        loop {
            tokio::time::sleep(Duration::from_secs(constants::CLEANUP_INTERVAL_SECS)).await;
            self.perform_cleanup().await;
        }
    }

    /// Drop terminal tasks and completions past the retention window.
    /// Live tasks are always kept.
    async fn perform_cleanup(&self) {
        let cutoff = chrono::Utc::now() - chrono::Duration::hours(constants::TASK_RETENTION_HOURS);
        let mut state = self.state.lock().await;
        let expired: Vec<String> = state
            .tasks
            .values()
            .filter(|t| {
                t.state.is_terminal() && t.ended_at.map(|ended| ended < cutoff).unwrap_or(false)
            })
            .map(|t| t.id.clone())
            .collect();
        if expired.is_empty() {
            return;
        }
        for id in &expired {
            state.tasks.remove(id);
            state.completions.remove(id);
            state.children.remove(id);
            state.deferred.remove(id);
        }
        info!("Cleaned up {} finished task(s)", expired.len());
    }
}
