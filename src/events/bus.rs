use super::{AgentRef, EventType, Stage, UnifiedEvent};
use crate::error::ErrorKind;
use crate::models::{SourceFragment, TokenUsage};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, error};

/// Persistence sink for emitted events. The session store implements this;
/// tests substitute a recorder.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn persist(&self, event: &UnifiedEvent) -> crate::Result<()>;
}

/// No-op sink for contexts without persistence (benchmarks, some tests).
pub struct NullSink;

#[async_trait]
impl EventSink for NullSink {
    async fn persist(&self, _event: &UnifiedEvent) -> crate::Result<()> {
        Ok(())
    }
}

/// Broadcast fabric for [`UnifiedEvent`]s.
///
/// One broadcast channel per session; emission is non-blocking for the
/// producer. Persistence happens off the emission path through an unbounded
/// queue drained by a single writer task, which keeps persisted order equal
/// to emission order per session.
///
/// Slow subscribers overflow their bounded buffer and observe a lagged error
/// on their receiver; the transport layer disconnects only that subscriber.
pub struct EventBus {
    channels: RwLock<HashMap<String, broadcast::Sender<UnifiedEvent>>>,
    persist_tx: mpsc::UnboundedSender<UnifiedEvent>,
    subscriber_buffer: usize,
}

impl EventBus {
    pub fn new(subscriber_buffer: usize, sink: Arc<dyn EventSink>) -> Arc<Self> {
        let (persist_tx, mut persist_rx) = mpsc::unbounded_channel::<UnifiedEvent>();

        tokio::spawn(async move {
            while let Some(event) = persist_rx.recv().await {
                if let Err(e) = sink.persist(&event).await {
                    error!(event_id = %event.event_id, "Failed to persist event: {}", e);
                }
            }
            debug!("Event persistence writer stopped");
        });

        Arc::new(Self {
            channels: RwLock::new(HashMap::new()),
            persist_tx,
            subscriber_buffer,
        })
    }

    /// Emit an event to live subscribers of its session and queue it for
    /// persistence. `stream` events are delivered but never persisted.
    pub async fn emit(&self, event: UnifiedEvent) {
        {
            let channels = self.channels.read().await;
            if let Some(tx) = channels.get(&event.session_id) {
                // No receivers is fine; subscribers may attach later and
                // replay from the persisted stream.
                let _ = tx.send(event.clone());
            }
        }

        if event.event_type != EventType::Stream {
            let _ = self.persist_tx.send(event);
        }
    }

    /// Subscribe to the live event stream of a session. The channel is
    /// created on first use.
    pub async fn subscribe(&self, session_id: &str) -> broadcast::Receiver<UnifiedEvent> {
        let mut channels = self.channels.write().await;
        channels
            .entry(session_id.to_string())
            .or_insert_with(|| broadcast::channel(self.subscriber_buffer).0)
            .subscribe()
    }

    pub async fn subscriber_count(&self, session_id: &str) -> usize {
        let channels = self.channels.read().await;
        channels
            .get(session_id)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    /// Drop the broadcast channel for a deleted session, disconnecting all
    /// of its subscribers.
    pub async fn drop_session(&self, session_id: &str) {
        let mut channels = self.channels.write().await;
        channels.remove(session_id);
    }

    /// Terminal error event handed to a subscriber that fell behind its
    /// bounded buffer before it is disconnected.
    pub fn lagged_event(session_id: &str) -> UnifiedEvent {
        UnifiedEvent::new(
            session_id,
            "",
            EventType::Error,
            Stage::Failed,
            AgentRef::system(),
        )
        .with_message("subscriber disconnected: event buffer overflow")
        .with_data(serde_json::json!({ "kind": ErrorKind::Internal.as_str() }))
    }

    // ── Convenience emitters ────────────────────────────────────────────
    // These fill in stage, UI hints, and timestamps from the fixed table so
    // producers can't drift from the external contract.

    pub async fn emit_init(&self, session_id: &str, task_id: &str, agent: AgentRef) {
        self.emit(
            UnifiedEvent::new(session_id, task_id, EventType::Init, Stage::Init, agent)
                .with_message("request received"),
        )
        .await;
    }

    pub async fn emit_thinking(
        &self,
        session_id: &str,
        task_id: &str,
        agent: AgentRef,
        stage: Stage,
        message: impl Into<String>,
    ) {
        self.emit(
            UnifiedEvent::new(session_id, task_id, EventType::Thinking, stage, agent)
                .with_message(message),
        )
        .await;
    }

    pub async fn emit_status(
        &self,
        session_id: &str,
        task_id: &str,
        agent: AgentRef,
        stage: Stage,
        message: impl Into<String>,
    ) {
        self.emit(
            UnifiedEvent::new(session_id, task_id, EventType::Status, stage, agent)
                .with_message(message),
        )
        .await;
    }

    pub async fn emit_progress(
        &self,
        session_id: &str,
        task_id: &str,
        agent: AgentRef,
        step_index: usize,
        total_steps: usize,
        message: impl Into<String>,
    ) {
        self.emit(
            UnifiedEvent::new(
                session_id,
                task_id,
                EventType::Progress,
                Stage::Executing,
                agent,
            )
            .with_message(message)
            .with_step(step_index, total_steps),
        )
        .await;
    }

    pub async fn emit_stream(&self, session_id: &str, task_id: &str, agent: AgentRef, token: &str) {
        self.emit(
            UnifiedEvent::new(
                session_id,
                task_id,
                EventType::Stream,
                Stage::Executing,
                agent,
            )
            .with_message(token),
        )
        .await;
    }

    pub async fn emit_retrieval(
        &self,
        session_id: &str,
        task_id: &str,
        agent: AgentRef,
        sources: Vec<SourceFragment>,
        message: impl Into<String>,
    ) {
        self.emit(
            UnifiedEvent::new(
                session_id,
                task_id,
                EventType::Progress,
                Stage::Retrieval,
                agent,
            )
            .with_message(message)
            .with_sources(sources),
        )
        .await;
    }

    pub async fn emit_result(
        &self,
        session_id: &str,
        task_id: &str,
        agent: AgentRef,
        answer: impl Into<String>,
        sources: Vec<SourceFragment>,
        tokens: Option<TokenUsage>,
        duration_ms: u64,
    ) {
        let mut event = UnifiedEvent::new(
            session_id,
            task_id,
            EventType::Result,
            Stage::Complete,
            agent,
        )
        .with_message("completed")
        .with_answer(answer)
        .with_sources(sources)
        .with_duration_ms(duration_ms);
        if let Some(tokens) = tokens {
            event = event.with_tokens(tokens);
        }
        self.emit(event).await;
    }

    /// Emit an error event. Terminal errors carry stage `failed`; transient
    /// ones (a retryable attempt failure) stay at stage `executing` so the
    /// one-terminal-event-per-task invariant holds.
    pub async fn emit_error(
        &self,
        session_id: &str,
        task_id: &str,
        agent: AgentRef,
        kind: ErrorKind,
        message: impl Into<String>,
        detail: Option<String>,
        terminal: bool,
    ) {
        let stage = if terminal { Stage::Failed } else { Stage::Executing };
        let mut data = serde_json::json!({ "kind": kind.as_str() });
        if let Some(detail) = detail {
            data["detail"] = serde_json::Value::String(detail);
        }
        self.emit(
            UnifiedEvent::new(session_id, task_id, EventType::Error, stage, agent)
                .with_message(message)
                .with_data(data),
        )
        .await;
    }
}
