//! Session management.
//!
//! A session is the long-lived container of a user's conversation turns and
//! persisted events. Each session has a single writer (its own mutex), which
//! is what preserves the non-decreasing timestamp invariant on its event
//! stream. Persistence is an append-only JSONL stream per session under the
//! configured root; in-memory operation (no root) is used by tests.

use crate::events::{EventSink, EventType, UnifiedEvent};
use crate::models::{ConversationTurn, SourceFragment, TurnRole};
use crate::{ChorusError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub turns: Vec<ConversationTurn>,
    pub events: Vec<UnifiedEvent>,
}

struct SessionRecord {
    session: Session,
    last_event_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Store of all live sessions.
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Arc<Mutex<SessionRecord>>>>,
    root: Option<PathBuf>,
}

impl SessionStore {
    /// Memory-only store.
    pub fn in_memory() -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            root: None,
        })
    }

    /// Store persisting under `<root>/sessions/<id>/`.
    pub fn with_root(root: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            root: Some(root),
        })
    }

    /// Create a session, generating an id when none is supplied.
    pub async fn create(&self, id: Option<String>) -> Result<Session> {
        let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&id) {
            return Err(ChorusError::BadInput(format!(
                "session already exists: {id}"
            )));
        }
        let session = Session {
            id: id.clone(),
            created_at: chrono::Utc::now(),
            turns: Vec::new(),
            events: Vec::new(),
        };
        sessions.insert(
            id.clone(),
            Arc::new(Mutex::new(SessionRecord {
                session: session.clone(),
                last_event_at: None,
            })),
        );
        if let Some(dir) = self.session_dir(&id) {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| ChorusError::Internal(e.into()))?;
        }
        info!(session_id = %id, "Session created");
        Ok(session)
    }

    /// Fetch an existing session record, creating it on first use.
    async fn ensure(&self, id: &str) -> Arc<Mutex<SessionRecord>> {
        {
            let sessions = self.sessions.read().await;
            if let Some(record) = sessions.get(id) {
                return record.clone();
            }
        }
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(id.to_string())
            .or_insert_with(|| {
                debug!(session_id = %id, "Session implicitly created");
                Arc::new(Mutex::new(SessionRecord {
                    session: Session {
                        id: id.to_string(),
                        created_at: chrono::Utc::now(),
                        turns: Vec::new(),
                        events: Vec::new(),
                    },
                    last_event_at: None,
                }))
            })
            .clone()
    }

    pub async fn exists(&self, id: &str) -> bool {
        self.sessions.read().await.contains_key(id)
    }

    pub async fn snapshot(&self, id: &str) -> Option<Session> {
        let record = {
            let sessions = self.sessions.read().await;
            sessions.get(id)?.clone()
        };
        let record = record.lock().await;
        Some(record.session.clone())
    }

    pub async fn list_ids(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    pub async fn append_user_turn(&self, id: &str, text: &str) -> Result<()> {
        self.append_turn(
            id,
            ConversationTurn {
                role: TurnRole::User,
                text: text.to_string(),
                timestamp: chrono::Utc::now(),
                sources: Vec::new(),
            },
        )
        .await
    }

    pub async fn append_assistant_turn(
        &self,
        id: &str,
        text: &str,
        sources: Vec<SourceFragment>,
    ) -> Result<()> {
        self.append_turn(
            id,
            ConversationTurn {
                role: TurnRole::Assistant,
                text: text.to_string(),
                timestamp: chrono::Utc::now(),
                sources,
            },
        )
        .await
    }

    async fn append_turn(&self, id: &str, turn: ConversationTurn) -> Result<()> {
        let record = self.ensure(id).await;
        let mut record = record.lock().await;
        if let Some(path) = self.session_file(id, "turns.jsonl") {
            append_jsonl(&path, &turn).await?;
        }
        record.session.turns.push(turn);
        Ok(())
    }

    /// Persisted events of a session, for subscriber replay.
    pub async fn events(&self, id: &str) -> Vec<UnifiedEvent> {
        match self.snapshot(id).await {
            Some(session) => session.events,
            None => Vec::new(),
        }
    }

    /// Delete a session and everything under it. The caller is responsible
    /// for interrupting descendant tasks first.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let removed = {
            let mut sessions = self.sessions.write().await;
            sessions.remove(id)
        };
        if removed.is_none() {
            return Err(ChorusError::NotFound(format!("session: {id}")));
        }
        if let Some(dir) = self.session_dir(id) {
            if dir.exists() {
                tokio::fs::remove_dir_all(&dir)
                    .await
                    .map_err(|e| ChorusError::Internal(e.into()))?;
            }
        }
        info!(session_id = %id, "Session deleted");
        Ok(())
    }

    fn session_dir(&self, id: &str) -> Option<PathBuf> {
        self.root
            .as_ref()
            .map(|root| root.join("sessions").join(id))
    }

    fn session_file(&self, id: &str, name: &str) -> Option<PathBuf> {
        self.session_dir(id).map(|dir| dir.join(name))
    }
}

async fn append_jsonl<T: Serialize>(path: &PathBuf, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ChorusError::Internal(e.into()))?;
    }
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| ChorusError::Internal(e.into()))?;
    file.write_all(&line)
        .await
        .map_err(|e| ChorusError::Internal(e.into()))?;
    Ok(())
}

#[async_trait]
impl EventSink for SessionStore {
    /// Append an event to its session's stream. Timestamps are clamped
    /// forward so the per-session stream is always non-decreasing even when
    /// producers race on the wall clock.
    async fn persist(&self, event: &UnifiedEvent) -> Result<()> {
        debug_assert!(event.event_type != EventType::Stream);
        let record = self.ensure(&event.session_id).await;
        let mut record = record.lock().await;

        let mut stored = event.clone();
        if let Some(last) = record.last_event_at {
            if stored.timestamp < last {
                stored.timestamp = last;
            }
        }
        record.last_event_at = Some(stored.timestamp);

        if let Some(path) = self.session_file(&event.session_id, "events.jsonl") {
            append_jsonl(&path, &stored).await?;
        }
        record.session.events.push(stored);
        Ok(())
    }
}
