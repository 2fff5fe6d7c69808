use crate::models::{AgentKind, Task};
use crate::{ChorusError, Result};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

struct QueuedTask {
    task: Task,
    seq: u64,
}

/// Bounded submission queue ordered by (priority desc, arrival asc).
///
/// Dequeueing skips tasks whose target agent is busy instead of blocking the
/// head of the line; tasks for other agents behind a blocked head still
/// dispatch.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<Mutex<QueueInner>>,
    max_size: usize,
}

struct QueueInner {
    entries: Vec<QueuedTask>,
    next_seq: u64,
}

impl TaskQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(QueueInner {
                entries: Vec::new(),
                next_seq: 0,
            })),
            max_size,
        }
    }

    pub async fn enqueue(&self, task: Task) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.entries.len() >= self.max_size {
            return Err(ChorusError::CapacityExhausted);
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        info!(
            task_id = %task.id,
            agent = task.agent.as_str(),
            priority = task.priority.value(),
            position = inner.entries.len() + 1,
            "Task queued"
        );
        inner.entries.push(QueuedTask { task, seq });
        Ok(())
    }

    /// Pop the best admissible task: highest priority, then earliest
    /// arrival, whose target agent is not in `busy`.
    pub async fn pop_admissible(&self, busy: &HashSet<AgentKind>) -> Option<Task> {
        let mut inner = self.inner.lock().await;
        let best = inner
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| !busy.contains(&e.task.agent))
            .min_by_key(|(_, e)| (std::cmp::Reverse(e.task.priority), e.seq))
            .map(|(idx, _)| idx)?;
        let entry = inner.entries.remove(best);
        debug!(task_id = %entry.task.id, remaining = inner.entries.len(), "Task dequeued");
        Some(entry.task)
    }

    /// Remove a specific queued task (interrupt of a not-yet-running task).
    pub async fn remove(&self, task_id: &str) -> Option<Task> {
        let mut inner = self.inner.lock().await;
        let idx = inner.entries.iter().position(|e| e.task.id == task_id)?;
        Some(inner.entries.remove(idx).task)
    }

    /// Remove every queued task belonging to a session.
    pub async fn remove_session(&self, session_id: &str) -> Vec<Task> {
        let mut inner = self.inner.lock().await;
        let (removed, kept): (Vec<_>, Vec<_>) = inner
            .entries
            .drain(..)
            .partition(|e| e.task.session_id == session_id);
        inner.entries = kept;
        removed.into_iter().map(|e| e.task).collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn oldest_queued_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        let inner = self.inner.lock().await;
        inner.entries.iter().map(|e| e.task.created_at).min()
    }
}
