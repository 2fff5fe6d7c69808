use crate::agents::Agent;
use crate::models::{AgentKind, Capability};
use crate::{ChorusError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Idle,
    Busy,
    Stopped,
}

/// Registry-owned bookkeeping for one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub kind: AgentKind,
    pub role: String,
    pub capabilities: Vec<Capability>,
    pub state: AgentState,
    pub current_task_id: Option<String>,
    pub invocations: u64,
    pub total_tokens: u64,
    pub error_count: u64,
}

impl AgentRecord {
    fn new(kind: AgentKind, capabilities: Vec<Capability>) -> Self {
        Self {
            kind,
            role: kind.role().to_string(),
            capabilities,
            state: AgentState::Idle,
            current_task_id: None,
            invocations: 0,
            total_tokens: 0,
            error_count: 0,
        }
    }
}

/// Holds the set of registered agents keyed by kind.
///
/// Records are owned exclusively by the registry; the busy/idle transition
/// is the synchronization point that enforces at most one running task per
/// agent.
pub struct AgentRegistry {
    agents: RwLock<HashMap<AgentKind, Arc<dyn Agent>>>,
    records: RwLock<HashMap<AgentKind, AgentRecord>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            records: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register(&self, agent: Arc<dyn Agent>) -> Result<()> {
        let kind = agent.kind();
        let mut agents = self.agents.write().await;
        if agents.contains_key(&kind) {
            warn!("Agent {} already registered", kind.as_str());
            return Err(ChorusError::Agent {
                message: format!("agent already registered: {}", kind.as_str()),
            });
        }
        let mut records = self.records.write().await;
        records.insert(kind, AgentRecord::new(kind, agent.capabilities().to_vec()));
        agents.insert(kind, agent);
        info!("Registered agent: {}", kind.as_str());
        Ok(())
    }

    pub async fn lookup(&self, kind: AgentKind) -> Option<Arc<dyn Agent>> {
        let agents = self.agents.read().await;
        agents.get(&kind).cloned()
    }

    pub async fn is_registered(&self, kind: AgentKind) -> bool {
        self.agents.read().await.contains_key(&kind)
    }

    /// Transition an agent to busy. Fails if the agent is already busy or
    /// stopped, which is what guarantees one running task per agent.
    pub async fn mark_busy(&self, kind: AgentKind, task_id: &str) -> Result<()> {
        let mut records = self.records.write().await;
        let record = records.get_mut(&kind).ok_or_else(|| ChorusError::Agent {
            message: format!("agent not registered: {}", kind.as_str()),
        })?;
        if record.state != AgentState::Idle {
            return Err(ChorusError::Agent {
                message: format!("agent {} is not idle", kind.as_str()),
            });
        }
        record.state = AgentState::Busy;
        record.current_task_id = Some(task_id.to_string());
        record.invocations += 1;
        Ok(())
    }

    /// Transition an agent back to idle after a task, folding in its usage.
    pub async fn mark_idle(&self, kind: AgentKind, tokens: u64, failed: bool) {
        let mut records = self.records.write().await;
        if let Some(record) = records.get_mut(&kind) {
            record.state = AgentState::Idle;
            record.current_task_id = None;
            record.total_tokens += tokens;
            if failed {
                record.error_count += 1;
            }
        }
    }

    pub async fn stop(&self, kind: AgentKind) {
        let mut records = self.records.write().await;
        if let Some(record) = records.get_mut(&kind) {
            record.state = AgentState::Stopped;
        }
    }

    pub async fn busy_set(&self) -> HashSet<AgentKind> {
        let records = self.records.read().await;
        records
            .values()
            .filter(|r| r.state != AgentState::Idle)
            .map(|r| r.kind)
            .collect()
    }

    pub async fn record(&self, kind: AgentKind) -> Option<AgentRecord> {
        let records = self.records.read().await;
        records.get(&kind).cloned()
    }

    pub async fn all_records(&self) -> Vec<AgentRecord> {
        let records = self.records.read().await;
        let mut all: Vec<_> = records.values().cloned().collect();
        all.sort_by_key(|r| r.kind.as_str());
        all
    }

    pub async fn count(&self) -> usize {
        self.agents.read().await.len()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}
