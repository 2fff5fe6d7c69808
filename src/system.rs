//! Explicit dependency container.
//!
//! Every component is constructed once here and handed to its collaborators
//! by reference; there are no process-wide mutable globals. Dependency
//! direction is one-way: the manager depends on the scheduler and gateways,
//! specialists depend only on gateways.

use crate::agents::{
    ChatAgent, ComputeAgent, EchoAdapter, KnowledgeAgent, SummarizeAgent, ToolAgent,
    TranslateAgent,
};
use crate::classifier::QueryClassifier;
use crate::config::Config;
use crate::events::EventBus;
use crate::llm::{HttpProvider, LlmGateway, LlmProvider};
use crate::manager::{Manager, Planner};
use crate::prompts::PromptRegistry;
use crate::quality::QualityController;
use crate::retrieval::{RetrievalLayer, StoreRegistry};
use crate::scheduler::{AgentRegistry, Scheduler};
use crate::session::SessionStore;
use crate::Result;
use std::sync::Arc;

pub struct System {
    pub config: Config,
    pub bus: Arc<EventBus>,
    pub sessions: Arc<SessionStore>,
    pub gateway: Arc<LlmGateway>,
    pub stores: Arc<StoreRegistry>,
    pub retrieval: Arc<RetrievalLayer>,
    pub prompts: Arc<PromptRegistry>,
    pub registry: Arc<AgentRegistry>,
    pub scheduler: Scheduler,
    pub manager: Manager,
}

impl System {
    /// Assemble against the real HTTP LLM provider.
    pub async fn assemble(config: Config) -> Result<Self> {
        let provider: Arc<dyn LlmProvider> = Arc::new(HttpProvider::new(&config.llm));
        Self::assemble_with_provider(config, provider).await
    }

    /// Assemble with an injected provider (tests, alternative backends).
    pub async fn assemble_with_provider(
        config: Config,
        provider: Arc<dyn LlmProvider>,
    ) -> Result<Self> {
        let prompts = Arc::new(PromptRegistry::load(
            &config.workspace_root.join("prompts"),
        )?);
        let sessions = SessionStore::with_root(config.workspace_root.clone());
        let bus = EventBus::new(config.events.subscriber_buffer, sessions.clone());

        let gateway = Arc::new(LlmGateway::new(
            provider,
            config.llm.cache_capacity,
            config.llm.timeout_secs,
        ));
        let stores = Arc::new(StoreRegistry::new());
        let retrieval = Arc::new(RetrievalLayer::new(
            stores.clone(),
            gateway.clone(),
            prompts.clone(),
            &config.retrieval,
        ));

        let registry = Arc::new(AgentRegistry::new());
        registry
            .register(Arc::new(ChatAgent::new(gateway.clone(), prompts.clone())))
            .await?;
        registry
            .register(Arc::new(KnowledgeAgent::new(
                retrieval.clone(),
                gateway.clone(),
                prompts.clone(),
            )))
            .await?;
        registry
            .register(Arc::new(ComputeAgent::new(gateway.clone())))
            .await?;
        registry
            .register(Arc::new(TranslateAgent::new(
                gateway.clone(),
                prompts.clone(),
            )))
            .await?;
        registry
            .register(Arc::new(SummarizeAgent::new(
                gateway.clone(),
                prompts.clone(),
            )))
            .await?;
        registry
            .register(Arc::new(
                ToolAgent::new().with_adapter(Box::new(EchoAdapter)),
            ))
            .await?;

        let scheduler = Scheduler::new(registry.clone(), bus.clone(), config.scheduler.clone());
        let classifier = Arc::new(QueryClassifier::new(gateway.clone(), prompts.clone()));
        let planner = Arc::new(Planner::new(gateway.clone(), prompts.clone()));
        let quality = Arc::new(QualityController::new(
            gateway.clone(),
            prompts.clone(),
            config.scheduler.retry_ceiling,
        ));
        let manager = Manager::new(
            scheduler.clone(),
            classifier,
            planner,
            quality,
            sessions.clone(),
            bus.clone(),
            gateway.clone(),
            prompts.clone(),
            config.synthesize_plans,
        );

        Ok(Self {
            config,
            bus,
            sessions,
            gateway,
            stores,
            retrieval,
            prompts,
            registry,
            scheduler,
            manager,
        })
    }

    /// Start the scheduler's background loops.
    pub fn spawn_scheduler(&self) {
        let scheduler = self.scheduler.clone();
        tokio::spawn(async move { scheduler.run().await });
    }
}
