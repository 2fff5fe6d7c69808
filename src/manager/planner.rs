use crate::llm::{extract_json, GenerationRequest, LlmGateway};
use crate::models::{AgentKind, Intent};
use crate::prompts::{keys, PromptRegistry};
use crate::Result;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// One unit of a multi-step plan.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanStep {
    pub agent: AgentKind,
    pub input: String,
}

#[derive(Deserialize)]
struct RawStep {
    agent: String,
    input: String,
}

/// Produces ordered step lists for the planned execution path.
pub struct Planner {
    gateway: Arc<LlmGateway>,
    prompts: Arc<PromptRegistry>,
}

impl Planner {
    pub fn new(gateway: Arc<LlmGateway>, prompts: Arc<PromptRegistry>) -> Self {
        Self { gateway, prompts }
    }

    /// Plan the steps for a query.
    ///
    /// A plain knowledge lookup is always a single retrieval step and never
    /// costs a model call. `plan_and_execute` asks the model; an unusable
    /// plan (empty, unparsable, only invented agents) degrades to the
    /// single-step fallback.
    pub async fn plan(
        &self,
        query: &str,
        intent: Intent,
        session_id: &str,
    ) -> Result<Vec<PlanStep>> {
        if intent == Intent::KnowledgeLookup {
            return Ok(vec![PlanStep {
                agent: AgentKind::Knowledge,
                input: query.to_string(),
            }]);
        }

        match self.plan_with_model(query, session_id).await {
            Ok(steps) if !steps.is_empty() => Ok(steps),
            Ok(_) => {
                debug!("Planner produced no usable steps, falling back to retrieval");
                Ok(Self::fallback(query))
            }
            Err(e) => {
                warn!("Planner call failed, falling back to retrieval: {}", e);
                Ok(Self::fallback(query))
            }
        }
    }

    fn fallback(query: &str) -> Vec<PlanStep> {
        vec![PlanStep {
            agent: AgentKind::Knowledge,
            input: query.to_string(),
        }]
    }

    async fn plan_with_model(&self, query: &str, session_id: &str) -> Result<Vec<PlanStep>> {
        let template = self.prompts.get(keys::PLANNER)?;
        let mut values = HashMap::new();
        values.insert("query".to_string(), query.to_string());

        let generation = self
            .gateway
            .generate(GenerationRequest::from_template(template, &values)?.with_session(session_id))
            .await?;

        let raw: Vec<RawStep> = serde_json::from_str(extract_json(&generation.content))?;
        let steps: Vec<PlanStep> = raw
            .into_iter()
            .filter_map(|step| match step.agent.parse::<AgentKind>() {
                Ok(agent) => Some(PlanStep {
                    agent,
                    input: step.input,
                }),
                Err(_) => {
                    warn!("Planner referenced unknown agent {:?}, dropping step", step.agent);
                    None
                }
            })
            .collect();
        Ok(steps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::helpers::ScriptedProvider;

    fn planner_with(provider: Arc<ScriptedProvider>) -> Planner {
        let gateway = Arc::new(crate::llm::LlmGateway::new(provider, 16, 5));
        Planner::new(gateway, Arc::new(PromptRegistry::builtin()))
    }

    #[tokio::test]
    async fn knowledge_lookup_is_a_static_single_step() {
        let provider = ScriptedProvider::new(vec![]);
        let planner = planner_with(provider.clone());

        let steps = planner
            .plan("what is X?", Intent::KnowledgeLookup, "sess")
            .await
            .unwrap();
        assert_eq!(
            steps,
            vec![PlanStep {
                agent: AgentKind::Knowledge,
                input: "what is X?".to_string(),
            }]
        );
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn model_plan_is_parsed_and_filtered() {
        let provider = ScriptedProvider::new(vec![Ok(r#"[
            {"agent": "knowledge", "input": "find background on X"},
            {"agent": "time_traveler", "input": "impossible"},
            {"agent": "summarize", "input": "condense the findings"}
        ]"#
        .to_string())]);
        let planner = planner_with(provider);

        let steps = planner
            .plan("research X and summarize", Intent::PlanAndExecute, "sess")
            .await
            .unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].agent, AgentKind::Knowledge);
        assert_eq!(steps[1].agent, AgentKind::Summarize);
    }

    #[tokio::test]
    async fn unusable_plan_falls_back_to_retrieval() {
        let provider = ScriptedProvider::new(vec![Ok("no plan today".to_string())]);
        let planner = planner_with(provider);

        let steps = planner
            .plan("complicated request", Intent::PlanAndExecute, "sess")
            .await
            .unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].agent, AgentKind::Knowledge);
    }
}
