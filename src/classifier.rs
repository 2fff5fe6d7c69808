//! LLM-based query classification onto the fixed intent set.

use crate::llm::{extract_json, GenerationRequest, LlmGateway};
use crate::models::Intent;
use crate::prompts::{keys, PromptRegistry};
use crate::{constants, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Classifier verdict for one query.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub intent: Intent,
    pub confidence: f64,
    pub reason: String,
}

impl Classification {
    fn unknown(reason: impl Into<String>) -> Self {
        Self {
            intent: Intent::Unknown,
            confidence: 0.0,
            reason: reason.into(),
        }
    }
}

#[derive(Deserialize)]
struct RawVerdict {
    intent: String,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    reason: String,
}

pub struct QueryClassifier {
    gateway: Arc<LlmGateway>,
    prompts: Arc<PromptRegistry>,
}

impl QueryClassifier {
    pub fn new(gateway: Arc<LlmGateway>, prompts: Arc<PromptRegistry>) -> Self {
        Self { gateway, prompts }
    }

    /// Map a query to an intent.
    ///
    /// An empty query short-circuits to `unknown` without any model call.
    /// A malformed model response gets exactly one stricter retry before
    /// collapsing to `unknown` with confidence 0.
    pub async fn classify(
        &self,
        query: &str,
        context: Option<&str>,
        session_id: &str,
    ) -> Result<Classification> {
        if query.trim().is_empty() {
            return Ok(Classification::unknown("empty query"));
        }

        match self
            .attempt(keys::CLASSIFIER, query, context, session_id)
            .await
        {
            Ok(classification) => Ok(classification),
            Err(first_err) => {
                warn!("Classifier response unparsable, retrying strict: {}", first_err);
                match self
                    .attempt(keys::CLASSIFIER_STRICT, query, None, session_id)
                    .await
                {
                    Ok(classification) => Ok(classification),
                    Err(second_err) => {
                        warn!("Strict classifier retry failed: {}", second_err);
                        Ok(Classification::unknown("classification failed"))
                    }
                }
            }
        }
    }

    async fn attempt(
        &self,
        template_key: &str,
        query: &str,
        context: Option<&str>,
        session_id: &str,
    ) -> Result<Classification> {
        let template = self.prompts.get(template_key)?;
        let mut values = HashMap::new();
        values.insert("query".to_string(), query.to_string());
        values.insert(
            "context".to_string(),
            context.unwrap_or("none").to_string(),
        );

        let request = GenerationRequest::from_template(template, &values)?
            .with_session(session_id)
            // Intent mapping must stay near-deterministic regardless of
            // what a template override says.
            .with_temperature(template.temperature.min(constants::CLASSIFIER_TEMPERATURE));
        let generation = self.gateway.generate(request).await?;

        let raw: RawVerdict = serde_json::from_str(extract_json(&generation.content))?;
        let intent: Intent = raw
            .intent
            .parse()
            .map_err(crate::ChorusError::BadInput)?;
        let classification = Classification {
            intent,
            confidence: raw.confidence.clamp(0.0, 1.0),
            reason: raw.reason,
        };
        debug!(
            intent = classification.intent.as_str(),
            confidence = classification.confidence,
            "Query classified"
        );
        Ok(classification)
    }
}
