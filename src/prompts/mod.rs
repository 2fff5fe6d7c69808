//! Keyed prompt templates.
//!
//! Templates are assembled once at startup (built-in set, optionally
//! overridden from a directory of JSON files) and immutable afterwards.
//! Rendering substitutes `{name}` placeholders; a placeholder without a
//! provided value is a `bad_input` failure, not a silent passthrough.

use crate::{ChorusError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub key: String,
    pub system: String,
    pub user_template: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl PromptTemplate {
    /// Substitute named placeholders with provided values.
    pub fn render(&self, values: &HashMap<String, String>) -> Result<String> {
        render_placeholders(&self.user_template, values)
    }
}

fn render_placeholders(template: &str, values: &HashMap<String, String>) -> Result<String> {
    // Single-pass: placeholder values are inserted verbatim and never
    // re-scanned, so user text containing braces cannot inject.
    let pattern = Regex::new(r"\{([a-zA-Z0-9_]+)\}").expect("static placeholder regex");
    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for caps in pattern.captures_iter(template) {
        let whole = caps.get(0).expect("capture 0 always present");
        let name = &caps[1];
        out.push_str(&template[last..whole.start()]);
        match values.get(name) {
            Some(value) => out.push_str(value),
            None => {
                return Err(ChorusError::BadInput(format!(
                    "missing template placeholder: {name}"
                )))
            }
        }
        last = whole.end();
    }
    out.push_str(&template[last..]);
    Ok(out)
}

/// Immutable registry of prompt templates keyed by name.
pub struct PromptRegistry {
    templates: HashMap<String, PromptTemplate>,
}

impl PromptRegistry {
    /// The built-in template set the engine ships with.
    pub fn builtin() -> Self {
        let mut templates = HashMap::new();
        for template in default_templates() {
            templates.insert(template.key.clone(), template);
        }
        Self { templates }
    }

    /// Built-ins overridden by any `<key>.json` files found in `dir`.
    pub fn load(dir: &Path) -> Result<Self> {
        let mut registry = Self::builtin();
        if !dir.is_dir() {
            debug!("Prompt directory {:?} not present, using built-ins", dir);
            return Ok(registry);
        }
        let entries = std::fs::read_dir(dir)
            .map_err(|e| ChorusError::Configuration(format!("cannot read prompt dir: {e}")))?;
        let mut loaded = 0usize;
        for entry in entries {
            let entry =
                entry.map_err(|e| ChorusError::Configuration(format!("prompt dir entry: {e}")))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| ChorusError::Configuration(format!("read {path:?}: {e}")))?;
            let template: PromptTemplate = serde_json::from_str(&raw)?;
            registry.templates.insert(template.key.clone(), template);
            loaded += 1;
        }
        if loaded > 0 {
            info!("Loaded {} prompt template override(s) from {:?}", loaded, dir);
        }
        Ok(registry)
    }

    pub fn get(&self, key: &str) -> Result<&PromptTemplate> {
        self.templates
            .get(key)
            .ok_or_else(|| ChorusError::NotFound(format!("prompt template: {key}")))
    }

    pub fn keys(&self) -> Vec<&str> {
        self.templates.keys().map(String::as_str).collect()
    }
}

pub mod keys {
    pub const CLASSIFIER: &str = "classifier";
    pub const CLASSIFIER_STRICT: &str = "classifier_strict";
    pub const STORE_ROUTER: &str = "store_router";
    pub const PLANNER: &str = "planner";
    pub const QUALITY_JUDGE: &str = "quality_judge";
    pub const CHAT: &str = "chat";
    pub const RAG_SYNTHESIS: &str = "rag_synthesis";
    pub const PLAN_SYNTHESIS: &str = "plan_synthesis";
    pub const TRANSLATE: &str = "translate";
    pub const SUMMARIZE: &str = "summarize";
}

fn default_templates() -> Vec<PromptTemplate> {
    vec![
        PromptTemplate {
            key: keys::CLASSIFIER.to_string(),
            system: "You classify user queries into exactly one intent. Respond with a single \
                     JSON object: {\"intent\": \"<intent>\", \"confidence\": <0..1>, \
                     \"reason\": \"<short reason>\"}. Valid intents: casual_chat, \
                     knowledge_lookup, compute, translate, summarize, tool_use, \
                     plan_and_execute, unknown."
                .to_string(),
            user_template: "Query: {query}\nContext: {context}".to_string(),
            temperature: 0.1,
            max_tokens: 200,
        },
        PromptTemplate {
            key: keys::CLASSIFIER_STRICT.to_string(),
            system: "Return ONLY a JSON object, no prose, no code fences: \
                     {\"intent\": \"...\", \"confidence\": 0.0, \"reason\": \"...\"}. \
                     The intent MUST be one of: casual_chat, knowledge_lookup, compute, \
                     translate, summarize, tool_use, plan_and_execute, unknown."
                .to_string(),
            user_template: "Query: {query}".to_string(),
            temperature: 0.0,
            max_tokens: 120,
        },
        PromptTemplate {
            key: keys::STORE_ROUTER.to_string(),
            system: "Select which knowledge stores are relevant to the query. Respond with a \
                     JSON array of store names drawn only from the provided list. An empty \
                     array means none are relevant."
                .to_string(),
            user_template: "Stores:\n{stores}\n\nQuery: {query}".to_string(),
            temperature: 0.0,
            max_tokens: 150,
        },
        PromptTemplate {
            key: keys::PLANNER.to_string(),
            system: "Break the request into an ordered list of steps for specialist agents. \
                     Respond with a JSON array of objects {\"agent\": \"<name>\", \
                     \"input\": \"<instruction>\"}. Valid agents: casual_chat, knowledge, \
                     compute, translate, summarize, tool_use. Use as few steps as possible."
                .to_string(),
            user_template: "Request: {query}".to_string(),
            temperature: 0.2,
            max_tokens: 500,
        },
        PromptTemplate {
            key: keys::QUALITY_JUDGE.to_string(),
            system: "You judge whether an answer addresses the question. Apply the rubric \
                     strictly: (1) the answer is non-empty; (2) it responds to the question \
                     rather than a different one; (3) factual claims are consistent with the \
                     provided sources when sources exist. Respond with a JSON object \
                     {\"addresses\": true|false, \"issues\": [\"...\"]}."
                .to_string(),
            user_template: "Question: {query}\n\nAnswer: {answer}\n\nSources:\n{sources}"
                .to_string(),
            temperature: 0.0,
            max_tokens: 300,
        },
        PromptTemplate {
            key: keys::CHAT.to_string(),
            system: "You are a helpful, concise conversational assistant.".to_string(),
            user_template: "{query}".to_string(),
            temperature: 0.7,
            max_tokens: 1024,
        },
        PromptTemplate {
            key: keys::RAG_SYNTHESIS.to_string(),
            system: "Answer the question using ONLY the provided context passages. Cite the \
                     passages you used by their document id in square brackets, e.g. [doc-3]. \
                     If the context is insufficient, say so."
                .to_string(),
            user_template: "Context:\n{context}\n\nQuestion: {query}".to_string(),
            temperature: 0.3,
            max_tokens: 1024,
        },
        PromptTemplate {
            key: keys::PLAN_SYNTHESIS.to_string(),
            system: "Combine the step outputs below into one coherent answer to the original \
                     request. Do not mention the steps themselves."
                .to_string(),
            user_template: "Request: {query}\n\nStep outputs:\n{steps}".to_string(),
            temperature: 0.4,
            max_tokens: 1024,
        },
        PromptTemplate {
            key: keys::TRANSLATE.to_string(),
            system: "Translate the text. If no target language is stated, translate to \
                     English. Output only the translation."
                .to_string(),
            user_template: "{query}".to_string(),
            temperature: 0.2,
            max_tokens: 1024,
        },
        PromptTemplate {
            key: keys::SUMMARIZE.to_string(),
            system: "Summarize the text in a short paragraph preserving the key facts."
                .to_string(),
            user_template: "{query}".to_string(),
            temperature: 0.3,
            max_tokens: 512,
        },
    ]
}
