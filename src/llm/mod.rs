//! Provider-agnostic LLM gateway.
//!
//! Single entry point for every generation in the engine: all specialists,
//! the classifier, the planner, and the quality judge go through
//! [`LlmGateway::generate`], which layers caching, retries, timeouts, and
//! token accounting over a pluggable [`LlmProvider`].

pub mod cache;
pub mod provider;

pub use cache::ResponseCache;
pub use provider::{Completion, CompletionRequest, HttpProvider, LlmProvider};

use crate::models::TokenUsage;
use crate::prompts::PromptTemplate;
use crate::{constants, ChorusError, Result};
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Static per-model rate table, USD per 1K tokens (prompt, completion).
/// Matched by model-name prefix; unknown models bill at the default rate.
const MODEL_RATES: &[(&str, f64, f64)] = &[
    ("gpt-4o-mini", 0.00015, 0.0006),
    ("gpt-4o", 0.0025, 0.01),
    ("gpt-4.1", 0.002, 0.008),
    ("claude-3-5-haiku", 0.0008, 0.004),
    ("claude-3-5-sonnet", 0.003, 0.015),
];
const DEFAULT_RATE: (f64, f64) = (0.001, 0.002);

fn rate_for(model: &str) -> (f64, f64) {
    MODEL_RATES
        .iter()
        .find(|(prefix, _, _)| model.starts_with(prefix))
        .map(|(_, p, c)| (*p, *c))
        .unwrap_or(DEFAULT_RATE)
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: String,
    pub system: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub session_id: Option<String>,
    pub use_cache: bool,
}

impl GenerationRequest {
    /// Build a request from a prompt template and placeholder values.
    pub fn from_template(
        template: &PromptTemplate,
        values: &HashMap<String, String>,
    ) -> Result<Self> {
        Ok(Self {
            prompt: template.render(values)?,
            system: Some(template.system.clone()),
            temperature: template.temperature,
            max_tokens: template.max_tokens,
            session_id: None,
            use_cache: false,
        })
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn cached(mut self) -> Self {
        self.use_cache = true;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

#[derive(Debug, Clone)]
pub struct Generation {
    pub content: String,
    pub usage: TokenUsage,
    pub cached: bool,
}

/// Process-wide token counters. Cost is tracked in microdollars so the hot
/// path stays on atomic adds.
#[derive(Default)]
struct GlobalCounters {
    prompt: AtomicU64,
    completion: AtomicU64,
    cost_microdollars: AtomicU64,
}

/// Strip optional markdown code fences around a JSON payload produced by a
/// model. Parsing of the remainder is the caller's business.
pub(crate) fn extract_json(content: &str) -> &str {
    let trimmed = content.trim();
    trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed)
}

pub struct LlmGateway {
    provider: Arc<dyn LlmProvider>,
    cache: ResponseCache,
    timeout: Duration,
    global: GlobalCounters,
    per_session: RwLock<HashMap<String, TokenUsage>>,
}

impl LlmGateway {
    pub fn new(provider: Arc<dyn LlmProvider>, cache_capacity: usize, timeout_secs: u64) -> Self {
        Self {
            provider,
            cache: ResponseCache::new(cache_capacity),
            timeout: Duration::from_secs(timeout_secs),
            global: GlobalCounters::default(),
            per_session: RwLock::new(HashMap::new()),
        }
    }

    pub fn model(&self) -> &str {
        self.provider.model()
    }

    /// Generate a completion.
    ///
    /// Cache hits return without touching the provider and without
    /// accumulating usage (nothing was spent). Transient provider failures
    /// retry with exponential backoff and jitter up to
    /// [`constants::LLM_MAX_ATTEMPTS`]; everything else fails fast.
    pub async fn generate(&self, request: GenerationRequest) -> Result<Generation> {
        let key = ResponseCache::key(
            self.provider.model(),
            request.system.as_deref(),
            &request.prompt,
            request.temperature,
            request.max_tokens,
        );

        if request.use_cache {
            if let Some(hit) = self.cache.get(&key) {
                debug!("LLM cache hit");
                return Ok(Generation {
                    content: hit.content,
                    usage: hit.usage,
                    cached: true,
                });
            }
        }

        let completion_request = CompletionRequest {
            system: request.system.clone(),
            prompt: request.prompt.clone(),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let completion = self.call_with_retries(&completion_request).await?;
        let usage = self.account(&completion, request.session_id.as_deref()).await;

        if request.use_cache {
            self.cache.put(
                key,
                cache::CachedGeneration {
                    content: completion.content.clone(),
                    usage: usage.clone(),
                },
            );
        }

        Ok(Generation {
            content: completion.content,
            usage,
            cached: false,
        })
    }

    async fn call_with_retries(&self, request: &CompletionRequest) -> Result<Completion> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let outcome = tokio::time::timeout(self.timeout, self.provider.complete(request)).await;

            let err = match outcome {
                Ok(Ok(completion)) => return Ok(completion),
                Ok(Err(e)) => e,
                Err(_) => ChorusError::Timeout {
                    message: format!("llm call exceeded {:?}", self.timeout),
                },
            };

            let transient = matches!(
                err,
                ChorusError::Timeout { .. }
                    | ChorusError::Http(_)
                    | ChorusError::Llm { transient: true, .. }
            );
            if !transient || attempt >= constants::LLM_MAX_ATTEMPTS {
                return Err(err);
            }

            let backoff = constants::LLM_BACKOFF_BASE_MS
                * u64::from(constants::LLM_BACKOFF_FACTOR.pow(attempt - 1));
            let jitter = rand::thread_rng().gen_range(0..=backoff / 4);
            warn!(
                attempt,
                backoff_ms = backoff + jitter,
                "Transient LLM failure, backing off: {}",
                err
            );
            tokio::time::sleep(Duration::from_millis(backoff + jitter)).await;
        }
    }

    async fn account(&self, completion: &Completion, session_id: Option<&str>) -> TokenUsage {
        let (prompt_rate, completion_rate) = rate_for(self.provider.model());
        let cost = (completion.prompt_tokens as f64 / 1000.0) * prompt_rate
            + (completion.completion_tokens as f64 / 1000.0) * completion_rate;
        let usage = TokenUsage {
            prompt: completion.prompt_tokens,
            completion: completion.completion_tokens,
            total: completion.prompt_tokens + completion.completion_tokens,
            cost,
        };

        self.global.prompt.fetch_add(usage.prompt, Ordering::Relaxed);
        self.global
            .completion
            .fetch_add(usage.completion, Ordering::Relaxed);
        self.global
            .cost_microdollars
            .fetch_add((cost * 1_000_000.0) as u64, Ordering::Relaxed);

        if let Some(session_id) = session_id {
            let mut per_session = self.per_session.write().await;
            let entry = per_session.entry(session_id.to_string()).or_default();
            entry.prompt += usage.prompt;
            entry.completion += usage.completion;
            entry.total += usage.total;
            entry.cost += usage.cost;
        }

        usage
    }

    pub fn global_usage(&self) -> TokenUsage {
        let prompt = self.global.prompt.load(Ordering::Relaxed);
        let completion = self.global.completion.load(Ordering::Relaxed);
        TokenUsage {
            prompt,
            completion,
            total: prompt + completion,
            cost: self.global.cost_microdollars.load(Ordering::Relaxed) as f64 / 1_000_000.0,
        }
    }

    pub async fn session_usage(&self, session_id: &str) -> TokenUsage {
        let per_session = self.per_session.read().await;
        per_session.get(session_id).cloned().unwrap_or_default()
    }

    pub async fn forget_session(&self, session_id: &str) {
        let mut per_session = self.per_session.write().await;
        per_session.remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    /// Provider that fails transiently `failures` times, then succeeds.
    struct FlakyProvider {
        failures: AtomicU32,
        calls: AtomicU32,
    }

    impl FlakyProvider {
        fn new(failures: u32) -> Self {
            Self {
                failures: AtomicU32::new(failures),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl LlmProvider for FlakyProvider {
        fn model(&self) -> &str {
            "gpt-4o-mini"
        }

        async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(ChorusError::Llm {
                    message: "503".into(),
                    transient: true,
                });
            }
            Ok(Completion {
                content: format!("echo: {}", request.prompt),
                prompt_tokens: 10,
                completion_tokens: 5,
            })
        }
    }

    struct FatalProvider;

    #[async_trait]
    impl LlmProvider for FatalProvider {
        fn model(&self) -> &str {
            "gpt-4o-mini"
        }

        async fn complete(&self, _request: &CompletionRequest) -> Result<Completion> {
            Err(ChorusError::Llm {
                message: "invalid request".into(),
                transient: false,
            })
        }
    }

    fn request(prompt: &str) -> GenerationRequest {
        GenerationRequest {
            prompt: prompt.into(),
            system: None,
            temperature: 0.0,
            max_tokens: 64,
            session_id: None,
            use_cache: false,
        }
    }

    #[tokio::test]
    async fn retries_transient_failures_then_succeeds() {
        let provider = Arc::new(FlakyProvider::new(2));
        let gateway = LlmGateway::new(provider.clone(), 8, 5);

        let generation = gateway.generate(request("hello")).await.unwrap();
        assert_eq!(generation.content, "echo: hello");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_the_error() {
        let provider = Arc::new(FlakyProvider::new(10));
        let gateway = LlmGateway::new(provider.clone(), 8, 5);

        let err = gateway.generate(request("hello")).await.unwrap_err();
        assert!(matches!(err, ChorusError::Llm { transient: true, .. }));
        assert_eq!(
            provider.calls.load(Ordering::SeqCst),
            constants::LLM_MAX_ATTEMPTS
        );
    }

    #[tokio::test]
    async fn persistent_errors_fail_fast() {
        let gateway = LlmGateway::new(Arc::new(FatalProvider), 8, 5);
        let err = gateway.generate(request("hello")).await.unwrap_err();
        assert!(matches!(
            err,
            ChorusError::Llm {
                transient: false,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn cache_short_circuits_identical_requests() {
        let provider = Arc::new(FlakyProvider::new(0));
        let gateway = LlmGateway::new(provider.clone(), 8, 5);

        let first = gateway.generate(request("same").cached()).await.unwrap();
        let second = gateway.generate(request("same").cached()).await.unwrap();

        assert!(!first.cached);
        assert!(second.cached);
        assert_eq!(first.content, second.content);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        // Cached hit accumulates nothing.
        assert_eq!(gateway.global_usage().prompt, 10);
    }

    #[tokio::test]
    async fn accounting_accumulates_per_session_and_globally() {
        let gateway = LlmGateway::new(Arc::new(FlakyProvider::new(0)), 8, 5);

        gateway
            .generate(request("one").with_session("sess-a"))
            .await
            .unwrap();
        gateway
            .generate(request("two").with_session("sess-a"))
            .await
            .unwrap();
        gateway
            .generate(request("three").with_session("sess-b"))
            .await
            .unwrap();

        let a = gateway.session_usage("sess-a").await;
        assert_eq!(a.prompt, 20);
        assert_eq!(a.completion, 10);
        assert_eq!(a.total, 30);
        assert!(a.cost > 0.0);

        let global = gateway.global_usage();
        assert_eq!(global.total, 45);

        gateway.forget_session("sess-a").await;
        assert_eq!(gateway.session_usage("sess-a").await.total, 0);
    }

    #[test]
    fn rate_table_prefix_match() {
        assert_eq!(rate_for("gpt-4o-mini-2024"), (0.00015, 0.0006));
        assert_eq!(rate_for("gpt-4o-2024"), (0.0025, 0.01));
        assert_eq!(rate_for("mystery-model"), DEFAULT_RATE);
    }
}
