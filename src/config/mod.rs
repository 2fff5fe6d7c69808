use crate::{constants, ChorusError, Result};
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

#[cfg(test)]
mod tests;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub scheduler: SchedulerConfig,
    pub llm: LlmConfig,
    pub retrieval: RetrievalConfig,
    pub events: EventsConfig,
    pub api: ApiConfig,
    /// Absolute root under which all user-derived paths must resolve.
    pub workspace_root: PathBuf,
    /// Whether multi-step plans end with a synthesis call or return the last
    /// step's answer verbatim.
    pub synthesize_plans: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub max_concurrent_tasks: usize,
    pub task_timeout_secs: u64,
    pub retry_ceiling: u32,
    pub max_queue_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout_secs: u64,
    pub cache_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    pub fanout: usize,
    pub cache_ttl_secs: u64,
    /// Embedding model identifier folded into retrieval cache keys so a
    /// model swap invalidates cached results.
    pub embedding_model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    pub subscriber_buffer: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub allowed_origins: Vec<String>,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn load() -> Result<Self> {
        match dotenv() {
            Ok(path) => tracing::debug!("Loaded .env file from: {:?}", path),
            Err(_) => tracing::debug!("No .env file found, using process environment"),
        }
        Self::from_env()
    }

    /// Build a config from the current process environment without touching
    /// any .env file. Used directly by tests.
    pub fn from_env() -> Result<Self> {
        let api_key = env::var("CHORUS_LLM_API_KEY").map_err(|_| {
            ChorusError::Configuration(
                "CHORUS_LLM_API_KEY environment variable is required".to_string(),
            )
        })?;
        if api_key.trim().is_empty() {
            return Err(ChorusError::Configuration(
                "CHORUS_LLM_API_KEY cannot be empty".to_string(),
            ));
        }

        let base_url =
            env::var("CHORUS_LLM_BASE_URL").unwrap_or_else(|_| "https://api.openai.com".to_string());
        url::Url::parse(&base_url).map_err(|e| {
            ChorusError::Configuration(format!("CHORUS_LLM_BASE_URL is not a valid URL: {e}"))
        })?;

        let llm = LlmConfig {
            api_key,
            base_url,
            model: env::var("CHORUS_LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            max_tokens: env_parse("CHORUS_LLM_MAX_TOKENS", 2048),
            temperature: env_parse("CHORUS_LLM_TEMPERATURE", 0.7),
            timeout_secs: env_parse("CHORUS_LLM_TIMEOUT_SEC", constants::DEFAULT_LLM_TIMEOUT_SECS),
            cache_capacity: env_parse(
                "CHORUS_LLM_CACHE_CAPACITY",
                constants::DEFAULT_LLM_CACHE_CAPACITY,
            ),
        };
        if !(0.0..=2.0).contains(&llm.temperature) {
            return Err(ChorusError::Configuration(format!(
                "CHORUS_LLM_TEMPERATURE must be within [0.0, 2.0], got {}",
                llm.temperature
            )));
        }

        let scheduler = SchedulerConfig {
            max_concurrent_tasks: env_parse(
                "CHORUS_MAX_CONCURRENT_TASKS",
                constants::DEFAULT_MAX_CONCURRENT_TASKS,
            ),
            task_timeout_secs: env_parse(
                "CHORUS_TASK_TIMEOUT_SEC",
                constants::DEFAULT_TASK_TIMEOUT_SECS,
            ),
            retry_ceiling: env_parse("CHORUS_RETRY_CEILING", constants::DEFAULT_RETRY_CEILING),
            max_queue_size: env_parse("CHORUS_MAX_QUEUE_SIZE", constants::MAX_QUEUE_SIZE),
        };
        if scheduler.max_concurrent_tasks == 0 {
            return Err(ChorusError::Configuration(
                "CHORUS_MAX_CONCURRENT_TASKS must be at least 1".to_string(),
            ));
        }

        let retrieval = RetrievalConfig {
            fanout: env_parse("CHORUS_RETRIEVAL_FANOUT", constants::DEFAULT_RETRIEVAL_FANOUT),
            cache_ttl_secs: env_parse(
                "CHORUS_RETRIEVAL_CACHE_TTL_SEC",
                constants::DEFAULT_RETRIEVAL_CACHE_TTL_SECS,
            ),
            embedding_model: env::var("CHORUS_EMBEDDING_MODEL")
                .unwrap_or_else(|_| "text-embedding-3-small".to_string()),
        };
        if retrieval.fanout == 0 {
            return Err(ChorusError::Configuration(
                "CHORUS_RETRIEVAL_FANOUT must be at least 1".to_string(),
            ));
        }

        let events = EventsConfig {
            subscriber_buffer: env_parse(
                "CHORUS_EVENT_SUBSCRIBER_BUFFER",
                constants::DEFAULT_EVENT_SUBSCRIBER_BUFFER,
            ),
        };

        let allowed_origins = env::var("CHORUS_ALLOWED_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:3000,http://127.0.0.1:3000".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let api = ApiConfig {
            // Bind localhost unless explicitly widened.
            host: env::var("CHORUS_API_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: env_parse("CHORUS_API_PORT", 3000),
            allowed_origins,
        };

        let workspace_root = PathBuf::from(
            env::var("CHORUS_WORKSPACE_ROOT").unwrap_or_else(|_| "./chorus-workspace".to_string()),
        );

        Ok(Config {
            scheduler,
            llm,
            retrieval,
            events,
            api,
            workspace_root,
            synthesize_plans: env_parse("CHORUS_SYNTHESIZE_PLANS", true),
        })
    }
}

#[cfg(test)]
impl Config {
    /// Compact config for unit tests. No environment access.
    pub fn for_tests(workspace_root: PathBuf) -> Self {
        Config {
            scheduler: SchedulerConfig {
                max_concurrent_tasks: constants::DEFAULT_MAX_CONCURRENT_TASKS,
                task_timeout_secs: constants::DEFAULT_TASK_TIMEOUT_SECS,
                retry_ceiling: constants::DEFAULT_RETRY_CEILING,
                max_queue_size: constants::MAX_QUEUE_SIZE,
            },
            llm: LlmConfig {
                api_key: "test-key".to_string(),
                base_url: "http://localhost:0".to_string(),
                model: "stub-model".to_string(),
                max_tokens: 512,
                temperature: 0.7,
                timeout_secs: 5,
                cache_capacity: 64,
            },
            retrieval: RetrievalConfig {
                fanout: constants::DEFAULT_RETRIEVAL_FANOUT,
                cache_ttl_secs: constants::DEFAULT_RETRIEVAL_CACHE_TTL_SECS,
                embedding_model: "stub-embed".to_string(),
            },
            events: EventsConfig {
                subscriber_buffer: constants::DEFAULT_EVENT_SUBSCRIBER_BUFFER,
            },
            api: ApiConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
                allowed_origins: vec![],
            },
            workspace_root,
            synthesize_plans: true,
        }
    }
}
