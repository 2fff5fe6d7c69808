//! Parallel multi-store retrieval with deduplication and caching.
//!
//! Fan-out across stores is bounded by a dedicated semaphore so a wide
//! `query_multi` cannot monopolize backend connections. Merging is
//! deterministic: stable sort by score descending with the configured store
//! order as tie-break, duplicates collapsed to their highest-scoring copy.

pub mod store;

pub use store::{validate_store_name, StoreDescriptor, StoreRegistry, VectorStore};

use crate::config::RetrievalConfig;
use crate::llm::{extract_json, GenerationRequest, LlmGateway};
use crate::models::SourceFragment;
use crate::prompts::{keys, PromptRegistry};
use crate::{ChorusError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, warn};

struct CacheEntry {
    expires_at: Instant,
    fragments: Vec<SourceFragment>,
}

pub struct RetrievalLayer {
    registry: Arc<StoreRegistry>,
    gateway: Arc<LlmGateway>,
    prompts: Arc<PromptRegistry>,
    fanout: Arc<Semaphore>,
    cache: RwLock<HashMap<String, CacheEntry>>,
    cache_ttl: Duration,
    embedding_model: String,
}

impl RetrievalLayer {
    pub fn new(
        registry: Arc<StoreRegistry>,
        gateway: Arc<LlmGateway>,
        prompts: Arc<PromptRegistry>,
        config: &RetrievalConfig,
    ) -> Self {
        Self {
            registry,
            gateway,
            prompts,
            fanout: Arc::new(Semaphore::new(config.fanout)),
            cache: RwLock::new(HashMap::new()),
            cache_ttl: Duration::from_secs(config.cache_ttl_secs),
            embedding_model: config.embedding_model.clone(),
        }
    }

    pub async fn query_single(
        &self,
        store_name: &str,
        text: &str,
        k: usize,
    ) -> Result<Vec<SourceFragment>> {
        self.query_multi(&[store_name.to_string()], text, k).await
    }

    /// Query several stores in parallel and merge to the global top-k.
    ///
    /// Every name is validated before any backend is touched; one invalid
    /// name rejects the whole call with `bad_input`.
    pub async fn query_multi(
        &self,
        store_names: &[String],
        text: &str,
        k: usize,
    ) -> Result<Vec<SourceFragment>> {
        for name in store_names {
            validate_store_name(name)?;
        }
        if store_names.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let cache_key = self.cache_key(store_names, text, k);
        if let Some(hit) = self.cache_get(&cache_key).await {
            debug!("Retrieval cache hit");
            return Ok(hit);
        }

        // Resolve all backends up front so an unknown store fails before
        // any search runs.
        let mut backends = Vec::with_capacity(store_names.len());
        for name in store_names {
            let (order, backend) = self.registry.get(name).await?;
            backends.push((name.clone(), order, backend));
        }

        let searches = backends.into_iter().map(|(name, order, backend)| {
            let fanout = self.fanout.clone();
            let text = text.to_string();
            async move {
                let _permit = fanout
                    .acquire()
                    .await
                    .expect("fanout semaphore never closed");
                let mut result = backend.similarity_search(&text, k).await;
                if matches!(result, Err(ChorusError::Store { .. })) {
                    // Store errors get exactly one retry before surfacing.
                    warn!(store = %name, "Store query failed, retrying once");
                    result = backend.similarity_search(&text, k).await;
                }
                result.map(|mut fragments| {
                    for fragment in &mut fragments {
                        fragment.store = name.clone();
                    }
                    (order, fragments)
                })
            }
        });

        let mut per_store = Vec::with_capacity(store_names.len());
        for outcome in futures::future::join_all(searches).await {
            per_store.push(outcome?);
        }

        let merged = merge_fragments(per_store, k);
        self.cache_put(cache_key, merged.clone()).await;
        Ok(merged)
    }

    /// Route the query to a relevant subset of stores via the LLM gateway,
    /// falling back to all stores when routing fails.
    pub async fn query_auto(&self, text: &str, k: usize) -> Result<Vec<SourceFragment>> {
        let all_names = self.registry.names().await;
        if all_names.is_empty() {
            return Ok(Vec::new());
        }

        let selected = match self.route_stores(text).await {
            Ok(selected) if !selected.is_empty() => selected,
            Ok(_) => {
                debug!("Store routing selected nothing, querying all stores");
                all_names.clone()
            }
            Err(e) => {
                warn!("Store routing failed, querying all stores: {}", e);
                all_names.clone()
            }
        };
        self.query_multi(&selected, text, k).await
    }

    async fn route_stores(&self, text: &str) -> Result<Vec<String>> {
        let descriptors = self.registry.descriptors().await;
        let listing = descriptors
            .iter()
            .map(|d| format!("- {}: {}", d.name, d.description))
            .collect::<Vec<_>>()
            .join("\n");

        let template = self.prompts.get(keys::STORE_ROUTER)?;
        let mut values = HashMap::new();
        values.insert("stores".to_string(), listing);
        values.insert("query".to_string(), text.to_string());
        let generation = self
            .gateway
            .generate(GenerationRequest::from_template(template, &values)?)
            .await?;

        let names: Vec<String> = serde_json::from_str(extract_json(&generation.content))?;
        // Keep only names the registry actually knows; the model may invent.
        let known = self.registry.names().await;
        Ok(names
            .into_iter()
            .filter(|n| known.iter().any(|k| k == n))
            .collect())
    }

    fn cache_key(&self, store_names: &[String], text: &str, k: usize) -> String {
        let mut sorted: Vec<&str> = store_names.iter().map(String::as_str).collect();
        sorted.sort_unstable();
        format!(
            "{}|{}|{}|{}",
            self.embedding_model,
            k,
            sorted.join(","),
            text
        )
    }

    async fn cache_get(&self, key: &str) -> Option<Vec<SourceFragment>> {
        let cache = self.cache.read().await;
        cache
            .get(key)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.fragments.clone())
    }

    async fn cache_put(&self, key: String, fragments: Vec<SourceFragment>) {
        let mut cache = self.cache.write().await;
        let now = Instant::now();
        cache.retain(|_, entry| entry.expires_at > now);
        cache.insert(
            key,
            CacheEntry {
                expires_at: now + self.cache_ttl,
                fragments,
            },
        );
    }
}

/// Merge per-store result lists into the global top-k.
///
/// Sort is stable over (score desc, store order asc); duplicates (same
/// document id seen from several stores) keep only their best-ranked copy.
fn merge_fragments(per_store: Vec<(usize, Vec<SourceFragment>)>, k: usize) -> Vec<SourceFragment> {
    let mut all: Vec<(usize, SourceFragment)> = per_store
        .into_iter()
        .flat_map(|(order, fragments)| fragments.into_iter().map(move |f| (order, f)))
        .collect();

    all.sort_by(|(order_a, a), (order_b, b)| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(order_a.cmp(order_b))
    });

    let mut seen = std::collections::HashSet::new();
    let mut merged = Vec::with_capacity(k);
    for (_, fragment) in all {
        if seen.insert(fragment.document_id.clone()) {
            merged.push(fragment);
            if merged.len() == k {
                break;
            }
        }
    }
    merged
}
