use crate::models::TokenUsage;
use lru::LruCache;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::sync::Mutex;

/// Cached generation payload.
#[derive(Debug, Clone)]
pub struct CachedGeneration {
    pub content: String,
    pub usage: TokenUsage,
}

/// Bounded LRU cache for LLM responses.
///
/// Keys are a stable SHA-256 over (model, system, prompt, temperature,
/// max_tokens). Lookups and inserts never suspend; the lock is held only for
/// the map operation itself.
pub struct ResponseCache {
    entries: Mutex<LruCache<[u8; 32], CachedGeneration>>,
}

impl ResponseCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity clamped to >= 1");
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn key(
        model: &str,
        system: Option<&str>,
        prompt: &str,
        temperature: f32,
        max_tokens: u32,
    ) -> [u8; 32] {
        let mut hasher = Sha256::new();
        // Length-prefixed fields; concatenation alone would let adjacent
        // fields collide.
        for part in [model, system.unwrap_or(""), prompt] {
            hasher.update((part.len() as u64).to_le_bytes());
            hasher.update(part.as_bytes());
        }
        hasher.update(temperature.to_le_bytes());
        hasher.update(max_tokens.to_le_bytes());
        hasher.finalize().into()
    }

    pub fn get(&self, key: &[u8; 32]) -> Option<CachedGeneration> {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        entries.get(key).cloned()
    }

    pub fn put(&self, key: [u8; 32], value: CachedGeneration) {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        entries.put(key, value);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
