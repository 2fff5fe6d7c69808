use crate::models::SourceFragment;
use crate::{constants, ChorusError, Result};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::OnceLock;
use tokio::sync::RwLock;
use tracing::info;

/// Pluggable vector store backend. The engine only needs similarity search;
/// indexing and storage live behind this seam.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn similarity_search(&self, query: &str, k: usize) -> Result<Vec<SourceFragment>>;
    async fn document_count(&self) -> u64;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreDescriptor {
    pub name: String,
    pub description: String,
    pub document_count: u64,
}

struct RegisteredStore {
    descriptor: StoreDescriptor,
    backend: Arc<dyn VectorStore>,
}

fn store_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(constants::STORE_NAME_PATTERN).expect("static store-name regex"))
}

/// Reject any externally supplied store name that does not match the
/// validated-name shape. Nothing downstream (backend lookup, filesystem
/// paths) ever sees an unvalidated name.
pub fn validate_store_name(name: &str) -> Result<()> {
    if store_name_regex().is_match(name) {
        Ok(())
    } else {
        Err(ChorusError::BadInput(format!(
            "invalid store name: {name:?}"
        )))
    }
}

/// Resolve a directory for a user-supplied identifier strictly under `root`.
///
/// The comparison is by canonical path components, not string prefix, so
/// `/data/stores-evil` can never pass as being under `/data/stores`.
pub fn resolve_under_root(root: &Path, name: &str) -> Result<PathBuf> {
    validate_store_name(name)?;
    let canonical_root = root
        .canonicalize()
        .map_err(|e| ChorusError::Configuration(format!("workspace root {root:?}: {e}")))?;
    let candidate = canonical_root.join(name);
    // The name regex excludes separators and dot segments, so join cannot
    // escape; the component check guards against future regex loosening.
    if !candidate.starts_with(&canonical_root) {
        return Err(ChorusError::BadInput(format!(
            "path escapes workspace root: {name:?}"
        )));
    }
    Ok(candidate)
}

/// Registry of live knowledge stores.
///
/// Registration order is preserved and used as the deterministic tie-break
/// order when merging multi-store results. Mutation happens only through
/// admin operations.
pub struct StoreRegistry {
    stores: RwLock<Vec<RegisteredStore>>,
}

impl StoreRegistry {
    pub fn new() -> Self {
        Self {
            stores: RwLock::new(Vec::new()),
        }
    }

    pub async fn register(
        &self,
        name: &str,
        description: &str,
        backend: Arc<dyn VectorStore>,
    ) -> Result<()> {
        validate_store_name(name)?;
        let mut stores = self.stores.write().await;
        if stores.iter().any(|s| s.descriptor.name == name) {
            return Err(ChorusError::BadInput(format!(
                "store already registered: {name}"
            )));
        }
        let document_count = backend.document_count().await;
        stores.push(RegisteredStore {
            descriptor: StoreDescriptor {
                name: name.to_string(),
                description: description.to_string(),
                document_count,
            },
            backend,
        });
        info!(store = name, documents = document_count, "Registered store");
        Ok(())
    }

    pub async fn remove(&self, name: &str) -> Result<()> {
        validate_store_name(name)?;
        let mut stores = self.stores.write().await;
        let before = stores.len();
        stores.retain(|s| s.descriptor.name != name);
        if stores.len() == before {
            return Err(ChorusError::NotFound(format!("store: {name}")));
        }
        info!(store = name, "Removed store");
        Ok(())
    }

    /// Look up a backend together with its registration index (the
    /// tie-break rank).
    pub async fn get(&self, name: &str) -> Result<(usize, Arc<dyn VectorStore>)> {
        validate_store_name(name)?;
        let stores = self.stores.read().await;
        stores
            .iter()
            .position(|s| s.descriptor.name == name)
            .map(|idx| (idx, stores[idx].backend.clone()))
            .ok_or_else(|| ChorusError::NotFound(format!("store: {name}")))
    }

    pub async fn descriptors(&self) -> Vec<StoreDescriptor> {
        let stores = self.stores.read().await;
        stores.iter().map(|s| s.descriptor.clone()).collect()
    }

    pub async fn names(&self) -> Vec<String> {
        let stores = self.stores.read().await;
        stores.iter().map(|s| s.descriptor.name.clone()).collect()
    }

    pub async fn len(&self) -> usize {
        self.stores.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for StoreRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EmptyStore;

    #[async_trait]
    impl VectorStore for EmptyStore {
        async fn similarity_search(&self, _query: &str, _k: usize) -> Result<Vec<SourceFragment>> {
            Ok(Vec::new())
        }
        async fn document_count(&self) -> u64 {
            0
        }
    }

    #[test]
    fn name_validation() {
        for good in ["alpha", "store-1", "My_Store", "a", &"x".repeat(64)] {
            assert!(validate_store_name(good).is_ok(), "{good} should pass");
        }
        for bad in ["", "../etc", "a/b", "a b", "store!", &"x".repeat(65), "a\0b"] {
            assert!(validate_store_name(bad).is_err(), "{bad:?} should fail");
        }
    }

    #[test]
    fn traversal_names_never_resolve() {
        let dir = tempfile::tempdir().unwrap();
        assert!(resolve_under_root(dir.path(), "../etc").is_err());
        assert!(resolve_under_root(dir.path(), "..").is_err());
        let ok = resolve_under_root(dir.path(), "alpha").unwrap();
        assert!(ok.starts_with(dir.path().canonicalize().unwrap()));
    }

    #[tokio::test]
    async fn registration_is_ordered_and_unique() {
        let registry = StoreRegistry::new();
        registry
            .register("beta", "second", Arc::new(EmptyStore))
            .await
            .unwrap();
        registry
            .register("alpha", "first", Arc::new(EmptyStore))
            .await
            .unwrap();

        // Order is registration order, not lexicographic.
        assert_eq!(registry.names().await, vec!["beta", "alpha"]);
        assert_eq!(registry.get("beta").await.unwrap().0, 0);
        assert_eq!(registry.get("alpha").await.unwrap().0, 1);

        let err = registry
            .register("alpha", "dup", Arc::new(EmptyStore))
            .await
            .unwrap_err();
        assert!(matches!(err, ChorusError::BadInput(_)));

        registry.remove("beta").await.unwrap();
        assert_eq!(registry.get("alpha").await.unwrap().0, 0);
        assert!(matches!(
            registry.get("beta").await,
            Err(ChorusError::NotFound(_))
        ));
    }
}
