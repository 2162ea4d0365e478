//! Long-term memory for AI agents: a hierarchical file memory
//! (resource → item → category summary), a triplet graph memory with
//! current/past/uncertain lifecycle, a vector index shared by both, and a
//! maintenance engine that keeps them compact on a nightly/weekly/monthly
//! schedule. A recall pipeline ranks memories of both kinds by relevance
//! and age for an agent's prompt.

pub mod ai;
pub mod config;
pub mod db;
pub mod error;
pub mod file_memory;
pub mod graph_memory;
pub mod maintenance;
pub mod memory;
pub mod prompts;
pub mod recall;
pub mod text;
pub mod thresholds;
pub mod util;
pub mod vector;

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;

pub use ai::{CallableError, Embedder, Llm};
pub use config::MemoryConfig;
pub use db::{Store, TripletInput, TripletStatus};
pub use error::MnemosError;
pub use file_memory::{FileMemory, FileRetrieveOptions, ItemInput, RetrievalLevel};
pub use graph_memory::{Expand, GraphLevel, GraphMemory, GraphRetrieveOptions};
pub use maintenance::{Cadence, MaintenanceEngine, MaintenanceReport, Scheduler};
pub use memory::{AgentMemory, AgentMemoryBuilder, MemoryMode, RecallOptions};
pub use recall::RecallPipeline;
pub use vector::{SqliteVectorIndex, VectorIndex};

pub type SharedStore = Arc<db::Store>;

/// Run a blocking store operation on tokio's blocking thread pool.
///
/// Engine calls are synchronous (they hit SQLite and the caller's LLM);
/// async hosts MUST go through this to avoid starving worker threads.
pub async fn store_call<F, T>(store: &SharedStore, f: F) -> Result<T, MnemosError>
where
    F: FnOnce(&db::Store) -> Result<T, MnemosError> + Send + 'static,
    T: Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || f(&store))
        .await
        .map_err(|e| MnemosError::Pool(format!("blocking task: {e}")))?
}

/// LRU cache of query embeddings, shared by the engines of one memory.
#[derive(Clone)]
pub struct EmbedCache {
    inner: Arc<parking_lot::Mutex<EmbedCacheInner>>,
}

struct EmbedCacheInner {
    cache: LruCache<String, Vec<f32>>,
    hits: u64,
    misses: u64,
}

impl EmbedCache {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Arc::new(parking_lot::Mutex::new(EmbedCacheInner {
                cache: LruCache::new(cap),
                hits: 0,
                misses: 0,
            })),
        }
    }

    pub fn get(&self, key: &str) -> Option<Vec<f32>> {
        let mut inner = self.inner.lock();
        let val = inner.cache.get(key).cloned();
        if val.is_some() {
            inner.hits += 1;
        } else {
            inner.misses += 1;
        }
        val
    }

    pub fn insert(&self, key: String, value: Vec<f32>) {
        self.inner.lock().cache.put(key, value);
    }

    /// (len, capacity, hits, misses)
    pub fn stats(&self) -> (usize, usize, u64, u64) {
        let inner = self.inner.lock();
        (inner.cache.len(), inner.cache.cap().get(), inner.hits, inner.misses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embed_cache_counts() {
        let cache = EmbedCache::new(1);
        assert!(cache.get("a").is_none());
        cache.insert("a".into(), vec![1.0]);
        assert_eq!(cache.get("a"), Some(vec![1.0]));
        cache.insert("b".into(), vec![2.0]);
        assert!(cache.get("a").is_none(), "capacity 1 evicts");
        assert_eq!(cache.stats(), (1, 1, 1, 2));
    }

    #[tokio::test]
    async fn store_call_runs_on_blocking_pool() {
        let store: SharedStore = Arc::new(Store::open(":memory:").unwrap());
        store_call(&store, |s| s.set_meta("k", "v")).await.unwrap();
        let v = store_call(&store, |s| Ok(s.get_meta("k"))).await.unwrap();
        assert_eq!(v.as_deref(), Some("v"));
    }
}
