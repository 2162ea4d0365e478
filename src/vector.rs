//! Vector similarity index keyed by owner id.
//!
//! Entries are persisted in the `vector_entries` table and served from an
//! in-memory map loaded at open. Brute-force cosine over one user's entries;
//! fine for the per-user collection sizes this engine targets.

use std::cmp::Ordering;
use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ai::cosine_similarity;
use crate::db::MemoryKind;
use crate::error::MnemosError;
use crate::SharedStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorEntry {
    pub vector_id: String,
    pub user_id: String,
    pub memory_kind: MemoryKind,
    /// Item id for file memory, resource id for graph memory.
    pub owner_id: String,
    pub embedding: Vec<f32>,
    pub created_at: i64,
}

impl VectorEntry {
    pub fn new(user_id: &str, memory_kind: MemoryKind, owner_id: &str, embedding: Vec<f32>, created_at: i64) -> Self {
        Self {
            vector_id: vector_id(memory_kind, owner_id),
            user_id: user_id.to_string(),
            memory_kind,
            owner_id: owner_id.to_string(),
            embedding,
            created_at,
        }
    }
}

/// Deterministic id so re-embedding an owner overwrites its entry.
pub fn vector_id(kind: MemoryKind, owner_id: &str) -> String {
    format!("{}:{owner_id}", kind.as_str())
}

#[derive(Debug, Clone)]
pub struct VectorFilter {
    pub user_id: String,
    pub memory_kind: Option<MemoryKind>,
}

impl VectorFilter {
    pub fn new(user_id: &str, memory_kind: Option<MemoryKind>) -> Self {
        Self {
            user_id: user_id.to_string(),
            memory_kind,
        }
    }

    fn matches(&self, e: &VectorEntry) -> bool {
        e.user_id == self.user_id && self.memory_kind.is_none_or(|k| k == e.memory_kind)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VectorHit {
    pub vector_id: String,
    pub owner_id: String,
    /// Cosine similarity scaled to [0, 1].
    pub score: f64,
    pub created_at: i64,
}

pub trait VectorIndex: Send + Sync {
    fn upsert(&self, entry: VectorEntry) -> Result<(), MnemosError>;

    /// Best `top_k` matches, highest score first, ties to the newest entry.
    fn query(&self, embedding: &[f32], top_k: usize, filter: &VectorFilter) -> Result<Vec<VectorHit>, MnemosError>;

    /// Returns whether an entry was removed.
    fn delete(&self, vector_id: &str) -> Result<bool, MnemosError>;

    fn get(&self, vector_id: &str) -> Option<VectorEntry>;

    fn entries(&self, filter: &VectorFilter) -> Vec<VectorEntry>;

    /// Compact and reload. Returns the number of live entries.
    fn rebuild(&self) -> Result<usize, MnemosError>;
}

/// Scale cosine from [-1, 1] to [0, 1].
pub fn scaled_score(cosine: f64) -> f64 {
    ((cosine + 1.0) / 2.0).clamp(0.0, 1.0)
}

pub struct SqliteVectorIndex {
    store: SharedStore,
    cache: RwLock<HashMap<String, VectorEntry>>,
}

impl SqliteVectorIndex {
    pub fn open(store: SharedStore) -> Result<Self, MnemosError> {
        let idx = Self {
            store,
            cache: RwLock::new(HashMap::new()),
        };
        idx.load()?;
        Ok(idx)
    }

    fn load(&self) -> Result<usize, MnemosError> {
        let entries = self.store.load_vectors()?;
        let count = entries.len();
        let mut cache = self.cache.write();
        cache.clear();
        for e in entries {
            cache.insert(e.vector_id.clone(), e);
        }
        debug!(count, "loaded vector index");
        Ok(count)
    }

    pub fn len(&self) -> usize {
        self.cache.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.read().is_empty()
    }
}

impl VectorIndex for SqliteVectorIndex {
    fn upsert(&self, entry: VectorEntry) -> Result<(), MnemosError> {
        if entry.embedding.is_empty() {
            return Err(MnemosError::Validation(format!("empty embedding for {}", entry.vector_id)));
        }
        self.store.put_vector(&entry)?;
        self.cache.write().insert(entry.vector_id.clone(), entry);
        Ok(())
    }

    fn query(&self, embedding: &[f32], top_k: usize, filter: &VectorFilter) -> Result<Vec<VectorHit>, MnemosError> {
        if top_k == 0 || embedding.is_empty() {
            return Ok(vec![]);
        }
        let cache = self.cache.read();
        let mut hits: Vec<VectorHit> = cache
            .values()
            .filter(|e| filter.matches(e) && e.embedding.len() == embedding.len())
            .map(|e| VectorHit {
                vector_id: e.vector_id.clone(),
                owner_id: e.owner_id.clone(),
                score: scaled_score(cosine_similarity(embedding, &e.embedding)),
                created_at: e.created_at,
            })
            .collect();
        drop(cache);
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then(b.created_at.cmp(&a.created_at))
                .then_with(|| a.vector_id.cmp(&b.vector_id))
        });
        hits.truncate(top_k);
        Ok(hits)
    }

    fn delete(&self, vector_id: &str) -> Result<bool, MnemosError> {
        let on_disk = self.store.delete_vector(vector_id)?;
        let cached = self.cache.write().remove(vector_id).is_some();
        Ok(on_disk || cached)
    }

    fn get(&self, vector_id: &str) -> Option<VectorEntry> {
        self.cache.read().get(vector_id).cloned()
    }

    fn entries(&self, filter: &VectorFilter) -> Vec<VectorEntry> {
        let mut out: Vec<VectorEntry> = self.cache.read().values().filter(|e| filter.matches(e)).cloned().collect();
        out.sort_by(|a, b| a.vector_id.cmp(&b.vector_id));
        out
    }

    fn rebuild(&self) -> Result<usize, MnemosError> {
        let count = self.load()?;
        self.store.incremental_vacuum()?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Store;
    use std::sync::Arc;

    fn index() -> SqliteVectorIndex {
        SqliteVectorIndex::open(Arc::new(Store::open(":memory:").unwrap())).unwrap()
    }

    #[test]
    fn query_ranks_and_filters() {
        let idx = index();
        idx.upsert(VectorEntry::new("u1", MemoryKind::File, "a", vec![1.0, 0.0], 10)).unwrap();
        idx.upsert(VectorEntry::new("u1", MemoryKind::File, "b", vec![0.0, 1.0], 20)).unwrap();
        idx.upsert(VectorEntry::new("u1", MemoryKind::Graph, "c", vec![1.0, 0.0], 30)).unwrap();
        idx.upsert(VectorEntry::new("u2", MemoryKind::File, "d", vec![1.0, 0.0], 40)).unwrap();

        let hits = idx.query(&[1.0, 0.0], 10, &VectorFilter::new("u1", Some(MemoryKind::File))).unwrap();
        let owners: Vec<_> = hits.iter().map(|h| h.owner_id.as_str()).collect();
        assert_eq!(owners, vec!["a", "b"]);
        assert!((hits[0].score - 1.0).abs() < 1e-9);
        assert!((hits[1].score - 0.5).abs() < 1e-9);

        let any_kind = idx.query(&[1.0, 0.0], 10, &VectorFilter::new("u1", None)).unwrap();
        assert_eq!(any_kind.len(), 3);
    }

    #[test]
    fn ties_prefer_newest() {
        let idx = index();
        idx.upsert(VectorEntry::new("u", MemoryKind::File, "old", vec![1.0, 1.0], 1)).unwrap();
        idx.upsert(VectorEntry::new("u", MemoryKind::File, "new", vec![2.0, 2.0], 2)).unwrap();
        let hits = idx.query(&[1.0, 1.0], 1, &VectorFilter::new("u", None)).unwrap();
        assert_eq!(hits[0].owner_id, "new");
    }

    #[test]
    fn delete_and_reload() {
        let store = Arc::new(Store::open(":memory:").unwrap());
        let idx = SqliteVectorIndex::open(Arc::clone(&store)).unwrap();
        idx.upsert(VectorEntry::new("u", MemoryKind::Graph, "r1", vec![0.5, 0.5], 1)).unwrap();
        idx.upsert(VectorEntry::new("u", MemoryKind::Graph, "r2", vec![0.1, 0.9], 2)).unwrap();
        assert!(idx.delete("graph:r1").unwrap());
        assert!(!idx.delete("graph:r1").unwrap());

        let reopened = SqliteVectorIndex::open(store).unwrap();
        assert_eq!(reopened.len(), 1);
        assert!(reopened.get("graph:r2").is_some());
        assert_eq!(reopened.rebuild().unwrap(), 1);
    }

    #[test]
    fn upsert_overwrites_same_owner() {
        let idx = index();
        idx.upsert(VectorEntry::new("u", MemoryKind::File, "a", vec![1.0, 0.0], 1)).unwrap();
        idx.upsert(VectorEntry::new("u", MemoryKind::File, "a", vec![0.0, 1.0], 2)).unwrap();
        assert_eq!(idx.len(), 1);
        assert_eq!(idx.get("file:a").unwrap().embedding, vec![0.0, 1.0]);
    }
}
