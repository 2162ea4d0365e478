//! Engine tuning knobs.
//!
//! Hosts either deserialize a `MemoryConfig` from their own config format
//! (every field is optional thanks to `#[serde(default)]`) or call
//! [`MemoryConfig::from_env`].

use serde::{Deserialize, Serialize};

use crate::thresholds;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub dedup_similarity: f64,
    pub max_cluster_size: usize,
    pub promote_access_count: i64,
    pub retention_access_count: i64,
    pub persistent_recency_ms: i64,
    pub stale_ms: i64,
    pub long_tail_ms: i64,
    pub graph_min_hits: usize,
    pub vector_top_k: usize,
    pub item_limit: usize,
    pub resource_limit: usize,
    pub embed_cache_size: usize,
    pub json_retries: usize,
    pub relevance_threshold: f64,
    pub decay_half_life_ms: i64,
    pub access_weight: f64,
    pub recall_max_tokens: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            dedup_similarity: thresholds::DEDUP_SIM,
            max_cluster_size: thresholds::MAX_CLUSTER_SIZE,
            promote_access_count: thresholds::PROMOTE_ACCESS_COUNT,
            retention_access_count: thresholds::RETENTION_ACCESS_COUNT,
            persistent_recency_ms: thresholds::PERSISTENT_RECENCY_MS,
            stale_ms: thresholds::STALE_MS,
            long_tail_ms: thresholds::LONG_TAIL_MS,
            graph_min_hits: thresholds::GRAPH_MIN_HITS,
            vector_top_k: thresholds::VECTOR_TOP_K,
            item_limit: thresholds::ITEM_LIMIT,
            resource_limit: thresholds::RESOURCE_LIMIT,
            embed_cache_size: thresholds::EMBED_CACHE_SIZE,
            json_retries: thresholds::JSON_RETRIES,
            relevance_threshold: thresholds::RELEVANCE_THRESHOLD,
            decay_half_life_ms: thresholds::DECAY_HALF_LIFE_MS,
            access_weight: thresholds::ACCESS_WEIGHT,
            recall_max_tokens: thresholds::RECALL_MAX_TOKENS,
        }
    }
}

const DAY_MS: i64 = 86_400_000;

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

impl MemoryConfig {
    /// Defaults overridden by `MNEMOS_*` variables. Day-valued variables
    /// (`*_DAYS`) are converted to milliseconds. Unparseable values are ignored.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(v) = env_parse("MNEMOS_DEDUP_SIMILARITY") {
            cfg.dedup_similarity = v;
        }
        if let Some(v) = env_parse("MNEMOS_MAX_CLUSTER_SIZE") {
            cfg.max_cluster_size = v;
        }
        if let Some(v) = env_parse("MNEMOS_PROMOTE_ACCESS_COUNT") {
            cfg.promote_access_count = v;
        }
        if let Some(v) = env_parse("MNEMOS_RETENTION_ACCESS_COUNT") {
            cfg.retention_access_count = v;
        }
        if let Some(v) = env_parse::<i64>("MNEMOS_PERSISTENT_RECENCY_DAYS") {
            cfg.persistent_recency_ms = v.saturating_mul(DAY_MS);
        }
        if let Some(v) = env_parse::<i64>("MNEMOS_STALE_DAYS") {
            cfg.stale_ms = v.saturating_mul(DAY_MS);
        }
        if let Some(v) = env_parse::<i64>("MNEMOS_LONG_TAIL_DAYS") {
            cfg.long_tail_ms = v.saturating_mul(DAY_MS);
        }
        if let Some(v) = env_parse("MNEMOS_GRAPH_MIN_HITS") {
            cfg.graph_min_hits = v;
        }
        if let Some(v) = env_parse("MNEMOS_VECTOR_TOP_K") {
            cfg.vector_top_k = v;
        }
        if let Some(v) = env_parse("MNEMOS_ITEM_LIMIT") {
            cfg.item_limit = v;
        }
        if let Some(v) = env_parse("MNEMOS_RESOURCE_LIMIT") {
            cfg.resource_limit = v;
        }
        if let Some(v) = env_parse("MNEMOS_EMBED_CACHE_SIZE") {
            cfg.embed_cache_size = v;
        }
        if let Some(v) = env_parse("MNEMOS_JSON_RETRIES") {
            cfg.json_retries = v;
        }
        if let Some(v) = env_parse("MNEMOS_RELEVANCE_THRESHOLD") {
            cfg.relevance_threshold = v;
        }
        if let Some(v) = env_parse::<i64>("MNEMOS_DECAY_HALF_LIFE_DAYS") {
            cfg.decay_half_life_ms = v.saturating_mul(DAY_MS);
        }
        if let Some(v) = env_parse("MNEMOS_ACCESS_WEIGHT") {
            cfg.access_weight = v;
        }
        if let Some(v) = env_parse("MNEMOS_RECALL_MAX_TOKENS") {
            cfg.recall_max_tokens = v;
        }
        cfg
    }
}
