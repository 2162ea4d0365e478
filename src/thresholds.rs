//! Default tuning values. Every one of these can be overridden through
//! `MemoryConfig`; the constants only document what a fresh config holds.

const DAY_MS: i64 = 86_400_000;

/// Nightly dedup: raw cosine above which two same-category items merge.
pub const DEDUP_SIM: f64 = 0.92;

/// Nightly dedup: clusters larger than this are split to prevent chain drift
/// (A≈B, B≈C but A≠C).
pub const MAX_CLUSTER_SIZE: usize = 8;

/// Nightly promote: access count at which an item gets retention priority.
pub const PROMOTE_ACCESS_COUNT: i64 = 5;

/// Weekly archive: items accessed at least this often are kept.
pub const RETENTION_ACCESS_COUNT: i64 = 5;

/// Weekly: items older than this feed the persistent summary.
pub const PERSISTENT_RECENCY_MS: i64 = 30 * DAY_MS;

/// Weekly: items not touched for this long are archived.
pub const STALE_MS: i64 = 90 * DAY_MS;

/// Monthly: items/resources untouched this long are archived regardless of use.
pub const LONG_TAIL_MS: i64 = 180 * DAY_MS;

/// Graph retrieval: fewer graph hits than this triggers vector backfill.
pub const GRAPH_MIN_HITS: usize = 3;

/// Vector queries return at most this many hits.
pub const VECTOR_TOP_K: usize = 20;

/// Keyword item retrieval cap.
pub const ITEM_LIMIT: usize = 50;

/// Raw resources returned at `resources` level.
pub const RESOURCE_LIMIT: usize = 3;

/// Query embeddings kept in the LRU cache.
pub const EMBED_CACHE_SIZE: usize = 128;

/// Recall pipeline: candidates scoring below this are dropped before decay.
pub const RELEVANCE_THRESHOLD: f64 = 0.7;

/// Recall pipeline: a memory this old scores half of a fresh one.
pub const DECAY_HALF_LIFE_MS: i64 = 30 * DAY_MS;

/// Recall pipeline: how far access time pulls a memory's age toward now.
/// 0 ages by creation only, 1 by last access only.
pub const ACCESS_WEIGHT: f64 = 0.7;

/// Recall pipeline: token budget of the memories block.
pub const RECALL_MAX_TOKENS: usize = 2000;

/// Recall pipeline: score given to plain keyword matches.
pub const KEYWORD_MATCH_SCORE: f64 = 0.8;

/// Re-ask attempts when the LLM returns unparseable JSON.
pub const JSON_RETRIES: usize = 2;

/// Scheduler cadences.
pub const NIGHTLY_EVERY_MS: i64 = DAY_MS;
pub const WEEKLY_EVERY_MS: i64 = 7 * DAY_MS;
pub const MONTHLY_EVERY_MS: i64 = 30 * DAY_MS;
