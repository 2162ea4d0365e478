//! Recall pipeline: one ranked list of memories across file items and graph
//! resources.
//!
//! Candidates come from keyword search over items and vector search over
//! both memory kinds. Each owner keeps its best score; anything under the
//! relevance threshold is dropped, the rest is decayed by age and packed
//! into a token budget.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::ai::{self, Embedder, Llm};
use crate::config::MemoryConfig;
use crate::db::{now_ms, MemoryKind};
use crate::error::MnemosError;
use crate::text::{self, is_cjk};
use crate::thresholds::KEYWORD_MATCH_SCORE;
use crate::util::format_age;
use crate::vector::{VectorFilter, VectorIndex};
use crate::{prompts, EmbedCache, SharedStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MemorySource {
    Keyword,
    Vector,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecalledMemory {
    pub text: String,
    /// Relevance after age decay. Drives the ranking.
    pub score: f64,
    /// Relevance before decay, in [0, 1].
    pub relevance: f64,
    pub source: MemorySource,
    pub memory_kind: MemoryKind,
    /// Item id for file memory, resource id for graph memory.
    pub owner_id: String,
    pub created_at: i64,
    pub last_accessed_at: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineRecall {
    /// The query actually searched with.
    pub query: String,
    pub memories: Vec<RecalledMemory>,
    /// Estimated tokens of the selected memories.
    pub tokens: usize,
}

impl PipelineRecall {
    pub fn is_empty(&self) -> bool {
        self.memories.is_empty()
    }

    pub fn to_context(&self) -> String {
        if self.memories.is_empty() {
            return String::new();
        }
        let now = now_ms();
        let lines: Vec<String> = self
            .memories
            .iter()
            .map(|m| format!("- [{}] (confidence: {:.2}) {}", format_age(m.created_at, now), m.score, m.text))
            .collect();
        format!("## Relevant Memories\n{}", lines.join("\n"))
    }
}

/// Rough token count: ~1.5 CJK chars or ~4 bytes of other text per token.
pub fn estimate_tokens(text: &str) -> usize {
    let mut cjk_count = 0_usize;
    let mut other_bytes = 0_usize;
    for c in text.chars() {
        if is_cjk(c) {
            cjk_count += 1;
        } else {
            other_bytes += c.len_utf8();
        }
    }
    let t = cjk_count as f64 / 1.5 + other_bytes as f64 / 4.0;
    t.ceil().max(1.0) as usize
}

/// Hyperbolic age decay: `score / (1 + age / half_life)`, where age is
/// measured from a point between creation and last access. `access_weight`
/// 0 ages from creation, 1 from last access.
pub fn decayed_score(
    score: f64,
    created_at: i64,
    last_accessed_at: i64,
    now: i64,
    half_life_ms: i64,
    access_weight: f64,
) -> f64 {
    if half_life_ms <= 0 {
        return score;
    }
    let w = if access_weight.is_finite() { access_weight.clamp(0.0, 1.0) } else { 0.0 };
    let accessed = last_accessed_at.max(created_at);
    let blended = created_at as f64 + (accessed - created_at) as f64 * w;
    let age = (now as f64 - blended).max(0.0);
    score / (1.0 + age / half_life_ms as f64)
}

pub struct RecallPipeline {
    store: SharedStore,
    vectors: Arc<dyn VectorIndex>,
    llm: Option<Arc<dyn Llm>>,
    embedder: Option<Arc<dyn Embedder>>,
    config: MemoryConfig,
    cache: EmbedCache,
}

impl RecallPipeline {
    pub fn new(store: SharedStore, vectors: Arc<dyn VectorIndex>, config: MemoryConfig) -> Self {
        let cache = EmbedCache::new(config.embed_cache_size);
        Self {
            store,
            vectors,
            llm: None,
            embedder: None,
            config,
            cache,
        }
    }

    /// With an LLM, messages are rewritten into a search query first.
    pub fn with_llm(mut self, llm: Arc<dyn Llm>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub(crate) fn with_cache(mut self, cache: EmbedCache) -> Self {
        self.cache = cache;
        self
    }

    pub fn is_tool_mode(&self) -> bool {
        self.llm.is_none()
    }

    pub fn has_embedder(&self) -> bool {
        self.embedder.is_some()
    }

    /// Rank memories for `message`. An explicit `search_query` is used as is;
    /// otherwise the LLM rewrites the message, or the message is searched
    /// directly in tool mode. Returned file items get their access stats bumped.
    pub fn retrieve(
        &self,
        user_id: &str,
        message: &str,
        search_query: Option<&str>,
        max_tokens: usize,
    ) -> Result<PipelineRecall, MnemosError> {
        self.retrieve_inner(user_id, message, search_query, max_tokens)
            .map_err(|e| e.with_user(user_id))
    }

    fn retrieve_inner(
        &self,
        user_id: &str,
        message: &str,
        search_query: Option<&str>,
        max_tokens: usize,
    ) -> Result<PipelineRecall, MnemosError> {
        let (query, terms) = match search_query.map(str::trim).filter(|q| !q.is_empty()) {
            Some(q) => (q.to_string(), text::search_terms(q)),
            None => {
                let q = self.rewrite_query(user_id, message);
                let terms = text::keywords(&q);
                (q, terms)
            }
        };
        let mut out = PipelineRecall {
            query,
            ..Default::default()
        };
        if out.query.is_empty() {
            return Ok(out);
        }

        let candidates = self.candidates(user_id, &out.query, &terms)?;
        let total = candidates.len();
        let now = now_ms();
        let mut ranked: Vec<RecalledMemory> = candidates
            .into_iter()
            .filter(|c| c.relevance >= self.config.relevance_threshold)
            .map(|mut c| {
                c.score = decayed_score(
                    c.relevance,
                    c.created_at,
                    c.last_accessed_at,
                    now,
                    self.config.decay_half_life_ms,
                    self.config.access_weight,
                );
                c
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then(b.created_at.cmp(&a.created_at))
                .then_with(|| a.owner_id.cmp(&b.owner_id))
        });

        for m in ranked {
            let tokens = estimate_tokens(&m.text);
            if out.tokens + tokens > max_tokens {
                break;
            }
            out.tokens += tokens;
            out.memories.push(m);
        }

        let touched: Vec<String> = out
            .memories
            .iter()
            .filter(|m| m.memory_kind == MemoryKind::File)
            .map(|m| m.owner_id.clone())
            .collect();
        self.store.touch_items(user_id, &touched, now)?;

        debug!(
            user_id,
            candidates = total,
            selected = out.memories.len(),
            tokens = out.tokens,
            "recall pipeline"
        );
        Ok(out)
    }

    fn rewrite_query(&self, user_id: &str, message: &str) -> String {
        let Some(llm) = &self.llm else {
            return message.trim().to_string();
        };
        match ai::complete_text(llm.as_ref(), &prompts::search_query(message), user_id, "query") {
            Ok(q) => q.trim_matches(|c| c == '"' || c == '\'').trim().to_string(),
            Err(e) => {
                warn!(user_id, error = %e, "query rewrite failed, searching with the message");
                message.trim().to_string()
            }
        }
    }

    /// Keyword items and vector hits of both kinds, one entry per owner
    /// holding its best relevance.
    fn candidates(&self, user_id: &str, query: &str, terms: &[String]) -> Result<Vec<RecalledMemory>, MnemosError> {
        let mut out: Vec<RecalledMemory> = Vec::new();
        let mut seen: HashMap<(MemoryKind, String), usize> = HashMap::new();
        let mut offer = |c: RecalledMemory| {
            let key = (c.memory_kind, c.owner_id.clone());
            match seen.get(&key) {
                Some(&i) if out[i].relevance >= c.relevance => {}
                Some(&i) => out[i] = c,
                None => {
                    seen.insert(key, out.len());
                    out.push(c);
                }
            }
        };

        let mut items = self.store.search_items(user_id, terms, None)?;
        items.sort_by(|a, b| {
            text::relevance(&b.content, terms)
                .partial_cmp(&text::relevance(&a.content, terms))
                .unwrap_or(Ordering::Equal)
                .then(b.created_at.cmp(&a.created_at))
        });
        items.truncate(self.config.item_limit);
        for item in items {
            offer(RecalledMemory {
                text: item.content,
                score: KEYWORD_MATCH_SCORE,
                relevance: KEYWORD_MATCH_SCORE,
                source: MemorySource::Keyword,
                memory_kind: MemoryKind::File,
                owner_id: item.id,
                created_at: item.created_at,
                last_accessed_at: item.last_accessed_at,
            });
        }

        let Some(embedder) = &self.embedder else {
            return Ok(out);
        };
        let qvec = match self.cache.get(query) {
            Some(v) => v,
            None => {
                let v = ai::embed_text(embedder.as_ref(), query, user_id)?;
                self.cache.insert(query.to_string(), v.clone());
                v
            }
        };

        let hits = self.vectors.query(
            &qvec,
            self.config.vector_top_k,
            &VectorFilter::new(user_id, Some(MemoryKind::File)),
        )?;
        let scores: HashMap<String, f64> = hits.iter().map(|h| (h.owner_id.clone(), h.score)).collect();
        let ids: Vec<String> = hits.into_iter().map(|h| h.owner_id).collect();
        // vectors of merged or archived items drop out here
        for item in self.store.active_items_by_ids(user_id, &ids)? {
            let relevance = scores.get(&item.id).copied().unwrap_or_default();
            offer(RecalledMemory {
                text: item.content,
                score: relevance,
                relevance,
                source: MemorySource::Vector,
                memory_kind: MemoryKind::File,
                owner_id: item.id,
                created_at: item.created_at,
                last_accessed_at: item.last_accessed_at,
            });
        }

        let hits = self.vectors.query(
            &qvec,
            self.config.vector_top_k,
            &VectorFilter::new(user_id, Some(MemoryKind::Graph)),
        )?;
        let scores: HashMap<String, f64> = hits.iter().map(|h| (h.owner_id.clone(), h.score)).collect();
        let ids: Vec<String> = hits.into_iter().map(|h| h.owner_id).collect();
        for res in self.store.resources_by_ids(user_id, &ids)? {
            let relevance = scores.get(&res.id).copied().unwrap_or_default();
            offer(RecalledMemory {
                text: res.text,
                score: relevance,
                relevance,
                source: MemorySource::Vector,
                memory_kind: MemoryKind::Graph,
                owner_id: res.id,
                created_at: res.created_at,
                last_accessed_at: res.created_at,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: i64 = 86_400_000;

    #[test]
    fn estimate_tokens_ascii() {
        // 26 bytes / 4 = 6.5, rounded up
        assert_eq!(estimate_tokens("hello world this is a test"), 7);
        assert_eq!(estimate_tokens(""), 1);
    }

    #[test]
    fn estimate_tokens_cjk() {
        assert_eq!(estimate_tokens("你好世界测试"), 4);
    }

    #[test]
    fn decay_halves_at_half_life() {
        let now = 1_000 * DAY;
        let s = decayed_score(0.8, now - 30 * DAY, now - 30 * DAY, now, 30 * DAY, 0.7);
        assert!((s - 0.4).abs() < 1e-9);
        assert!((decayed_score(0.8, now, now, now, 30 * DAY, 0.7) - 0.8).abs() < 1e-9);
    }

    #[test]
    fn access_pulls_age_toward_now() {
        let now = 1_000 * DAY;
        let created = now - 60 * DAY;
        let untouched = decayed_score(0.8, created, created, now, 30 * DAY, 0.7);
        let touched = decayed_score(0.8, created, now, now, 30 * DAY, 0.7);
        assert!(touched > untouched);
        // weight 0.7 of 60 days: the blended age is 18 days
        assert!((touched - 0.8 / (1.0 + 18.0 / 30.0)).abs() < 1e-9);
        // out-of-range weights clamp
        assert_eq!(
            decayed_score(0.8, created, now, now, 30 * DAY, 5.0),
            decayed_score(0.8, created, now, now, 30 * DAY, 1.0)
        );
        // access before creation counts as creation
        assert_eq!(
            decayed_score(0.8, created, created - DAY, now, 30 * DAY, 0.7),
            untouched
        );
    }

    #[test]
    fn context_block() {
        let now = now_ms();
        let r = PipelineRecall {
            query: "tea".into(),
            memories: vec![RecalledMemory {
                text: "User likes tea".into(),
                score: 0.5,
                relevance: 0.8,
                source: MemorySource::Keyword,
                memory_kind: MemoryKind::File,
                owner_id: "i1".into(),
                created_at: now - 3 * DAY,
                last_accessed_at: now - 3 * DAY,
            }],
            tokens: 4,
        };
        assert_eq!(r.to_context(), "## Relevant Memories\n- [3d ago] (confidence: 0.50) User likes tea");
        assert_eq!(PipelineRecall::default().to_context(), "");
    }
}
