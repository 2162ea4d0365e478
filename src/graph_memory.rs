//! Triplet graph memory with current/past/uncertain lifecycle and
//! graph + vector hybrid retrieval.
//!
//! Every write stores the raw text as a resource and embeds it, so an
//! embedder is mandatory. Triplets come from the caller (tool mode) or from
//! the configured LLM.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::ai::{self, Embedder, Llm};
use crate::config::MemoryConfig;
use crate::db::{self, entity_key, MemoryKind, Triplet, TripletInput, TripletStatus, TripletWrite};
use crate::error::MnemosError;
use crate::vector::{VectorEntry, VectorFilter, VectorIndex};
use crate::{prompts, text, EmbedCache, SharedStore};

/// Entity used when nothing else matches: extracted triplets refer to the
/// speaker this way.
pub const FALLBACK_ENTITY: &str = "User";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphLevel {
    GraphOnly,
    #[default]
    GraphThenVector,
    VectorOnly,
}

impl FromStr for GraphLevel {
    type Err = MnemosError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "graph_only" | "graph" => Ok(Self::GraphOnly),
            "graph_then_vector" => Ok(Self::GraphThenVector),
            "vector_only" | "vector" => Ok(Self::VectorOnly),
            other => Err(MnemosError::Validation(format!("unknown graph level '{other}'"))),
        }
    }
}

impl fmt::Display for GraphLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::GraphOnly => "graph_only",
            Self::GraphThenVector => "graph_then_vector",
            Self::VectorOnly => "vector_only",
        })
    }
}

/// Traversal breadth from the matched entities. Each level returns a
/// superset of every lower one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Expand {
    None,
    Low,
    #[default]
    Medium,
    High,
    Full,
}

/// Hops beyond the seed entity, triplets followed per entity, and the
/// statuses admitted.
#[derive(Debug, Clone, Copy)]
pub struct TraversalConfig {
    pub depth: usize,
    pub fanout: Option<usize>,
    pub statuses: &'static [TripletStatus],
}

const CURRENT: &[TripletStatus] = &[TripletStatus::Current];
const CURRENT_UNCERTAIN: &[TripletStatus] = &[TripletStatus::Current, TripletStatus::Uncertain];
const ALL: &[TripletStatus] = &[TripletStatus::Current, TripletStatus::Uncertain, TripletStatus::Past];

impl Expand {
    pub fn traversal(self) -> TraversalConfig {
        let (depth, fanout, statuses) = match self {
            Self::None => (0, Some(10), CURRENT),
            Self::Low => (1, Some(10), CURRENT),
            Self::Medium => (1, Some(25), CURRENT_UNCERTAIN),
            Self::High => (2, Some(50), CURRENT_UNCERTAIN),
            Self::Full => (3, None, ALL),
        };
        TraversalConfig { depth, fanout, statuses }
    }
}

impl FromStr for Expand {
    type Err = MnemosError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "full" => Ok(Self::Full),
            other => Err(MnemosError::Validation(format!("unknown expand level '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GraphRetrieveOptions {
    pub level: GraphLevel,
    pub expand: Expand,
    /// Explicit seed entities. Without them the LLM extracts entities from
    /// the query, or in tool mode the query keywords are used.
    pub entities: Option<Vec<String>>,
}

impl GraphRetrieveOptions {
    pub fn new(level: GraphLevel) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    pub fn expand(mut self, expand: Expand) -> Self {
        self.expand = expand;
        self
    }

    pub fn entities<S: Into<String>>(mut self, entities: impl IntoIterator<Item = S>) -> Self {
        self.entities = Some(entities.into_iter().map(Into::into).collect());
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FactHit {
    pub triplet: Triplet,
    /// Hops from the nearest seed entity.
    pub depth: usize,
}

impl FactHit {
    pub fn status(&self) -> TripletStatus {
        self.triplet.status
    }

    pub fn render(&self) -> String {
        let t = &self.triplet;
        format!("{} {} {} ({})", t.subject, t.predicate, t.object, t.status)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Passage {
    pub resource_id: String,
    pub text: String,
    pub score: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GraphRetrieval {
    pub facts: Vec<FactHit>,
    pub passages: Vec<Passage>,
}

impl GraphRetrieval {
    pub fn is_empty(&self) -> bool {
        self.facts.is_empty() && self.passages.is_empty()
    }

    pub fn to_context(&self) -> String {
        let mut sections = Vec::new();
        if !self.facts.is_empty() {
            let lines: Vec<String> = self.facts.iter().map(|f| format!("- {}", f.render())).collect();
            sections.push(format!("## Known Facts\n{}", lines.join("\n")));
        }
        if !self.passages.is_empty() {
            let lines: Vec<String> = self
                .passages
                .iter()
                .map(|p| format!("- {} ({:.2})", p.text, p.score))
                .collect();
            sections.push(format!("## Related Passages\n{}", lines.join("\n")));
        }
        sections.join("\n\n")
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GraphWriteOutcome {
    pub resource_id: String,
    pub inserted: Vec<String>,
    pub superseded: Vec<String>,
    pub unchanged: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawTriplet {
    subject: String,
    predicate: String,
    object: String,
    #[serde(default)]
    status: Option<String>,
}

impl From<RawTriplet> for TripletInput {
    fn from(r: RawTriplet) -> Self {
        let status = r
            .status
            .as_deref()
            .map(TripletStatus::coerce)
            .unwrap_or(TripletStatus::Current);
        TripletInput::new(r.subject, r.predicate, r.object, status)
    }
}

/// Run `op`, and run it once more if it lost a write race. The write
/// re-reads every row it touches, so the retry sees the winner's state.
fn retry_conflict_once<T>(user_id: &str, mut op: impl FnMut() -> Result<T, MnemosError>) -> Result<T, MnemosError> {
    match op() {
        Err(MnemosError::Conflict { entity, .. }) => {
            debug!(user_id, entity = %entity, "triplet write conflicted, retrying once");
            op()
        }
        other => other,
    }
}

pub struct GraphMemory {
    store: SharedStore,
    vectors: Arc<dyn VectorIndex>,
    llm: Option<Arc<dyn Llm>>,
    embedder: Arc<dyn Embedder>,
    config: MemoryConfig,
    cache: EmbedCache,
}

impl GraphMemory {
    pub fn new(
        store: SharedStore,
        vectors: Arc<dyn VectorIndex>,
        embedder: Option<Arc<dyn Embedder>>,
        config: MemoryConfig,
    ) -> Result<Self, MnemosError> {
        let embedder = embedder.ok_or(MnemosError::Capability {
            operation: "graph memory",
            missing: "embedder",
        })?;
        let cache = EmbedCache::new(config.embed_cache_size);
        Ok(Self {
            store,
            vectors,
            llm: None,
            embedder,
            config,
            cache,
        })
    }

    pub fn with_llm(mut self, llm: Arc<dyn Llm>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn tool_use_instruction() -> &'static str {
        crate::prompts::GRAPH_MEMORY_TOOL_INSTRUCTIONS
    }

    pub(crate) fn with_cache(mut self, cache: EmbedCache) -> Self {
        self.cache = cache;
        self
    }

    /// Store `text` and its triplets. `triplets: Some(..)` is tool mode;
    /// `None` asks the LLM (or, without one, stores the text alone).
    pub fn memorize(
        &self,
        user_id: &str,
        text: &str,
        triplets: Option<Vec<TripletInput>>,
    ) -> Result<GraphWriteOutcome, MnemosError> {
        if text.trim().is_empty() {
            return Err(MnemosError::Validation("nothing to memorize".into()));
        }
        let triplets: Vec<TripletInput> = match (triplets, &self.llm) {
            (Some(t), _) => t,
            (None, Some(llm)) => {
                let raw: Vec<RawTriplet> = ai::parse_json_response(
                    llm.as_ref(),
                    &prompts::extract_triplets(text),
                    self.config.json_retries,
                    user_id,
                    "extract",
                )?;
                raw.into_iter().map(TripletInput::from).collect()
            }
            (None, None) => vec![],
        };
        for t in &triplets {
            db::validate_triplet(t)?;
        }
        let embedding = ai::embed_text(self.embedder.as_ref(), text, user_id)?;

        let outcome = retry_conflict_once(user_id, || self.write(user_id, text, &triplets))?;

        let entry = VectorEntry::new(user_id, MemoryKind::Graph, &outcome.resource_id, embedding, db::now_ms());
        if let Err(e) = self.vectors.upsert(entry) {
            warn!(user_id, resource_id = %outcome.resource_id, error = %e, "vector upsert failed, rolling back write");
            if let Err(pe) = self.store.with_tx(user_id, "resource", |tx| {
                db::resources::purge_write_tx(tx, user_id, &outcome.resource_id)
            }) {
                warn!(user_id, resource_id = %outcome.resource_id, error = %pe, "rollback: purge failed");
            }
            return Err(e.with_user(user_id));
        }

        info!(
            user_id,
            resource_id = %outcome.resource_id,
            inserted = outcome.inserted.len(),
            superseded = outcome.superseded.len(),
            unchanged = outcome.unchanged.len(),
            "graph memory stored"
        );
        Ok(outcome)
    }

    fn write(&self, user_id: &str, text: &str, triplets: &[TripletInput]) -> Result<GraphWriteOutcome, MnemosError> {
        let now = db::now_ms();
        let entity = triplets
            .iter()
            .find(|t| t.status == TripletStatus::Current)
            .map(|t| format!("triplet ({}, {})", t.subject, t.predicate))
            .unwrap_or_else(|| "resource".to_string());
        self.store.with_tx(user_id, &entity, |tx| {
            let resource = db::resources::insert_resource_tx(tx, user_id, text, MemoryKind::Graph, now)?;
            let mut out = GraphWriteOutcome {
                resource_id: resource.id.clone(),
                ..Default::default()
            };
            for t in triplets {
                match db::triplets::write_triplet_tx(tx, user_id, &resource.id, t, now)? {
                    TripletWrite::Inserted { id, superseded } => {
                        out.inserted.push(id);
                        out.superseded.extend(superseded);
                    }
                    TripletWrite::Unchanged { id } => out.unchanged.push(id),
                }
            }
            Ok(out)
        })
    }

    pub fn retrieve(&self, user_id: &str, query: &str, opts: &GraphRetrieveOptions) -> Result<GraphRetrieval, MnemosError> {
        self.retrieve_inner(user_id, query, opts).map_err(|e| e.with_user(user_id))
    }

    fn retrieve_inner(&self, user_id: &str, query: &str, opts: &GraphRetrieveOptions) -> Result<GraphRetrieval, MnemosError> {
        let mut out = GraphRetrieval::default();
        if opts.level != GraphLevel::VectorOnly {
            let explicit = opts.entities.as_ref().filter(|e| !e.is_empty());
            let seeds = match explicit {
                Some(e) => e.clone(),
                None => self.query_entities(user_id, query)?,
            };
            // Checked across all statuses so every expand level agrees on it.
            let seeds = if explicit.is_none() && !self.any_triplets(user_id, &seeds)? {
                vec![FALLBACK_ENTITY.to_string()]
            } else {
                seeds
            };
            out.facts = self.traverse(user_id, &seeds, opts.expand.traversal())?;
        }
        let want_vector = match opts.level {
            GraphLevel::GraphOnly => false,
            GraphLevel::GraphThenVector => out.facts.len() < self.config.graph_min_hits,
            GraphLevel::VectorOnly => true,
        };
        if want_vector {
            out.passages = self.passages(user_id, query)?;
        }
        debug!(
            user_id,
            level = %opts.level,
            facts = out.facts.len(),
            passages = out.passages.len(),
            "graph retrieval"
        );
        Ok(out)
    }

    fn query_entities(&self, user_id: &str, query: &str) -> Result<Vec<String>, MnemosError> {
        match &self.llm {
            Some(llm) => ai::parse_json_response(
                llm.as_ref(),
                &prompts::extract_entities(query),
                self.config.json_retries,
                user_id,
                "entities",
            ),
            None => Ok(text::keywords(query)),
        }
    }

    /// Whether any seed entity appears in a triplet of any status.
    fn any_triplets(&self, user_id: &str, seeds: &[String]) -> Result<bool, MnemosError> {
        for s in seeds {
            let key = entity_key(s);
            if !key.is_empty() && !self.store.triplets_touching(user_id, &key, ALL, Some(1))?.is_empty() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Breadth-first walk from the seed entities. Which triplets an entity
    /// contributes depends only on the entity and `cfg`, so a config with
    /// more depth, fan-out or statuses always yields a superset.
    fn traverse(&self, user_id: &str, seeds: &[String], cfg: TraversalConfig) -> Result<Vec<FactHit>, MnemosError> {
        let mut visited: HashSet<String> = HashSet::new();
        let mut frontier: Vec<String> = Vec::new();
        for s in seeds {
            let key = entity_key(s);
            if !key.is_empty() && visited.insert(key.clone()) {
                frontier.push(key);
            }
        }

        let mut found: HashMap<String, FactHit> = HashMap::new();
        for depth in 0..=cfg.depth {
            let mut next = Vec::new();
            for entity in &frontier {
                for t in self.store.triplets_touching(user_id, entity, cfg.statuses, cfg.fanout)? {
                    for endpoint in [entity_key(&t.subject), entity_key(&t.object)] {
                        if visited.insert(endpoint.clone()) {
                            next.push(endpoint);
                        }
                    }
                    found.entry(t.id.clone()).or_insert(FactHit { triplet: t, depth });
                }
            }
            if next.is_empty() {
                break;
            }
            frontier = next;
        }

        let mut facts: Vec<FactHit> = found.into_values().collect();
        facts.sort_by(|a, b| {
            a.triplet
                .status
                .rank()
                .cmp(&b.triplet.status.rank())
                .then(b.triplet.created_at.cmp(&a.triplet.created_at))
                .then_with(|| a.triplet.id.cmp(&b.triplet.id))
        });
        Ok(facts)
    }

    fn passages(&self, user_id: &str, query: &str) -> Result<Vec<Passage>, MnemosError> {
        let qvec = match self.cache.get(query) {
            Some(v) => v,
            None => {
                let v = ai::embed_text(self.embedder.as_ref(), query, user_id)?;
                self.cache.insert(query.to_string(), v.clone());
                v
            }
        };
        let hits = self.vectors.query(
            &qvec,
            self.config.vector_top_k,
            &VectorFilter::new(user_id, Some(MemoryKind::Graph)),
        )?;
        let ids: Vec<String> = hits.iter().map(|h| h.owner_id.clone()).collect();
        let live: HashMap<String, String> = self
            .store
            .resources_by_ids(user_id, &ids)?
            .into_iter()
            .map(|r| (r.id, r.text))
            .collect();
        Ok(hits
            .into_iter()
            .filter_map(|h| {
                live.get(&h.owner_id).map(|text| Passage {
                    resource_id: h.owner_id.clone(),
                    text: text.clone(),
                    score: h.score,
                })
            })
            .collect())
    }
}
