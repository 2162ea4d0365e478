//! Hierarchical file memory: raw resources, atomic items, category summaries.
//!
//! Tool mode (no LLM configured) takes items from the caller; internal-LLM
//! mode extracts and classifies them. Both go through the same write path.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::ai::{self, Embedder, Llm};
use crate::config::MemoryConfig;
use crate::db::{self, Category, Item, MemoryKind, Resource};
use crate::error::MnemosError;
use crate::vector::{VectorEntry, VectorFilter, VectorIndex};
use crate::{prompts, text, EmbedCache, SharedStore};

pub const DEFAULT_CATEGORY: &str = "general";

/// One item as supplied by a tool-mode caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemInput {
    pub content: String,
    #[serde(default)]
    pub category: Option<String>,
}

impl ItemInput {
    pub fn new(content: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            category: Some(category.into()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ExtractedItem {
    content: String,
    #[serde(default)]
    category_hint: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ClassifiedItem {
    #[serde(default)]
    category: Option<String>,
}

fn normalize_category(raw: Option<&str>) -> String {
    let c = raw.map(|c| c.trim().to_lowercase()).unwrap_or_default();
    if c.is_empty() {
        DEFAULT_CATEGORY.to_string()
    } else {
        c
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileLevel {
    Summaries,
    Items,
    Resources,
    Auto,
}

/// A parsed retrieval level. `base: None` is pure vector search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrievalLevel {
    pub base: Option<FileLevel>,
    pub semantic: bool,
}

impl RetrievalLevel {
    pub const AUTO: Self = Self::plain(FileLevel::Auto);
    pub const SUMMARIES: Self = Self::plain(FileLevel::Summaries);
    pub const ITEMS: Self = Self::plain(FileLevel::Items);
    pub const RESOURCES: Self = Self::plain(FileLevel::Resources);
    pub const VECTOR_ONLY: Self = Self {
        base: None,
        semantic: true,
    };

    pub const fn plain(base: FileLevel) -> Self {
        Self {
            base: Some(base),
            semantic: false,
        }
    }

    pub const fn then_semantic(base: FileLevel) -> Self {
        Self {
            base: Some(base),
            semantic: true,
        }
    }
}

impl Default for RetrievalLevel {
    fn default() -> Self {
        Self::AUTO
    }
}

impl FromStr for RetrievalLevel {
    type Err = MnemosError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        if s == "vector_only" || s == "semantic" {
            return Ok(Self::VECTOR_ONLY);
        }
        let (base, semantic) = match s
            .strip_suffix("_then_semantic")
            .or_else(|| s.strip_suffix("_then_vector"))
        {
            Some(b) => (b, true),
            None => (s.as_str(), false),
        };
        let base = match base {
            "summaries" => FileLevel::Summaries,
            "items" => FileLevel::Items,
            "resources" => FileLevel::Resources,
            "auto" => FileLevel::Auto,
            other => return Err(MnemosError::Validation(format!("unknown retrieval level '{other}'"))),
        };
        Ok(Self {
            base: Some(base),
            semantic,
        })
    }
}

impl fmt::Display for RetrievalLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let base = match self.base {
            None => return f.write_str("vector_only"),
            Some(FileLevel::Summaries) => "summaries",
            Some(FileLevel::Items) => "items",
            Some(FileLevel::Resources) => "resources",
            Some(FileLevel::Auto) => "auto",
        };
        if self.semantic {
            write!(f, "{base}_then_semantic")
        } else {
            f.write_str(base)
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FileRetrieveOptions {
    pub level: RetrievalLevel,
    /// Overrides the keywords derived from the query.
    pub search_query: Option<String>,
    /// Restrict summaries and items to these categories.
    pub categories: Option<Vec<String>>,
}

impl FileRetrieveOptions {
    pub fn level(level: RetrievalLevel) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    pub fn search(mut self, q: impl Into<String>) -> Self {
        self.search_query = Some(q.into());
        self
    }

    pub fn categories(mut self, cats: Vec<String>) -> Self {
        self.categories = Some(cats);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CategorySummary {
    pub category: String,
    pub general: String,
    pub persistent: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SemanticItem {
    pub item: Item,
    pub score: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FileRetrieval {
    pub summaries: Vec<CategorySummary>,
    pub items: Vec<Item>,
    pub resources: Vec<Resource>,
    pub semantic: Vec<SemanticItem>,
}

impl FileRetrieval {
    pub fn is_empty(&self) -> bool {
        self.summaries.is_empty() && self.items.is_empty() && self.resources.is_empty() && self.semantic.is_empty()
    }

    /// Markdown block for an agent prompt.
    pub fn to_context(&self) -> String {
        let mut sections = Vec::new();
        for s in &self.summaries {
            let mut block = format!("## {}", s.category);
            if !s.general.trim().is_empty() {
                block.push_str(&format!("\n### General\n{}", s.general.trim()));
            }
            if !s.persistent.trim().is_empty() {
                block.push_str(&format!("\n### Persistent\n{}", s.persistent.trim()));
            }
            sections.push(block);
        }
        if !self.items.is_empty() {
            let lines: Vec<String> = self.items.iter().map(|i| format!("- {}", i.content)).collect();
            sections.push(format!("## Retrieved Items\n{}", lines.join("\n")));
        }
        if !self.resources.is_empty() {
            let texts: Vec<&str> = self.resources.iter().map(|r| r.text.as_str()).collect();
            sections.push(format!("## Raw Context\n{}", texts.join("\n---\n")));
        }
        if !self.semantic.is_empty() {
            let lines: Vec<String> = self
                .semantic
                .iter()
                .map(|s| format!("- {} ({:.2})", s.item.content, s.score))
                .collect();
            sections.push(format!("## Semantic Matches\n{}", lines.join("\n")));
        }
        sections.join("\n\n")
    }
}

pub struct FileMemory {
    store: SharedStore,
    vectors: Arc<dyn VectorIndex>,
    llm: Option<Arc<dyn Llm>>,
    embedder: Option<Arc<dyn Embedder>>,
    config: MemoryConfig,
    cache: EmbedCache,
}

impl FileMemory {
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

    /// Switch to internal-LLM mode.
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

    /// Instructions for an agent runtime calling `memorize` and `retrieve` as tools.
    pub fn tool_use_instruction() -> &'static str {
        crate::prompts::FILE_MEMORY_TOOL_INSTRUCTIONS
    }

    /// Store `text` as a resource and derive items from it.
    ///
    /// `items: Some(..)` is the tool-mode path. With `None`, the configured
    /// LLM extracts and classifies; without an LLM the whole text becomes one
    /// `general` item. All callables run before anything is written, so a
    /// failing callable leaves no trace. Returns the new item ids.
    pub fn memorize(&self, user_id: &str, text: &str, items: Option<Vec<ItemInput>>) -> Result<Vec<String>, MnemosError> {
        if text.trim().is_empty() && items.as_ref().is_none_or(|v| v.is_empty()) {
            return Err(MnemosError::Validation("nothing to memorize".into()));
        }

        let drafts: Vec<(String, String)> = match (items, &self.llm) {
            (Some(items), _) => self.tool_items(text, items),
            (None, Some(llm)) => self.extract_items(user_id, llm.as_ref(), text)?,
            (None, None) => self.tool_items(text, vec![]),
        };

        let embeddings = match &self.embedder {
            Some(emb) => Some(
                drafts
                    .iter()
                    .map(|(content, _)| ai::embed_text(emb.as_ref(), content, user_id))
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            None => None,
        };

        let now = db::now_ms();
        let (resource, created) = self.store.with_tx(user_id, "resource", |tx| {
            let resource = db::resources::insert_resource_tx(tx, user_id, text, MemoryKind::File, now)?;
            let mut created = Vec::with_capacity(drafts.len());
            for (i, (content, category)) in drafts.iter().enumerate() {
                db::categories::ensure_category_tx(tx, user_id, category, now)?;
                let item = db::items::insert_item_tx(tx, user_id, &resource.id, content, category, now)?;
                if embeddings.is_some() {
                    let vid = crate::vector::vector_id(MemoryKind::File, &item.id);
                    db::items::set_embedding_id_tx(tx, user_id, &item.id, &vid)?;
                }
                created.push((i, item));
            }
            Ok((resource, created))
        })?;

        if let Some(embeddings) = embeddings {
            let mut upserted = Vec::new();
            for (i, item) in &created {
                let entry = VectorEntry::new(user_id, MemoryKind::File, &item.id, embeddings[*i].clone(), item.created_at);
                let vid = entry.vector_id.clone();
                if let Err(e) = self.vectors.upsert(entry) {
                    warn!(user_id, resource_id = %resource.id, error = %e, "vector upsert failed, rolling back write");
                    self.rollback(user_id, &resource.id, &upserted);
                    return Err(e.with_user(user_id));
                }
                upserted.push(vid);
            }
        }

        let ids: Vec<String> = created.into_iter().map(|(_, item)| item.id).collect();
        info!(user_id, resource_id = %resource.id, count = ids.len(), "file memory stored");
        Ok(ids)
    }

    fn tool_items(&self, text: &str, items: Vec<ItemInput>) -> Vec<(String, String)> {
        let mut drafts: Vec<(String, String)> = items
            .into_iter()
            .filter(|i| !i.content.trim().is_empty())
            .map(|i| (i.content.trim().to_string(), normalize_category(i.category.as_deref())))
            .collect();
        if drafts.is_empty() && !text.trim().is_empty() {
            drafts.push((text.trim().to_string(), DEFAULT_CATEGORY.to_string()));
        }
        drafts
    }

    fn extract_items(&self, user_id: &str, llm: &dyn Llm, text: &str) -> Result<Vec<(String, String)>, MnemosError> {
        let retries = self.config.json_retries;
        let extracted: Vec<ExtractedItem> =
            ai::parse_json_response(llm, &prompts::extract_items(text), retries, user_id, "extract")?;
        let extracted: Vec<ExtractedItem> = extracted.into_iter().filter(|e| !e.content.trim().is_empty()).collect();
        if extracted.is_empty() {
            debug!(user_id, "extractor found no items");
            return Ok(vec![]);
        }

        let existing: Vec<String> = self
            .store
            .list_categories(user_id)
            .map_err(|e| e.with_user(user_id))?
            .into_iter()
            .map(|c| c.name)
            .collect();
        let contents: Vec<String> = extracted.iter().map(|e| e.content.trim().to_string()).collect();
        let classified: Vec<ClassifiedItem> = ai::parse_json_response(
            llm,
            &prompts::classify_items(&existing, &contents),
            retries,
            user_id,
            "classify",
        )?;

        Ok(extracted
            .into_iter()
            .enumerate()
            .map(|(i, e)| {
                let category = classified
                    .get(i)
                    .and_then(|c| c.category.as_deref())
                    .filter(|c| !c.trim().is_empty())
                    .or(e.category_hint.as_deref());
                (e.content.trim().to_string(), normalize_category(category))
            })
            .collect())
    }

    fn rollback(&self, user_id: &str, resource_id: &str, vector_ids: &[String]) {
        for vid in vector_ids {
            if let Err(e) = self.vectors.delete(vid) {
                warn!(user_id, vector_id = %vid, error = %e, "rollback: vector delete failed");
            }
        }
        if let Err(e) = self
            .store
            .with_tx(user_id, "resource", |tx| db::resources::purge_write_tx(tx, user_id, resource_id))
        {
            warn!(user_id, resource_id, error = %e, "rollback: purge failed");
        }
    }

    pub fn retrieve(&self, user_id: &str, query: &str, opts: &FileRetrieveOptions) -> Result<FileRetrieval, MnemosError> {
        if opts.level.semantic && self.embedder.is_none() {
            return Err(MnemosError::Capability {
                operation: "semantic file retrieval",
                missing: "embedder",
            });
        }
        self.retrieve_inner(user_id, query, opts).map_err(|e| e.with_user(user_id))
    }

    fn retrieve_inner(&self, user_id: &str, query: &str, opts: &FileRetrieveOptions) -> Result<FileRetrieval, MnemosError> {
        let terms = match opts.search_query.as_deref() {
            Some(q) if !q.trim().is_empty() => text::search_terms(q),
            _ => text::keywords(query),
        };
        let mut out = FileRetrieval::default();

        // tool mode never auto-escalates
        let base = match (opts.level.base, &self.llm) {
            (Some(FileLevel::Auto), None) => Some(FileLevel::Summaries),
            (b, _) => b,
        };

        match base {
            None => {}
            Some(FileLevel::Summaries) => {
                out.summaries = self.summaries(user_id, query, &terms, opts.categories.as_deref())?;
            }
            Some(FileLevel::Items) => {
                out.items = self.items(user_id, &terms, opts.categories.as_deref())?;
            }
            Some(FileLevel::Resources) => {
                out.items = self.items(user_id, &terms, opts.categories.as_deref())?;
                out.resources = self.resources(user_id, &terms, &out.items)?;
            }
            Some(FileLevel::Auto) => {
                out.summaries = self.summaries(user_id, query, &terms, opts.categories.as_deref())?;
                if !self.sufficient(user_id, query, &out.summaries)? {
                    out.items = self.items(user_id, &terms, opts.categories.as_deref())?;
                    if out.items.is_empty() {
                        out.resources = self.resources(user_id, &terms, &[])?;
                    }
                }
            }
        }

        if opts.level.semantic {
            out.semantic = self.semantic(user_id, query, opts.categories.as_deref())?;
        }

        let mut touched: Vec<String> = out.items.iter().map(|i| i.id.clone()).collect();
        touched.extend(out.semantic.iter().map(|s| s.item.id.clone()));
        touched.sort();
        touched.dedup();
        self.store.touch_items(user_id, &touched, db::now_ms())?;

        debug!(
            user_id,
            level = %opts.level,
            summaries = out.summaries.len(),
            items = out.items.len(),
            resources = out.resources.len(),
            semantic = out.semantic.len(),
            "file retrieval"
        );
        Ok(out)
    }

    /// Categories relevant to the query, with at least one non-empty summary.
    fn summaries(
        &self,
        user_id: &str,
        query: &str,
        terms: &[String],
        filter: Option<&[String]>,
    ) -> Result<Vec<CategorySummary>, MnemosError> {
        let all = self.store.list_categories(user_id)?;
        if all.is_empty() {
            return Ok(vec![]);
        }
        let names: Vec<String> = all.iter().map(|c| c.name.clone()).collect();

        let selected: HashSet<String> = match filter {
            Some(f) => f.iter().map(|c| normalize_category(Some(c))).collect(),
            None => match &self.llm {
                Some(llm) => {
                    let picked: Vec<String> = ai::parse_json_response(
                        llm.as_ref(),
                        &prompts::select_categories(query, &names),
                        self.config.json_retries,
                        user_id,
                        "select",
                    )?;
                    picked.iter().map(|c| normalize_category(Some(c))).collect()
                }
                None => self.categories_matching(user_id, terms, &all)?,
            },
        };

        let relevant: Vec<&Category> = if selected.is_empty() && filter.is_none() {
            all.iter().collect()
        } else {
            all.iter().filter(|c| selected.contains(&c.name)).collect()
        };

        Ok(relevant
            .into_iter()
            .filter(|c| !c.general_summary.trim().is_empty() || !c.persistent_summary.trim().is_empty())
            .map(|c| CategorySummary {
                category: c.name.clone(),
                general: c.general_summary.clone(),
                persistent: c.persistent_summary.clone(),
            })
            .collect())
    }

    /// Tool-mode category relevance: the name is a query term, or an active
    /// item in it matches one.
    fn categories_matching(&self, user_id: &str, terms: &[String], all: &[Category]) -> Result<HashSet<String>, MnemosError> {
        let mut hit: HashSet<String> = all
            .iter()
            .filter(|c| terms.iter().any(|t| c.name.contains(t.as_str())))
            .map(|c| c.name.clone())
            .collect();
        for item in self.store.search_items(user_id, terms, None)? {
            hit.insert(item.category);
        }
        Ok(hit)
    }

    fn items(&self, user_id: &str, terms: &[String], categories: Option<&[String]>) -> Result<Vec<Item>, MnemosError> {
        let cats: Option<Vec<String>> = categories.map(|c| c.iter().map(|c| normalize_category(Some(c))).collect());
        let found = self.store.search_items(user_id, terms, cats.as_deref())?;
        let mut scored: Vec<(f64, Item)> = found.into_iter().map(|i| (text::relevance(&i.content, terms), i)).collect();
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.1.created_at.cmp(&a.1.created_at))
        });
        scored.truncate(self.config.item_limit);
        Ok(scored.into_iter().map(|(_, i)| i).collect())
    }

    /// Resources backing `items`, then any whose text matches the terms.
    fn resources(&self, user_id: &str, terms: &[String], items: &[Item]) -> Result<Vec<Resource>, MnemosError> {
        let limit = self.config.resource_limit;
        let mut backing: Vec<String> = Vec::new();
        for i in items {
            if !backing.contains(&i.resource_id) {
                backing.push(i.resource_id.clone());
            }
        }
        let mut out = self.store.resources_by_ids(user_id, &backing)?;
        if out.len() < limit {
            let seen: HashSet<String> = out.iter().map(|r| r.id.clone()).collect();
            let extra = self.store.search_resources(user_id, MemoryKind::File, terms, limit)?;
            out.extend(extra.into_iter().filter(|r| !seen.contains(&r.id)));
        }
        out.truncate(limit);
        Ok(out)
    }

    fn sufficient(&self, user_id: &str, query: &str, summaries: &[CategorySummary]) -> Result<bool, MnemosError> {
        let Some(llm) = &self.llm else { return Ok(true) };
        if summaries.is_empty() {
            return Ok(false);
        }
        let rendered = FileRetrieval {
            summaries: summaries.to_vec(),
            ..Default::default()
        }
        .to_context();
        ai::parse_bool_response(llm.as_ref(), &prompts::sufficiency_check(query, &rendered), user_id, "judge")
    }

    fn semantic(&self, user_id: &str, query: &str, categories: Option<&[String]>) -> Result<Vec<SemanticItem>, MnemosError> {
        let Some(embedder) = &self.embedder else {
            return Ok(vec![]);
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
        let ids: Vec<String> = hits.iter().map(|h| h.owner_id.clone()).collect();
        // stale entries of merged/archived owners drop out here
        let live: HashMap<String, Item> = self
            .store
            .active_items_by_ids(user_id, &ids)?
            .into_iter()
            .map(|i| (i.id.clone(), i))
            .collect();
        let cats: Option<HashSet<String>> = categories.map(|c| c.iter().map(|c| normalize_category(Some(c))).collect());
        Ok(hits
            .into_iter()
            .filter_map(|h| live.get(&h.owner_id).map(|i| (h.score, i.clone())))
            .filter(|(_, i)| cats.as_ref().is_none_or(|c| c.contains(&i.category)))
            .map(|(score, item)| SemanticItem { item, score })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_strings() {
        assert_eq!("items".parse::<RetrievalLevel>().unwrap(), RetrievalLevel::ITEMS);
        assert_eq!(
            "summaries_then_semantic".parse::<RetrievalLevel>().unwrap(),
            RetrievalLevel::then_semantic(FileLevel::Summaries)
        );
        assert_eq!(
            "resources_then_vector".parse::<RetrievalLevel>().unwrap(),
            RetrievalLevel::then_semantic(FileLevel::Resources)
        );
        assert_eq!("vector_only".parse::<RetrievalLevel>().unwrap(), RetrievalLevel::VECTOR_ONLY);
        assert_eq!("semantic".parse::<RetrievalLevel>().unwrap(), RetrievalLevel::VECTOR_ONLY);
        assert!("everything".parse::<RetrievalLevel>().is_err());
        assert_eq!(RetrievalLevel::then_semantic(FileLevel::Items).to_string(), "items_then_semantic");
    }

    #[test]
    fn category_normalization() {
        assert_eq!(normalize_category(Some("  Work ")), "work");
        assert_eq!(normalize_category(Some("")), DEFAULT_CATEGORY);
        assert_eq!(normalize_category(None), DEFAULT_CATEGORY);
    }

    #[test]
    fn context_sections() {
        let r = FileRetrieval {
            summaries: vec![CategorySummary {
                category: "preferences".into(),
                general: "Likes tea.".into(),
                persistent: String::new(),
            }],
            ..Default::default()
        };
        let ctx = r.to_context();
        assert!(ctx.starts_with("## preferences\n### General\nLikes tea."));
        assert!(!ctx.contains("### Persistent"));
        assert!(FileRetrieval::default().to_context().is_empty());
    }
}
