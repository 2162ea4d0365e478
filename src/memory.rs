//! One handle over file memory, graph memory and their maintenance.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::ai::{Embedder, Llm};
use crate::config::MemoryConfig;
use crate::db::{Store, TripletInput};
use crate::error::MnemosError;
use crate::file_memory::{FileMemory, FileRetrieval, FileRetrieveOptions, ItemInput};
use crate::graph_memory::{GraphMemory, GraphRetrieval, GraphRetrieveOptions, GraphWriteOutcome};
use crate::maintenance::{Cadence, MaintenanceEngine, MaintenanceReport, Scheduler};
use crate::recall::{PipelineRecall, RecallPipeline};
use crate::vector::{SqliteVectorIndex, VectorIndex};
use crate::{EmbedCache, SharedStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryMode {
    #[default]
    File,
    Graph,
    Both,
}

impl MemoryMode {
    fn has_file(self) -> bool {
        matches!(self, Self::File | Self::Both)
    }

    fn has_graph(self) -> bool {
        matches!(self, Self::Graph | Self::Both)
    }
}

impl FromStr for MemoryMode {
    type Err = MnemosError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(Self::File),
            "graph" => Ok(Self::Graph),
            "both" => Ok(Self::Both),
            other => Err(MnemosError::Validation(format!("unknown memory mode '{other}'"))),
        }
    }
}

impl fmt::Display for MemoryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::File => "file",
            Self::Graph => "graph",
            Self::Both => "both",
        })
    }
}

#[derive(Default)]
pub struct AgentMemoryBuilder {
    path: Option<String>,
    store: Option<SharedStore>,
    mode: MemoryMode,
    llm: Option<Arc<dyn Llm>>,
    embedder: Option<Arc<dyn Embedder>>,
    config: Option<MemoryConfig>,
}

impl AgentMemoryBuilder {
    /// Database file; `:memory:` (the default) for a throwaway store.
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Share an already open store. Takes precedence over `path`.
    pub fn store(mut self, store: SharedStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn mode(mut self, mode: MemoryMode) -> Self {
        self.mode = mode;
        self
    }

    /// Without an LLM both engines run in tool mode.
    pub fn llm(mut self, llm: Arc<dyn Llm>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn config(mut self, config: MemoryConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn build(self) -> Result<AgentMemory, MnemosError> {
        let config = self.config.unwrap_or_default();
        let store = match self.store {
            Some(s) => s,
            None => Arc::new(Store::open(self.path.as_deref().unwrap_or(":memory:"))?),
        };
        let vectors: Arc<dyn VectorIndex> = Arc::new(SqliteVectorIndex::open(Arc::clone(&store))?);
        let cache = EmbedCache::new(config.embed_cache_size);

        let file = if self.mode.has_file() {
            let mut fm = FileMemory::new(Arc::clone(&store), Arc::clone(&vectors), config.clone()).with_cache(cache.clone());
            if let Some(llm) = &self.llm {
                fm = fm.with_llm(Arc::clone(llm));
            }
            if let Some(emb) = &self.embedder {
                fm = fm.with_embedder(Arc::clone(emb));
            }
            Some(fm)
        } else {
            None
        };

        let graph = if self.mode.has_graph() {
            let mut gm = GraphMemory::new(Arc::clone(&store), Arc::clone(&vectors), self.embedder.clone(), config.clone())?
                .with_cache(cache.clone());
            if let Some(llm) = &self.llm {
                gm = gm.with_llm(Arc::clone(llm));
            }
            Some(gm)
        } else {
            None
        };

        let pipeline = if self.mode.has_file() {
            let mut p = RecallPipeline::new(Arc::clone(&store), Arc::clone(&vectors), config.clone()).with_cache(cache.clone());
            if let Some(llm) = &self.llm {
                p = p.with_llm(Arc::clone(llm));
            }
            if let Some(emb) = &self.embedder {
                p = p.with_embedder(Arc::clone(emb));
            }
            Some(p)
        } else {
            None
        };
        let recall_max_tokens = config.recall_max_tokens;

        let mut maintenance = MaintenanceEngine::new(Arc::clone(&store), Arc::clone(&vectors), config);
        if let Some(llm) = self.llm {
            maintenance = maintenance.with_llm(llm);
        }
        if let Some(emb) = self.embedder {
            maintenance = maintenance.with_embedder(emb);
        }

        info!(mode = %self.mode, "agent memory ready");
        Ok(AgentMemory {
            mode: self.mode,
            store,
            vectors,
            file,
            graph,
            pipeline,
            recall_max_tokens,
            maintenance: Arc::new(maintenance),
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct RecallOptions {
    pub file: FileRetrieveOptions,
    pub graph: GraphRetrieveOptions,
    /// Leave out the ranked memories block.
    pub skip_pipeline: bool,
    /// Token budget of the ranked memories block; the configured one when unset.
    pub max_tokens: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MemorizeOutcome {
    pub item_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub graph: Option<GraphWriteOutcome>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Recall {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<FileRetrieval>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub graph: Option<GraphRetrieval>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memories: Option<PipelineRecall>,
}

impl Recall {
    /// File block, graph block, then ranked memories. Empty blocks are left out.
    pub fn to_context(&self) -> String {
        let blocks: Vec<String> = [
            self.file.as_ref().map(FileRetrieval::to_context),
            self.graph.as_ref().map(GraphRetrieval::to_context),
            self.memories.as_ref().map(PipelineRecall::to_context),
        ]
        .into_iter()
        .flatten()
        .filter(|b| !b.trim().is_empty())
        .collect();
        blocks.join("\n\n")
    }
}

pub struct AgentMemory {
    mode: MemoryMode,
    store: SharedStore,
    vectors: Arc<dyn VectorIndex>,
    file: Option<FileMemory>,
    graph: Option<GraphMemory>,
    pipeline: Option<RecallPipeline>,
    recall_max_tokens: usize,
    maintenance: Arc<MaintenanceEngine>,
}

impl AgentMemory {
    pub fn builder() -> AgentMemoryBuilder {
        AgentMemoryBuilder::default()
    }

    /// Write `text` to every enabled memory. In `both` mode the file write
    /// commits before the graph write starts; each is atomic on its own.
    pub fn memorize(
        &self,
        user_id: &str,
        text: &str,
        items: Option<Vec<ItemInput>>,
        triplets: Option<Vec<TripletInput>>,
    ) -> Result<MemorizeOutcome, MnemosError> {
        let mut out = MemorizeOutcome::default();
        if let Some(file) = &self.file {
            out.item_ids = file.memorize(user_id, text, items)?;
        }
        if let Some(graph) = &self.graph {
            out.graph = Some(graph.memorize(user_id, text, triplets)?);
        }
        Ok(out)
    }

    pub fn recall(&self, user_id: &str, query: &str, opts: &RecallOptions) -> Result<Recall, MnemosError> {
        let file = match &self.file {
            Some(f) => Some(f.retrieve(user_id, query, &opts.file)?),
            None => None,
        };
        let graph = match &self.graph {
            Some(g) => Some(g.retrieve(user_id, query, &opts.graph)?),
            None => None,
        };
        // The ranked block backs up the file levels: always in tool mode or
        // with an embedder, otherwise only when the file levels found nothing.
        let memories = match (&self.pipeline, &file) {
            (Some(p), Some(f)) if !opts.skip_pipeline && (p.is_tool_mode() || p.has_embedder() || f.is_empty()) => {
                let budget = opts.max_tokens.unwrap_or(self.recall_max_tokens);
                Some(p.retrieve(user_id, query, opts.file.search_query.as_deref(), budget)?)
            }
            _ => None,
        };
        Ok(Recall { file, graph, memories })
    }

    /// Combined context string for an agent prompt.
    pub fn retrieve(&self, user_id: &str, query: &str, opts: &RecallOptions) -> Result<String, MnemosError> {
        Ok(self.recall(user_id, query, opts)?.to_context())
    }

    /// Run one cadence, or all three in order when `cadence` is `None`.
    pub fn maintain(&self, user_id: &str, cadence: Option<Cadence>) -> Result<Vec<MaintenanceReport>, MnemosError> {
        match cadence {
            Some(c) => Ok(vec![self.maintenance.run(user_id, c)?]),
            None => self.maintenance.run_all(user_id),
        }
    }

    /// Background maintenance for every user in the store.
    pub fn scheduler(&self, every: Duration) -> Scheduler {
        Scheduler::new(Arc::clone(&self.maintenance), every)
    }

    pub fn mode(&self) -> MemoryMode {
        self.mode
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn vectors(&self) -> &Arc<dyn VectorIndex> {
        &self.vectors
    }

    pub fn file(&self) -> Option<&FileMemory> {
        self.file.as_ref()
    }

    pub fn graph(&self) -> Option<&GraphMemory> {
        self.graph.as_ref()
    }

    pub fn pipeline(&self) -> Option<&RecallPipeline> {
        self.pipeline.as_ref()
    }

    pub fn maintenance(&self) -> &Arc<MaintenanceEngine> {
        &self.maintenance
    }
}
