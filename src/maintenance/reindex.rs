//! Monthly reindex: re-embed live rows, drop orphaned vectors, compact.

use std::collections::HashSet;

use tracing::{debug, info, warn};

use super::{MaintenanceEngine, MonthlyReport};
use crate::ai::embed_text;
use crate::db::items::set_embedding_id_tx;
use crate::db::MemoryKind;
use crate::error::MnemosError;
use crate::vector::{vector_id, VectorEntry, VectorFilter};

pub(super) fn reindex(engine: &MaintenanceEngine, user_id: &str, report: &mut MonthlyReport) -> Result<(), MnemosError> {
    let store = &engine.store;
    let items = store.active_items(user_id, None)?;
    let resources = store.active_resources(user_id, MemoryKind::Graph)?;

    let mut live: HashSet<String> = HashSet::with_capacity(items.len() + resources.len());
    live.extend(items.iter().map(|i| vector_id(MemoryKind::File, &i.id)));
    live.extend(resources.iter().map(|r| vector_id(MemoryKind::Graph, &r.id)));

    if let Some(embedder) = engine.embedder.as_deref() {
        for item in &items {
            let vid = vector_id(MemoryKind::File, &item.id);
            let result = embed_text(embedder, &item.content, user_id).and_then(|emb| {
                engine
                    .vectors
                    .upsert(VectorEntry::new(user_id, MemoryKind::File, &item.id, emb, item.created_at))?;
                if item.embedding_id.as_deref() != Some(vid.as_str()) {
                    store.with_tx(user_id, "item", |conn| set_embedding_id_tx(conn, user_id, &item.id, &vid))?;
                }
                Ok(())
            });
            match result {
                Ok(()) => report.reembedded += 1,
                Err(e) => {
                    warn!(user_id, item_id = %item.id, error = %e, "re-embed failed");
                    report.failed += 1;
                }
            }
        }
        for resource in &resources {
            let result = embed_text(embedder, &resource.text, user_id).and_then(|emb| {
                engine.vectors.upsert(VectorEntry::new(
                    user_id,
                    MemoryKind::Graph,
                    &resource.id,
                    emb,
                    resource.created_at,
                ))
            });
            match result {
                Ok(()) => report.reembedded += 1,
                Err(e) => {
                    warn!(user_id, resource_id = %resource.id, error = %e, "re-embed failed");
                    report.failed += 1;
                }
            }
        }
    } else {
        debug!(user_id, "no embedder configured, skipping re-embed");
    }

    for entry in engine.vectors.entries(&VectorFilter::new(user_id, None)) {
        if !live.contains(&entry.vector_id) && engine.vectors.delete(&entry.vector_id)? {
            report.orphans_removed += 1;
        }
    }

    engine.vectors.rebuild()?;
    report.index_size = engine.vectors.entries(&VectorFilter::new(user_id, None)).len();
    info!(
        user_id,
        reembedded = report.reembedded,
        orphans = report.orphans_removed,
        index_size = report.index_size,
        "vector index rebuilt"
    );
    Ok(())
}
