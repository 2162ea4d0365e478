//! Nightly dedup: collapse near-identical items of a category into one.
//!
//! Items are linked when their raw cosine similarity exceeds the configured
//! threshold; linked groups (single linkage) become clusters. Groups larger
//! than `max_cluster_size` are split around their two most distant members
//! so a chain A≈B≈C with A≉C doesn't fold unrelated items together.

use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::{debug, warn};

use super::{MaintenanceEngine, NightlyReport};
use crate::ai::{complete_text, cosine_similarity, embed_text, Llm};
use crate::db::items::{insert_merged_item_tx, mark_merged_tx};
use crate::db::{Item, MemoryKind};
use crate::error::MnemosError;
use crate::prompts;
use crate::vector::{vector_id, VectorEntry};

/// Group `items` by embedding similarity. Items without an embedding are
/// never clustered. Only clusters of two or more are returned, each ordered
/// oldest first, largest clusters first.
pub fn cluster_items(
    items: &[Item],
    embeddings: &HashMap<String, Vec<f32>>,
    threshold: f64,
    max_size: usize,
) -> Vec<Vec<Item>> {
    let with_emb: Vec<(&Item, &Vec<f32>)> = items
        .iter()
        .filter_map(|i| embeddings.get(&i.id).map(|e| (i, e)))
        .collect();
    let n = with_emb.len();

    let mut parent: Vec<usize> = (0..n).collect();
    fn find(parent: &mut [usize], x: usize) -> usize {
        let mut r = x;
        while parent[r] != r {
            r = parent[r];
        }
        let mut c = x;
        while parent[c] != r {
            let next = parent[c];
            parent[c] = r;
            c = next;
        }
        r
    }

    for i in 0..n {
        for j in (i + 1)..n {
            if cosine_similarity(with_emb[i].1, with_emb[j].1) > threshold {
                let (ri, rj) = (find(&mut parent, i), find(&mut parent, j));
                if ri != rj {
                    parent[ri] = rj;
                }
            }
        }
    }

    // BTreeMap keeps the output order independent of hashing.
    let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for i in 0..n {
        let root = find(&mut parent, i);
        groups.entry(root).or_default().push(i);
    }

    let mut clusters: Vec<Vec<usize>> = Vec::new();
    for (_, idx) in groups {
        split_oversized(idx, &with_emb, max_size.max(2), &mut clusters);
    }

    let mut out: Vec<Vec<Item>> = clusters
        .into_iter()
        .filter(|c| c.len() >= 2)
        .map(|c| {
            let mut members: Vec<Item> = c.into_iter().map(|i| with_emb[i].0.clone()).collect();
            members.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
            members
        })
        .collect();
    out.sort_by(|a, b| b.len().cmp(&a.len()));
    out
}

/// k=2 split around the least similar pair, recursing until every part fits.
fn split_oversized(idx: Vec<usize>, with_emb: &[(&Item, &Vec<f32>)], max_size: usize, out: &mut Vec<Vec<usize>>) {
    if idx.len() <= max_size {
        out.push(idx);
        return;
    }
    let sim = |a: usize, b: usize| cosine_similarity(with_emb[a].1, with_emb[b].1);

    let (mut seed_a, mut seed_b, mut lowest) = (idx[0], idx[1], f64::MAX);
    for (k, &a) in idx.iter().enumerate() {
        for &b in &idx[k + 1..] {
            let s = sim(a, b);
            if s < lowest {
                (seed_a, seed_b, lowest) = (a, b, s);
            }
        }
    }

    let (mut left, mut right) = (vec![seed_a], vec![seed_b]);
    for &i in idx.iter().filter(|&&i| i != seed_a && i != seed_b) {
        let (sa, sb) = (sim(i, seed_a), sim(i, seed_b));
        // Ties go to the smaller side so identical vectors still split evenly.
        if sa > sb || (sa == sb && left.len() <= right.len()) {
            left.push(i);
        } else {
            right.push(i);
        }
    }
    split_oversized(left, with_emb, max_size, out);
    split_oversized(right, with_emb, max_size, out);
}

pub(super) fn dedup(engine: &MaintenanceEngine, user_id: &str, report: &mut NightlyReport) -> Result<(), MnemosError> {
    let Some(llm) = engine.llm.as_deref() else {
        debug!(user_id, "no llm configured, skipping dedup");
        return Ok(());
    };
    let store = &engine.store;
    let cfg = &engine.config;

    for category in store.list_categories(user_id)? {
        // Merged items can still match leftovers of a split cluster, so the
        // category is re-clustered until a pass merges nothing. Each merging
        // pass shrinks the active set, which bounds the loop.
        let mut failed: HashSet<Vec<String>> = HashSet::new();
        loop {
            let items = store.active_items(user_id, Some(&category.name))?;
            if items.len() < 2 {
                break;
            }
            let embeddings: HashMap<String, Vec<f32>> = items
                .iter()
                .filter_map(|i| {
                    engine
                        .vectors
                        .get(&vector_id(MemoryKind::File, &i.id))
                        .map(|e| (i.id.clone(), e.embedding))
                })
                .collect();

            let mut merged_any = false;
            for cluster in cluster_items(&items, &embeddings, cfg.dedup_similarity, cfg.max_cluster_size) {
                let key: Vec<String> = cluster.iter().map(|i| i.id.clone()).collect();
                if failed.contains(&key) {
                    continue;
                }
                report.clusters += 1;
                match merge_cluster(engine, llm, user_id, &cluster) {
                    Ok(merged) => {
                        report.merged += merged;
                        report.created += 1;
                        merged_any = true;
                    }
                    Err(e) => {
                        warn!(user_id, category = %category.name, size = cluster.len(), error = %e, "cluster merge failed");
                        report.failed += 1;
                        failed.insert(key);
                    }
                }
            }
            if !merged_any {
                break;
            }
        }
    }
    Ok(())
}

/// Compress, embed, then swap the originals for the merged item in one
/// transaction. Vector entries follow after commit; a crash in between
/// leaves merged originals with stale vectors, which monthly reindex drops.
fn merge_cluster(
    engine: &MaintenanceEngine,
    llm: &dyn Llm,
    user_id: &str,
    cluster: &[Item],
) -> Result<usize, MnemosError> {
    let contents: Vec<String> = cluster.iter().map(|i| i.content.clone()).collect();
    let merged_text = complete_text(llm, &prompts::compress_items(&contents), user_id, "compress")?;
    let embedding = match engine.embedder.as_deref() {
        Some(emb) => Some(embed_text(emb, &merged_text, user_id)?),
        None => None,
    };

    let ids: Vec<String> = cluster.iter().map(|i| i.id.clone()).collect();
    let merged = engine.store.with_tx(user_id, "item", |conn| {
        let merged = insert_merged_item_tx(conn, user_id, cluster, &merged_text, embedding.is_some())?;
        let moved = mark_merged_tx(conn, user_id, &ids, &merged.id)?;
        if moved != ids.len() {
            // Some original changed under us; roll back and let the next run retry.
            return Err(MnemosError::conflict(user_id, "item"));
        }
        Ok(merged)
    })?;

    for id in &ids {
        engine.vectors.delete(&vector_id(MemoryKind::File, id))?;
    }
    if let Some(embedding) = embedding {
        engine.vectors.upsert(VectorEntry::new(
            user_id,
            MemoryKind::File,
            &merged.id,
            embedding,
            merged.created_at,
        ))?;
    }
    debug!(user_id, merged_id = %merged.id, sources = ids.len(), "merged cluster");
    Ok(ids.len())
}
