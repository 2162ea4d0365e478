//! Weekly stale-item archive and monthly long-tail archive.
//!
//! Archived rows are never deleted. Their vector entries are, so archived
//! content only resurfaces through the raw resource it came from.

use tracing::{info, warn};

use super::{MaintenanceEngine, MonthlyReport, WeeklyReport};
use crate::db::items::archive_item_tx;
use crate::db::resources::archive_resource_tx;
use crate::db::{Item, MemoryKind};
use crate::error::MnemosError;
use crate::vector::vector_id;

/// Archive items untouched since the staleness cutoff, unless promoted or
/// accessed at least `retention_access_count` times.
pub(super) fn archive_stale(
    engine: &MaintenanceEngine,
    user_id: &str,
    now: i64,
    report: &mut WeeklyReport,
) -> Result<(), MnemosError> {
    let cfg = &engine.config;
    let stale = engine.store.stale_items(user_id, now - cfg.stale_ms, cfg.retention_access_count)?;
    let (archived, failed) = archive_items(engine, user_id, &stale)?;
    report.archived += archived;
    report.failed += failed;
    if archived > 0 {
        info!(user_id, archived, "archived stale items");
    }
    Ok(())
}

/// Archive everything past the long-tail cutoff regardless of use, then the
/// resources no active item points at anymore.
pub(super) fn archive_long_tail(
    engine: &MaintenanceEngine,
    user_id: &str,
    now: i64,
    report: &mut MonthlyReport,
) -> Result<(), MnemosError> {
    let cutoff = now - engine.config.long_tail_ms;
    let items = engine.store.long_tail_items(user_id, cutoff)?;
    let (archived, failed) = archive_items(engine, user_id, &items)?;
    report.archived_items += archived;
    report.failed += failed;

    let resources = engine.store.long_tail_resources(user_id, cutoff)?;
    let ids: Vec<String> = resources.iter().map(|r| r.id.clone()).collect();
    let archived: Vec<String> = engine.store.with_tx(user_id, "resource", |conn| {
        let mut done = Vec::new();
        for id in &ids {
            if archive_resource_tx(conn, user_id, id, now)? {
                done.push(id.clone());
            }
        }
        Ok(done)
    })?;
    for id in &archived {
        if let Err(e) = engine.vectors.delete(&vector_id(MemoryKind::Graph, id)) {
            warn!(user_id, resource_id = %id, error = %e, "vector delete failed");
            report.failed += 1;
        }
    }
    report.archived_resources += archived.len();

    if report.archived_items + report.archived_resources > 0 {
        info!(
            user_id,
            items = report.archived_items,
            resources = report.archived_resources,
            "archived long tail"
        );
    }
    Ok(())
}

/// Flip still-active `items` to archived in one transaction, then drop their
/// vectors. Rows that changed status since they were listed are skipped.
fn archive_items(engine: &MaintenanceEngine, user_id: &str, items: &[Item]) -> Result<(usize, usize), MnemosError> {
    if items.is_empty() {
        return Ok((0, 0));
    }
    let archived: Vec<&Item> = engine.store.with_tx(user_id, "item", |conn| {
        let mut done = Vec::new();
        for item in items {
            if archive_item_tx(conn, user_id, &item.id)? {
                done.push(item);
            }
        }
        Ok(done)
    })?;

    let mut failed = 0;
    for item in &archived {
        if let Err(e) = engine.vectors.delete(&vector_id(MemoryKind::File, &item.id)) {
            warn!(user_id, item_id = %item.id, error = %e, "vector delete failed");
            failed += 1;
        }
    }
    Ok((archived.len(), failed))
}
