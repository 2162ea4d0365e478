//! Raw ingested text. Rows are never mutated, only archived or purged.

use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::*;

const RESOURCE_COLS: &str = "id, user_id, text, memory_kind, created_at, archived_at";

fn row_to_resource(row: &rusqlite::Row) -> rusqlite::Result<Resource> {
    Ok(Resource {
        id: row.get(0)?,
        user_id: row.get(1)?,
        text: row.get(2)?,
        memory_kind: parse_col(3, row.get(3)?)?,
        created_at: row.get(4)?,
        archived_at: row.get(5)?,
    })
}

pub(crate) fn insert_resource_tx(
    conn: &Connection,
    user_id: &str,
    text: &str,
    kind: MemoryKind,
    now: i64,
) -> Result<Resource, MnemosError> {
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO resources (id, user_id, text, memory_kind, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![id, user_id, text, kind.as_str(), now],
    )?;
    Ok(Resource {
        id,
        user_id: user_id.to_string(),
        text: text.to_string(),
        memory_kind: kind,
        created_at: now,
        archived_at: None,
    })
}

/// Returns false when the resource was already archived (or never existed).
pub(crate) fn archive_resource_tx(
    conn: &Connection,
    user_id: &str,
    id: &str,
    now: i64,
) -> Result<bool, MnemosError> {
    let n = conn.execute(
        "UPDATE resources SET archived_at = ?1 WHERE user_id = ?2 AND id = ?3 AND archived_at IS NULL",
        params![now, user_id, id],
    )?;
    Ok(n > 0)
}

/// Undo a committed write: drop the resource together with every item and
/// triplet it produced, restore the triplets those triplets superseded, and
/// drop categories left without items.
pub(crate) fn purge_write_tx(conn: &Connection, user_id: &str, resource_id: &str) -> Result<(), MnemosError> {
    let new_ids: Vec<String> = {
        let mut stmt = conn.prepare("SELECT id FROM triplets WHERE user_id = ?1 AND resource_id = ?2")?;
        let rows = stmt.query_map(params![user_id, resource_id], |r| r.get(0))?;
        rows.collect::<Result<_, _>>()?
    };
    conn.execute(
        "DELETE FROM triplets WHERE user_id = ?1 AND resource_id = ?2",
        params![user_id, resource_id],
    )?;
    for id in &new_ids {
        conn.execute(
            "UPDATE triplets SET status = 'current', superseded_by = NULL \
             WHERE user_id = ?1 AND superseded_by = ?2",
            params![user_id, id],
        )?;
    }
    let categories: Vec<String> = {
        let mut stmt =
            conn.prepare("SELECT DISTINCT category FROM items WHERE user_id = ?1 AND resource_id = ?2")?;
        let rows = stmt.query_map(params![user_id, resource_id], |r| r.get(0))?;
        rows.collect::<Result<_, _>>()?
    };
    conn.execute(
        "DELETE FROM items WHERE user_id = ?1 AND resource_id = ?2",
        params![user_id, resource_id],
    )?;
    // lazily created categories go too, once nothing else points at them
    for name in &categories {
        conn.execute(
            "DELETE FROM categories WHERE user_id = ?1 AND name = ?2 \
               AND NOT EXISTS (SELECT 1 FROM items WHERE user_id = ?1 AND category = ?2)",
            params![user_id, name],
        )?;
    }
    conn.execute(
        "DELETE FROM resources WHERE user_id = ?1 AND id = ?2",
        params![user_id, resource_id],
    )?;
    Ok(())
}

impl Store {
    pub fn get_resource(&self, user_id: &str, id: &str) -> Result<Resource, MnemosError> {
        let conn = self.conn()?;
        let sql = format!("SELECT {RESOURCE_COLS} FROM resources WHERE user_id = ?1 AND id = ?2");
        conn.query_row(&sql, params![user_id, id], row_to_resource)
            .optional()?
            .ok_or_else(|| MnemosError::not_found(user_id, "resource", id))
    }

    /// Non-archived resources among `ids`, newest first.
    pub fn resources_by_ids(&self, user_id: &str, ids: &[String]) -> Result<Vec<Resource>, MnemosError> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        let conn = self.conn()?;
        let placeholders = (0..ids.len()).map(|i| format!("?{}", i + 2)).collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT {RESOURCE_COLS} FROM resources \
             WHERE user_id = ?1 AND archived_at IS NULL AND id IN ({placeholders}) \
             ORDER BY created_at DESC, rowid DESC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut args: Vec<&dyn rusqlite::ToSql> = vec![&user_id];
        for id in ids {
            args.push(id);
        }
        let rows = stmt.query_map(args.as_slice(), row_to_resource)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Non-archived resources of one kind, oldest first.
    pub fn active_resources(&self, user_id: &str, kind: MemoryKind) -> Result<Vec<Resource>, MnemosError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {RESOURCE_COLS} FROM resources \
             WHERE user_id = ?1 AND memory_kind = ?2 AND archived_at IS NULL \
             ORDER BY created_at ASC, rowid ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![user_id, kind.as_str()], row_to_resource)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Long-tail candidates: non-archived resources created before `cutoff`
    /// that no active item still points at.
    pub fn long_tail_resources(&self, user_id: &str, cutoff: i64) -> Result<Vec<Resource>, MnemosError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {RESOURCE_COLS} FROM resources r \
             WHERE r.user_id = ?1 AND r.archived_at IS NULL AND r.created_at < ?2 \
               AND NOT EXISTS (SELECT 1 FROM items i \
                               WHERE i.resource_id = r.id AND i.status = 'active') \
             ORDER BY r.created_at ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![user_id, cutoff], row_to_resource)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Non-archived resources of one kind whose text contains any of
    /// `terms` (case-insensitive), newest first.
    pub fn search_resources(
        &self,
        user_id: &str,
        kind: MemoryKind,
        terms: &[String],
        limit: usize,
    ) -> Result<Vec<Resource>, MnemosError> {
        if terms.is_empty() || limit == 0 {
            return Ok(vec![]);
        }
        let conn = self.conn()?;
        let mut args: Vec<String> = vec![user_id.to_string(), kind.as_str().to_string()];
        let matches = terms
            .iter()
            .map(|t| {
                args.push(t.to_lowercase());
                format!("instr(LOWER(text), ?{}) > 0", args.len())
            })
            .collect::<Vec<_>>()
            .join(" OR ");
        let sql = format!(
            "SELECT {RESOURCE_COLS} FROM resources \
             WHERE user_id = ?1 AND memory_kind = ?2 AND archived_at IS NULL AND ({matches}) \
             ORDER BY created_at DESC, rowid DESC LIMIT {limit}"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args), row_to_resource)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }
}
