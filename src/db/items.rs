//! Atomic file-memory items and their access statistics.

use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use uuid::Uuid;

use super::*;

const ITEM_COLS: &str = "id, user_id, resource_id, content, category, created_at, last_accessed_at, \
                         access_count, embedding_id, status, merged_into, retained";

fn row_to_item(row: &rusqlite::Row) -> rusqlite::Result<Item> {
    Ok(Item {
        id: row.get(0)?,
        user_id: row.get(1)?,
        resource_id: row.get(2)?,
        content: row.get(3)?,
        category: row.get(4)?,
        created_at: row.get(5)?,
        last_accessed_at: row.get(6)?,
        access_count: row.get(7)?,
        embedding_id: row.get(8)?,
        status: parse_col(9, row.get(9)?)?,
        merged_into: row.get(10)?,
        retained: row.get::<_, i64>(11)? != 0,
    })
}

fn id_placeholders(start: usize, n: usize) -> String {
    (0..n).map(|i| format!("?{}", start + i)).collect::<Vec<_>>().join(",")
}

pub(crate) fn insert_item_tx(
    conn: &Connection,
    user_id: &str,
    resource_id: &str,
    content: &str,
    category: &str,
    now: i64,
) -> Result<Item, MnemosError> {
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO items (id, user_id, resource_id, content, category, created_at, last_accessed_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
        params![id, user_id, resource_id, content, category, now],
    )?;
    Ok(Item {
        id,
        user_id: user_id.to_string(),
        resource_id: resource_id.to_string(),
        content: content.to_string(),
        category: category.to_string(),
        created_at: now,
        last_accessed_at: now,
        access_count: 0,
        embedding_id: None,
        status: ItemStatus::Active,
        merged_into: None,
        retained: false,
    })
}

/// Insert the item that absorbs a dedup cluster. It inherits the newest
/// source's resource and timestamps, the summed access count, and the
/// retention flag of any source.
pub(crate) fn insert_merged_item_tx(
    conn: &Connection,
    user_id: &str,
    sources: &[Item],
    content: &str,
    embedded: bool,
) -> Result<Item, MnemosError> {
    let newest = sources
        .iter()
        .max_by_key(|i| i.created_at)
        .ok_or_else(|| MnemosError::Validation("merge without sources".into()))?;
    let id = Uuid::new_v4().to_string();
    let embedding_id = embedded.then(|| crate::vector::vector_id(MemoryKind::File, &id));
    let last_accessed_at = sources.iter().map(|i| i.last_accessed_at).max().unwrap_or(newest.created_at);
    let access_count: i64 = sources.iter().map(|i| i.access_count).sum();
    let retained = sources.iter().any(|i| i.retained);
    conn.execute(
        "INSERT INTO items (id, user_id, resource_id, content, category, created_at, last_accessed_at, \
                            access_count, embedding_id, retained) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            id,
            user_id,
            newest.resource_id,
            content,
            newest.category,
            newest.created_at,
            last_accessed_at,
            access_count,
            embedding_id,
            retained as i64
        ],
    )?;
    Ok(Item {
        id,
        user_id: user_id.to_string(),
        resource_id: newest.resource_id.clone(),
        content: content.to_string(),
        category: newest.category.clone(),
        created_at: newest.created_at,
        last_accessed_at,
        access_count,
        embedding_id,
        status: ItemStatus::Active,
        merged_into: None,
        retained,
    })
}

/// Flip still-active `ids` to merged. Returns how many rows actually moved;
/// callers compare against `ids.len()` to detect a concurrent change.
pub(crate) fn mark_merged_tx(
    conn: &Connection,
    user_id: &str,
    ids: &[String],
    merged_into: &str,
) -> Result<usize, MnemosError> {
    let mut moved = 0;
    for id in ids {
        moved += conn.execute(
            "UPDATE items SET status = 'merged', merged_into = ?1 \
             WHERE user_id = ?2 AND id = ?3 AND status = 'active'",
            params![merged_into, user_id, id],
        )?;
    }
    Ok(moved)
}

/// Returns false when the item was no longer active.
pub(crate) fn archive_item_tx(conn: &Connection, user_id: &str, id: &str) -> Result<bool, MnemosError> {
    let n = conn.execute(
        "UPDATE items SET status = 'archived' WHERE user_id = ?1 AND id = ?2 AND status = 'active'",
        params![user_id, id],
    )?;
    Ok(n > 0)
}

pub(crate) fn set_embedding_id_tx(
    conn: &Connection,
    user_id: &str,
    id: &str,
    embedding_id: &str,
) -> Result<(), MnemosError> {
    conn.execute(
        "UPDATE items SET embedding_id = ?1 WHERE user_id = ?2 AND id = ?3",
        params![embedding_id, user_id, id],
    )?;
    Ok(())
}

impl Store {
    pub fn get_item(&self, user_id: &str, id: &str) -> Result<Item, MnemosError> {
        let conn = self.conn()?;
        let sql = format!("SELECT {ITEM_COLS} FROM items WHERE user_id = ?1 AND id = ?2");
        conn.query_row(&sql, params![user_id, id], row_to_item)
            .optional()?
            .ok_or_else(|| MnemosError::not_found(user_id, "item", id))
    }

    /// Active items among `ids`, in no particular order.
    pub fn active_items_by_ids(&self, user_id: &str, ids: &[String]) -> Result<Vec<Item>, MnemosError> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {ITEM_COLS} FROM items WHERE user_id = ?1 AND status = 'active' AND id IN ({})",
            id_placeholders(2, ids.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let args = std::iter::once(user_id.to_string()).chain(ids.iter().cloned());
        let rows = stmt.query_map(params_from_iter(args), row_to_item)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Active items containing at least one of `terms` (case-insensitive,
    /// no wildcards), optionally restricted to `categories`. Ranking is the
    /// caller's job.
    pub fn search_items(
        &self,
        user_id: &str,
        terms: &[String],
        categories: Option<&[String]>,
    ) -> Result<Vec<Item>, MnemosError> {
        if terms.is_empty() {
            return Ok(vec![]);
        }
        let conn = self.conn()?;
        let mut args: Vec<String> = vec![user_id.to_string()];
        let matches = terms
            .iter()
            .map(|t| {
                args.push(t.to_lowercase());
                format!("instr(LOWER(content), ?{}) > 0", args.len())
            })
            .collect::<Vec<_>>()
            .join(" OR ");
        let mut sql = format!(
            "SELECT {ITEM_COLS} FROM items WHERE user_id = ?1 AND status = 'active' AND ({matches})"
        );
        if let Some(cats) = categories {
            if cats.is_empty() {
                return Ok(vec![]);
            }
            sql.push_str(&format!(" AND category IN ({})", id_placeholders(args.len() + 1, cats.len())));
            args.extend(cats.iter().cloned());
        }
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), row_to_item)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Active items, oldest first, optionally for one category.
    pub fn active_items(&self, user_id: &str, category: Option<&str>) -> Result<Vec<Item>, MnemosError> {
        let conn = self.conn()?;
        let (sql, args) = match category {
            Some(c) => (
                format!(
                    "SELECT {ITEM_COLS} FROM items WHERE user_id = ?1 AND status = 'active' AND category = ?2 \
                     ORDER BY created_at ASC, rowid ASC"
                ),
                vec![user_id.to_string(), c.to_string()],
            ),
            None => (
                format!(
                    "SELECT {ITEM_COLS} FROM items WHERE user_id = ?1 AND status = 'active' \
                     ORDER BY created_at ASC, rowid ASC"
                ),
                vec![user_id.to_string()],
            ),
        };
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), row_to_item)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Items of any status, oldest first. Used to inspect lifecycle history.
    pub fn items_for_user(&self, user_id: &str) -> Result<Vec<Item>, MnemosError> {
        let conn = self.conn()?;
        let sql = format!("SELECT {ITEM_COLS} FROM items WHERE user_id = ?1 ORDER BY created_at ASC, rowid ASC");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([user_id], row_to_item)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Bump access stats on items a read returned. Non-active rows are left alone.
    pub fn touch_items(&self, user_id: &str, ids: &[String], now: i64) -> Result<(), MnemosError> {
        if ids.is_empty() {
            return Ok(());
        }
        let conn = self.conn()?;
        let sql = format!(
            "UPDATE items SET access_count = access_count + 1, last_accessed_at = ?2 \
             WHERE user_id = ?1 AND status = 'active' AND id IN ({})",
            id_placeholders(3, ids.len())
        );
        let mut args: Vec<&dyn rusqlite::ToSql> = vec![&user_id, &now];
        for id in ids {
            args.push(id);
        }
        conn.execute(&sql, args.as_slice())?;
        Ok(())
    }

    /// Flag frequently used items so the weekly archive keeps them.
    pub fn promote_items(&self, user_id: &str, min_access: i64) -> Result<usize, MnemosError> {
        let n = self.conn()?.execute(
            "UPDATE items SET retained = 1 \
             WHERE user_id = ?1 AND status = 'active' AND retained = 0 AND access_count >= ?2",
            params![user_id, min_access],
        )?;
        Ok(n)
    }

    /// Weekly archive candidates: not touched since `cutoff`, rarely used,
    /// and not promoted.
    pub fn stale_items(&self, user_id: &str, cutoff: i64, retention: i64) -> Result<Vec<Item>, MnemosError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {ITEM_COLS} FROM items \
             WHERE user_id = ?1 AND status = 'active' AND retained = 0 \
               AND last_accessed_at < ?2 AND access_count < ?3 \
             ORDER BY last_accessed_at ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![user_id, cutoff, retention], row_to_item)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Monthly archive candidates: not touched since `cutoff`, whatever their use.
    pub fn long_tail_items(&self, user_id: &str, cutoff: i64) -> Result<Vec<Item>, MnemosError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {ITEM_COLS} FROM items \
             WHERE user_id = ?1 AND status = 'active' AND last_accessed_at < ?2 \
             ORDER BY last_accessed_at ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![user_id, cutoff], row_to_item)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Active items of a category created in `(after, until]`, oldest first.
    pub fn items_created_between(
        &self,
        user_id: &str,
        category: &str,
        after: i64,
        until: i64,
    ) -> Result<Vec<Item>, MnemosError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {ITEM_COLS} FROM items \
             WHERE user_id = ?1 AND category = ?2 AND status = 'active' \
               AND created_at > ?3 AND created_at <= ?4 \
             ORDER BY created_at ASC, rowid ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![user_id, category, after, until], row_to_item)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }
}
