//! Category rows and their two summaries.

use rusqlite::{params, Connection, OptionalExtension};

use super::*;

const CATEGORY_COLS: &str = "user_id, name, general_summary, persistent_summary, general_fingerprint, \
                             persistent_watermark, updated_at";

fn row_to_category(row: &rusqlite::Row) -> rusqlite::Result<Category> {
    Ok(Category {
        user_id: row.get(0)?,
        name: row.get(1)?,
        general_summary: row.get(2)?,
        persistent_summary: row.get(3)?,
        general_fingerprint: row.get(4)?,
        persistent_watermark: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

/// Lazily create the category row on first item write.
pub(crate) fn ensure_category_tx(conn: &Connection, user_id: &str, name: &str, now: i64) -> Result<(), MnemosError> {
    conn.execute(
        "INSERT OR IGNORE INTO categories (user_id, name, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
        params![user_id, name, now],
    )?;
    Ok(())
}

impl Store {
    pub fn get_category(&self, user_id: &str, name: &str) -> Result<Category, MnemosError> {
        let conn = self.conn()?;
        let sql = format!("SELECT {CATEGORY_COLS} FROM categories WHERE user_id = ?1 AND name = ?2");
        conn.query_row(&sql, params![user_id, name], row_to_category)
            .optional()?
            .ok_or_else(|| MnemosError::not_found(user_id, "category", name))
    }

    pub fn list_categories(&self, user_id: &str) -> Result<Vec<Category>, MnemosError> {
        let conn = self.conn()?;
        let sql = format!("SELECT {CATEGORY_COLS} FROM categories WHERE user_id = ?1 ORDER BY name");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([user_id], row_to_category)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn set_general_summary(
        &self,
        user_id: &str,
        name: &str,
        summary: &str,
        fingerprint: &str,
        now: i64,
    ) -> Result<(), MnemosError> {
        let n = self.conn()?.execute(
            "UPDATE categories SET general_summary = ?1, general_fingerprint = ?2, updated_at = ?3 \
             WHERE user_id = ?4 AND name = ?5",
            params![summary, fingerprint, now, user_id, name],
        )?;
        if n == 0 {
            return Err(MnemosError::not_found(user_id, "category", name));
        }
        Ok(())
    }

    /// Append `addendum` to the persistent summary and move the watermark,
    /// but only if the watermark is still `expected`. Returns false when a
    /// concurrent run already advanced it.
    pub fn append_persistent_summary(
        &self,
        user_id: &str,
        name: &str,
        addendum: &str,
        expected: i64,
        watermark: i64,
        now: i64,
    ) -> Result<bool, MnemosError> {
        let n = self.conn()?.execute(
            "UPDATE categories SET \
                persistent_summary = CASE WHEN persistent_summary = '' THEN ?1 \
                                          ELSE persistent_summary || char(10) || char(10) || ?1 END, \
                persistent_watermark = ?2, updated_at = ?3 \
             WHERE user_id = ?4 AND name = ?5 AND persistent_watermark = ?6",
            params![addendum, watermark, now, user_id, name, expected],
        )?;
        Ok(n > 0)
    }
}
