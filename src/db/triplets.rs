//! Triplet storage with current/past/uncertain lifecycle.
//!
//! At most one row per (user, subject, predicate) is `current`; the partial
//! unique index in the schema enforces it even against concurrent writers.

use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::*;

const TRIPLET_COLS: &str = "id, user_id, subject, predicate, object, status, resource_id, created_at, superseded_by";

fn row_to_triplet(row: &rusqlite::Row) -> rusqlite::Result<Triplet> {
    Ok(Triplet {
        id: row.get(0)?,
        user_id: row.get(1)?,
        subject: row.get(2)?,
        predicate: row.get(3)?,
        object: row.get(4)?,
        status: parse_col(5, row.get(5)?)?,
        resource_id: row.get(6)?,
        created_at: row.get(7)?,
        superseded_by: row.get(8)?,
    })
}

/// Outcome of writing one triplet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TripletWrite {
    Inserted { id: String, superseded: Vec<String> },
    /// An identical current triplet already exists.
    Unchanged { id: String },
}

/// Insert one triplet. A `current` triplet first looks up the current row
/// for the same (subject, predicate): an identical object makes the write a
/// no-op, a different one is flipped to `past` and linked to the new row.
/// Past and uncertain triplets are inserted as-is.
pub(crate) fn write_triplet_tx(
    conn: &Connection,
    user_id: &str,
    resource_id: &str,
    input: &TripletInput,
    now: i64,
) -> Result<TripletWrite, MnemosError> {
    validate_triplet(input)?;
    let subject_key = entity_key(&input.subject);
    let predicate_key = entity_key(&input.predicate);
    let object_key = entity_key(&input.object);
    let id = Uuid::new_v4().to_string();

    let mut superseded = Vec::new();
    if input.status == TripletStatus::Current {
        let existing: Vec<(String, String)> = {
            let mut stmt = conn.prepare(
                "SELECT id, object_key FROM triplets \
                 WHERE user_id = ?1 AND subject_key = ?2 AND predicate_key = ?3 AND status = 'current'",
            )?;
            let rows = stmt.query_map(params![user_id, subject_key, predicate_key], |r| {
                Ok((r.get(0)?, r.get(1)?))
            })?;
            rows.collect::<Result<_, _>>()?
        };
        if let Some((same, _)) = existing.iter().find(|(_, obj)| *obj == object_key) {
            return Ok(TripletWrite::Unchanged { id: same.clone() });
        }
        for (old, _) in existing {
            conn.execute(
                "UPDATE triplets SET status = 'past', superseded_by = ?1 \
                 WHERE user_id = ?2 AND id = ?3 AND status = 'current'",
                params![id, user_id, old],
            )?;
            superseded.push(old);
        }
    }

    conn.execute(
        "INSERT INTO triplets (id, user_id, subject, predicate, object, subject_key, predicate_key, \
                               object_key, status, resource_id, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            id,
            user_id,
            input.subject.trim(),
            input.predicate.trim(),
            input.object.trim(),
            subject_key,
            predicate_key,
            object_key,
            input.status.as_str(),
            resource_id,
            now
        ],
    )?;
    Ok(TripletWrite::Inserted { id, superseded })
}

impl Store {
    pub fn get_triplet(&self, user_id: &str, id: &str) -> Result<Triplet, MnemosError> {
        let conn = self.conn()?;
        let sql = format!("SELECT {TRIPLET_COLS} FROM triplets WHERE user_id = ?1 AND id = ?2");
        conn.query_row(&sql, params![user_id, id], row_to_triplet)
            .optional()?
            .ok_or_else(|| MnemosError::not_found(user_id, "triplet", id))
    }

    /// Every triplet for (subject, predicate), any status, newest first.
    pub fn triplets_for(&self, user_id: &str, subject: &str, predicate: &str) -> Result<Vec<Triplet>, MnemosError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {TRIPLET_COLS} FROM triplets \
             WHERE user_id = ?1 AND subject_key = ?2 AND predicate_key = ?3 \
             ORDER BY created_at DESC, rowid DESC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![user_id, entity_key(subject), entity_key(predicate)], row_to_triplet)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Triplets whose subject or object is `entity`, restricted to
    /// `statuses`, ordered current → uncertain → past and newest first
    /// within a status. `limit` of `None` means unbounded.
    pub fn triplets_touching(
        &self,
        user_id: &str,
        entity: &str,
        statuses: &[TripletStatus],
        limit: Option<usize>,
    ) -> Result<Vec<Triplet>, MnemosError> {
        if statuses.is_empty() {
            return Ok(vec![]);
        }
        let conn = self.conn()?;
        let status_list = statuses
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(",");
        let sql = format!(
            "SELECT {TRIPLET_COLS} FROM triplets \
             WHERE user_id = ?1 AND (subject_key = ?2 OR object_key = ?2) AND status IN ({status_list}) \
             ORDER BY CASE status WHEN 'current' THEN 0 WHEN 'uncertain' THEN 1 ELSE 2 END, \
                      created_at DESC, rowid DESC \
             LIMIT ?3"
        );
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![user_id, entity_key(entity), limit], row_to_triplet)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn count_triplets(&self, user_id: &str, status: Option<TripletStatus>) -> Result<usize, MnemosError> {
        let conn = self.conn()?;
        let n: i64 = match status {
            Some(s) => conn.query_row(
                "SELECT COUNT(*) FROM triplets WHERE user_id = ?1 AND status = ?2",
                params![user_id, s.as_str()],
                |r| r.get(0),
            )?,
            None => conn.query_row("SELECT COUNT(*) FROM triplets WHERE user_id = ?1", [user_id], |r| r.get(0))?,
        };
        Ok(n as usize)
    }
}
