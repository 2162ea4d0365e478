//! On-disk side of the vector index.

use rusqlite::params;

use super::*;
use crate::ai::{bytes_to_embedding, embedding_to_bytes};
use crate::vector::VectorEntry;

impl Store {
    pub(crate) fn put_vector(&self, entry: &VectorEntry) -> Result<(), MnemosError> {
        self.conn()?.execute(
            "INSERT OR REPLACE INTO vector_entries \
             (vector_id, user_id, memory_kind, owner_id, embedding, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry.vector_id,
                entry.user_id,
                entry.memory_kind.as_str(),
                entry.owner_id,
                embedding_to_bytes(&entry.embedding),
                entry.created_at
            ],
        )?;
        Ok(())
    }

    pub(crate) fn delete_vector(&self, vector_id: &str) -> Result<bool, MnemosError> {
        let n = self
            .conn()?
            .execute("DELETE FROM vector_entries WHERE vector_id = ?1", [vector_id])?;
        Ok(n > 0)
    }

    /// Load every well-formed entry. Rows with an unknown kind or an empty
    /// embedding are deleted on the way.
    pub(crate) fn load_vectors(&self) -> Result<Vec<VectorEntry>, MnemosError> {
        let conn = self.conn()?;
        let raw: Vec<(String, String, String, String, Vec<u8>, i64)> = {
            let mut stmt = conn.prepare(
                "SELECT vector_id, user_id, memory_kind, owner_id, embedding, created_at FROM vector_entries",
            )?;
            let rows = stmt.query_map([], |r| {
                Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?))
            })?;
            rows.collect::<Result<_, _>>()?
        };

        let mut entries = Vec::with_capacity(raw.len());
        let mut malformed = Vec::new();
        for (vector_id, user_id, kind, owner_id, blob, created_at) in raw {
            let embedding = bytes_to_embedding(&blob);
            match kind.parse::<MemoryKind>() {
                Ok(memory_kind) if !embedding.is_empty() && blob.len() % 4 == 0 => entries.push(VectorEntry {
                    vector_id,
                    user_id,
                    memory_kind,
                    owner_id,
                    embedding,
                    created_at,
                }),
                _ => malformed.push(vector_id),
            }
        }
        for id in &malformed {
            conn.execute("DELETE FROM vector_entries WHERE vector_id = ?1", [id])?;
        }
        if !malformed.is_empty() {
            tracing::warn!(count = malformed.len(), "dropped malformed vector entries");
        }
        Ok(entries)
    }
}
