//! SQLite-backed storage for resources, items, categories, triplets and
//! vector entries. Every query is scoped by `user_id`.

pub(crate) mod categories;
pub(crate) mod items;
pub(crate) mod resources;
pub(crate) mod triplets;
mod vec;

pub use triplets::TripletWrite;

use std::fmt;
use std::str::FromStr;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};

use crate::error::{is_conflict, MnemosError};

/// Set busy_timeout on every connection handed out by the pool.
/// Writers queue behind each other instead of failing with SQLITE_BUSY.
#[derive(Debug)]
struct BusyTimeoutCustomizer;
impl r2d2::CustomizeConnection<rusqlite::Connection, rusqlite::Error> for BusyTimeoutCustomizer {
    fn on_acquire(&self, conn: &mut rusqlite::Connection) -> Result<(), rusqlite::Error> {
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(())
    }
}

type PooledConn = r2d2::PooledConnection<SqliteConnectionManager>;

const MAX_FIELD_LEN: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryKind {
    File,
    Graph,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Active,
    Merged,
    Archived,
}

/// Lifecycle of a triplet. Anything the extractor emits outside these three
/// is coerced to `Uncertain`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TripletStatus {
    Current,
    Past,
    Uncertain,
}

macro_rules! str_enum {
    ($ty:ident, $what:literal, { $($variant:ident => $s:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $s,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = MnemosError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($s => Ok(Self::$variant),)+
                    other => Err(MnemosError::Validation(format!("unknown {} '{}'", $what, other))),
                }
            }
        }
    };
}

str_enum!(MemoryKind, "memory kind", { File => "file", Graph => "graph" });
str_enum!(ItemStatus, "item status", { Active => "active", Merged => "merged", Archived => "archived" });
str_enum!(TripletStatus, "triplet status", { Current => "current", Past => "past", Uncertain => "uncertain" });

impl TripletStatus {
    /// Lenient parse used on extractor output.
    pub fn coerce(s: &str) -> Self {
        s.parse().unwrap_or(Self::Uncertain)
    }

    /// Retrieval order: current, then uncertain, then past.
    pub fn rank(self) -> u8 {
        match self {
            Self::Current => 0,
            Self::Uncertain => 1,
            Self::Past => 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    pub id: String,
    pub user_id: String,
    pub text: String,
    pub memory_kind: MemoryKind,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub user_id: String,
    /// Back-reference only; resolved through the store.
    pub resource_id: String,
    pub content: String,
    pub category: String,
    pub created_at: i64,
    pub last_accessed_at: i64,
    pub access_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_id: Option<String>,
    pub status: ItemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merged_into: Option<String>,
    /// Set by nightly promotion; retained items survive the weekly archive.
    pub retained: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Category {
    pub user_id: String,
    pub name: String,
    pub general_summary: String,
    pub persistent_summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub general_fingerprint: Option<String>,
    /// created_at of the newest item folded into `persistent_summary`.
    pub persistent_watermark: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Triplet {
    pub id: String,
    pub user_id: String,
    pub subject: String,
    pub predicate: String,
    pub object: String,
    pub status: TripletStatus,
    pub resource_id: String,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TripletInput {
    pub subject: String,
    pub predicate: String,
    pub object: String,
    pub status: TripletStatus,
}

impl TripletInput {
    pub fn current(
        subject: impl Into<String>,
        predicate: impl Into<String>,
        object: impl Into<String>,
    ) -> Self {
        Self::new(subject, predicate, object, TripletStatus::Current)
    }

    pub fn new(
        subject: impl Into<String>,
        predicate: impl Into<String>,
        object: impl Into<String>,
        status: TripletStatus,
    ) -> Self {
        Self {
            subject: subject.into(),
            predicate: predicate.into(),
            object: object.into(),
            status,
        }
    }
}

pub(crate) fn validate_triplet(input: &TripletInput) -> Result<(), MnemosError> {
    for (field, value) in [
        ("subject", &input.subject),
        ("predicate", &input.predicate),
        ("object", &input.object),
    ] {
        if value.trim().is_empty() {
            return Err(MnemosError::Validation(format!("triplet {field} must not be empty")));
        }
        if value.chars().count() > MAX_FIELD_LEN {
            return Err(MnemosError::Validation(format!("triplet {field} too long")));
        }
    }
    Ok(())
}

/// Case- and whitespace-insensitive key used for entity matching and the
/// one-current-per-(subject, predicate) index.
pub fn entity_key(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS resources (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    text TEXT NOT NULL,
    memory_kind TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    archived_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_resources_user ON resources(user_id, memory_kind, created_at);

CREATE TABLE IF NOT EXISTS items (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    resource_id TEXT NOT NULL,
    content TEXT NOT NULL,
    category TEXT NOT NULL DEFAULT 'general',
    created_at INTEGER NOT NULL,
    last_accessed_at INTEGER NOT NULL,
    access_count INTEGER NOT NULL DEFAULT 0,
    embedding_id TEXT,
    status TEXT NOT NULL DEFAULT 'active',
    merged_into TEXT,
    retained INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_items_category ON items(user_id, status, category);
CREATE INDEX IF NOT EXISTS idx_items_accessed ON items(user_id, status, last_accessed_at);
CREATE INDEX IF NOT EXISTS idx_items_resource ON items(resource_id);

CREATE TABLE IF NOT EXISTS categories (
    user_id TEXT NOT NULL,
    name TEXT NOT NULL,
    general_summary TEXT NOT NULL DEFAULT '',
    persistent_summary TEXT NOT NULL DEFAULT '',
    general_fingerprint TEXT,
    persistent_watermark INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (user_id, name)
);

CREATE TABLE IF NOT EXISTS triplets (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    subject TEXT NOT NULL,
    predicate TEXT NOT NULL,
    object TEXT NOT NULL,
    subject_key TEXT NOT NULL,
    predicate_key TEXT NOT NULL,
    object_key TEXT NOT NULL,
    status TEXT NOT NULL,
    resource_id TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    superseded_by TEXT
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_triplets_one_current
    ON triplets(user_id, subject_key, predicate_key) WHERE status = 'current';
CREATE INDEX IF NOT EXISTS idx_triplets_subject ON triplets(user_id, subject_key);
CREATE INDEX IF NOT EXISTS idx_triplets_object ON triplets(user_id, object_key);
CREATE INDEX IF NOT EXISTS idx_triplets_resource ON triplets(resource_id);

CREATE TABLE IF NOT EXISTS vector_entries (
    vector_id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    memory_kind TEXT NOT NULL,
    owner_id TEXT NOT NULL,
    embedding BLOB NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_vector_entries_user ON vector_entries(user_id, memory_kind);

CREATE TABLE IF NOT EXISTS maintenance_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    cadence TEXT NOT NULL,
    started_at INTEGER NOT NULL,
    finished_at INTEGER,
    report TEXT
);
CREATE INDEX IF NOT EXISTS idx_maintenance_runs_user ON maintenance_runs(user_id, cadence, finished_at);

CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// SQLite-backed memory store.
pub struct Store {
    pool: Pool<SqliteConnectionManager>,
}

impl Store {
    /// Open (or create) a database at the given path.
    /// Pool size defaults to 8 (1 writer + 7 readers in WAL mode).
    pub fn open(path: &str) -> Result<Self, MnemosError> {
        let pool_size = if path == ":memory:" { 2 } else { 8 };
        let manager = if path == ":memory:" {
            // Shared cache so all pool connections see the same in-memory DB.
            // Each store gets a unique name so tests never see each other.
            let name = uuid::Uuid::new_v4().to_string();
            SqliteConnectionManager::file(format!("file:{name}?mode=memory&cache=shared"))
        } else {
            SqliteConnectionManager::file(path)
        };
        let pool = Pool::builder()
            .max_size(pool_size)
            .connection_customizer(Box::new(BusyTimeoutCustomizer))
            .build(manager)
            .map_err(|e| MnemosError::Pool(e.to_string()))?;

        let conn = pool.get().map_err(|e| MnemosError::Pool(e.to_string()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA auto_vacuum=INCREMENTAL;")?;
        conn.execute_batch(SCHEMA)?;
        drop(conn);
        tracing::debug!(path, pool_size, "store opened");
        Ok(Self { pool })
    }

    pub(crate) fn conn(&self) -> Result<PooledConn, MnemosError> {
        self.pool.get().map_err(|e| MnemosError::Pool(e.to_string()))
    }

    /// Run `f` inside a `BEGIN IMMEDIATE` transaction. Lock contention and
    /// uniqueness violations come back as `Conflict` on `entity`; other
    /// backend failures as `Storage`. Nothing is committed unless `f` succeeds.
    pub(crate) fn with_tx<T>(
        &self,
        user_id: &str,
        entity: &str,
        f: impl FnOnce(&Connection) -> Result<T, MnemosError>,
    ) -> Result<T, MnemosError> {
        let scope = |e: MnemosError| match e {
            MnemosError::Database(ref db) if is_conflict(db) => MnemosError::conflict(user_id, entity),
            other => other.with_user(user_id),
        };
        let mut conn = self.conn().map_err(scope)?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| scope(e.into()))?;
        let out = f(&tx).map_err(scope)?;
        tx.commit().map_err(|e| scope(e.into()))?;
        Ok(out)
    }

    /// Every user that owns at least one resource.
    pub fn list_users(&self) -> Result<Vec<String>, MnemosError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT DISTINCT user_id FROM resources ORDER BY user_id")?;
        let rows = stmt
            .query_map([], |r| r.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(rows)
    }

    pub fn get_meta(&self, key: &str) -> Option<String> {
        self.conn().ok().and_then(|c| {
            c.query_row("SELECT value FROM meta WHERE key = ?1", [key], |r| r.get(0))
                .ok()
        })
    }

    pub fn set_meta(&self, key: &str, value: &str) -> Result<(), MnemosError> {
        self.conn()?.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn record_run_start(&self, user_id: &str, cadence: &str, now: i64) -> Result<i64, MnemosError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO maintenance_runs (user_id, cadence, started_at) VALUES (?1, ?2, ?3)",
            params![user_id, cadence, now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn record_run_finish(&self, run_id: i64, now: i64, report: &str) -> Result<(), MnemosError> {
        self.conn()?.execute(
            "UPDATE maintenance_runs SET finished_at = ?1, report = ?2 WHERE id = ?3",
            params![now, report, run_id],
        )?;
        Ok(())
    }

    /// Start time of the most recent completed run of `cadence` for the user.
    pub fn last_completed_run(&self, user_id: &str, cadence: &str) -> Result<Option<i64>, MnemosError> {
        let conn = self.conn()?;
        let v = conn
            .query_row(
                "SELECT MAX(started_at) FROM maintenance_runs \
                 WHERE user_id = ?1 AND cadence = ?2 AND finished_at IS NOT NULL",
                params![user_id, cadence],
                |r| r.get::<_, Option<i64>>(0),
            )
            .optional()?
            .flatten();
        Ok(v)
    }

    /// Reclaim free pages left behind by deletes.
    pub fn incremental_vacuum(&self) -> Result<(), MnemosError> {
        self.conn()?.execute_batch("PRAGMA incremental_vacuum;")?;
        Ok(())
    }
}

fn parse_col<T: FromStr>(idx: usize, s: String) -> rusqlite::Result<T> {
    s.parse().map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unexpected value '{s}'").into(),
        )
    })
}
