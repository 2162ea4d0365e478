//! Scheduled batch jobs that keep both memories compact and current.
//!
//! - nightly: dedup near-identical items, promote heavily used ones,
//!   rebuild each category's general summary
//! - weekly: fold older items into the persistent summary, archive stale items
//! - monthly: archive the long tail, re-embed everything live, rebuild the index
//!
//! Every job re-checks row status before acting, so re-running after a
//! partial failure only finishes the remainder. Jobs for one user never
//! overlap (`JobLocks`); different users run in parallel.

mod archive;
mod dedup;
mod reindex;
mod scheduler;
mod summary;

pub use dedup::cluster_items;
pub use scheduler::Scheduler;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

use crate::ai::{Embedder, Llm};
use crate::config::MemoryConfig;
use crate::db::now_ms;
use crate::error::MnemosError;
use crate::thresholds;
use crate::vector::VectorIndex;
use crate::SharedStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Cadence {
    Nightly,
    Weekly,
    Monthly,
}

impl Cadence {
    pub const ALL: [Cadence; 3] = [Cadence::Nightly, Cadence::Weekly, Cadence::Monthly];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Nightly => "nightly",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
        }
    }

    /// Minimum spacing between two completed runs.
    pub fn every_ms(self) -> i64 {
        match self {
            Self::Nightly => thresholds::NIGHTLY_EVERY_MS,
            Self::Weekly => thresholds::WEEKLY_EVERY_MS,
            Self::Monthly => thresholds::MONTHLY_EVERY_MS,
        }
    }
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Cadence {
    type Err = MnemosError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nightly" | "daily" => Ok(Self::Nightly),
            "weekly" => Ok(Self::Weekly),
            "monthly" => Ok(Self::Monthly),
            other => Err(MnemosError::Validation(format!("unknown cadence '{other}'"))),
        }
    }
}

fn is_zero(n: &usize) -> bool {
    *n == 0
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NightlyReport {
    /// Clusters of two or more near-duplicates found.
    pub clusters: usize,
    /// Original items marked merged.
    pub merged: usize,
    /// Merged items created.
    pub created: usize,
    pub promoted: usize,
    pub summarized: usize,
    /// Categories whose items didn't change since the last summary.
    pub unchanged: usize,
    #[serde(skip_serializing_if = "is_zero")]
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WeeklyReport {
    /// Categories whose persistent summary got an addendum.
    pub persisted: usize,
    /// Items folded into those addenda.
    pub folded: usize,
    /// Categories whose watermark moved under a concurrent run.
    #[serde(skip_serializing_if = "is_zero")]
    pub skipped: usize,
    pub archived: usize,
    #[serde(skip_serializing_if = "is_zero")]
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MonthlyReport {
    pub archived_items: usize,
    pub archived_resources: usize,
    pub reembedded: usize,
    pub orphans_removed: usize,
    pub index_size: usize,
    #[serde(skip_serializing_if = "is_zero")]
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "cadence", rename_all = "lowercase")]
pub enum MaintenanceReport {
    Nightly(NightlyReport),
    Weekly(WeeklyReport),
    Monthly(MonthlyReport),
}

impl MaintenanceReport {
    pub fn cadence(&self) -> Cadence {
        match self {
            Self::Nightly(_) => Cadence::Nightly,
            Self::Weekly(_) => Cadence::Weekly,
            Self::Monthly(_) => Cadence::Monthly,
        }
    }

    pub fn failed(&self) -> usize {
        match self {
            Self::Nightly(r) => r.failed,
            Self::Weekly(r) => r.failed,
            Self::Monthly(r) => r.failed,
        }
    }
}

/// One mutex per user. A second job for the same user waits for the first.
#[derive(Default)]
pub struct JobLocks {
    inner: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl JobLocks {
    pub fn for_user(&self, user_id: &str) -> Arc<Mutex<()>> {
        Arc::clone(self.inner.lock().entry(user_id.to_string()).or_default())
    }
}

pub struct MaintenanceEngine {
    store: SharedStore,
    vectors: Arc<dyn VectorIndex>,
    llm: Option<Arc<dyn Llm>>,
    embedder: Option<Arc<dyn Embedder>>,
    config: MemoryConfig,
    locks: Arc<JobLocks>,
}

impl MaintenanceEngine {
    pub fn new(store: SharedStore, vectors: Arc<dyn VectorIndex>, config: MemoryConfig) -> Self {
        Self {
            store,
            vectors,
            llm: None,
            embedder: None,
            config,
            locks: Arc::new(JobLocks::default()),
        }
    }

    /// Compression and summarization need an LLM; without one those steps
    /// are skipped.
    pub fn with_llm(mut self, llm: Arc<dyn Llm>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn run(&self, user_id: &str, cadence: Cadence) -> Result<MaintenanceReport, MnemosError> {
        self.run_at(user_id, cadence, now_ms())
    }

    /// Run one cadence as if the clock read `now`.
    pub fn run_at(&self, user_id: &str, cadence: Cadence, now: i64) -> Result<MaintenanceReport, MnemosError> {
        Ok(match cadence {
            Cadence::Nightly => MaintenanceReport::Nightly(self.nightly_at(user_id, now)?),
            Cadence::Weekly => MaintenanceReport::Weekly(self.weekly_at(user_id, now)?),
            Cadence::Monthly => MaintenanceReport::Monthly(self.monthly_at(user_id, now)?),
        })
    }

    /// Nightly, weekly and monthly in that order.
    pub fn run_all(&self, user_id: &str) -> Result<Vec<MaintenanceReport>, MnemosError> {
        let now = now_ms();
        Cadence::ALL.iter().map(|c| self.run_at(user_id, *c, now)).collect()
    }

    pub fn nightly(&self, user_id: &str) -> Result<NightlyReport, MnemosError> {
        self.nightly_at(user_id, now_ms())
    }

    pub fn nightly_at(&self, user_id: &str, now: i64) -> Result<NightlyReport, MnemosError> {
        self.guarded(user_id, Cadence::Nightly, now, || {
            let mut report = NightlyReport::default();
            dedup::dedup(self, user_id, &mut report)?;
            report.promoted = self.store.promote_items(user_id, self.config.promote_access_count)?;
            summary::general_summaries(self, user_id, now, &mut report)?;
            Ok(report)
        })
    }

    pub fn weekly(&self, user_id: &str) -> Result<WeeklyReport, MnemosError> {
        self.weekly_at(user_id, now_ms())
    }

    pub fn weekly_at(&self, user_id: &str, now: i64) -> Result<WeeklyReport, MnemosError> {
        self.guarded(user_id, Cadence::Weekly, now, || {
            let mut report = WeeklyReport::default();
            summary::persistent_summaries(self, user_id, now, &mut report)?;
            archive::archive_stale(self, user_id, now, &mut report)?;
            Ok(report)
        })
    }

    pub fn monthly(&self, user_id: &str) -> Result<MonthlyReport, MnemosError> {
        self.monthly_at(user_id, now_ms())
    }

    pub fn monthly_at(&self, user_id: &str, now: i64) -> Result<MonthlyReport, MnemosError> {
        self.guarded(user_id, Cadence::Monthly, now, || {
            let mut report = MonthlyReport::default();
            archive::archive_long_tail(self, user_id, now, &mut report)?;
            reindex::reindex(self, user_id, &mut report)?;
            Ok(report)
        })
    }

    /// Cadences whose last completed run is older than their spacing.
    pub fn due(&self, user_id: &str, now: i64) -> Result<Vec<Cadence>, MnemosError> {
        let mut due = Vec::new();
        for c in Cadence::ALL {
            let last = self.store.last_completed_run(user_id, c.as_str()).map_err(|e| e.with_user(user_id))?;
            if last.is_none_or(|t| now - t >= c.every_ms()) {
                due.push(c);
            }
        }
        Ok(due)
    }

    /// Take the user's job lock, record the run, and log its report.
    fn guarded<R: Serialize>(
        &self,
        user_id: &str,
        cadence: Cadence,
        now: i64,
        job: impl FnOnce() -> Result<R, MnemosError>,
    ) -> Result<R, MnemosError> {
        let lock = self.locks.for_user(user_id);
        let _guard = lock.lock();
        let scoped = |e: MnemosError| e.with_user(user_id);

        let run_id = self.store.record_run_start(user_id, cadence.as_str(), now).map_err(scoped)?;
        let report = job().map_err(scoped)?;
        let json = serde_json::to_string(&report).unwrap_or_default();
        self.store.record_run_finish(run_id, now_ms(), &json).map_err(scoped)?;
        info!(user_id, cadence = %cadence, report = %json, "maintenance finished");
        Ok(report)
    }
}
