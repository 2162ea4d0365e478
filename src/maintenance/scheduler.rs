//! Background driver: every tick, run each user's due cadences on the
//! blocking pool. Users run in parallel; one user's cadences run in order.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::{MaintenanceEngine, MaintenanceReport};
use crate::db::now_ms;
use crate::store_call;

pub struct Scheduler {
    engine: Arc<MaintenanceEngine>,
    every: Duration,
}

impl Scheduler {
    pub fn new(engine: Arc<MaintenanceEngine>, every: Duration) -> Self {
        Self {
            engine,
            every: every.max(Duration::from_millis(1)),
        }
    }

    /// One pass over every user with data. Returns the reports of the jobs
    /// that ran; failed jobs are logged and left for the next tick.
    pub async fn tick(&self) -> Vec<(String, MaintenanceReport)> {
        let users = match store_call(self.engine.store(), |s| s.list_users()).await {
            Ok(u) => u,
            Err(e) => {
                error!(error = %e, "maintenance tick: listing users failed");
                return vec![];
            }
        };

        let mut handles = Vec::with_capacity(users.len());
        for user_id in users {
            let engine = Arc::clone(&self.engine);
            handles.push(tokio::task::spawn_blocking(move || {
                let now = now_ms();
                let due = match engine.due(&user_id, now) {
                    Ok(d) => d,
                    Err(e) => {
                        warn!(user_id, error = %e, "maintenance tick: due check failed");
                        return vec![];
                    }
                };
                let mut done = Vec::with_capacity(due.len());
                for cadence in due {
                    match engine.run_at(&user_id, cadence, now) {
                        Ok(report) => done.push((user_id.clone(), report)),
                        Err(e) => warn!(user_id, cadence = %cadence, error = %e, "maintenance job failed"),
                    }
                }
                done
            }));
        }

        let mut reports = Vec::new();
        for handle in handles {
            match handle.await {
                Ok(done) => reports.extend(done),
                Err(e) => error!(error = %e, "maintenance task panicked"),
            }
        }
        reports
    }

    /// Tick forever on the configured interval. The first tick fires at once.
    pub fn spawn(self) -> JoinHandle<()> {
        info!(every_secs = self.every.as_secs(), "maintenance scheduler started");
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let reports = self.tick().await;
                if !reports.is_empty() {
                    info!(jobs = reports.len(), "maintenance tick finished");
                }
            }
        })
    }
}
