//! Cron-driven report generation. Each granularity has one job that reports
//! on the most recent fully elapsed period; jobs stagger shortly after
//! midnight so finer roll-ups land before coarser ones read them.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::period::{Granularity, Period};
use crate::report::aggregator::ReportEngine;
use crate::report::ReportDocument;

/// Six-field cron expressions (seconds first).
pub fn default_cron(granularity: Granularity) -> &'static str {
    match granularity {
        Granularity::Daily => "0 5 0 * * *",
        Granularity::Weekly => "0 10 0 * * 1",
        Granularity::Monthly => "0 15 0 1 * *",
        Granularity::Quarterly => "0 20 0 1 1,4,7,10 *",
        Granularity::Annual => "0 25 0 1 1 *",
    }
}

#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub period_key: String,
    pub finished_at: DateTime<Utc>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct JobStatus {
    pub granularity: Granularity,
    pub cron: String,
    pub next_run: Option<DateTime<Utc>>,
    pub last_outcome: Option<JobOutcome>,
}

pub struct ReportScheduler {
    engine: Arc<ReportEngine>,
    crons: HashMap<Granularity, String>,
    scheduler: RwLock<Option<JobScheduler>>,
    job_ids: RwLock<HashMap<Granularity, Uuid>>,
    outcomes: Arc<RwLock<HashMap<Granularity, JobOutcome>>>,
}

impl ReportScheduler {
    pub fn new(engine: Arc<ReportEngine>) -> Self {
        let crons = Granularity::ALL
            .iter()
            .map(|g| (*g, default_cron(*g).to_string()))
            .collect();
        Self {
            engine,
            crons,
            scheduler: RwLock::new(None),
            job_ids: RwLock::new(HashMap::new()),
            outcomes: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    #[cfg(test)]
    fn set_cron(&mut self, granularity: Granularity, cron: &str) {
        self.crons.insert(granularity, cron.to_string());
    }

    /// Register the five jobs and start ticking. Returns an error if the
    /// scheduler is already running.
    pub async fn start(&self) -> Result<()> {
        let mut slot = self.scheduler.write().await;
        if slot.is_some() {
            return Err(Error::Scheduler("scheduler is already running".into()));
        }

        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| Error::Scheduler(e.to_string()))?;

        let mut ids = HashMap::new();
        for granularity in Granularity::ALL {
            let cron = self
                .crons
                .get(&granularity)
                .cloned()
                .unwrap_or_else(|| default_cron(granularity).to_string());
            let engine = self.engine.clone();
            let outcomes = self.outcomes.clone();
            let job = Job::new_async(cron.as_str(), move |_id, _scheduler| {
                let engine = engine.clone();
                let outcomes = outcomes.clone();
                Box::pin(async move {
                    let _ = run_job(&engine, &outcomes, granularity).await;
                })
            })
            .map_err(|e| Error::Scheduler(format!("invalid cron for {granularity}: {e}")))?;
            ids.insert(granularity, job.guid());
            scheduler
                .add(job)
                .await
                .map_err(|e| Error::Scheduler(e.to_string()))?;
            log::info!("registered {granularity} report job ({cron})");
        }

        scheduler
            .start()
            .await
            .map_err(|e| Error::Scheduler(e.to_string()))?;
        *self.job_ids.write().await = ids;
        *slot = Some(scheduler);
        log::info!("report scheduler started");
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        let mut slot = self.scheduler.write().await;
        match slot.take() {
            Some(mut scheduler) => {
                scheduler
                    .shutdown()
                    .await
                    .map_err(|e| Error::Scheduler(e.to_string()))?;
                log::info!("report scheduler stopped");
                Ok(())
            }
            None => Err(Error::Scheduler("scheduler is not running".into())),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.scheduler.read().await.is_some()
    }

    /// Run one job body immediately, outside its cron cadence. The outcome is
    /// recorded exactly as a scheduled run's would be.
    pub async fn trigger(&self, granularity: Granularity) -> Result<ReportDocument> {
        run_job(&self.engine, &self.outcomes, granularity).await
    }

    /// Per-job cadence, next fire time, and last recorded outcome.
    pub async fn status(&self) -> Vec<JobStatus> {
        let scheduler = self.scheduler.read().await.clone();
        let ids = self.job_ids.read().await.clone();
        let outcomes = self.outcomes.read().await.clone();

        let mut statuses = Vec::with_capacity(Granularity::ALL.len());
        for granularity in Granularity::ALL {
            let next_run = match (&scheduler, ids.get(&granularity)) {
                (Some(s), Some(id)) => {
                    let mut s = s.clone();
                    s.next_tick_for_job(*id).await.ok().flatten()
                }
                _ => None,
            };
            statuses.push(JobStatus {
                granularity,
                cron: self
                    .crons
                    .get(&granularity)
                    .cloned()
                    .unwrap_or_else(|| default_cron(granularity).to_string()),
                next_run,
                last_outcome: outcomes.get(&granularity).cloned(),
            });
        }
        statuses
    }
}

/// Generate the previous complete period's report and record the outcome.
/// Failures are recorded and logged; the job stays registered.
async fn run_job(
    engine: &ReportEngine,
    outcomes: &RwLock<HashMap<Granularity, JobOutcome>>,
    granularity: Granularity,
) -> Result<ReportDocument> {
    let today = chrono::Local::now().date_naive();
    let period = Period::previous_complete(granularity, today);
    let result = engine.generate(period, false).await;

    let outcome = JobOutcome {
        period_key: period.to_key(),
        finished_at: Utc::now(),
        error: result.as_ref().err().map(|e| e.to_string()),
    };
    outcomes.write().await.insert(granularity, outcome);

    match &result {
        Ok(_) => log::info!("scheduled {granularity} report for {period} complete"),
        Err(e) => log::error!("scheduled {granularity} report for {period} failed: {e}"),
    }
    result
}
