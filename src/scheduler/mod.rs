//! Cron scheduler for the recovery jobs
//!
//! Each registered job gets its own loop that sleeps until the next firing of
//! its cron expression, runs the job to completion and then waits for the next
//! firing after *now*. Firings that fall inside a run are skipped rather than
//! queued, so a job never overlaps with itself.
//!
//! Expressions use the six-field form with a leading seconds field (an optional
//! seventh field is the year), e.g. `"0 */5 * * * *"` for every five minutes.
//!
//! ```no_run
//! use url_dl::scheduler::CronScheduler;
//! # use url_dl::recovery::RecoveryJob;
//! # use std::sync::Arc;
//! # async fn example(job: Arc<dyn RecoveryJob>) -> url_dl::Result<()> {
//! let mut scheduler = CronScheduler::new();
//! scheduler.register("0 * * * * *", job)?;
//!
//! let shutdown = tokio_util::sync::CancellationToken::new();
//! tokio::spawn(scheduler.start(shutdown.clone()));
//! # Ok(())
//! # }
//! ```

use crate::recovery::RecoveryJob;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

struct ScheduledJob {
    expression: String,
    schedule: Schedule,
    job: Arc<dyn RecoveryJob>,
}

/// Runs recovery jobs on cron schedules
#[derive(Default)]
pub struct CronScheduler {
    jobs: Vec<ScheduledJob>,
}

impl CronScheduler {
    /// Create a scheduler with no jobs
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `job` to run on `expression`
    ///
    /// Fails with [`Error::Scheduler`] if the expression does not parse.
    pub fn register(&mut self, expression: &str, job: Arc<dyn RecoveryJob>) -> Result<()> {
        let schedule = Schedule::from_str(expression).map_err(|e| {
            Error::Scheduler(format!(
                "invalid cron expression '{}' for job {}: {}",
                expression,
                job.name(),
                e
            ))
        })?;

        info!(job = job.name(), schedule = expression, "Recovery job registered");
        self.jobs.push(ScheduledJob {
            expression: expression.to_string(),
            schedule,
            job,
        });
        Ok(())
    }

    /// Names of the registered jobs, in registration order
    pub fn job_names(&self) -> Vec<&'static str> {
        self.jobs.iter().map(|j| j.job.name()).collect()
    }

    /// Run every job's loop until `shutdown` is cancelled
    ///
    /// A run in progress when shutdown arrives is allowed to finish.
    pub async fn start(self, shutdown: CancellationToken) {
        let loops: Vec<_> = self
            .jobs
            .into_iter()
            .map(|job| tokio::spawn(job_loop(job, shutdown.clone())))
            .collect();

        for result in futures::future::join_all(loops).await {
            if let Err(e) = result {
                error!(error = %e, "Cron job loop panicked");
            }
        }

        info!("Cron scheduler stopped");
    }
}

async fn job_loop(scheduled: ScheduledJob, shutdown: CancellationToken) {
    let name = scheduled.job.name();
    let mut last: DateTime<Utc> = Utc::now();

    loop {
        let Some(next) = scheduled.schedule.after(&last).next() else {
            info!(job = name, schedule = %scheduled.expression, "Schedule has no further firings");
            break;
        };

        let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }

        let started = std::time::Instant::now();
        match scheduled.job.run().await {
            Ok(report) => debug!(
                job = name,
                scanned = report.scanned,
                processed = report.processed,
                failed = report.failed,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Recovery job finished"
            ),
            Err(e) => error!(job = name, error = %e, "Recovery job failed"),
        }

        let now = Utc::now();
        let skipped = scheduled
            .schedule
            .after(&next)
            .take_while(|t| *t <= now)
            .count();
        if skipped > 0 {
            debug!(job = name, skipped, "Skipped firings that arrived while the job was running");
        }
        last = next.max(now);
    }
}
