//! Periodic jobs: price tick, DCA tick, interest accrual and the order-expiry sweep.
//!
//! Each job gets its own tokio task and interval. The engine is synchronous, so every run
//! goes through `spawn_blocking` under a timeout. Price-dependent jobs that fail on a stale or
//! missing quote are retried with exponential backoff before the tick is given up; the next
//! interval starts from scratch either way.

use crate::config::{OracleParams, SchedulerParams};
use crate::engine::{
    AccrualReport, DcaTickReport, Engine, EngineError, ExpiryReport, PriceTickReport,
};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Job {
    PriceTick,
    DcaTick,
    InterestAccrual,
    OrderExpiry,
}

impl Job {
    pub const ALL: [Job; 4] = [Job::PriceTick, Job::DcaTick, Job::InterestAccrual, Job::OrderExpiry];

    pub fn period(&self, params: &SchedulerParams) -> Duration {
        let ms = match self {
            Job::PriceTick => params.price_tick_ms,
            Job::DcaTick => params.dca_tick_ms,
            Job::InterestAccrual => params.interest_tick_ms,
            Job::OrderExpiry => params.expiry_sweep_ms,
        };
        Duration::from_millis(ms.max(1))
    }

    fn needs_price(&self) -> bool {
        matches!(self, Job::PriceTick | Job::DcaTick)
    }

    /// Runs the job once on the calling thread.
    pub fn run(&self, engine: &Engine) -> Result<JobReport, EngineError> {
        Ok(match self {
            Job::PriceTick => JobReport::Price(engine.on_price_tick()?),
            Job::DcaTick => JobReport::Dca(engine.run_dca_tick()?),
            Job::InterestAccrual => JobReport::Interest(engine.accrue_interest()),
            Job::OrderExpiry => JobReport::Expiry(engine.expire_stale_orders()),
        })
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Job::PriceTick => "price_tick",
            Job::DcaTick => "dca_tick",
            Job::InterestAccrual => "interest_accrual",
            Job::OrderExpiry => "order_expiry",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub enum JobReport {
    Price(PriceTickReport),
    Dca(DcaTickReport),
    Interest(AccrualReport),
    Expiry(ExpiryReport),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("{job} did not finish within {after_ms}ms")]
    TimedOut { job: Job, after_ms: u64 },

    #[error("{job} worker stopped: {reason}")]
    Worker { job: Job, reason: String },
}

impl SchedulerError {
    fn is_retryable(&self) -> bool {
        match self {
            SchedulerError::Engine(err) => err.is_price_error(),
            SchedulerError::TimedOut { .. } => true,
            SchedulerError::Worker { .. } => false,
        }
    }
}

/// Runs `job` once on the blocking pool, bounded by the oracle timeout for price jobs.
pub async fn run_once(engine: Arc<Engine>, job: Job) -> Result<JobReport, SchedulerError> {
    let settings = engine.settings();
    let task = tokio::task::spawn_blocking(move || job.run(&engine));

    let joined = if job.needs_price() {
        let limit = settings.oracle.timeout_ms;
        match time::timeout(Duration::from_millis(limit), task).await {
            Ok(joined) => joined,
            Err(_) => return Err(SchedulerError::TimedOut { job, after_ms: limit }),
        }
    } else {
        task.await
    };
    match joined {
        Ok(result) => result.map_err(SchedulerError::from),
        Err(err) => Err(SchedulerError::Worker { job, reason: err.to_string() }),
    }
}

/// `run_once` with exponential backoff on price failures.
pub async fn run_with_retry(engine: Arc<Engine>, job: Job) -> Result<JobReport, SchedulerError> {
    let params: OracleParams = engine.settings().oracle.clone();
    let mut attempt = 0u32;
    loop {
        match run_once(engine.clone(), job).await {
            Ok(report) => return Ok(report),
            Err(err) if job.needs_price() && err.is_retryable() && attempt < params.retry_attempts => {
                let delay = params
                    .retry_backoff_ms
                    .saturating_mul(1u64 << attempt.min(16));
                debug!(%job, attempt, delay_ms = delay, error = %err, "retrying");
                time::sleep(Duration::from_millis(delay)).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

fn log_report(job: Job, report: &JobReport) {
    match report {
        JobReport::Price(r) => {
            for (user, err) in &r.failures {
                warn!(%job, user = user.0, error = %err, "tick item failed");
            }
        }
        JobReport::Dca(r) => {
            if !r.is_empty() {
                info!(
                    %job,
                    executed = r.executed.len(),
                    skipped = r.skipped.len(),
                    deferred = r.deferred.len(),
                    failed = r.failed.len(),
                    "dca tick"
                );
            }
        }
        JobReport::Interest(r) => {
            for (loan, err) in &r.failures {
                warn!(%job, loan = loan.0, error = %err, "accrual failed");
            }
        }
        JobReport::Expiry(r) => {
            for (op, err) in &r.failures {
                warn!(%job, op = op.0, error = %err, "expiry failed");
            }
        }
    }
}

/// Handle to the running job loops.
#[derive(Debug)]
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<(Job, JoinHandle<()>)>,
}

impl SchedulerHandle {
    pub fn jobs(&self) -> Vec<Job> {
        self.tasks.iter().map(|(job, _)| *job).collect()
    }

    /// Signals every loop to stop and waits for in-flight runs to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for (job, task) in self.tasks {
            if let Err(err) = task.await {
                error!(%job, error = %err, "job loop ended abnormally");
            }
        }
        info!("scheduler stopped");
    }
}

pub struct Scheduler;

impl Scheduler {
    /// Starts all four jobs with the periods from the engine's current settings.
    pub fn spawn(engine: Arc<Engine>) -> SchedulerHandle {
        Self::spawn_jobs(engine, &Job::ALL)
    }

    pub fn spawn_jobs(engine: Arc<Engine>, jobs: &[Job]) -> SchedulerHandle {
        let (tx, rx) = watch::channel(false);
        let params = engine.settings().scheduler.clone();
        let tasks = jobs
            .iter()
            .map(|&job| {
                let period = job.period(&params);
                let task = tokio::spawn(job_loop(engine.clone(), job, period, rx.clone()));
                (job, task)
            })
            .collect();
        info!(jobs = jobs.len(), "scheduler started");
        SchedulerHandle { shutdown: tx, tasks }
    }
}

async fn job_loop(engine: Arc<Engine>, job: Job, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut interval = time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!(%job, period_ms = period.as_millis() as u64, "job loop started");

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match run_with_retry(engine.clone(), job).await {
                    Ok(report) => log_report(job, &report),
                    Err(err) => warn!(%job, error = %err, "job run failed"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!(%job, "job loop stopped");
}
