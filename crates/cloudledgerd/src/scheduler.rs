//! Periodic reconciliation runs
//!
//! Every configured (resource, scope) pair is a [`Job`]. On each tick the
//! scheduler starts one run per job unless that job is still in flight. A run
//! attempt is bounded by a timeout and retried with capped exponential
//! backoff when the error is retryable. The sweep follows a successful run
//! only.

use cloudledger::{LedgerError, Reconciler, RunResult, SweepResult};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Retry configuration for failed runs
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts per trigger, the first one included
    pub max_attempts: u32,

    /// Delay before the first retry
    pub initial_delay: Duration,

    /// Upper bound for any delay
    pub max_delay: Duration,

    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `retry` (0-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.backoff_multiplier.max(1.0).powi(retry.min(64) as i32);
        let secs = self.initial_delay.as_secs_f64() * factor;
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub interval: Duration,
    pub run_timeout: Duration,
    pub retry: RetryConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(900),
            run_timeout: Duration::from_secs(600),
            retry: RetryConfig::default(),
        }
    }
}

/// One resource kind in one scope
#[derive(Clone)]
pub struct Job {
    pub reconciler: Reconciler,
    pub scope: String,
}

impl Job {
    pub fn new(reconciler: Reconciler, scope: impl Into<String>) -> Self {
        Self {
            reconciler,
            scope: scope.into(),
        }
    }

    pub fn key(&self) -> JobKey {
        JobKey {
            resource: self.reconciler.descriptor().name.clone(),
            scope: self.scope.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobKey {
    pub resource: String,
    pub scope: String,
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.resource, self.scope)
    }
}

#[derive(Debug)]
pub enum JobOutcome {
    Completed {
        run: RunResult,
        /// `None` when the sweep itself failed
        sweep: Option<SweepResult>,
        attempts: u32,
    },
    Failed {
        error: LedgerError,
        attempts: u32,
    },
    /// Another run of the same job was still in flight
    Skipped,
}

impl JobOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, JobOutcome::Completed { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            JobOutcome::Completed { attempts, .. } | JobOutcome::Failed { attempts, .. } => {
                *attempts
            }
            JobOutcome::Skipped => 0,
        }
    }
}

type InFlight = Arc<Mutex<HashSet<JobKey>>>;

/// Releases its job when dropped, including on abort
struct InFlightGuard {
    in_flight: InFlight,
    key: JobKey,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Ok(mut set) = self.in_flight.lock() {
            set.remove(&self.key);
        }
    }
}

pub struct Scheduler {
    config: SchedulerConfig,
    in_flight: InFlight,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    fn claim(&self, key: JobKey) -> Option<InFlightGuard> {
        let mut set = self.in_flight.lock().ok()?;
        if !set.insert(key.clone()) {
            return None;
        }
        Some(InFlightGuard {
            in_flight: self.in_flight.clone(),
            key,
        })
    }

    /// Run a job once with retries, unless it is already in flight
    pub async fn run_once(&self, job: &Job) -> JobOutcome {
        let key = job.key();
        match self.claim(key.clone()) {
            Some(_guard) => self.execute(job).await,
            None => {
                warn!(job = %key, "Run still in flight, skipping trigger");
                JobOutcome::Skipped
            }
        }
    }

    async fn execute(&self, job: &Job) -> JobOutcome {
        let key = job.key();
        let retry = &self.config.retry;
        let max_attempts = retry.max_attempts.max(1);
        let mut attempt = 0;

        let run = loop {
            attempt += 1;
            debug!(job = %key, attempt, "Starting run");
            let result = match tokio::time::timeout(
                self.config.run_timeout,
                job.reconciler.run(&job.scope),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(LedgerError::Transient(format!(
                    "run timed out after {}s",
                    self.config.run_timeout.as_secs_f64()
                ))),
            };

            match result {
                Ok(run) => break run,
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = retry.delay_for(attempt - 1);
                    warn!(
                        job = %key,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Run failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(job = %key, attempt, error = %e, "Run failed");
                    return JobOutcome::Failed {
                        error: e,
                        attempts: attempt,
                    };
                }
            }
        };

        let sweep = match job
            .reconciler
            .sweep(&job.scope, run.started_at, &run.listed)
            .await
        {
            Ok(sweep) => Some(sweep),
            Err(e) => {
                // The next successful pass sweeps again
                warn!(job = %key, error = %e, "Stale sweep failed");
                None
            }
        };

        JobOutcome::Completed {
            run,
            sweep,
            attempts: attempt,
        }
    }

    /// Trigger every job on each interval tick until `cancel` fires
    ///
    /// Runs still in flight at shutdown are abandoned; their committed
    /// entities stay valid and no sweep follows them.
    pub async fn serve(self: Arc<Self>, jobs: Vec<Job>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut running: JoinSet<(JobKey, JobOutcome)> = JoinSet::new();

        info!(
            jobs = jobs.len(),
            interval_secs = self.config.interval.as_secs(),
            "Scheduler started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    for job in &jobs {
                        let key = job.key();
                        let Some(guard) = self.claim(key.clone()) else {
                            warn!(job = %key, "Run still in flight, skipping trigger");
                            continue;
                        };
                        let scheduler = self.clone();
                        let job = job.clone();
                        running.spawn(async move {
                            let _guard = guard;
                            let outcome = scheduler.execute(&job).await;
                            (key, outcome)
                        });
                    }
                }
                Some(joined) = running.join_next(), if !running.is_empty() => {
                    match joined {
                        Ok((key, outcome)) => log_outcome(&key, &outcome),
                        Err(e) => error!(error = %e, "Run task panicked"),
                    }
                }
            }
        }

        let abandoned = running.len();
        running.shutdown().await;
        info!(abandoned, "Scheduler stopped");
    }
}

fn log_outcome(key: &JobKey, outcome: &JobOutcome) {
    match outcome {
        JobOutcome::Completed {
            run,
            sweep,
            attempts,
        } => {
            let retired = sweep.as_ref().map(|s| s.retired).unwrap_or(0);
            info!(job = %key, attempts, retired, "{}", run);
        }
        JobOutcome::Failed { error, attempts } => {
            error!(job = %key, attempts, error = %error, "Job failed");
        }
        JobOutcome::Skipped => {}
    }
}
