use crate::errors::QueueError;
use crate::storage::JobStore;
use std::time::Duration;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default time between two reaper ticks.
pub const DEFAULT_REAPER_INTERVAL: Duration = Duration::from_secs(5);

/// Default time after which a job without worker heartbeat is stopped.
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(600);

/// The grim reaper: reconciles sent and stopped jobs into ground truth.
///
/// It only touches jobs in `SENT` or `STOPPED`, which workers never write
/// again, so any number of reapers can run next to any number of workers.
#[derive(Debug, Clone)]
pub struct Reaper<S> {
    store: S,
    interval: Duration,
    stall_timeout: Option<Duration>,
    shutdown_when_idle: bool,
    shutdown: CancellationToken,
}

/// What one reaper tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Jobs stopped because their worker stopped heart-beating.
    pub reclaimed: Vec<i64>,
    /// Jobs moved to `LOGGED`.
    pub finalized: Vec<i64>,
}

impl<S: JobStore> Reaper<S> {
    /// Create a reaper with the default interval and stall timeout.
    pub fn new(store: S) -> Self {
        Self {
            store,
            interval: DEFAULT_REAPER_INTERVAL,
            stall_timeout: Some(DEFAULT_STALL_TIMEOUT),
            shutdown_when_idle: false,
            shutdown: CancellationToken::new(),
        }
    }

    /// Set the time between two ticks.
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the stall timeout, `None` disables the stall sweep.
    pub fn stall_timeout(mut self, stall_timeout: Option<Duration>) -> Self {
        self.stall_timeout = stall_timeout;
        self
    }

    /// Stop after the first tick that finalized nothing.
    pub fn shutdown_when_idle(mut self, shutdown_when_idle: bool) -> Self {
        self.shutdown_when_idle = shutdown_when_idle;
        self
    }

    /// Stop ticking once `shutdown` is cancelled.
    pub fn shutdown_on(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Tick until shutdown, or until idle if `shutdown_when_idle` is set.
    pub async fn run(&self) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => {
                    debug!("Shutdown requested. Reaper stopped");
                    break;
                }
                _ = ticker.tick() => {}
            }
            match self.run_once().await {
                Ok(report) if report.finalized.is_empty() && self.shutdown_when_idle => {
                    debug!("No jobs left to finalize. Shutting down the reaper…");
                    break;
                }
                Ok(_) => {}
                Err(error) if error.is_transient() => {
                    warn!("Failed to finalize jobs, retrying next tick: {error}");
                }
                Err(error) => error!("Failed to finalize jobs: {error}"),
            }
        }
    }

    /// Sweep stalled jobs, then finalize until nothing is left.
    pub async fn run_once(&self) -> Result<ReapReport, QueueError> {
        let mut report = ReapReport::default();

        if let Some(stall_timeout) = self.stall_timeout {
            report.reclaimed = self.store.reclaim_stalled(stall_timeout).await?;
            for job_id in &report.reclaimed {
                warn!(job.id = job_id, "Stopped job without worker heartbeat for {stall_timeout:?}");
            }
        }

        while let Some(job) = self.store.finalize_next().await? {
            info!(
                job.id = job.job_id,
                campaign.id = job.campaign_id,
                channel = %job.channel,
                from = %job.previous_status,
                reconciled = job.reconciled,
                "Finalized job"
            );
            report.finalized.push(job.job_id);
        }

        Ok(report)
    }
}
