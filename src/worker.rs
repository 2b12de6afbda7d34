use crate::dispatcher::{BatchReport, Dispatcher, Drain};
use crate::errors::QueueError;
use crate::schema::ClaimedJob;
use crate::sender::ChannelSender;
use crate::storage::JobStore;
use crate::util::with_sentry_transaction;
use rand::Rng;
use sentry_core::{Hub, SentryFutureExt};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, trace, warn};

pub(crate) struct Worker<S, C> {
    pub(crate) worker_id: i32,
    pub(crate) store: S,
    pub(crate) dispatcher: Dispatcher<S, C>,
    pub(crate) shutdown_when_queue_empty: bool,
    pub(crate) poll_interval: Duration,
    pub(crate) jitter: Duration,
    pub(crate) shutdown: CancellationToken,
}

impl<S: JobStore, C: ChannelSender> Worker<S, C> {
    /// Calculate the sleep duration with random jitter applied.
    fn sleep_duration_with_jitter(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.poll_interval;
        }

        let jitter_millis = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
        self.poll_interval + Duration::from_millis(random_jitter)
    }

    /// Sleep for `duration`, returning `false` if shutdown was requested first.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            () = self.shutdown.cancelled() => false,
            () = sleep(duration) => true,
        }
    }

    /// Claim and send campaign jobs until shutdown is requested, or until the
    /// queue is empty if `shutdown_when_queue_empty` is set.
    #[allow(clippy::cognitive_complexity)]
    pub(crate) async fn run(&self) {
        while !self.shutdown.is_cancelled() {
            match self.run_next_job().await {
                Ok(Some(_)) => {}
                Ok(None) if self.shutdown_when_queue_empty => {
                    debug!("No ready campaign jobs found. Shutting down the worker…");
                    return;
                }
                Ok(None) => {
                    let sleep_duration = self.sleep_duration_with_jitter();
                    trace!("No ready campaign jobs found. Polling again in {sleep_duration:?}…");
                    self.pause(sleep_duration).await;
                }
                Err(error) => {
                    error!("Failed to claim job: {error}");
                    self.pause(self.sleep_duration_with_jitter()).await;
                }
            }
        }
        debug!("Shutdown requested. Worker stopped");
    }

    /// Claim the next ready job and send it to completion.
    ///
    /// Returns:
    /// - `Ok(Some(job_id))` if a job was claimed and processed
    /// - `Ok(None)` if no jobs were ready
    /// - `Err(...)` if claiming failed
    async fn run_next_job(&self) -> Result<Option<i64>, QueueError> {
        trace!("Looking for next campaign job…");

        let Some(job) = self.store.claim_next(self.worker_id).await? else {
            return Ok(None);
        };

        let span = info_span!(
            "job",
            job.id = job.id,
            campaign.id = job.campaign_id,
            channel = %job.channel
        );
        self.process(&job).instrument(span).await;

        Ok(Some(job.id))
    }

    /// Enqueue and drain a job this worker owns.
    ///
    /// Transient store errors do not release the job: the failing step is
    /// retried until it goes through, since no other worker can pick the job
    /// up. On shutdown the job is stopped between batches.
    async fn process(&self, job: &ClaimedJob) {
        info!("Claimed job");

        let staged = match self.retrying("enqueue job", || self.store.enqueue(job.id)).await {
            Some(Some(staged)) => staged,
            Some(None) => {
                info!("Job was stopped before it was enqueued");
                return;
            }
            None => return self.release(job).await,
        };
        debug!(staged, "Staged messages");

        let mut totals = BatchReport::default();
        let drained = loop {
            let result = with_sentry_transaction("campaign.drain", async || {
                self.drain(job, &mut totals).await
            })
            .bind_hub(Hub::current())
            .await;

            match result {
                Ok(drained) => break drained,
                Err(error) if error.is_transient() => {
                    error!("Failed to drain job: {error}");
                    if !self.pause(self.sleep_duration_with_jitter()).await {
                        break false;
                    }
                }
                Err(error) => {
                    error!("Giving up on job: {error}");
                    break false;
                }
            }
        };

        info!(
            staged,
            accepted = totals.accepted,
            failed = totals.failed,
            "Finished sending job"
        );

        if !drained {
            self.release(job).await;
        }
    }

    /// Send batches until the job is drained (`true`) or shutdown is
    /// requested (`false`).
    async fn drain(&self, job: &ClaimedJob, totals: &mut BatchReport) -> Result<bool, QueueError> {
        while !self.shutdown.is_cancelled() {
            let Drain::More(report) = self.dispatcher.drain_once(job).await? else {
                return Ok(true);
            };
            totals.accepted += report.accepted;
            totals.failed += report.failed;
        }
        Ok(false)
    }

    /// Hand an unfinished job over to the reaper.
    async fn release(&self, job: &ClaimedJob) {
        match self.store.release(job.id).await {
            Ok(true) => warn!("Stopped unfinished job; retry the campaign to send the rest"),
            Ok(false) => debug!("Job was already stopped"),
            Err(error) => error!("Failed to release job, the stall sweep will stop it: {error}"),
        }
    }

    /// Run `f` until it succeeds. `None` if shutdown was requested or the
    /// error is not transient.
    async fn retrying<T, F, Fut>(&self, operation: &str, mut f: F) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, QueueError>>,
    {
        loop {
            match f().await {
                Ok(value) => return Some(value),
                Err(error) if error.is_transient() => {
                    error!("Failed to {operation}: {error}");
                    if !self.pause(self.sleep_duration_with_jitter()).await {
                        return None;
                    }
                }
                Err(error) => {
                    error!("Failed to {operation}: {error}");
                    return None;
                }
            }
        }
    }
}
