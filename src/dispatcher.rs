use crate::errors::QueueError;
use crate::schema::{ClaimedJob, StagedMessage};
use crate::sender::{ChannelSender, SendOutcome};
use crate::storage::JobStore;
use crate::util::try_to_extract_panic_info;
use futures_util::FutureExt;
use futures_util::future::join_all;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{debug, trace, warn};

/// Minimum time between the starts of two consecutive batches.
pub const DEFAULT_PACING_WINDOW: Duration = Duration::from_secs(1);

/// What a call to [`Dispatcher::drain_once`] achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drain {
    /// A batch was sent; call again.
    More(BatchReport),
    /// Nothing was left to dequeue.
    Done,
}

impl Drain {
    /// Whether the job may still have messages to send.
    pub fn more(&self) -> bool {
        matches!(self, Self::More(_))
    }
}

/// Per-batch counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Messages accepted by the channel sender.
    pub accepted: usize,
    /// Messages the channel sender failed.
    pub failed: usize,
}

/// Sends the staged messages of a job in paced batches.
///
/// Each batch is fanned out to the [`ChannelSender`] concurrently, and a new
/// batch never starts less than one pacing window after the previous one, so
/// a worker sends at most `batch_size` messages per window.
pub struct Dispatcher<S, C> {
    store: S,
    sender: Arc<C>,
    batch_size: u32,
    pacing_window: Duration,
}

impl<S: JobStore, C: ChannelSender> Dispatcher<S, C> {
    /// Create a dispatcher with the default one second pacing window.
    pub fn new(store: S, sender: Arc<C>, batch_size: u32) -> Self {
        Self {
            store,
            sender,
            batch_size,
            pacing_window: DEFAULT_PACING_WINDOW,
        }
    }

    /// Override the pacing window.
    pub fn pacing_window(mut self, pacing_window: Duration) -> Self {
        self.pacing_window = pacing_window;
        self
    }

    /// Number of messages to dequeue for `job`.
    ///
    /// The job's own send rate caps the worker's batch size.
    fn batch_limit(&self, job: &ClaimedJob) -> i64 {
        let send_rate = i64::from(job.send_rate.max(1));
        i64::from(self.batch_size.max(1)).min(send_rate)
    }

    /// Dequeue and send one batch of `job`'s messages.
    ///
    /// Send failures are recorded on the staging rows and counted in the
    /// report. Only store errors are returned, after every send of the batch
    /// has completed.
    pub async fn drain_once(&self, job: &ClaimedJob) -> Result<Drain, QueueError> {
        let started = Instant::now();

        let batch = self.store.dequeue_batch(job.id, self.batch_limit(job)).await?;
        if batch.is_empty() {
            debug!("Job drained");
            return Ok(Drain::Done);
        }

        trace!(batch.size = batch.len(), "Sending batch…");
        let results = join_all(batch.iter().map(|message| self.send_and_record(job, message))).await;

        let mut report = BatchReport::default();
        let mut first_error = None;
        for result in results {
            match result {
                Ok(true) => report.accepted += 1,
                Ok(false) => report.failed += 1,
                Err(error) => {
                    warn!("Failed to record send outcome: {error}");
                    if first_error.is_none() {
                        first_error = Some(error);
                    }
                }
            }
        }
        if let Some(error) = first_error {
            return Err(error);
        }

        debug!(
            batch.accepted = report.accepted,
            batch.failed = report.failed,
            "Batch sent"
        );

        if let Some(remaining) = self.pacing_window.checked_sub(started.elapsed()) {
            sleep(remaining).await;
        }

        Ok(Drain::More(report))
    }

    /// Send one message and store the outcome, returning whether it was accepted.
    async fn send_and_record(
        &self,
        job: &ClaimedJob,
        message: &StagedMessage,
    ) -> Result<bool, QueueError> {
        let outcome = AssertUnwindSafe(self.sender.send(job.channel, message))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                let error = try_to_extract_panic_info(&*panic);
                warn!(recipient = %message.recipient, "{error}");
                SendOutcome::failed("sender_panic")
            });

        if let SendOutcome::Failed { error_code } = &outcome {
            debug!(recipient = %message.recipient, %error_code, "Message failed");
        }

        self.store
            .record_outcome(job.channel, message, &outcome)
            .await?;

        Ok(outcome.is_accepted())
    }
}
