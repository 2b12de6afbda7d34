//! Administrative operations on the job queue.
//!
//! These are the only entry points that create, halt or resume sendable
//! work. They run out-of-band from workers and the reaper.

use crate::errors::QueueError;
use crate::schema::{Channel, DeliverySummary, Job, JobStatus, Message};
use crate::storage::PgJobStore;
use sqlx::PgExecutor;
use tracing::{info, instrument};

/// Default target messages per second of a new job.
pub const DEFAULT_SEND_RATE: i32 = 100;

const JOB_COLUMNS: &str =
    "id, campaign_id, channel, send_rate, status, worker_id, created_at, updated_at";

impl PgJobStore {
    /// Insert a `READY` job for a campaign.
    ///
    /// Fails with [`QueueError::ActiveJobExists`] if the campaign already has
    /// a job that has not been logged.
    #[instrument(name = "campaign.insert_job", skip(self))]
    pub async fn insert(
        &self,
        campaign_id: i64,
        channel: Channel,
        send_rate: i32,
    ) -> Result<i64, QueueError> {
        let job_id = insert_ready(&self.pool, campaign_id, channel, send_rate)
            .await?
            .ok_or(QueueError::ActiveJobExists { campaign_id })?;

        info!(job.id = job_id, "Inserted job");
        Ok(job_id)
    }

    /// Stop the campaign's `READY`, `ENQUEUED` or `SENDING` job.
    ///
    /// Its worker receives no further batches; staged results are reconciled
    /// by the reaper.
    #[instrument(name = "campaign.stop_job", skip(self))]
    pub async fn stop(&self, campaign_id: i64) -> Result<i64, QueueError> {
        let job_id = sqlx::query_scalar::<_, i64>(
            r"
            UPDATE job_queue
            SET status = 'STOPPED', updated_at = NOW()
            WHERE campaign_id = $1 AND status = ANY($2)
            RETURNING id
            ",
        )
        .bind(campaign_id)
        .bind(JobStatus::all_where(JobStatus::is_dispatchable))
        .fetch_optional(&self.pool)
        .await?
        .ok_or(QueueError::NoActiveJob { campaign_id })?;

        info!(job.id = job_id, "Stopped job");
        Ok(job_id)
    }

    /// Queue a new attempt for the recipients that were not delivered yet.
    ///
    /// The latest job must be `LOGGED`, or `READY` in which case it is
    /// replaced by the new one. `SENT` and `STOPPED` jobs have to be
    /// finalized by the grim reaper first. The new job keeps its channel and
    /// send rate.
    #[instrument(name = "campaign.retry_job", skip(self))]
    pub async fn retry(&self, campaign_id: i64) -> Result<i64, QueueError> {
        let mut tx = self.pool.begin().await?;

        let latest = sqlx::query_as::<_, Job>(&format!(
            "SELECT {JOB_COLUMNS} FROM job_queue WHERE campaign_id = $1 ORDER BY id DESC LIMIT 1 FOR UPDATE"
        ))
        .bind(campaign_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(QueueError::NoJob { campaign_id })?;

        match latest.status {
            JobStatus::Logged => {}
            JobStatus::Ready => {
                sqlx::query("DELETE FROM job_queue WHERE id = $1")
                    .bind(latest.id)
                    .execute(&mut *tx)
                    .await?;
                info!(job.id = latest.id, "Superseding queued job");
            }
            status if status.awaits_finalization() => {
                return Err(QueueError::AwaitingFinalization { campaign_id, status });
            }
            status => return Err(QueueError::NotRetryable { campaign_id, status }),
        }

        let job_id = insert_ready(&mut *tx, campaign_id, latest.channel, latest.send_rate)
            .await?
            .ok_or(QueueError::ActiveJobExists { campaign_id })?;

        tx.commit().await?;

        info!(job.id = job_id, previous.id = latest.id, "Retrying campaign");
        Ok(job_id)
    }

    /// The most recent job of a campaign.
    pub async fn latest_job(&self, campaign_id: i64) -> Result<Option<Job>, QueueError> {
        let job = sqlx::query_as::<_, Job>(&format!(
            "SELECT {JOB_COLUMNS} FROM job_queue WHERE campaign_id = $1 ORDER BY id DESC LIMIT 1"
        ))
        .bind(campaign_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    /// Ground-truth rows of a campaign, in upload order.
    pub async fn messages(
        &self,
        channel: Channel,
        campaign_id: i64,
    ) -> Result<Vec<Message>, QueueError> {
        let messages = sqlx::query_as::<_, Message>(&format!(
            r"
            SELECT id, campaign_id, recipient, params, dequeued_at, sent_at, message_id, error_code
            FROM {messages}
            WHERE campaign_id = $1
            ORDER BY id ASC
            ",
            messages = channel.messages_table(),
        ))
        .bind(campaign_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(messages)
    }

    /// Delivery counters of a campaign's ground-truth rows.
    pub async fn delivery_summary(
        &self,
        channel: Channel,
        campaign_id: i64,
    ) -> Result<DeliverySummary, QueueError> {
        let summary = sqlx::query_as::<_, DeliverySummary>(&format!(
            r"
            SELECT
                COUNT(*) AS total,
                COUNT(sent_at) AS sent,
                COUNT(*) FILTER (WHERE sent_at IS NULL AND error_code IS NOT NULL) AS failed,
                COUNT(*) FILTER (WHERE dequeued_at IS NULL) AS pending
            FROM {messages}
            WHERE campaign_id = $1
            ",
            messages = channel.messages_table(),
        ))
        .bind(campaign_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(summary)
    }
}

async fn insert_ready<'e>(
    executor: impl PgExecutor<'e>,
    campaign_id: i64,
    channel: Channel,
    send_rate: i32,
) -> Result<Option<i64>, sqlx::Error> {
    sqlx::query_scalar::<_, i64>(
        r"
        INSERT INTO job_queue (campaign_id, channel, send_rate)
        VALUES ($1, $2, $3)
        ON CONFLICT (campaign_id) WHERE status <> 'LOGGED' DO NOTHING
        RETURNING id
        ",
    )
    .bind(campaign_id)
    .bind(channel)
    .bind(send_rate)
    .fetch_optional(executor)
    .await
}
