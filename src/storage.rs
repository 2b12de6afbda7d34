use crate::errors::QueueError;
use crate::schema::{Channel, ClaimedJob, FinalizedJob, JobStatus, StagedMessage};
use crate::sender::SendOutcome;
use sqlx::{FromRow, PgPool};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Apply the job queue schema migrations.
pub async fn setup_database(pool: &PgPool) -> Result<(), QueueError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// The queue transitions used by workers and the grim reaper.
///
/// Every method is a single transaction: a failure leaves the job in the
/// state it was in before the call, and callers are expected to simply try
/// again later.
pub trait JobStore: Clone + Send + Sync + 'static {
    /// Claim the oldest `READY` job for `worker_id`, moving it to `ENQUEUED`.
    ///
    /// Concurrent callers never receive the same job. `None` means there was
    /// nothing to claim, or that every candidate was taken by another worker.
    fn claim_next(
        &self,
        worker_id: i32,
    ) -> impl Future<Output = Result<Option<ClaimedJob>, QueueError>> + Send;

    /// Copy the unresolved ground-truth recipients of a claimed job into
    /// staging and move the job to `SENDING`.
    ///
    /// Returns the number of staged rows, or `None` if the job is no longer
    /// `ENQUEUED` (it was stopped after being claimed).
    fn enqueue(&self, job_id: i64) -> impl Future<Output = Result<Option<u64>, QueueError>> + Send;

    /// Take up to `limit` staged messages that have not been dequeued yet,
    /// in insertion order, stamping them with a dequeue time.
    ///
    /// An empty batch means the job is drained: a `SENDING` job with no
    /// undequeued staging rows left is moved to `SENT` in the same
    /// transaction. Jobs in any other state (for instance `STOPPED`) never
    /// yield messages. A `limit` below one yields nothing and changes nothing.
    fn dequeue_batch(
        &self,
        job_id: i64,
        limit: i64,
    ) -> impl Future<Output = Result<Vec<StagedMessage>, QueueError>> + Send;

    /// Store the provider's answer for a dequeued message.
    ///
    /// If the job was finalized while the message was in flight, the staging
    /// row is gone and the outcome is written to the ground-truth row instead.
    fn record_outcome(
        &self,
        channel: Channel,
        message: &StagedMessage,
        outcome: &SendOutcome,
    ) -> impl Future<Output = Result<(), QueueError>> + Send;

    /// Reconcile one `SENT` or `STOPPED` job into ground truth, clear its
    /// staging rows and move it to `LOGGED`.
    fn finalize_next(&self) -> impl Future<Output = Result<Option<FinalizedJob>, QueueError>> + Send;

    /// Stop `ENQUEUED`/`SENDING` jobs whose worker has not touched them for
    /// longer than `older_than`, returning their ids.
    fn reclaim_stalled(
        &self,
        older_than: Duration,
    ) -> impl Future<Output = Result<Vec<i64>, QueueError>> + Send;

    /// Stop a job its worker gives up on, for instance on shutdown.
    ///
    /// Returns `false` if the job was no longer `ENQUEUED` or `SENDING`.
    fn release(&self, job_id: i64) -> impl Future<Output = Result<bool, QueueError>> + Send;
}

/// [`JobStore`] backed by a PostgreSQL connection pool.
#[derive(Debug, Clone)]
pub struct PgJobStore {
    pub(crate) pool: PgPool,
}

impl PgJobStore {
    /// Wrap a connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[derive(FromRow)]
struct JobHead {
    campaign_id: i64,
    channel: Channel,
    status: JobStatus,
}

#[derive(FromRow)]
struct FinalizeCandidate {
    id: i64,
    campaign_id: i64,
    channel: Channel,
    status: JobStatus,
}

impl JobStore for PgJobStore {
    async fn claim_next(&self, worker_id: i32) -> Result<Option<ClaimedJob>, QueueError> {
        let job = sqlx::query_as::<_, ClaimedJob>(
            r"
            UPDATE job_queue
            SET status = 'ENQUEUED', worker_id = $1, updated_at = NOW()
            WHERE id = (
                SELECT id FROM job_queue
                WHERE status = 'READY'
                ORDER BY created_at ASC, id ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING id, campaign_id, channel, send_rate
            ",
        )
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    async fn enqueue(&self, job_id: i64) -> Result<Option<u64>, QueueError> {
        let mut tx = self.pool.begin().await?;

        let head = sqlx::query_as::<_, JobHead>(
            "SELECT campaign_id, channel, status FROM job_queue WHERE id = $1 FOR UPDATE",
        )
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(head) = head.filter(|head| head.status == JobStatus::Enqueued) else {
            tx.rollback().await?;
            return Ok(None);
        };

        let staged = sqlx::query(&format!(
            r"
            INSERT INTO {ops} (campaign_id, recipient, params)
            SELECT campaign_id, recipient, params
            FROM {messages}
            WHERE campaign_id = $1 AND sent_at IS NULL
            ORDER BY id ASC
            ",
            ops = head.channel.ops_table(),
            messages = head.channel.messages_table(),
        ))
        .bind(head.campaign_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        sqlx::query("UPDATE job_queue SET status = 'SENDING', updated_at = NOW() WHERE id = $1")
            .bind(job_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Some(staged))
    }

    async fn dequeue_batch(&self, job_id: i64, limit: i64) -> Result<Vec<StagedMessage>, QueueError> {
        if limit < 1 {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await?;

        // Holding the job row serializes batches with `stop`.
        let head = sqlx::query_as::<_, JobHead>(
            "SELECT campaign_id, channel, status FROM job_queue WHERE id = $1 FOR UPDATE",
        )
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(head) = head.filter(|head| head.status == JobStatus::Sending) else {
            tx.rollback().await?;
            return Ok(Vec::new());
        };

        let mut batch = sqlx::query_as::<_, StagedMessage>(&format!(
            r"
            UPDATE {ops}
            SET dequeued_at = NOW()
            WHERE id IN (
                SELECT id FROM {ops}
                WHERE campaign_id = $1 AND dequeued_at IS NULL
                ORDER BY id ASC
                FOR UPDATE SKIP LOCKED
                LIMIT $2
            )
            RETURNING id, campaign_id, recipient, params
            ",
            ops = head.channel.ops_table(),
        ))
        .bind(head.campaign_id)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        batch.sort_unstable_by_key(|message| message.id);

        // Rows locked by a concurrent dequeue are skipped above but not drained.
        let drained = batch.is_empty()
            && !sqlx::query_scalar::<_, bool>(&format!(
                "SELECT EXISTS (SELECT 1 FROM {ops} WHERE campaign_id = $1 AND dequeued_at IS NULL)",
                ops = head.channel.ops_table(),
            ))
            .bind(head.campaign_id)
            .fetch_one(&mut *tx)
            .await?;

        let next_status = match drained {
            true => JobStatus::Sent,
            false => JobStatus::Sending,
        };
        sqlx::query("UPDATE job_queue SET status = $2, updated_at = NOW() WHERE id = $1")
            .bind(job_id)
            .bind(next_status)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(batch)
    }

    async fn record_outcome(
        &self,
        channel: Channel,
        message: &StagedMessage,
        outcome: &SendOutcome,
    ) -> Result<(), QueueError> {
        let ops = channel.ops_table();
        let staged = match outcome {
            SendOutcome::Accepted { message_id } => sqlx::query(&format!(
                "UPDATE {ops} SET sent_at = NOW(), message_id = $2, error_code = NULL WHERE id = $1"
            ))
            .bind(message.id)
            .bind(message_id)
            .execute(&self.pool)
            .await?,
            SendOutcome::Failed { error_code } => {
                sqlx::query(&format!("UPDATE {ops} SET error_code = $2 WHERE id = $1"))
                    .bind(message.id)
                    .bind(error_code)
                    .execute(&self.pool)
                    .await?
            }
        };
        if staged.rows_affected() > 0 {
            return Ok(());
        }

        // Finalized while in flight: the staging row was already reconciled.
        let messages = channel.messages_table();
        let logged = match outcome {
            SendOutcome::Accepted { message_id } => sqlx::query(&format!(
                r"
                UPDATE {messages}
                SET sent_at = NOW(), message_id = $3, error_code = NULL
                WHERE campaign_id = $1 AND recipient = $2
                "
            ))
            .bind(message.campaign_id)
            .bind(&message.recipient)
            .bind(message_id)
            .execute(&self.pool)
            .await?,
            SendOutcome::Failed { error_code } => sqlx::query(&format!(
                r"
                UPDATE {messages}
                SET error_code = $3
                WHERE campaign_id = $1 AND recipient = $2 AND sent_at IS NULL
                "
            ))
            .bind(message.campaign_id)
            .bind(&message.recipient)
            .bind(error_code)
            .execute(&self.pool)
            .await?,
        };

        match logged.rows_affected() {
            0 => warn!(
                recipient = %message.recipient,
                "Dropped send outcome of a recipient missing from ground truth"
            ),
            _ => debug!(
                recipient = %message.recipient,
                "Recorded send outcome of a finalized job in ground truth"
            ),
        }
        Ok(())
    }

    async fn finalize_next(&self) -> Result<Option<FinalizedJob>, QueueError> {
        let mut tx = self.pool.begin().await?;

        let candidate = sqlx::query_as::<_, FinalizeCandidate>(
            r"
            SELECT id, campaign_id, channel, status
            FROM job_queue
            WHERE status = ANY($1)
            ORDER BY updated_at ASC, id ASC
            FOR UPDATE SKIP LOCKED
            LIMIT 1
            ",
        )
        .bind(JobStatus::all_where(JobStatus::awaits_finalization))
        .fetch_optional(&mut *tx)
        .await?;

        let Some(job) = candidate else {
            tx.rollback().await?;
            return Ok(None);
        };

        // Deleting first waits for outcomes still being written to staging,
        // and later writers fall back to ground truth. Rows that were never
        // dequeued carry no outcome and leave ground truth as is.
        let reconciled = sqlx::query(&format!(
            r"
            WITH staged AS (
                DELETE FROM {ops}
                WHERE campaign_id = $1
                RETURNING campaign_id, recipient, dequeued_at, sent_at, message_id, error_code
            )
            UPDATE {messages} AS m
            SET dequeued_at = o.dequeued_at,
                sent_at = o.sent_at,
                message_id = o.message_id,
                error_code = o.error_code
            FROM staged AS o
            WHERE o.dequeued_at IS NOT NULL
              AND m.campaign_id = o.campaign_id
              AND m.recipient = o.recipient
            ",
            messages = job.channel.messages_table(),
            ops = job.channel.ops_table(),
        ))
        .bind(job.campaign_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        sqlx::query("UPDATE job_queue SET status = 'LOGGED', updated_at = NOW() WHERE id = $1")
            .bind(job.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(Some(FinalizedJob {
            job_id: job.id,
            campaign_id: job.campaign_id,
            channel: job.channel,
            previous_status: job.status,
            reconciled,
        }))
    }

    async fn reclaim_stalled(&self, older_than: Duration) -> Result<Vec<i64>, QueueError> {
        let ids = sqlx::query_scalar::<_, i64>(
            r"
            UPDATE job_queue
            SET status = 'STOPPED', updated_at = NOW()
            WHERE status = ANY($2)
              AND updated_at < NOW() - make_interval(secs => $1)
            RETURNING id
            ",
        )
        .bind(older_than.as_secs_f64())
        .bind(JobStatus::all_where(JobStatus::is_claimed))
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    async fn release(&self, job_id: i64) -> Result<bool, QueueError> {
        let released = sqlx::query(
            "UPDATE job_queue SET status = 'STOPPED', updated_at = NOW() WHERE id = $1 AND status = ANY($2)",
        )
        .bind(job_id)
        .bind(JobStatus::all_where(JobStatus::is_claimed))
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(released > 0)
    }
}
