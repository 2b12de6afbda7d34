use crate::schema::JobStatus;
use thiserror::Error;

/// Errors returned by job queue transitions and control operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The underlying database call failed.
    ///
    /// These are treated as transient: the operation did not commit and may
    /// be attempted again.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Applying the schema migrations failed.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A job that has not been logged yet already exists for the campaign.
    #[error("Campaign {campaign_id} already has an open job")]
    ActiveJobExists {
        /// The campaign that was targeted.
        campaign_id: i64,
    },

    /// No `READY`, `ENQUEUED` or `SENDING` job exists for the campaign.
    #[error("Campaign {campaign_id} has no job that can be stopped")]
    NoActiveJob {
        /// The campaign that was targeted.
        campaign_id: i64,
    },

    /// The campaign has never had a job.
    #[error("Campaign {campaign_id} has no job to retry")]
    NoJob {
        /// The campaign that was targeted.
        campaign_id: i64,
    },

    /// The campaign's latest job is `SENT` or `STOPPED` and its results are
    /// not reconciled yet.
    #[error(
        "Campaign {campaign_id} cannot be retried yet: its {status} job must first be finalized by the grim reaper"
    )]
    AwaitingFinalization {
        /// The campaign that was targeted.
        campaign_id: i64,
        /// Status of the campaign's latest job.
        status: JobStatus,
    },

    /// The campaign's latest job is in a state that cannot be retried.
    #[error("Campaign {campaign_id} cannot be retried while its job is {status}")]
    NotRetryable {
        /// The campaign that was targeted.
        campaign_id: i64,
        /// Status of the campaign's latest job.
        status: JobStatus,
    },
}

impl QueueError {
    /// Whether the error is a storage failure worth retrying, as opposed to a
    /// rejected control operation.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}
