//! Database schema definitions for SQLx.
//!
//! Row types for the `job_queue` table and the per-channel ground-truth
//! (`*_messages`) and staging (`*_ops`) tables.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "job_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Inserted and waiting for a worker.
    Ready,
    /// Claimed by a worker, staging not populated yet.
    Enqueued,
    /// Staging populated, worker is draining it.
    Sending,
    /// Every staging row has been dequeued.
    Sent,
    /// Halted by an operator or by the stall sweep.
    Stopped,
    /// Staging reconciled into ground truth. Terminal.
    Logged,
}

impl JobStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [JobStatus; 6] = [
        Self::Ready,
        Self::Enqueued,
        Self::Sending,
        Self::Sent,
        Self::Stopped,
        Self::Logged,
    ];

    /// Whether a worker may still dequeue for a job in this state.
    pub fn is_dispatchable(self) -> bool {
        matches!(self, Self::Ready | Self::Enqueued | Self::Sending)
    }

    /// Whether the grim reaper picks up a job in this state.
    pub fn awaits_finalization(self) -> bool {
        matches!(self, Self::Sent | Self::Stopped)
    }

    /// Whether a worker owns a job in this state.
    pub fn is_claimed(self) -> bool {
        matches!(self, Self::Enqueued | Self::Sending)
    }

    /// The statuses satisfying `predicate`, for `status = ANY(..)` filters.
    pub fn all_where(predicate: fn(JobStatus) -> bool) -> Vec<JobStatus> {
        Self::ALL.into_iter().filter(|status| predicate(*status)).collect()
    }

    /// Database representation of the status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ready => "READY",
            Self::Enqueued => "ENQUEUED",
            Self::Sending => "SENDING",
            Self::Sent => "SENT",
            Self::Stopped => "STOPPED",
            Self::Logged => "LOGGED",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery channel of a campaign.
///
/// Each channel has its own ground-truth and staging tables.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "message_channel", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Email messages.
    #[default]
    Email,
    /// SMS messages.
    Sms,
    /// WhatsApp messages.
    Whatsapp,
}

impl Channel {
    /// All channels.
    pub const ALL: [Channel; 3] = [Self::Email, Self::Sms, Self::Whatsapp];

    /// Name of the channel, as stored in the database.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Sms => "sms",
            Self::Whatsapp => "whatsapp",
        }
    }

    /// Ground-truth table holding one row per campaign recipient.
    pub fn messages_table(self) -> &'static str {
        match self {
            Self::Email => "email_messages",
            Self::Sms => "sms_messages",
            Self::Whatsapp => "whatsapp_messages",
        }
    }

    /// Staging table holding the working copy of an active job.
    pub fn ops_table(self) -> &'static str {
        match self {
            Self::Email => "email_ops",
            Self::Sms => "sms_ops",
            Self::Whatsapp => "whatsapp_ops",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|channel| channel.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown channel `{s}`, expected one of: email, sms, whatsapp"))
    }
}

/// Represents a job record in the `job_queue` table
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Job {
    /// Unique identifier for the job
    pub id: i64,
    /// Campaign being sent
    pub campaign_id: i64,
    /// Channel the campaign is sent over
    pub channel: Channel,
    /// Target messages per second
    pub send_rate: i32,
    /// Current lifecycle state
    pub status: JobStatus,
    /// Worker that claimed the job, if any
    pub worker_id: Option<i32>,
    /// Timestamp when the job was inserted
    pub created_at: DateTime<Utc>,
    /// Timestamp of the last transition or worker heartbeat
    pub updated_at: DateTime<Utc>,
}

/// A job a worker has just won through `claim_next`.
#[derive(Debug, Clone, FromRow)]
pub struct ClaimedJob {
    /// Job identifier
    pub id: i64,
    /// Campaign being sent
    pub campaign_id: i64,
    /// Channel the campaign is sent over
    pub channel: Channel,
    /// Target messages per second
    pub send_rate: i32,
}

/// A staging row handed to the channel sender.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct StagedMessage {
    /// Staging row identifier
    pub id: i64,
    /// Campaign the message belongs to
    pub campaign_id: i64,
    /// Address, phone number or handle of the recipient
    pub recipient: String,
    /// Templating parameters
    pub params: Value,
}

/// Represents a ground-truth message row
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Message {
    /// Row identifier
    pub id: i64,
    /// Campaign the message belongs to
    pub campaign_id: i64,
    /// Address, phone number or handle of the recipient
    pub recipient: String,
    /// Templating parameters
    pub params: Value,
    /// When a worker last took the message for sending
    pub dequeued_at: Option<DateTime<Utc>>,
    /// When the provider accepted the message
    pub sent_at: Option<DateTime<Utc>>,
    /// Provider message identifier
    pub message_id: Option<String>,
    /// Provider or transport error of the last attempt
    pub error_code: Option<String>,
}

/// Result of reconciling one job in `finalize_next`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizedJob {
    /// The job that is now `LOGGED`
    pub job_id: i64,
    /// Campaign of the job
    pub campaign_id: i64,
    /// Channel of the job
    pub channel: Channel,
    /// Status the job was finalized from (`SENT` or `STOPPED`)
    pub previous_status: JobStatus,
    /// Number of ground-truth rows updated from staging
    pub reconciled: u64,
}

/// Delivery counters of a campaign's ground-truth rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromRow, Serialize)]
pub struct DeliverySummary {
    /// Number of recipients
    pub total: i64,
    /// Recipients accepted by the provider
    pub sent: i64,
    /// Recipients whose last attempt failed
    pub failed: i64,
    /// Recipients never attempted
    pub pending: i64,
}
