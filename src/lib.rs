#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod control;
mod dispatcher;
mod errors;
mod reaper;
mod runner;
/// Database schema definitions.
pub mod schema;
mod sender;
mod storage;
mod util;
mod worker;

/// Default target messages per second of a new job.
pub use self::control::DEFAULT_SEND_RATE;
/// Paced batch sending of a claimed job.
pub use self::dispatcher::{BatchReport, DEFAULT_PACING_WINDOW, Dispatcher, Drain};
/// Error type for queue transitions and control operations.
pub use self::errors::QueueError;
/// Finalization of sent and stopped jobs.
pub use self::reaper::{DEFAULT_REAPER_INTERVAL, DEFAULT_STALL_TIMEOUT, ReapReport, Reaper};
/// The entry point that starts workers and reapers.
pub use self::runner::{DEFAULT_BATCH_SIZE, RunHandle, Runner};
pub use self::schema::{Channel, JobStatus};
/// Channel transport abstraction.
pub use self::sender::{ChannelSender, DryRunSender, SendOutcome};
/// Queue store abstraction and its PostgreSQL implementation.
pub use self::storage::{JobStore, PgJobStore, setup_database};
