#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::indexing_slicing)]

use campaign_workers::schema::{Message, StagedMessage};
use campaign_workers::{
    BatchReport, Channel, ChannelSender, Dispatcher, Drain, DryRunSender, JobStatus, JobStore, PgJobStore,
    Reaper, Runner, SendOutcome, setup_database,
};
use claims::assert_some;
use insta::assert_compact_json_snapshot;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;
use tokio::sync::Barrier;
use tokio::time::Instant;

/// Test utilities and common setup
mod test_utils {
    use super::*;
    use sqlx::postgres::PgPoolOptions;
    use testcontainers::runners::AsyncRunner;

    /// Set up a migrated test database with `TestContainers` and return the store and container
    pub(super) async fn setup_test_db() -> anyhow::Result<(PgJobStore, ContainerAsync<Postgres>)> {
        let postgres_image = Postgres::default();
        let container = postgres_image.start().await?;

        let host = container.get_host().await?;
        let port = container.get_host_port_ipv4(5432).await?;
        let connection_string = format!("postgresql://postgres:postgres@{host}:{port}/postgres");

        let pool = PgPoolOptions::new()
            .max_connections(16)
            .connect(&connection_string)
            .await?;
        setup_database(&pool).await?;

        Ok((PgJobStore::new(pool), container))
    }

    /// Upload `count` recipients for a campaign, as the upload layer would
    pub(super) async fn seed_recipients(
        pool: &PgPool,
        channel: Channel,
        campaign_id: i64,
        count: i64,
    ) -> anyhow::Result<()> {
        sqlx::query(&format!(
            r"
            INSERT INTO {messages} (campaign_id, recipient, params)
            SELECT $1, 'user' || n || '@example.com', jsonb_build_object('name', 'User ' || n)
            FROM generate_series(1, $2::bigint) AS n
            ",
            messages = channel.messages_table(),
        ))
        .bind(campaign_id)
        .bind(count)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Create a worker runner that exits once no job is left to claim
    pub(super) fn create_test_worker<C: ChannelSender>(
        store: &PgJobStore,
        sender: C,
        worker_id: i32,
    ) -> Runner<PgJobStore, C> {
        Runner::new(store.clone(), sender, worker_id)
            .poll_interval(Duration::from_millis(50))
            .jitter(Duration::ZERO)
            .pacing_window(Duration::from_millis(100))
            .shutdown_when_queue_empty()
    }

    /// Create a grim reaper runner that exits once nothing is left to finalize
    pub(super) fn create_test_reaper(store: &PgJobStore) -> Runner<PgJobStore, DryRunSender> {
        Runner::new(store.clone(), DryRunSender, 99)
            .grim_reaper(true)
            .reaper_interval(Duration::from_millis(50))
            .shutdown_when_queue_empty()
    }

    pub(super) async fn status_of(store: &PgJobStore, campaign_id: i64) -> anyhow::Result<JobStatus> {
        let job = store.latest_job(campaign_id).await?;
        Ok(job.expect("campaign should have a job").status)
    }
}

use test_utils::{create_test_reaper, create_test_worker, seed_recipients, setup_test_db, status_of};

/// Accepts everything and counts deliveries per recipient.
#[derive(Clone, Default)]
struct CountingSender {
    deliveries: Arc<Mutex<HashMap<(i64, String), usize>>>,
}

impl ChannelSender for CountingSender {
    async fn send(&self, _channel: Channel, message: &StagedMessage) -> SendOutcome {
        *self
            .deliveries
            .lock()
            .unwrap()
            .entry((message.campaign_id, message.recipient.clone()))
            .or_default() += 1;
        SendOutcome::accepted(format!("counted-{}", message.id))
    }
}

/// Fails user2 and panics on user5.
struct BouncingSender;

impl ChannelSender for BouncingSender {
    async fn send(&self, _channel: Channel, message: &StagedMessage) -> SendOutcome {
        match message.recipient.as_str() {
            "user2@example.com" => SendOutcome::failed("mailbox_full"),
            "user5@example.com" => panic!("smtp connection reset"),
            _ => SendOutcome::accepted(format!("smtp-{}", message.id)),
        }
    }
}

#[tokio::test]
async fn worker_and_reaper_deliver_a_campaign() -> anyhow::Result<()> {
    let (store, _container) = setup_test_db().await?;
    seed_recipients(store.pool(), Channel::Sms, 1, 10).await?;
    store.insert(1, Channel::Sms, 100).await?;

    create_test_worker(&store, DryRunSender, 1)
        .start()
        .wait_for_shutdown()
        .await;

    let job = assert_some!(store.latest_job(1).await?);
    assert_eq!(job.status, JobStatus::Sent);
    assert_eq!(job.worker_id, Some(1));

    create_test_reaper(&store).start().wait_for_shutdown().await;
    assert_eq!(status_of(&store, 1).await?, JobStatus::Logged);

    let messages = store.messages(Channel::Sms, 1).await?;
    assert_eq!(messages.len(), 10);
    assert!(messages.iter().all(|message| {
        message.sent_at.is_some()
            && message.error_code.is_none()
            && message
                .message_id
                .as_deref()
                .is_some_and(|id| id.starts_with("dry-run-sms-"))
    }));
    Ok(())
}

#[tokio::test]
async fn batches_are_paced_to_one_per_window() -> anyhow::Result<()> {
    let (store, _container) = setup_test_db().await?;
    seed_recipients(store.pool(), Channel::Email, 1, 30).await?;
    let job_id = store.insert(1, Channel::Email, 100).await?;

    let job = assert_some!(store.claim_next(1).await?);
    assert_eq!(store.enqueue(job_id).await?, Some(30));

    let dispatcher = Dispatcher::new(store.clone(), Arc::new(CountingSender::default()), 10);

    let started = Instant::now();
    for _ in 0..3 {
        let drain = dispatcher.drain_once(&job).await?;
        assert_eq!(drain, Drain::More(BatchReport { accepted: 10, failed: 0 }));
    }
    assert!(started.elapsed() >= Duration::from_secs(2));

    assert_eq!(dispatcher.drain_once(&job).await?, Drain::Done);
    assert_eq!(status_of(&store, 1).await?, JobStatus::Sent);
    Ok(())
}

#[tokio::test]
async fn send_failures_are_recorded_and_retried() -> anyhow::Result<()> {
    let (store, _container) = setup_test_db().await?;
    seed_recipients(store.pool(), Channel::Email, 1, 6).await?;
    let first_job = store.insert(1, Channel::Email, 100).await?;

    create_test_worker(&store, BouncingSender, 1)
        .start()
        .wait_for_shutdown()
        .await;
    create_test_reaper(&store).start().wait_for_shutdown().await;

    let errors: Vec<_> = store
        .messages(Channel::Email, 1)
        .await?
        .into_iter()
        .filter_map(|message| Some((message.recipient, message.error_code?)))
        .collect();
    assert_compact_json_snapshot!(errors, @r#"[["user2@example.com", "mailbox_full"], ["user5@example.com", "sender_panic"]]"#);

    let retry_job = store.retry(1).await?;
    assert!(retry_job > first_job);

    let sender = CountingSender::default();
    create_test_worker(&store, sender.clone(), 2)
        .start()
        .wait_for_shutdown()
        .await;
    create_test_reaper(&store).start().wait_for_shutdown().await;

    let mut resent: Vec<_> = sender
        .deliveries
        .lock()
        .unwrap()
        .keys()
        .map(|(_, recipient)| recipient.clone())
        .collect();
    resent.sort();
    assert_eq!(resent, vec!["user2@example.com", "user5@example.com"]);

    let summary = store.delivery_summary(Channel::Email, 1).await?;
    assert_compact_json_snapshot!(summary, @r#"{"total": 6, "sent": 6, "failed": 0, "pending": 0}"#);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_workers_send_each_message_exactly_once() -> anyhow::Result<()> {
    let (store, _container) = setup_test_db().await?;
    for campaign_id in 1..=4 {
        seed_recipients(store.pool(), Channel::Email, campaign_id, 15).await?;
        store.insert(campaign_id, Channel::Email, 100).await?;
    }

    let sender = CountingSender::default();
    let handle = create_test_worker(&store, sender.clone(), 1)
        .start()
        .join(create_test_worker(&store, sender.clone(), 2).start())
        .join(create_test_worker(&store, sender.clone(), 3).start());
    handle.wait_for_shutdown().await;

    create_test_reaper(&store).start().wait_for_shutdown().await;

    let deliveries = sender.deliveries.lock().unwrap().clone();
    assert_eq!(deliveries.len(), 60);
    assert!(deliveries.values().all(|count| *count == 1));

    for campaign_id in 1..=4 {
        assert_eq!(status_of(&store, campaign_id).await?, JobStatus::Logged);
    }
    Ok(())
}

/// Holds every send of a two-message batch until the test releases it.
struct GatedSender {
    started: Arc<Barrier>,
    release: Arc<Barrier>,
}

impl GatedSender {
    /// The sender, and the barriers the test waits on: one for the batch to
    /// reach the sender and one to let it through.
    fn new() -> (Self, Arc<Barrier>, Arc<Barrier>) {
        // Two concurrent sends in the batch plus the test
        let started = Arc::new(Barrier::new(3));
        let release = Arc::new(Barrier::new(3));
        let sender = Self {
            started: started.clone(),
            release: release.clone(),
        };
        (sender, started, release)
    }
}

impl ChannelSender for GatedSender {
    async fn send(&self, _channel: Channel, message: &StagedMessage) -> SendOutcome {
        self.started.wait().await;
        self.release.wait().await;
        SendOutcome::accepted(format!("gated-{}", message.id))
    }
}

fn delivered_recipients(messages: &[Message]) -> Vec<&str> {
    messages
        .iter()
        .filter(|message| message.sent_at.is_some())
        .map(|message| message.recipient.as_str())
        .collect()
}

#[tokio::test]
async fn stop_halts_a_worker_between_batches() -> anyhow::Result<()> {
    let (store, _container) = setup_test_db().await?;
    seed_recipients(store.pool(), Channel::Email, 1, 10).await?;
    let job_id = store.insert(1, Channel::Email, 100).await?;

    let (sender, started, release) = GatedSender::new();
    let runner = create_test_worker(&store, sender, 1).batch_size(2).start();

    started.wait().await;
    assert_eq!(store.stop(1).await?, job_id);
    release.wait().await;

    runner.wait_for_shutdown().await;
    assert_eq!(status_of(&store, 1).await?, JobStatus::Stopped);

    let report = Reaper::new(store.clone()).run_once().await?;
    assert_eq!(report.finalized, vec![job_id]);

    let messages = store.messages(Channel::Email, 1).await?;
    assert_eq!(
        delivered_recipients(&messages),
        vec!["user1@example.com", "user2@example.com"]
    );
    assert!(messages[2..].iter().all(|message| message.dequeued_at.is_none()));
    Ok(())
}

#[tokio::test]
async fn reaper_tick_during_an_in_flight_batch_keeps_its_outcomes() -> anyhow::Result<()> {
    let (store, _container) = setup_test_db().await?;
    seed_recipients(store.pool(), Channel::Email, 1, 10).await?;
    let job_id = store.insert(1, Channel::Email, 100).await?;

    let (sender, started, release) = GatedSender::new();
    let runner = create_test_worker(&store, sender, 1).batch_size(2).start();

    started.wait().await;
    store.stop(1).await?;
    let report = Reaper::new(store.clone()).run_once().await?;
    assert_eq!(report.finalized, vec![job_id]);
    release.wait().await;

    runner.wait_for_shutdown().await;
    assert_eq!(status_of(&store, 1).await?, JobStatus::Logged);

    let messages = store.messages(Channel::Email, 1).await?;
    assert_eq!(
        delivered_recipients(&messages),
        vec!["user1@example.com", "user2@example.com"]
    );
    let summary = store.delivery_summary(Channel::Email, 1).await?;
    assert_compact_json_snapshot!(summary, @r#"{"total": 10, "sent": 2, "failed": 0, "pending": 8}"#);

    // Only the recipients that were never delivered are sent again
    let retry_job = store.retry(1).await?;
    store.claim_next(2).await?;
    assert_eq!(store.enqueue(retry_job).await?, Some(8));
    Ok(())
}

#[tokio::test]
async fn shutdown_finishes_the_batch_and_stops_the_job() -> anyhow::Result<()> {
    let (store, _container) = setup_test_db().await?;
    seed_recipients(store.pool(), Channel::Sms, 1, 10).await?;
    let job_id = store.insert(1, Channel::Sms, 100).await?;

    let (sender, started, release) = GatedSender::new();
    let runner = create_test_worker(&store, sender, 1).batch_size(2).start();

    started.wait().await;
    runner.request_shutdown();
    release.wait().await;
    runner.shutdown(Duration::from_secs(10)).await;

    let job = assert_some!(store.latest_job(1).await?);
    assert_eq!(job.status, JobStatus::Stopped);

    // Both outcomes made it to staging before the worker let go of the job
    let report = Reaper::new(store.clone()).run_once().await?;
    assert_eq!(report.finalized, vec![job_id]);

    let messages = store.messages(Channel::Sms, 1).await?;
    assert_eq!(
        delivered_recipients(&messages),
        vec!["user1@example.com", "user2@example.com"]
    );
    assert!(messages[2..].iter().all(|message| message.dequeued_at.is_none()));
    Ok(())
}

#[tokio::test]
async fn reaper_recovers_jobs_of_crashed_workers() -> anyhow::Result<()> {
    let (store, _container) = setup_test_db().await?;
    seed_recipients(store.pool(), Channel::Sms, 1, 8).await?;
    let job_id = store.insert(1, Channel::Sms, 100).await?;

    // A worker that claimed, staged, took a batch and then died
    store.claim_next(1).await?;
    store.enqueue(job_id).await?;
    assert_eq!(store.dequeue_batch(job_id, 3).await?.len(), 3);
    sqlx::query("UPDATE job_queue SET updated_at = NOW() - INTERVAL '20 minutes' WHERE id = $1")
        .bind(job_id)
        .execute(store.pool())
        .await?;

    let report = Reaper::new(store.clone())
        .stall_timeout(Some(Duration::from_secs(600)))
        .run_once()
        .await?;
    assert_eq!(report.reclaimed, vec![job_id]);
    assert_eq!(report.finalized, vec![job_id]);
    assert_eq!(status_of(&store, 1).await?, JobStatus::Logged);

    let messages = store.messages(Channel::Sms, 1).await?;
    assert_eq!(
        messages.iter().filter(|m| m.dequeued_at.is_some()).count(),
        3
    );
    assert!(messages.iter().all(|m| m.sent_at.is_none()));

    // The campaign can now be sent again in full
    let retry_job = store.retry(1).await?;
    store.claim_next(2).await?;
    assert_eq!(store.enqueue(retry_job).await?, Some(8));
    Ok(())
}

#[tokio::test]
async fn stall_sweep_can_be_disabled() -> anyhow::Result<()> {
    let (store, _container) = setup_test_db().await?;
    let job_id = store.insert(1, Channel::Email, 100).await?;
    store.claim_next(1).await?;
    sqlx::query("UPDATE job_queue SET updated_at = NOW() - INTERVAL '1 day' WHERE id = $1")
        .bind(job_id)
        .execute(store.pool())
        .await?;

    let report = Reaper::new(store.clone())
        .stall_timeout(None)
        .run_once()
        .await?;
    assert!(report.reclaimed.is_empty());
    assert!(report.finalized.is_empty());
    assert_eq!(status_of(&store, 1).await?, JobStatus::Enqueued);
    Ok(())
}
