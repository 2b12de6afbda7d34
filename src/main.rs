use anyhow::{Context, Result};
use campaign_workers::{
    Channel, DEFAULT_BATCH_SIZE, DEFAULT_SEND_RATE, DryRunSender, PgJobStore, Runner,
    setup_database,
};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Campaign dispatch workers and job queue administration
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// PostgreSQL connection string
    #[arg(long, env = "DATABASE_URL", global = true, hide_env_values = true)]
    database_url: Option<String>,

    /// Log at debug level (ignored when RUST_LOG is set)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a worker, or the grim reaper with `--grim-reaper`
    Worker(WorkerArgs),
    /// Queue a campaign for sending
    InsertJob {
        /// Campaign to send
        #[arg(long)]
        campaign_id: i64,
        /// Target messages per second
        #[arg(long, default_value_t = DEFAULT_SEND_RATE, value_parser = clap::value_parser!(i32).range(1..))]
        send_rate: i32,
        /// Channel the campaign is sent over
        #[arg(long, default_value_t = Channel::Email)]
        channel: Channel,
    },
    /// Halt the campaign's running or queued job
    StopJob {
        /// Campaign to stop
        #[arg(long)]
        campaign_id: i64,
    },
    /// Send the campaign again to the recipients not delivered yet
    RetryJob {
        /// Campaign to retry
        #[arg(long)]
        campaign_id: i64,
    },
    /// Print the campaign's latest job and delivery counters
    JobStatus {
        /// Campaign to inspect
        #[arg(long)]
        campaign_id: i64,
    },
    /// Apply the database migrations
    Migrate,
}

#[derive(Debug, Args)]
struct WorkerArgs {
    /// Unique id of this worker instance
    #[arg(long)]
    worker_id: i32,

    /// Maximum number of messages sent per second
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE, value_parser = clap::value_parser!(u32).range(1..))]
    batch_size: u32,

    /// Finalize sent and stopped jobs instead of sending
    #[arg(long)]
    grim_reaper: bool,

    /// How often an idle worker looks for jobs (milliseconds)
    #[arg(long, default_value_t = 1000)]
    poll_interval_ms: u64,

    /// Time between two reaper ticks (seconds)
    #[arg(long, default_value_t = 5)]
    reaper_interval_secs: u64,

    /// Stop jobs without worker heartbeat for this long (seconds, 0 disables)
    #[arg(long, default_value_t = 600)]
    stall_timeout_secs: u64,

    /// How long to wait for the current batch on shutdown before aborting (seconds)
    #[arg(long, default_value_t = 30)]
    shutdown_timeout_secs: u64,

    /// Size of the database connection pool
    #[arg(long, default_value_t = 10)]
    max_connections: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = match cli.verbose {
        true => "info,campaign_workers=debug",
        false => "info",
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let database_url = cli
        .database_url
        .context("a database URL is required, pass --database-url or set DATABASE_URL")?;

    let max_connections = match &cli.command {
        Command::Worker(args) => args.max_connections,
        _ => 2,
    };
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(&database_url)
        .await
        .context("failed to connect to the database")?;
    let store = PgJobStore::new(pool);

    match cli.command {
        Command::Worker(args) => run_worker(store, args).await?,
        Command::InsertJob {
            campaign_id,
            send_rate,
            channel,
        } => {
            let job_id = store.insert(campaign_id, channel, send_rate).await?;
            println!("{job_id}");
        }
        Command::StopJob { campaign_id } => {
            let job_id = store.stop(campaign_id).await?;
            println!("{job_id}");
        }
        Command::RetryJob { campaign_id } => {
            let job_id = store.retry(campaign_id).await?;
            println!("{job_id}");
        }
        Command::JobStatus { campaign_id } => {
            let job = store
                .latest_job(campaign_id)
                .await?
                .with_context(|| format!("campaign {campaign_id} has no job"))?;
            let delivery = store.delivery_summary(job.channel, campaign_id).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({ "job": job, "delivery": delivery }))?
            );
        }
        Command::Migrate => {
            setup_database(store.pool()).await?;
            info!("Migrations applied");
        }
    }

    Ok(())
}

async fn run_worker(store: PgJobStore, args: WorkerArgs) -> Result<()> {
    let stall_timeout =
        (args.stall_timeout_secs > 0).then(|| Duration::from_secs(args.stall_timeout_secs));

    let runner = Runner::new(store, DryRunSender, args.worker_id)
        .batch_size(args.batch_size)
        .grim_reaper(args.grim_reaper)
        .poll_interval(Duration::from_millis(args.poll_interval_ms))
        .reaper_interval(Duration::from_secs(args.reaper_interval_secs))
        .stall_timeout(stall_timeout);

    let handle = runner.start();
    shutdown_signal().await?;
    handle
        .shutdown(Duration::from_secs(args.shutdown_timeout_secs))
        .await;

    Ok(())
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;

    info!("Shutdown signal detected. Finishing the current batch…");
    Ok(())
}
