use crate::dispatcher::{DEFAULT_PACING_WINDOW, Dispatcher};
use crate::reaper::{DEFAULT_REAPER_INTERVAL, DEFAULT_STALL_TIMEOUT, Reaper};
use crate::sender::ChannelSender;
use crate::storage::JobStore;
use crate::worker::Worker;
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, warn};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_JITTER: Duration = Duration::from_millis(100);

/// Default number of messages a worker dequeues per batch.
pub const DEFAULT_BATCH_SIZE: u32 = 100;

/// Starts either a claim-and-drain worker or a grim reaper.
pub struct Runner<S, C> {
    store: S,
    sender: Arc<C>,
    worker_id: i32,
    batch_size: u32,
    grim_reaper: bool,
    poll_interval: Duration,
    jitter: Duration,
    pacing_window: Duration,
    reaper_interval: Duration,
    stall_timeout: Option<Duration>,
    shutdown_when_queue_empty: bool,
}

impl<S: std::fmt::Debug, C> std::fmt::Debug for Runner<S, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("store", &self.store)
            .field("worker_id", &self.worker_id)
            .field("batch_size", &self.batch_size)
            .field("grim_reaper", &self.grim_reaper)
            .field("shutdown_when_queue_empty", &self.shutdown_when_queue_empty)
            .finish_non_exhaustive()
    }
}

impl<S: JobStore, C: ChannelSender> Runner<S, C> {
    /// Create a runner for the worker identified by `worker_id`.
    ///
    /// Every running instance must use a distinct id.
    pub fn new(store: S, sender: C, worker_id: i32) -> Self {
        Self {
            store,
            sender: Arc::new(sender),
            worker_id,
            batch_size: DEFAULT_BATCH_SIZE,
            grim_reaper: false,
            poll_interval: DEFAULT_POLL_INTERVAL,
            jitter: DEFAULT_JITTER,
            pacing_window: DEFAULT_PACING_WINDOW,
            reaper_interval: DEFAULT_REAPER_INTERVAL,
            stall_timeout: Some(DEFAULT_STALL_TIMEOUT),
            shutdown_when_queue_empty: false,
        }
    }

    /// Set the maximum number of messages sent per pacing window.
    pub fn batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Run the grim reaper instead of the claim-and-drain loop.
    pub fn grim_reaper(mut self, grim_reaper: bool) -> Self {
        self.grim_reaper = grim_reaper;
        self
    }

    /// Set how often an idle worker polls for new jobs.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set the maximum random jitter to add to poll intervals.
    ///
    /// Jitter helps reduce thundering herd effects when multiple workers
    /// are polling for jobs simultaneously. The actual jitter applied will
    /// be a random value between 0 and the specified duration.
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Set the minimum time between the starts of two batches.
    pub fn pacing_window(mut self, pacing_window: Duration) -> Self {
        self.pacing_window = pacing_window;
        self
    }

    /// Set the time between two reaper ticks.
    pub fn reaper_interval(mut self, reaper_interval: Duration) -> Self {
        self.reaper_interval = reaper_interval;
        self
    }

    /// Set after how long without heartbeat the reaper stops a job.
    ///
    /// `None` disables the stall sweep.
    pub fn stall_timeout(mut self, stall_timeout: Option<Duration>) -> Self {
        self.stall_timeout = stall_timeout;
        self
    }

    /// Shut down once there is no work left.
    ///
    /// A worker stops when no job can be claimed, a reaper after a tick that
    /// finalized nothing.
    pub fn shutdown_when_queue_empty(mut self) -> Self {
        self.shutdown_when_queue_empty = true;
        self
    }

    /// Spawn the configured loop on the Tokio runtime.
    pub fn start(&self) -> RunHandle {
        let shutdown = CancellationToken::new();
        let handle = if self.grim_reaper {
            info!(worker.id = self.worker_id, "Starting grim reaper…");

            let reaper = Reaper::new(self.store.clone())
                .interval(self.reaper_interval)
                .stall_timeout(self.stall_timeout)
                .shutdown_when_idle(self.shutdown_when_queue_empty)
                .shutdown_on(shutdown.clone());

            let span = info_span!("reaper", worker.id = self.worker_id);
            tokio::spawn(async move { reaper.run().instrument(span).await })
        } else {
            info!(worker.id = self.worker_id, batch_size = self.batch_size, "Starting worker…");

            let dispatcher = Dispatcher::new(self.store.clone(), self.sender.clone(), self.batch_size)
                .pacing_window(self.pacing_window);

            let worker = Worker {
                worker_id: self.worker_id,
                store: self.store.clone(),
                dispatcher,
                shutdown_when_queue_empty: self.shutdown_when_queue_empty,
                poll_interval: self.poll_interval,
                jitter: self.jitter,
                shutdown: shutdown.clone(),
            };

            let span = info_span!("worker", worker.id = self.worker_id);
            tokio::spawn(async move { worker.run().instrument(span).await })
        };

        RunHandle {
            handles: vec![handle],
            shutdown: vec![shutdown],
        }
    }
}

/// Handle to a running worker or reaper
#[derive(Debug)]
pub struct RunHandle {
    handles: Vec<JoinHandle<()>>,
    shutdown: Vec<CancellationToken>,
}

impl RunHandle {
    /// Wait for the spawned loops to shut down.
    pub async fn wait_for_shutdown(self) {
        join_all(self.handles).await.into_iter().for_each(|result| {
            if let Err(error) = result {
                warn!(%error, "Background worker task panicked");
            }
        });
    }

    /// Ask the spawned loops to stop.
    ///
    /// A worker finishes its current batch, records every outcome and stops
    /// its job so the reaper reconciles it. A reaper finishes its tick.
    pub fn request_shutdown(&self) {
        for token in &self.shutdown {
            token.cancel();
        }
    }

    /// Request shutdown and wait up to `grace` for the loops to stop,
    /// aborting whatever is still running afterwards.
    pub async fn shutdown(self, grace: Duration) {
        self.request_shutdown();

        let abort_handles: Vec<AbortHandle> =
            self.handles.iter().map(JoinHandle::abort_handle).collect();
        if timeout(grace, self.wait_for_shutdown()).await.is_err() {
            warn!("Background workers did not stop within {grace:?}. Aborting…");
            abort_handles.iter().for_each(AbortHandle::abort);
        }
    }

    /// Abort the spawned loops.
    ///
    /// A worker interrupted mid-batch leaves its job `SENDING` and may lose
    /// outcomes of messages already sent; the reaper's stall sweep stops the
    /// job once the heartbeat is older than the stall timeout. Prefer
    /// [`RunHandle::shutdown`].
    pub fn abort(&self) {
        for handle in &self.handles {
            handle.abort();
        }
    }

    /// Merge the loops of another handle into this one.
    pub fn join(mut self, other: RunHandle) -> RunHandle {
        self.handles.extend(other.handles);
        self.shutdown.extend(other.shutdown);
        self
    }
}
