//! The controller for the bulk control-plane task processor: owns the shared connection
//! pools and supervises a small pool of task workers, all popping the same Redis queue.

use std::sync::Arc;
use std::time::Duration;

use ingest_engine::utils::Shared;
use tokio::task::JoinHandle;

use super::worker::BulkWorker;
use crate::args::Args;

/// Supervises the bulk task workers (spec §4.10 "Bulk variants are accepted-immediately...
/// enqueue work to an in-process background task")
pub struct EventController {
    shared: Arc<Shared>,
    worker_count: usize,
    handles: Vec<JoinHandle<()>>,
}

impl EventController {
    /// Build the shared connection pools and prepare (but don't yet spawn) the worker pool
    ///
    /// # Arguments
    ///
    /// * `args` - The command line args passed to this process
    /// * `conf` - The engine config, shared with the `engine`/`worker` binaries
    pub async fn new(args: Args, conf: ingest_engine::Conf) -> Self {
        let shared = Shared::new(conf).await;
        EventController {
            shared: Arc::new(shared),
            worker_count: args.workers.max(1),
            handles: Vec::new(),
        }
    }

    /// Spawn every bulk task worker
    pub fn spawn(&mut self) {
        self.handles.reserve(self.worker_count);
        for index in 0..self.worker_count {
            let worker = BulkWorker::new(format!("bulk-worker-{index}"), self.shared.clone());
            self.handles.push(tokio::spawn(worker.start()));
        }
    }

    /// Check whether any worker task has exited; a worker only ever exits on panic, since
    /// its loop is infinite, so a finished handle here means something broke
    async fn check_tasks(&mut self) {
        let mut still_running = Vec::with_capacity(self.handles.len());
        for handle in self.handles.drain(..) {
            if handle.is_finished() {
                if let Err(error) = handle.await {
                    tracing::error!(%error, "bulk task worker exited unexpectedly");
                }
            } else {
                still_running.push(handle);
            }
        }
        self.handles = still_running;
    }

    /// Spawn the worker pool and supervise it forever, respawning nothing (mirrors the
    /// main worker pool's policy of surfacing a crashed task rather than blindly retrying)
    pub async fn start(mut self) {
        tracing::info!(workers = self.worker_count, "starting bulk control-plane task processor");
        self.spawn();
        loop {
            self.check_tasks().await;
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    }
}
