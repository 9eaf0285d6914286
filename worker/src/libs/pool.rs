//! The worker pool supervisor: spawns `concurrency` claim loops and keeps them running.

use std::sync::Arc;

use ingest_engine::pipeline::handlers::Registry;
use ingest_engine::pipeline::tagger::ModelHandle;
use ingest_engine::utils::Shared;
use tokio::task::JoinHandle;

use super::job;

/// Owns the long-running worker tasks, sharing one [`Shared`], one [`Registry`], and one
/// [`ModelHandle`] across all of them (spec §4.9 "N long-running workers")
pub struct WorkerPool {
    shared: Arc<Shared>,
    registry: Arc<Registry>,
    model: Arc<ModelHandle>,
    concurrency: usize,
}

impl WorkerPool {
    #[must_use]
    pub fn new(shared: Shared, concurrency: usize) -> Self {
        WorkerPool {
            shared: Arc::new(shared),
            registry: Arc::new(Registry::new()),
            model: Arc::new(ModelHandle::stub()),
            concurrency,
        }
    }

    /// Spawn every worker and block until they all exit (they never do, short of a panic)
    pub async fn start(&self) {
        tracing::info!(concurrency = self.concurrency, "starting worker pool");
        let mut handles: Vec<JoinHandle<()>> = Vec::with_capacity(self.concurrency);
        for index in 0..self.concurrency {
            let worker_id = format!("worker-{index}");
            let shared = self.shared.clone();
            let registry = self.registry.clone();
            let model = self.model.clone();
            handles.push(tokio::spawn(async move {
                job::worker_loop(worker_id, shared, registry, model).await;
            }));
        }
        // a claim loop never returns on its own; if one does, it panicked, so respawning it
        // blind would just spin on the same bug. Surface the failure and let the process
        // supervisor (systemd, k8s) restart the whole pool instead.
        for (index, handle) in handles.into_iter().enumerate() {
            if let Err(error) = handle.await {
                tracing::error!(index, %error, "worker task exited unexpectedly");
            }
        }
    }
}
