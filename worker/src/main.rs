//! The worker pool binary (spec §4.9): N long-running workers that claim jobs from the
//! engine's Job Store and drive them through the pipeline stages.

use clap::Parser;

mod args;
mod libs;

use libs::WorkerPool;

#[tokio::main]
async fn main() {
    let args = args::Args::parse();
    let conf = ingest_engine::Conf::new(&args.config).expect("Failed to load config");
    ingest_engine::utils::trace::setup("ingest-worker", &conf.tracing);
    let concurrency = conf.worker.concurrency;
    let shared = ingest_engine::utils::Shared::new(conf).await;
    let pool = WorkerPool::new(shared, concurrency);
    pool.start().await;
}
