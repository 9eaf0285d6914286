//! The bulk control-plane task processor (spec §4.10): pops `BulkTask`s pushed by the
//! engine's `POST /jobs/bulk/{action}` route and applies them, one job at a time,
//! publishing the same events a single-job action would.

use clap::Parser;

mod args;
mod libs;

use libs::EventController;

#[tokio::main]
async fn main() {
    let args = args::Args::parse();
    let conf = ingest_engine::Conf::new(&args.config).expect("Failed to load config");
    ingest_engine::utils::trace::setup("ingest-event-handler", &conf.tracing);
    let controller = EventController::new(args, conf).await;
    controller.start().await;
}
