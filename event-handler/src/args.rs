use clap::Parser;

/// The command line args passed to the bulk control-plane task processor
#[derive(Parser, Debug, Clone)]
#[clap(version, author)]
pub struct Args {
    /// The path to load the config file from
    #[clap(short, long, default_value = "ingest.yml")]
    pub config: String,
    /// How many bulk task workers to run concurrently, each blocking-popping the same
    /// Redis queue (spec §4.10 "Bulk variants... enqueue work to an in-process
    /// background task")
    #[clap(short, long, default_value_t = 4)]
    pub workers: usize,
}
