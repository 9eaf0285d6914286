use clap::Parser;

/// The command line args passed to the ingest engine API
#[derive(Parser, Debug)]
#[clap(version, author)]
pub struct Args {
    /// The path to load the config file from
    #[clap(short, long, default_value = "ingest.yml")]
    pub config: String,
}
