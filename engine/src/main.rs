// import any API only structures
cfg_if::cfg_if! {
    if #[cfg(feature = "api")] {
        mod args;

        use clap::Parser;
    }
}

#[cfg(feature = "api")]
/// Start the ingest engine API
#[tokio::main]
async fn main() {
    // load command line args
    let args = args::Args::parse();
    // load config
    let conf = ingest_engine::conf::Conf::new(&args.config).expect("Failed to load config");
    // launch our api
    Box::pin(ingest_engine::axum(conf)).await;
}

/// Main function alerting the user to compile the API with the api feature enabled
#[cfg(not(feature = "api"))]
fn main() {
    println!("To run the ingest engine API please enable the api feature");
}
