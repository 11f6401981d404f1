use clap::Parser;
use tracing_subscriber::EnvFilter;

use nestegg::api::{Cli, run_cli};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run_cli(Cli::parse()).await {
        eprintln!("{e}");
        std::process::exit(1);
    }
}
