use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Tails an observer log and ingests records into storage and the bus.
#[derive(Parser, Debug)]
#[command(name = "zlogger-ingestor")]
struct Cli {
    #[command(flatten)]
    args: ingestor::cli::Args,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    ingestor::cli::run(cli.args).await
}
