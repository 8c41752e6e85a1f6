use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Walks upcoming event subgroups and triggers rider-profile retrieval
/// jobs at computed offsets before and after each subgroup's start
/// before and after each subgroup's start.
#[derive(Parser, Debug)]
#[command(name = "zlogger-scheduler")]
struct Cli {
    #[command(flatten)]
    args: scheduler::cli::Args,
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

    scheduler::cli::run(cli.args).await
}
