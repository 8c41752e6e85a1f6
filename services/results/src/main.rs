use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Runs the race-results engine against a race config and the position
/// store, producing text/JSON/HTML/SQL-template output.
#[derive(Parser, Debug)]
#[command(name = "zlogger-results")]
struct Cli {
    #[command(flatten)]
    args: results::cli::Args,
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

    results::cli::run(cli.args).await
}
