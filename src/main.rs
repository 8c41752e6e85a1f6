use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// zlogger: virtual-cycling telemetry ingestion and race-results engine.
#[derive(Parser, Debug)]
#[command(name = "zlogger", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Tail an observer log and ingest records into storage and the bus.
    Ingest(ingestor::cli::Args),
    /// Run the race-results engine against a race config and position store.
    Results(results::cli::Args),
    /// Walk upcoming event subgroups and trigger rider-profile retrievals.
    Schedule(scheduler::cli::Args),
    /// Parse a race-configuration file and report whether it's valid.
    ConfigCheck(ConfigCheckArgs),
}

#[derive(clap::Args, Debug)]
struct ConfigCheckArgs {
    /// Path to the race-configuration file.
    config: std::path::PathBuf,
}

fn init_logging(verbose: u8) {
    let log_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Ingest(args) => {
            init_logging(args.verbose);
            ingestor::cli::run(args).await
        }
        Command::Results(args) => {
            init_logging(args.verbose);
            results::cli::run(args).await
        }
        Command::Schedule(args) => {
            init_logging(args.verbose);
            scheduler::cli::run(args).await
        }
        Command::ConfigCheck(args) => {
            init_logging(0);
            let source = std::fs::read_to_string(&args.config)
                .map_err(|e| anyhow::anyhow!("reading {}: {e}", args.config.display()))?;
            match zlog_config::parse(&source) {
                Ok(config) => {
                    println!(
                        "OK: race `{}` ({} groups), start={} finish={}",
                        config.id.as_deref().unwrap_or("<unnamed>"),
                        config.groups.len(),
                        config.start_ms,
                        config.finish_ms
                    );
                    Ok(())
                }
                Err(e) => {
                    eprintln!("INVALID: {e}");
                    std::process::exit(1);
                }
            }
        }
    }
}
