use std::env;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use shopwatch_sync::{run_ingest, AppConfig, SyncPipeline};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "shopwatch-cli")]
#[command(about = "Normalize vendor sales CSVs and watch pages for price changes")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, short, global = true, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest CSVs, check watched targets and send notifications.
    Run,
    /// Only normalize and summarize the input CSVs.
    Ingest,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("SHOPWATCH_LOG")
        .unwrap_or_else(|_| EnvFilter::new("shopwatch=info,warn"));
    let format = env::var("SHOPWATCH_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());
    let registry = tracing_subscriber::registry().with(filter);

    match format.as_str() {
        "json" => registry.with(fmt::layer().json().with_ansi(false)).init(),
        _ => registry.with(fmt::layer().compact()).init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = AppConfig::load(&cli.config)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let now = chrono::Local::now().naive_local();
            let summary = SyncPipeline::new(config)?.run_once(now).await?;
            println!(
                "run complete: files={} normalized={} errors={} targets={} notifications={}",
                summary.files,
                summary.normalized,
                summary.errors,
                summary.targets.len(),
                summary.notifications_sent()
            );
        }
        Commands::Ingest => {
            let report = run_ingest(&config.csv)?;
            println!("ingest complete: {}", report.counts_line());
        }
    }

    Ok(())
}
