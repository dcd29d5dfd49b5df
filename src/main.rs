//! CLI entry point for asset-relay.

use anyhow::{Context, Result};
use asset_relay::events::EventLog;
use asset_relay::logging::{default_level, init_tracing};
use asset_relay::{FailureLedger, RelayConfig};
use clap::Parser;
use tracing::{debug, info};

mod cli;

use cli::{Args, Command, ConfigAction, LedgerAction};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    init_tracing(default_level(args.verbose, args.quiet), args.no_color);
    debug!(?args, "CLI arguments parsed");

    let config = match &args.config {
        Some(path) => RelayConfig::load(path),
        None => RelayConfig::load_default(),
    }
    .context("Failed to load configuration")?;

    match args.command {
        Command::Ledger { action } => run_ledger_command(&config, action).await,
        Command::Config {
            action: ConfigAction::Show,
        } => {
            let rendered = config
                .to_toml_string()
                .context("Failed to render configuration")?;
            print!("{rendered}");
            Ok(())
        }
        Command::Events { limit } => run_events_command(&config, limit).await,
    }
}

async fn run_ledger_command(config: &RelayConfig, action: LedgerAction) -> Result<()> {
    let ledger = FailureLedger::new(&config.ledger_path);
    match action {
        LedgerAction::Show { json } => {
            let records = ledger.load_all().await.with_context(|| {
                format!("Failed to read ledger '{}'", config.ledger_path.display())
            })?;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&records).context("Failed to encode ledger")?
                );
                return Ok(());
            }
            if records.is_empty() {
                println!("No failed transfers recorded.");
                return Ok(());
            }
            for record in &records {
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    record.timestamp, record.kind, record.file_name, record.destination, record.error
                );
            }
            println!("{} failed transfer(s)", records.len());
        }
        LedgerAction::Clear => {
            let count = ledger.len().await.unwrap_or(0);
            ledger.clear().await.with_context(|| {
                format!("Failed to clear ledger '{}'", config.ledger_path.display())
            })?;
            info!(cleared = count, "failure ledger cleared");
            println!("Cleared {count} ledger entr{}", if count == 1 { "y" } else { "ies" });
        }
    }
    Ok(())
}

async fn run_events_command(config: &RelayConfig, limit: usize) -> Result<()> {
    let log = EventLog::new(&config.event_log_path);
    let events = log.read_all().await.with_context(|| {
        format!("Failed to read event log '{}'", config.event_log_path.display())
    })?;
    let start = events.len().saturating_sub(limit);
    for event in &events[start..] {
        let detail = event.detail.as_deref().unwrap_or("");
        println!(
            "{}\t{:?}\t{}\t{}\t{detail}",
            event.timestamp, event.event, event.task_id, event.name
        );
    }
    Ok(())
}
