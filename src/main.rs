use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use charger_scar::api::{self, AppState};
use charger_scar::config::AppConfig;
use charger_scar::logging::init_logging;
use charger_scar::models::MonitoringQuery;
use charger_scar::monitoring;
use charger_scar::projections::CauseTable;
use charger_scar::store::{EventSource, SqliteEventStore};

/// Charger telemetry analytics API
#[derive(Debug, Parser)]
#[command(name = "charger-scar", version, about)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true, env = "CHARGER_SCAR_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite event store path
    #[arg(long, global = true, env = "CHARGER_SCAR_DB")]
    database: Option<PathBuf>,

    /// Listen address for `serve`
    #[arg(long, global = true, env = "CHARGER_SCAR_BIND")]
    bind: Option<String>,

    /// Tracing filter, e.g. `info` or `charger_scar=debug`
    #[arg(long, global = true, env = "CHARGER_SCAR_LOG")]
    log: Option<String>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP API (default)
    Serve,
    /// Append telemetry documents from a JSON-lines file
    Import { file: PathBuf },
    /// Print sessions and SCAR statistics as JSON
    Report {
        /// Charger serial number; repeat for several
        #[arg(long = "serial")]
        serials: Vec<String>,
        /// First day, YYYY-MM-DD
        #[arg(long)]
        start: Option<String>,
        /// Last day, YYYY-MM-DD
        #[arg(long)]
        end: Option<String>,
        /// Also list sessions that never reached a terminal status
        #[arg(long)]
        include_in_progress: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load(cli.config.as_deref())
        .context("failed to load configuration")?
        .with_bind(cli.bind)
        .with_database(cli.database)
        .with_log_filter(cli.log);
    init_logging(&config, cli.verbose);

    let store = SqliteEventStore::open(&config.database)
        .with_context(|| format!("failed to open {}", config.database.display()))?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(&config, store).await,
        Command::Import { file } => {
            let count = store
                .import_jsonl(&file)
                .with_context(|| format!("failed to import {}", file.display()))?;
            println!("imported {count} events");
            Ok(())
        }
        Command::Report {
            serials,
            start,
            end,
            include_in_progress,
        } => {
            let query = MonitoringQuery {
                serial_nos: Some(serials),
                start_date: start,
                end_date: end,
                include_in_progress,
                ..Default::default()
            };
            report(&store, &query)
        }
    }
}

async fn serve(config: &AppConfig, store: SqliteEventStore) -> Result<()> {
    let addr = config.socket_addr()?;
    let app = api::router(AppState::new(store));

    info!("Server running on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn report(store: &SqliteEventStore, query: &MonitoringQuery) -> Result<()> {
    let filter = monitoring::filter_from_query(query)?;
    let causes = CauseTable::new(store.list_cause_codes()?);
    let events = store.fetch_events(&filter)?;
    let report = monitoring::session_report(&events, &causes, monitoring::dangling_policy(query));
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
