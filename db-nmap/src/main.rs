use std::process::ExitCode;
use anyhow::{Context, Result};
use db_nmap::config::Config;
use db_nmap::scan::runner::{self, LiveScan};
use db_nmap::store::db::ScanDb;
use db_nmap::store::supervisor::{ConnectionSupervisor, SqliteConnector};
use db_nmap::store_manager::{self, Ingest, IngestTotals, StoreHandle};

const USAGE: &str = "usage: db-nmap [nmap arguments...]\n       db-nmap import FILE...";

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("db_nmap=info"))
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let import_files = match args.split_first() {
        Some((command, files)) if command == "import" => Some(files),
        Some(_) => None,
        None => {
            eprintln!("{USAGE}");
            return Ok(ExitCode::from(2));
        }
    };
    if import_files.is_some_and(<[String]>::is_empty) {
        eprintln!("{USAGE}");
        return Ok(ExitCode::from(2));
    }

    let config = Config::from_env().context("Failed to load config")?;

    // Open SQLite database
    let db = ScanDb::open(&config.database.path)?;
    tracing::info!("Opened database at {:?}", config.database.path);

    // Replays are short; only live scans get a reconnecting store
    let supervisor = import_files.is_none().then(|| {
        let connector = SqliteConnector { path: db.path().to_path_buf() };
        ConnectionSupervisor::new(connector, config.reconnect.retry_policy())
    });

    let store = StoreHandle::spawn(db, supervisor, config.merge.policy());
    let workspace_id = store
        .workspace_id(&config.workspace.name)
        .await
        .with_context(|| format!("Failed to open workspace {:?}", config.workspace.name))?;
    tracing::debug!(workspace = %config.workspace.name, workspace_id, "Using workspace");

    let ingest = Ingest::new(store.clone(), workspace_id);
    let (totals, code) = match import_files {
        Some(files) => run_import(files, ingest).await,
        None => run_live(&config, args, ingest).await?,
    };

    tracing::info!("registered {} hosts with {} services", totals.hosts, totals.services);
    if totals.failed > 0 {
        tracing::warn!("{} hosts could not be registered", totals.failed);
    }

    match store.host_count(workspace_id).await {
        Ok(count) => tracing::debug!("Workspace {:?} holds {} hosts", config.workspace.name, count),
        Err(e) => tracing::error!("Failed to count hosts: {:#}", e),
    }

    // Shutdown store thread
    if let Err(e) = store.shutdown().await {
        tracing::error!("Failed to shutdown store: {:#}", e);
    }

    Ok(code)
}

async fn run_live(config: &Config, args: Vec<String>, ingest: Ingest) -> Result<(IngestTotals, ExitCode)> {
    tokio::spawn(async {
        if runner::second_interrupt(tokio::signal::ctrl_c).await.is_ok() {
            tracing::warn!("Interrupted again, exiting without waiting for the scanner");
            std::process::exit(130);
        }
    });

    let scan = LiveScan {
        binary: config.scanner.binary.clone(),
        args,
        pipe_capacity: config.scanner.pipe_capacity,
    };

    let outcome = scan.run(ingest).await?;
    if let Ok(summary) = &outcome.decode {
        if !summary.finished {
            tracing::warn!("Scanner output ended early, {} hosts were decoded", summary.hosts);
        }
    }
    if let Some(path) = &outcome.persisted {
        tracing::info!("Report written to {}", path.display());
    }

    Ok((outcome.totals, ExitCode::from(outcome.exit_code())))
}

async fn run_import(files: &[String], mut ingest: Ingest) -> (IngestTotals, ExitCode) {
    let outcome = store_manager::import_files(files, &mut ingest).await;
    if !outcome.failed.is_empty() {
        tracing::error!("{} of {} reports could not be imported", outcome.failed.len(), files.len());
    }
    (outcome.totals, ExitCode::from(outcome.exit_code()))
}
