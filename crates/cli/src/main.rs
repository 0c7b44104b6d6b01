use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use human_bytes::human_bytes;
use serde::Serialize;
use skyharvest_core::config::{IngestSettings, load_settings};
use skyharvest_core::run_log::{init_logging, start_run_log};
use skyharvest_core::{
    APP_NAME, IngestOptions, ProgressSink, RunSummary, S3AnonymousStore, SelectionConfig,
    TaskOutcome, TaskProgress, run_ingest_with, select_tasks,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "skyharvest")]
#[command(about = "Fetch and unpack OpenSky state-vector sample archives", long_about = None)]
struct Cli {
    #[arg(long)]
    json: bool,

    #[arg(long)]
    events: bool,

    /// TOML settings file; environment variables and flags override it.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    storage_root: Option<PathBuf>,

    #[arg(long)]
    max_tasks: Option<usize>,

    #[arg(long)]
    workers: Option<usize>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Download, extract and account the selected archives.
    Run {
        /// Also write an NDJSON run log next to the storage root.
        #[arg(long)]
        run_log: bool,
    },
    /// Print the archives a run would fetch.
    List,
}

#[derive(Debug, Serialize)]
struct CliError {
    code: &'static str,
    message: String,
    retryable: bool,
}

impl CliError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: false,
        }
    }

    fn retryable(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: true,
        }
    }
}

struct ConsoleProgressSink;

impl ProgressSink for ConsoleProgressSink {
    fn on_progress(&self, p: TaskProgress) {
        match p.outcome {
            TaskOutcome::Succeeded => println!(
                "[{}/{}] done: {} (+{}) -> total (csv): {}",
                p.index,
                p.total,
                p.display_name,
                human_bytes(p.added_bytes as f64),
                human_bytes(p.total_bytes as f64)
            ),
            TaskOutcome::Empty => println!(
                "[{}/{}] skipped (no payload): {}",
                p.index, p.total, p.display_name
            ),
            TaskOutcome::Failed { code, .. } => println!(
                "[{}/{}] skipped/failed: {} ({code})",
                p.index, p.total, p.display_name
            ),
            TaskOutcome::Cancelled => println!(
                "[{}/{}] cancelled: {}",
                p.index, p.total, p.display_name
            ),
        }
    }
}

struct NdjsonProgressSink {
    run_id: String,
}

impl ProgressSink for NdjsonProgressSink {
    fn on_progress(&self, p: TaskProgress) {
        let line = serde_json::json!({
            "type": "task.progress",
            "runId": self.run_id,
            "index": p.index,
            "total": p.total,
            "name": p.display_name,
            "outcome": p.outcome,
            "addedBytes": p.added_bytes,
            "totalBytes": p.total_bytes,
        });
        println!("{line}");
    }
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_logging(true);

    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            emit_error(&e);
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let settings = resolve_settings(&cli)?;

    match cli.cmd {
        Command::Run { run_log } => ingest_run(settings, run_log, cli.json, cli.events).await,
        Command::List => list_run(settings, cli.json).await,
    }
}

fn resolve_settings(cli: &Cli) -> Result<IngestSettings, CliError> {
    let mut settings = load_settings(cli.config.as_deref()).map_err(map_core_err)?;
    settings.apply_env().map_err(map_core_err)?;

    if let Some(root) = &cli.storage_root {
        settings.storage_root = root.clone();
    }
    if let Some(n) = cli.max_tasks {
        settings.max_tasks = n;
    }
    if let Some(n) = cli.workers {
        settings.workers = n;
    }

    settings.validate().map_err(map_core_err)?;
    Ok(settings)
}

fn prepare_storage_root(root: &Path, quiet: bool) -> Result<(), CliError> {
    if root.is_dir() {
        if !quiet {
            println!("Saving data to: {}", root.display());
        }
        return Ok(());
    }
    std::fs::create_dir_all(root).map_err(|e| CliError::new("storage.io", e.to_string()))?;
    if !quiet {
        println!("Created target directory: {}", root.display());
    }
    Ok(())
}

fn open_store(settings: &IngestSettings) -> Result<Arc<S3AnonymousStore>, CliError> {
    S3AnonymousStore::new(settings.store_config())
        .map(Arc::new)
        .map_err(map_core_err)
}

async fn ingest_run(
    settings: IngestSettings,
    run_log: bool,
    json: bool,
    events: bool,
) -> Result<(), CliError> {
    let quiet = json || events;
    prepare_storage_root(&settings.storage_root, quiet)?;
    let store = open_store(&settings)?;

    let run_id = format!("run_{}", uuid::Uuid::new_v4().simple());
    let _log_guard = if run_log {
        let data_dir = settings
            .storage_root
            .parent()
            .unwrap_or(&settings.storage_root);
        Some(
            start_run_log(&run_id, data_dir)
                .map_err(|e| CliError::new("log.open_failed", e.to_string()))?,
        )
    } else {
        None
    };

    info!(
        event = "selection.start",
        workers = settings.workers,
        bucket = %settings.bucket,
        max_tasks = settings.max_tasks,
        "initialising {} workers, scanning bucket '{}' (limit: {})",
        settings.workers,
        settings.bucket,
        settings.max_tasks
    );
    let selection = select_tasks(store.as_ref(), &settings.selection_config())
        .await
        .map_err(map_core_err)?;
    info!(
        event = "selection.done",
        tasks = selection.tasks.len(),
        skipped_existing = selection.skipped_existing,
        "{} new files found, starting parallel processing",
        selection.tasks.len()
    );

    if events {
        println!(
            "{}",
            serde_json::json!({
                "type": "run.state",
                "runId": run_id,
                "state": "running",
                "tasksTotal": selection.tasks.len(),
            })
        );
    }

    let cancel = CancellationToken::new();
    let cancel_on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!(
                event = "ingest.interrupt",
                "interrupt received; finishing in-flight tasks"
            );
            cancel_on_signal.cancel();
        }
    });

    let console = ConsoleProgressSink;
    let ndjson = NdjsonProgressSink {
        run_id: run_id.clone(),
    };
    let progress: Option<&dyn ProgressSink> = if events {
        Some(&ndjson)
    } else if json {
        None
    } else {
        Some(&console)
    };

    let summary = run_ingest_with(
        store,
        settings.ingest_config(),
        selection.tasks,
        IngestOptions {
            cancel: Some(&cancel),
            progress,
        },
    )
    .await
    .map_err(map_core_err)?;

    report_summary(&summary, &settings.storage_root, &run_id, json, events)
}

fn report_summary(
    summary: &RunSummary,
    storage_root: &Path,
    run_id: &str,
    json: bool,
    events: bool,
) -> Result<(), CliError> {
    if events {
        println!(
            "{}",
            serde_json::json!({
                "type": "run.state",
                "runId": run_id,
                "state": if summary.cancelled { "cancelled" } else { "finished" },
                "totals": summary.totals,
            })
        );
        return Ok(());
    }

    if json {
        println!(
            "{}",
            serde_json::to_string(summary)
                .map_err(|e| CliError::new("output.encode_failed", e.to_string()))?
        );
        return Ok(());
    }

    println!("{}", "-".repeat(40));
    if summary.cancelled {
        println!(
            "Interrupted after {} of {} tasks.",
            summary.totals.completed_count - summary.totals.cancelled,
            summary.tasks_total
        );
    }
    println!(
        "Done. Disk space used (uncompressed): {}",
        human_bytes(summary.totals.total_bytes as f64)
    );
    println!(
        "succeeded={} failed={} empty={}",
        summary.totals.succeeded, summary.totals.failed, summary.totals.empty
    );
    println!("Data located in: {}", storage_root.display());
    Ok(())
}

async fn list_run(settings: IngestSettings, json: bool) -> Result<(), CliError> {
    let store = open_store(&settings)?;
    let dry_run = SelectionConfig {
        create_dirs: false,
        ..settings.selection_config()
    };

    let selection = select_tasks(store.as_ref(), &dry_run)
        .await
        .map_err(map_core_err)?;

    if json {
        let tasks: Vec<_> = selection
            .tasks
            .iter()
            .map(|t| {
                serde_json::json!({
                    "remoteKey": t.remote_key,
                    "localArchivePath": t.local_archive_path,
                    "outputPath": t.output_path(),
                })
            })
            .collect();
        println!(
            "{}",
            serde_json::json!({
                "tasks": tasks,
                "skippedExisting": selection.skipped_existing,
            })
        );
        return Ok(());
    }

    for t in &selection.tasks {
        println!("{} -> {}", t.remote_key, t.output_path().display());
    }
    println!(
        "tasks={} skippedExisting={}",
        selection.tasks.len(),
        selection.skipped_existing
    );
    Ok(())
}

fn map_core_err(e: skyharvest_core::Error) -> CliError {
    match e {
        skyharvest_core::Error::InvalidConfig { message } => {
            CliError::new("config.invalid", message)
        }
        skyharvest_core::Error::Listing { message } => {
            CliError::retryable("listing.failed", format!("{APP_NAME}: {message}"))
        }
        other => CliError::new(other.code(), other.to_string()),
    }
}

fn emit_error(e: &CliError) {
    let json = serde_json::to_string(e).unwrap_or_else(|_| {
        "{\"code\":\"unknown\",\"message\":\"json encode failed\",\"retryable\":false}".to_string()
    });
    let _ = writeln!(std::io::stderr(), "{json}");
}
