use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::accounting::{RunAccumulator, TaskResult};
use crate::extract::{ExtractOutcome, extract_archive, remove_best_effort};
use crate::progress::{ProgressSink, TaskProgress};
use crate::selection::Task;
use crate::storage::ObjectStore;
use crate::{Error, Result};

pub const DEFAULT_WORKERS: usize = 5;

type ExtractFn = fn(&Path) -> Result<ExtractOutcome>;

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub bucket: String,
    pub concurrency: usize,
}

#[derive(Default)]
pub struct IngestOptions<'a> {
    pub cancel: Option<&'a CancellationToken>,
    pub progress: Option<&'a dyn ProgressSink>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub tasks_total: u32,
    pub totals: RunAccumulator,
    /// In completion order.
    pub results: Vec<TaskResult>,
    pub cancelled: bool,
    pub elapsed_ms: u64,
}

pub async fn run_ingest<S: ObjectStore + 'static>(
    store: Arc<S>,
    config: IngestConfig,
    tasks: Vec<Task>,
) -> Result<RunSummary> {
    run_ingest_with(store, config, tasks, IngestOptions::default()).await
}

/// Downloads and extracts every task with at most `config.concurrency` in
/// flight. Task failures are folded into the summary; only invalid
/// configuration is returned as an error.
pub async fn run_ingest_with<S: ObjectStore + 'static>(
    store: Arc<S>,
    config: IngestConfig,
    tasks: Vec<Task>,
    options: IngestOptions<'_>,
) -> Result<RunSummary> {
    drive(store, config, tasks, options, extract_archive).await
}

async fn drive<S: ObjectStore + 'static>(
    store: Arc<S>,
    config: IngestConfig,
    tasks: Vec<Task>,
    options: IngestOptions<'_>,
    extract: ExtractFn,
) -> Result<RunSummary> {
    if config.concurrency == 0 {
        return Err(Error::InvalidConfig {
            message: "concurrency must be >= 1".to_string(),
        });
    }
    let tasks_total = u32::try_from(tasks.len()).map_err(|_| Error::InvalidConfig {
        message: "too many tasks for one run".to_string(),
    })?;

    let started = Instant::now();
    info!(
        event = "ingest.start",
        provider = store.provider(),
        bucket = %config.bucket,
        tasks_total,
        concurrency = config.concurrency,
        "ingest.start"
    );

    let cancel = options.cancel.cloned().unwrap_or_default();
    let semaphore = Arc::new(Semaphore::new(config.concurrency));
    let bucket: Arc<str> = Arc::from(config.bucket.as_str());

    let mut workers = JoinSet::new();
    for task in tasks {
        workers.spawn(process_task(
            store.clone(),
            bucket.clone(),
            semaphore.clone(),
            cancel.clone(),
            task,
            extract,
        ));
    }

    let mut totals = RunAccumulator::default();
    let mut results = Vec::with_capacity(tasks_total as usize);
    while let Some(joined) = workers.join_next().await {
        let result = joined.unwrap_or_else(|e| {
            let err = Error::WorkerPanicked {
                message: e.to_string(),
            };
            error!(event = "ingest.worker_lost", error = %err, "ingest.worker_lost");
            TaskResult::failed("<unknown>".to_string(), String::new(), &err)
        });

        totals.record(&result);
        debug!(
            event = "ingest.task.finish",
            index = totals.completed_count,
            total = tasks_total,
            name = %result.display_name,
            success = result.is_success(),
            added_bytes = result.decompressed_bytes,
            total_bytes = totals.total_bytes,
            "ingest.task.finish"
        );
        if let Some(sink) = options.progress {
            sink.on_progress(TaskProgress {
                index: totals.completed_count,
                total: tasks_total,
                display_name: result.display_name.clone(),
                outcome: result.outcome.clone(),
                added_bytes: result.decompressed_bytes,
                total_bytes: totals.total_bytes,
            });
        }
        results.push(result);
    }

    let elapsed_ms = started.elapsed().as_millis() as u64;
    info!(
        event = "ingest.finish",
        tasks_total,
        completed = totals.completed_count,
        succeeded = totals.succeeded,
        failed = totals.failed,
        cancelled = totals.cancelled,
        total_bytes = totals.total_bytes,
        duration_ms = elapsed_ms,
        "ingest.finish"
    );

    Ok(RunSummary {
        tasks_total,
        totals,
        results,
        cancelled: cancel.is_cancelled(),
        elapsed_ms,
    })
}

async fn process_task<S: ObjectStore + 'static>(
    store: Arc<S>,
    bucket: Arc<str>,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
    task: Task,
    extract: ExtractFn,
) -> TaskResult {
    let display_name = task.display_name();
    let res =
        fetch_and_extract(store.as_ref(), &bucket, &semaphore, &cancel, &task, extract).await;
    match res {
        Ok(bytes) => TaskResult::succeeded(display_name, task.remote_key, bytes),
        Err(Error::Cancelled) => {
            debug!(event = "ingest.task.cancelled", name = %display_name, "ingest.task.cancelled");
            TaskResult::failed(display_name, task.remote_key, &Error::Cancelled)
        }
        Err(e) => {
            error!(
                event = "ingest.task.failed",
                name = %display_name,
                key = %task.remote_key,
                code = e.code(),
                error = %e,
                "task failed: {display_name}"
            );
            TaskResult::failed(display_name, task.remote_key, &e)
        }
    }
}

async fn fetch_and_extract<S: ObjectStore + ?Sized>(
    store: &S,
    bucket: &str,
    semaphore: &Semaphore,
    cancel: &CancellationToken,
    task: &Task,
    extract: ExtractFn,
) -> Result<u64> {
    let _permit = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(Error::Cancelled),
        permit = semaphore.acquire() => permit.map_err(|_| Error::Cancelled)?,
    };

    let archive = task.local_archive_path.clone();
    let downloaded = match store.download_to(bucket, &task.remote_key, &archive).await {
        Ok(n) => n,
        Err(e) => {
            remove_best_effort(&archive, "archive.partial_download");
            return Err(e);
        }
    };
    debug!(
        event = "ingest.task.downloaded",
        key = %task.remote_key,
        bytes = downloaded,
        "ingest.task.downloaded"
    );

    if cancel.is_cancelled() {
        warn!(
            event = "ingest.task.cancelled_after_download",
            key = %task.remote_key,
            "ingest.task.cancelled_after_download"
        );
        remove_best_effort(&archive, "archive");
        return Err(Error::Cancelled);
    }

    let outcome = tokio::task::spawn_blocking(move || extract(&archive))
        .await
        .map_err(|e| Error::WorkerPanicked {
            message: format!("extract worker: {e}"),
        })??;
    Ok(outcome.decompressed_bytes)
}
