use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock};

use chrono::Utc;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

pub const ENV_LOG: &str = "SKYHARVEST_LOG";
pub const ENV_LOG_DIR: &str = "SKYHARVEST_LOG_DIR";

static RUN_LOGGER: OnceLock<RunLogger> = OnceLock::new();
static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Process-wide NDJSON sink. Writes are dropped while no run log is open.
#[derive(Debug, Default)]
struct RunLogger {
    file: Mutex<Option<BufWriter<File>>>,
}

impl RunLogger {
    fn lock(&self) -> MutexGuard<'_, Option<BufWriter<File>>> {
        self.file.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn start(&self, path: &Path) -> std::io::Result<()> {
        let mut slot = self.lock();
        if slot.is_some() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "run log already active",
            ));
        }
        let file = OpenOptions::new().create_new(true).write(true).open(path)?;
        *slot = Some(BufWriter::new(file));
        Ok(())
    }

    fn finish(&self) -> std::io::Result<()> {
        let Some(mut writer) = self.lock().take() else {
            return Ok(());
        };
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    fn writer(&self) -> RunLogWriter<'_> {
        RunLogWriter(self.lock())
    }
}

struct RunLogWriter<'a>(MutexGuard<'a, Option<BufWriter<File>>>);

impl Write for RunLogWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self.0.as_mut() {
            Some(w) => w.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.0.as_mut() {
            Some(w) => w.flush(),
            None => Ok(()),
        }
    }
}

fn build_env_filter_from(skyharvest_log: Option<&str>, rust_log: Option<&str>) -> EnvFilter {
    let default = || EnvFilter::new("info");

    if let Some(v) = skyharvest_log {
        return EnvFilter::try_new(v).unwrap_or_else(|_| default());
    }
    if let Some(v) = rust_log {
        return EnvFilter::try_new(v).unwrap_or_else(|_| default());
    }
    default()
}

fn build_env_filter() -> EnvFilter {
    build_env_filter_from(
        std::env::var(ENV_LOG).ok().as_deref(),
        std::env::var("RUST_LOG").ok().as_deref(),
    )
}

/// Installs the global subscriber once: NDJSON into the active run log (if
/// any) and, with `console`, human-readable lines on stderr.
pub fn init_logging(console: bool) {
    TRACING_INIT.get_or_init(|| {
        let logger: &'static RunLogger = RUN_LOGGER.get_or_init(RunLogger::default);
        let env_filter = build_env_filter();

        let json_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
            .with_writer(move || logger.writer());

        let console_layer = console.then(|| {
            tracing_subscriber::fmt::layer()
                .compact()
                .with_target(false)
                .with_writer(std::io::stderr)
        });

        let subscriber = tracing_subscriber::registry()
            .with(env_filter)
            .with(json_layer)
            .with(console_layer);
        let _ = subscriber.try_init();
    });
}

pub struct RunLogGuard {
    path: PathBuf,
}

impl RunLogGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLogGuard {
    fn drop(&mut self) {
        if let Some(logger) = RUN_LOGGER.get() {
            let _ = logger.finish();
        }
    }
}

/// Opens `<data_dir>/logs/ingest-<utc>-<run_id>.ndjson` and routes events
/// into it until the guard drops.
pub fn start_run_log(run_id: &str, data_dir: &Path) -> std::io::Result<RunLogGuard> {
    let log_dir = resolve_log_dir(data_dir);
    std::fs::create_dir_all(&log_dir)?;

    let file_name = format!(
        "ingest-{}-{}.ndjson",
        Utc::now().format("%Y%m%dT%H%M%SZ"),
        sanitize_filename_component(run_id)
    );
    let path = log_dir.join(file_name);

    RUN_LOGGER.get_or_init(RunLogger::default).start(&path)?;

    Ok(RunLogGuard { path })
}

fn resolve_log_dir(data_dir: &Path) -> PathBuf {
    if let Ok(v) = std::env::var(ENV_LOG_DIR) {
        return PathBuf::from(v);
    }
    data_dir.join("logs")
}

fn sanitize_filename_component(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '_' | '-' => c,
            _ => '_',
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_filter_precedence_is_skyharvest_then_rust_log_then_default() {
        let f1 = build_env_filter_from(Some("debug"), Some("warn"));
        let f2 = build_env_filter_from(None, Some("warn"));
        let f3 = build_env_filter_from(None, None);

        assert_eq!(f1.to_string(), "debug");
        assert_eq!(f2.to_string(), "warn");
        assert_eq!(f3.to_string(), "info");
    }

    #[test]
    fn run_ids_are_sanitized_for_file_names() {
        assert_eq!(sanitize_filename_component("run/1 a"), "run_1_a");
    }

    #[test]
    fn run_log_is_ndjson_and_flushed_on_drop() {
        init_logging(false);
        let temp = tempfile::tempdir().expect("create tempdir");
        let guard = start_run_log("run_test", temp.path()).expect("start_run_log");

        let expected_dir = temp.path().join("logs");
        assert_eq!(guard.path().parent(), Some(expected_dir.as_path()));

        tracing::info!(event = "ingest.start", tasks_total = 1, "ingest.start");
        tracing::warn!(event = "extract.cleanup_failed", what = "archive", "extract.cleanup_failed");
        tracing::info!(event = "ingest.finish", total_bytes = 10, "ingest.finish");

        let path = guard.path().to_path_buf();
        drop(guard);

        let text = std::fs::read_to_string(&path).expect("read run log");
        assert!(!text.trim().is_empty(), "run log is empty");

        for line in text.lines() {
            let v: serde_json::Value = serde_json::from_str(line).expect("valid json line");
            let obj = v.as_object().expect("json object");
            assert!(obj.contains_key("timestamp"));
            assert!(obj.contains_key("level"));
            let fields = obj
                .get("fields")
                .and_then(|f| f.as_object())
                .expect("fields object");
            assert!(fields.contains_key("event"));
        }
    }
}
