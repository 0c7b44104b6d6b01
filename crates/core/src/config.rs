use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::pipeline::{DEFAULT_WORKERS, IngestConfig};
use crate::selection::{MIN_OBJECT_BYTES, SelectionConfig};
use crate::storage::{
    DEFAULT_BUCKET, DEFAULT_ENDPOINT, DEFAULT_PREFIX, POOL_HEADROOM, S3AnonymousStoreConfig,
};
use crate::{Error, Result};

pub const ENV_STORAGE_ROOT: &str = "OPENSKY_DOWNLOAD_PATH";
pub const ENV_MAX_TASKS: &str = "MAX_FILES";
pub const ENV_WORKERS: &str = "MAX_WORKERS";

pub const DEFAULT_MAX_TASKS: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestSettings {
    pub storage_root: PathBuf,
    pub max_tasks: usize,
    pub workers: usize,
    pub endpoint: String,
    pub bucket: String,
    pub prefix: String,
    pub min_object_bytes: u64,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            storage_root: default_storage_root(),
            max_tasks: DEFAULT_MAX_TASKS,
            workers: DEFAULT_WORKERS,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            bucket: DEFAULT_BUCKET.to_string(),
            prefix: DEFAULT_PREFIX.to_string(),
            min_object_bytes: MIN_OBJECT_BYTES,
        }
    }
}

/// `<cwd>/data/raw`
pub fn default_storage_root() -> PathBuf {
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join("data")
        .join("raw")
}

pub fn load_settings(path: Option<&Path>) -> Result<IngestSettings> {
    let Some(path) = path else {
        return Ok(IngestSettings::default());
    };

    let text = std::fs::read_to_string(path).map_err(|e| Error::InvalidConfig {
        message: format!("config read failed: {}: {e}", path.display()),
    })?;
    parse_settings(&text).map_err(|e| Error::InvalidConfig {
        message: format!("config invalid: {e}"),
    })
}

pub fn parse_settings(text: &str) -> std::result::Result<IngestSettings, toml::de::Error> {
    toml::from_str(text)
}

impl IngestSettings {
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|k| std::env::var(k).ok())
    }

    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let get = |k: &str| lookup(k).filter(|v| !v.trim().is_empty());

        if let Some(v) = get(ENV_STORAGE_ROOT) {
            self.storage_root = PathBuf::from(v);
        }
        if let Some(v) = get(ENV_MAX_TASKS) {
            self.max_tasks = parse_count(ENV_MAX_TASKS, &v)?;
        }
        if let Some(v) = get(ENV_WORKERS) {
            self.workers = parse_count(ENV_WORKERS, &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers < 1 {
            return Err(Error::InvalidConfig {
                message: "workers must be >= 1".to_string(),
            });
        }
        if self.bucket.trim().is_empty() {
            return Err(Error::InvalidConfig {
                message: "bucket must not be empty".to_string(),
            });
        }
        if !(self.endpoint.starts_with("https://") || self.endpoint.starts_with("http://")) {
            return Err(Error::InvalidConfig {
                message: format!("endpoint must be an http(s) url: {}", self.endpoint),
            });
        }
        if self.storage_root.as_os_str().is_empty() {
            return Err(Error::InvalidConfig {
                message: "storage_root must not be empty".to_string(),
            });
        }
        Ok(())
    }

    pub fn selection_config(&self) -> SelectionConfig {
        SelectionConfig {
            bucket: self.bucket.clone(),
            prefix: self.prefix.clone(),
            storage_root: self.storage_root.clone(),
            max_tasks: self.max_tasks,
            min_object_bytes: self.min_object_bytes,
            create_dirs: true,
        }
    }

    pub fn ingest_config(&self) -> IngestConfig {
        IngestConfig {
            bucket: self.bucket.clone(),
            concurrency: self.workers,
        }
    }

    pub fn store_config(&self) -> S3AnonymousStoreConfig {
        S3AnonymousStoreConfig {
            endpoint: self.endpoint.clone(),
            max_connections: self.workers + POOL_HEADROOM,
        }
    }
}

fn parse_count(name: &str, value: &str) -> Result<usize> {
    value.trim().parse::<usize>().map_err(|e| Error::InvalidConfig {
        message: format!("{name} must be a non-negative integer (got {value:?}): {e}"),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults_match_the_public_bucket() {
        let s = IngestSettings::default();
        assert_eq!(s.max_tasks, 5);
        assert_eq!(s.workers, 5);
        assert_eq!(s.bucket, "data-samples");
        assert_eq!(s.prefix, "states/");
        assert!(s.storage_root.ends_with("data/raw"));
        assert_eq!(s.store_config().max_connections, 10);
        s.validate().unwrap();
    }

    #[test]
    fn env_overrides_file_values() {
        let mut s = parse_settings("max_tasks = 20\nworkers = 2\n").unwrap();
        let env: HashMap<&str, &str> = [
            (ENV_STORAGE_ROOT, "/srv/opensky"),
            (ENV_WORKERS, " 8 "),
            (ENV_MAX_TASKS, ""),
        ]
        .into_iter()
        .collect();

        s.apply_env_from(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(s.storage_root, PathBuf::from("/srv/opensky"));
        assert_eq!(s.workers, 8);
        assert_eq!(s.max_tasks, 20);
    }

    #[test]
    fn non_numeric_env_is_rejected() {
        let mut s = IngestSettings::default();
        let err = s
            .apply_env_from(|k| (k == ENV_MAX_TASKS).then(|| "many".to_string()))
            .unwrap_err();
        assert_eq!(err.code(), "config.invalid");
    }

    #[test]
    fn validation_rejects_zero_workers_and_bad_endpoint() {
        let s = IngestSettings {
            workers: 0,
            ..IngestSettings::default()
        };
        assert!(s.validate().is_err());

        let s = IngestSettings {
            endpoint: "s3.opensky-network.org".to_string(),
            ..IngestSettings::default()
        };
        assert!(s.validate().is_err());
    }

    #[test]
    fn load_settings_reads_toml_file() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("skyharvest.toml");
        std::fs::write(&path, "bucket = \"other\"\nmin_object_bytes = 1\n").unwrap();

        let s = load_settings(Some(&path)).unwrap();
        assert_eq!(s.bucket, "other");
        assert_eq!(s.min_object_bytes, 1);
        assert_eq!(s.workers, 5);

        let missing = load_settings(Some(&temp.path().join("nope.toml"))).unwrap_err();
        assert_eq!(missing.code(), "config.invalid");
    }
}
