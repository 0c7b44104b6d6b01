mod accounting;
pub mod config;
mod error;
mod extract;
mod pipeline;
mod progress;
pub mod run_log;
mod selection;
mod storage;

pub const APP_NAME: &str = "SkyHarvest";

pub use accounting::{RunAccumulator, TaskOutcome, TaskResult};
pub use error::{Error, Result};
pub use extract::{
    ARCHIVE_SUFFIX, ExtractOutcome, PAYLOAD_SUFFIX, extract_archive, output_path_for_archive,
};
pub use pipeline::{
    DEFAULT_WORKERS, IngestConfig, IngestOptions, RunSummary, run_ingest, run_ingest_with,
};
pub use progress::{ProgressSink, TaskProgress};
pub use selection::{
    MIN_OBJECT_BYTES, Selection, SelectionConfig, Task, is_candidate, local_archive_path,
    select_tasks,
};
pub use storage::{
    InMemoryStore, ListPage, ObjectStore, ObjectSummary, S3AnonymousStore,
    S3AnonymousStoreConfig, parse_list_objects_v2,
};
