use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },

    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("listing failed: {message}")]
    Listing { message: String },

    #[error("download failed for {key}: {message}")]
    DownloadFailed { key: String, message: String },

    #[error("archive corrupt: {path:?}: {message}")]
    ArchiveCorrupt { path: PathBuf, message: String },

    #[error("decompression failed: {path:?}: {message}")]
    DecompressionFailed { path: PathBuf, message: String },

    #[error("worker panicked: {message}")]
    WorkerPanicked { message: String },

    #[error("cancelled")]
    Cancelled,
}

impl Error {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "config.invalid",
            Self::Io(_) => "storage.io",
            Self::Listing { .. } => "listing.failed",
            Self::DownloadFailed { .. } => "download.failed",
            Self::ArchiveCorrupt { .. } => "archive.corrupt",
            Self::DecompressionFailed { .. } => "decompress.failed",
            Self::WorkerPanicked { .. } => "worker.panicked",
            Self::Cancelled => "task.cancelled",
        }
    }
}
