// Per-session download options, validated before any I/O happens.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::types::DownloadError;

pub const MIN_CHUNK_SIZE: u64 = 1024;
pub const DEFAULT_CHUNK_SIZE: u64 = 16 * 1024 * 1024;
pub const DEFAULT_CONCURRENCY: usize = 4;
pub const DEFAULT_RETRY_COUNT: u32 = 10;

/// Suffix appended to the destination path to locate the resume manifest.
pub const MANIFEST_SUFFIX: &str = ".turbodownload";

/// Options for a single download session.
///
/// Non-serializable collaborators (the transform stream, a custom transport,
/// event subscribers, the progress callback) attach through builder methods
/// on [`crate::engine::Downloader`] instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadOptions {
    /// Source resource.
    pub url: String,
    /// Local output path.
    pub dest_file: PathBuf,
    /// Bytes per chunk; at least [`MIN_CHUNK_SIZE`].
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    /// Maximum parallel chunk transfers; at least 1.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Retries per chunk after the first failed attempt.
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    /// Enables manifest persistence so an interrupted transfer can resume.
    #[serde(default = "default_true")]
    pub can_be_resumed: bool,
    /// Byte used to preallocate the destination file.
    #[serde(default)]
    pub fill_file_byte: u8,
}

fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

fn default_retry_count() -> u32 {
    DEFAULT_RETRY_COUNT
}

fn default_true() -> bool {
    true
}

impl DownloadOptions {
    pub fn new(url: impl Into<String>, dest_file: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            dest_file: dest_file.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
            retry_count: DEFAULT_RETRY_COUNT,
            can_be_resumed: true,
            fill_file_byte: 0,
        }
    }

    /// Reject invalid option values before any network or disk activity.
    pub fn validate(&self) -> Result<(), DownloadError> {
        let parsed = url::Url::parse(&self.url)?;
        match parsed.scheme() {
            "http" | "https" => {}
            scheme => return Err(DownloadError::UnsupportedScheme(scheme.to_string())),
        }

        if self.dest_file.as_os_str().is_empty() {
            return Err(DownloadError::Config(
                "destination file path is empty".to_string(),
            ));
        }
        if self.chunk_size < MIN_CHUNK_SIZE {
            return Err(DownloadError::Config(format!(
                "chunk size {} is below the {MIN_CHUNK_SIZE} byte minimum",
                self.chunk_size
            )));
        }
        if self.concurrency == 0 {
            return Err(DownloadError::Config(
                "concurrency must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Path of the resume manifest, stored next to the destination file.
    pub fn manifest_path(&self) -> PathBuf {
        let mut name = self.dest_file.as_os_str().to_os_string();
        name.push(MANIFEST_SUFFIX);
        PathBuf::from(name)
    }
}
