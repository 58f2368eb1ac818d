use serde::{Deserialize, Serialize};

// ─── Data Model ─────────────────────────────────────
//
//  probe ──▶ plan ──▶ chunks, one worker each
//
//  Chunk offsets are absolute positions in both the resource and the
//  destination file; the two coincide by construction.

/// One contiguous byte range of the resource, assigned to a single worker.
///
/// `size` is `None` when the resource length is unknown; such a plan holds
/// exactly one chunk that grows the file as it writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Absolute byte position in the resource and the destination file.
    pub offset: u64,
    /// Total byte length, `None` for an unknown-size resource.
    pub size: Option<u64>,
    /// Bytes successfully written for this chunk so far.
    pub downloaded: u64,
}

impl Chunk {
    /// Returns true once every byte of a known-size chunk is written.
    pub fn is_complete(&self) -> bool {
        matches!(self.size, Some(size) if self.downloaded >= size)
    }

    /// Bytes still to transfer, `None` when the total is unknown.
    pub fn remaining(&self) -> Option<u64> {
        self.size.map(|size| size.saturating_sub(self.downloaded))
    }

    /// Next absolute byte position to request and write.
    pub fn resume_position(&self) -> u64 {
        self.offset + self.downloaded
    }
}

/// The durable download plan: the resume identity `(total_size,
/// accept_ranges)` plus per-chunk progress. Serialized verbatim into the
/// manifest file next to the destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadPlan {
    pub total_size: Option<u64>,
    pub accept_ranges: bool,
    pub chunks: Vec<Chunk>,
}

impl DownloadPlan {
    /// Aggregate bytes written across all chunks.
    pub fn downloaded(&self) -> u64 {
        self.chunks.iter().map(|c| c.downloaded).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.chunks.iter().all(Chunk::is_complete)
    }

    /// A plan on disk is reused iff its identity matches the current probe.
    pub fn matches(&self, probe: &ProbeResult) -> bool {
        self.total_size == probe.total_size && self.accept_ranges == probe.accept_ranges
    }
}

/// What the metadata probe learned about the resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    /// Final URL after redirects.
    pub url: String,
    /// Content length, `None` when the server did not report one.
    pub total_size: Option<u64>,
    /// Whether the server advertises byte-range support.
    pub accept_ranges: bool,
}

// ─── Error Types ────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("unsupported URL scheme: {0}")]
    UnsupportedScheme(String),

    #[error("probe failed: {0}")]
    Probe(#[source] Box<DownloadError>),

    #[error("HTTP error: {status} {message}")]
    Http { status: u16, message: String },

    #[error("server ignored the range request and returned the full body")]
    RangeIgnored,

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("stream error: {0}")]
    Stream(#[source] std::io::Error),

    #[error("file system error: {0}")]
    FileSystem(#[from] std::io::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("transfer cancelled")]
    Cancelled,

    #[error("manifest save failed: {0}")]
    PlanPersist(String),

    #[error("chunk at offset {offset} failed after {attempts} attempts: {source}")]
    ChunkFailed {
        offset: u64,
        attempts: u32,
        source: Box<DownloadError>,
    },

    #[error("download session already started")]
    AlreadyStarted,
}

impl DownloadError {
    /// True for cooperative cancellation, which the orchestrator folds into
    /// a normal abort completion instead of a failure.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::ChunkFailed { source, .. } | Self::Probe(source) => source.is_cancelled(),
            _ => false,
        }
    }
}
