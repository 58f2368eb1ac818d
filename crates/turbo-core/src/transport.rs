// Pluggable HTTP transport: the seam between the engine and the network.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};

use crate::types::{DownloadError, ProbeResult};

/// Streaming response body.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// Caller-supplied byte-stream endomorphism interposed between network and
/// disk. It may change the content length (e.g. encryption) and is
/// responsible for its own framing.
pub type TransformFn = dyn Fn(ByteStream) -> ByteStream + Send + Sync;

const USER_AGENT: &str = concat!("turbo/", env!("CARGO_PKG_VERSION"));
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP operations the engine needs. The default implementation is
/// [`HttpTransport`]; tests and embedders may inject their own.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Metadata-only request: total size and range support. Redirects are
    /// followed transparently.
    async fn probe(&self, url: &str) -> Result<ProbeResult, DownloadError>;

    /// GET the resource, optionally restricted to the inclusive byte range
    /// `start..=end`. A ranged request the server answers with a full-body
    /// 200 must fail with [`DownloadError::RangeIgnored`] so a chunk window
    /// is never overrun by a whole-resource body.
    async fn fetch(
        &self,
        url: &str,
        range: Option<(u64, u64)>,
    ) -> Result<ByteStream, DownloadError>;
}

/// Default transport backed by a shared `reqwest` client.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self, DownloadError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .pool_idle_timeout(IDLE_TIMEOUT)
            .read_timeout(IDLE_TIMEOUT)
            .build()?;
        Ok(Self { client })
    }
}

fn status_error(status: reqwest::StatusCode) -> DownloadError {
    DownloadError::Http {
        status: status.as_u16(),
        message: status.canonical_reason().unwrap_or("Unknown").to_string(),
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn probe(&self, url: &str) -> Result<ProbeResult, DownloadError> {
        let response = self.client.head(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status));
        }

        let headers = response.headers();
        let total_size = headers
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let accept_ranges = headers
            .get(reqwest::header::ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.contains("bytes"))
            .unwrap_or(false);

        Ok(ProbeResult {
            url: response.url().to_string(),
            total_size,
            accept_ranges,
        })
    }

    async fn fetch(
        &self,
        url: &str,
        range: Option<(u64, u64)>,
    ) -> Result<ByteStream, DownloadError> {
        let mut request = self.client.get(url);
        if let Some((start, end)) = range {
            request = request.header(reqwest::header::RANGE, format!("bytes={start}-{end}"));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status));
        }
        if range.is_some() && status != reqwest::StatusCode::PARTIAL_CONTENT {
            return Err(DownloadError::RangeIgnored);
        }

        Ok(response.bytes_stream().map_err(io::Error::other).boxed())
    }
}
