// Adversarial transport implementations for engine tests: deterministic or
// hostile stand-ins for the network, injected through the transport seam.

#![cfg(test)]

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;

use crate::transport::{ByteStream, Transport};
use crate::types::{DownloadError, ProbeResult};

fn stream_in_buffers(data: Vec<u8>) -> ByteStream {
    let buffers: Vec<std::io::Result<Bytes>> = data
        .chunks(1024)
        .map(|piece| Ok(Bytes::copy_from_slice(piece)))
        .collect();
    futures_util::stream::iter(buffers).boxed()
}

fn server_error() -> DownloadError {
    DownloadError::Http {
        status: 500,
        message: "Internal Server Error".to_string(),
    }
}

/// Serves a fixed in-memory body with range support, recording the last
/// requested range and counting fetches.
pub struct StaticTransport {
    body: Vec<u8>,
    last_range: Mutex<Option<(u64, u64)>>,
    fetch_count: AtomicU32,
}

impl StaticTransport {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            last_range: Mutex::new(None),
            fetch_count: AtomicU32::new(0),
        }
    }

    pub fn last_range(&self) -> Option<(u64, u64)> {
        *self.last_range.lock().unwrap()
    }

    pub fn fetch_count(&self) -> u32 {
        self.fetch_count.load(Ordering::SeqCst)
    }

    fn slice(&self, range: Option<(u64, u64)>) -> Vec<u8> {
        match range {
            Some((start, end)) => self.body[start as usize..=end as usize].to_vec(),
            None => self.body.clone(),
        }
    }
}

#[async_trait]
impl Transport for StaticTransport {
    async fn probe(&self, url: &str) -> Result<ProbeResult, DownloadError> {
        Ok(ProbeResult {
            url: url.to_string(),
            total_size: Some(self.body.len() as u64),
            accept_ranges: true,
        })
    }

    async fn fetch(
        &self,
        _url: &str,
        range: Option<(u64, u64)>,
    ) -> Result<ByteStream, DownloadError> {
        self.fetch_count.fetch_add(1, Ordering::SeqCst);
        *self.last_range.lock().unwrap() = range;
        Ok(stream_in_buffers(self.slice(range)))
    }
}

/// Every fetch fails with a 500. Probes succeed so the failure lands in the
/// retry loop, not the probe stage.
pub struct FailingTransport {
    total_size: u64,
    fetch_count: AtomicU32,
}

impl FailingTransport {
    pub fn new(total_size: u64) -> Self {
        Self {
            total_size,
            fetch_count: AtomicU32::new(0),
        }
    }

    pub fn fetch_count(&self) -> u32 {
        self.fetch_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for FailingTransport {
    async fn probe(&self, url: &str) -> Result<ProbeResult, DownloadError> {
        Ok(ProbeResult {
            url: url.to_string(),
            total_size: Some(self.total_size),
            accept_ranges: true,
        })
    }

    async fn fetch(
        &self,
        _url: &str,
        _range: Option<(u64, u64)>,
    ) -> Result<ByteStream, DownloadError> {
        self.fetch_count.fetch_add(1, Ordering::SeqCst);
        Err(server_error())
    }
}

/// Fails the first `fail_count` fetches, then serves the body. Exercises
/// retry recovery.
pub struct FlakyTransport {
    inner: StaticTransport,
    fail_count: u32,
    attempts: AtomicU32,
}

impl FlakyTransport {
    pub fn new(body: Vec<u8>, fail_count: u32) -> Self {
        Self {
            inner: StaticTransport::new(body),
            fail_count,
            attempts: AtomicU32::new(0),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for FlakyTransport {
    async fn probe(&self, url: &str) -> Result<ProbeResult, DownloadError> {
        self.inner.probe(url).await
    }

    async fn fetch(
        &self,
        url: &str,
        range: Option<(u64, u64)>,
    ) -> Result<ByteStream, DownloadError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.fail_count {
            return Err(server_error());
        }
        self.inner.fetch(url, range).await
    }
}

/// Serves the body but holds every fetch open for `delay`, tracking how
/// many fetches overlap. Measures scheduler concurrency.
pub struct GaugeTransport {
    inner: StaticTransport,
    delay: Duration,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl GaugeTransport {
    pub fn new(body: Vec<u8>, delay: Duration) -> Self {
        Self {
            inner: StaticTransport::new(body),
            delay,
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for GaugeTransport {
    async fn probe(&self, url: &str) -> Result<ProbeResult, DownloadError> {
        self.inner.probe(url).await
    }

    async fn fetch(
        &self,
        url: &str,
        range: Option<(u64, u64)>,
    ) -> Result<ByteStream, DownloadError> {
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        let result = self.inner.fetch(url, range).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
