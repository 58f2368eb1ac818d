// One chunk's transfer: ranged GET, optional transform, positional writes.

use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::events::{DownloadEvent, EventBus};
use crate::transport::{TransformFn, Transport};
use crate::types::{Chunk, DownloadError};

/// Everything a chunk worker needs besides its own chunk.
pub(crate) struct TransferContext {
    pub url: String,
    pub dest: PathBuf,
    /// Whether the server honors byte ranges; without it every transfer is
    /// a full-body GET.
    pub ranged: bool,
    pub transport: Arc<dyn Transport>,
    pub transform: Option<Arc<TransformFn>>,
    pub events: Arc<EventBus>,
}

/// Per-buffer progress report from a worker to the scheduler: the chunk's
/// new cumulative `downloaded` value.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ProgressUpdate {
    pub index: usize,
    pub downloaded: u64,
}

/// Transfer the remaining bytes of `chunk` into the destination file.
///
/// `chunk.downloaded` advances by post-transform byte counts as buffers
/// reach the file, so a failed attempt leaves it at the last written
/// position and the next attempt resumes from there. Cancellation is
/// observed at every suspension point.
pub(crate) async fn transfer_chunk(
    ctx: &TransferContext,
    index: usize,
    chunk: &mut Chunk,
    progress: &mpsc::UnboundedSender<ProgressUpdate>,
    cancel: &CancellationToken,
) -> Result<(), DownloadError> {
    let range = match chunk.size {
        Some(size) if ctx.ranged => {
            let remaining = size.saturating_sub(chunk.downloaded);
            if remaining == 0 {
                return Ok(());
            }
            let start = chunk.resume_position();
            Some((start, start + remaining - 1))
        }
        // Full-body request: a partial write cannot be spliced into the
        // middle of a new response body, so restart from zero.
        _ => {
            chunk.downloaded = 0;
            None
        }
    };

    let stream = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
        result = ctx.transport.fetch(&ctx.url, range) => result?,
    };
    let mut stream = match &ctx.transform {
        Some(transform) => transform(stream),
        None => stream,
    };

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .open(&ctx.dest)
        .await?;
    if range.is_none() && chunk.size.is_none() {
        // Unknown total: the file grows as the single chunk writes.
        file.set_len(0).await?;
    }
    file.seek(SeekFrom::Start(chunk.resume_position())).await?;

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            next = stream.next() => next,
        };
        let Some(buf) = next else { break };
        let buf = buf.map_err(DownloadError::Stream)?;

        file.write_all(&buf).await?;
        chunk.downloaded += buf.len() as u64;

        ctx.events.emit(DownloadEvent::ChunkProgress { chunk: *chunk });
        let _ = progress.send(ProgressUpdate {
            index,
            downloaded: chunk.downloaded,
        });
    }
    file.flush().await?;

    Ok(())
}
