// Bounded-concurrency chunk scheduler with per-chunk retry and backoff.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::events::DownloadEvent;
use crate::plan::PlanStore;
use crate::types::{Chunk, DownloadError, DownloadPlan};

use super::chunk::{transfer_chunk, ProgressUpdate, TransferContext};
use super::ProgressFn;

/// Backoff before retry attempt `attempt` (1-based), quadratic in the
/// attempt index. A pure function so tests can assert the schedule.
pub(crate) fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_millis(1000 * u64::from(attempt).pow(2))
}

/// Run one chunk to completion, retrying failed attempts up to
/// `retry_count` times. An aborted session short-circuits the loop: the
/// cancelled attempt's error is returned without further attempts.
pub(crate) async fn run_chunk(
    ctx: Arc<TransferContext>,
    index: usize,
    mut chunk: Chunk,
    retry_count: u32,
    progress: mpsc::UnboundedSender<ProgressUpdate>,
    cancel: CancellationToken,
) -> Result<(), DownloadError> {
    let mut attempt: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        ctx.events.emit(DownloadEvent::ChunkStarted { chunk, attempt });
        match transfer_chunk(&ctx, index, &mut chunk, &progress, &cancel).await {
            Ok(()) => {
                ctx.events.emit(DownloadEvent::ChunkFinished { chunk, attempt });
                return Ok(());
            }
            Err(err) => {
                ctx.events.emit(DownloadEvent::ChunkError {
                    chunk,
                    attempt,
                    message: err.to_string(),
                });
                if err.is_cancelled() {
                    return Err(err);
                }

                attempt += 1;
                if attempt > retry_count {
                    return Err(DownloadError::ChunkFailed {
                        offset: chunk.offset,
                        attempts: attempt,
                        source: Box::new(err),
                    });
                }

                let delay = backoff_delay(attempt);
                tracing::warn!(
                    offset = chunk.offset,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    %err,
                    "chunk attempt failed, backing off"
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

/// Drive every incomplete chunk through a pool of at most `concurrency`
/// workers, draining per-buffer progress into the orchestrator-owned plan
/// and persisting the manifest on each tick. The first terminal error wins;
/// remaining workers are cancelled rather than restarted.
pub(crate) async fn run_scheduler(
    ctx: Arc<TransferContext>,
    plan: &mut DownloadPlan,
    concurrency: usize,
    retry_count: u32,
    store: Option<&PlanStore>,
    progress_cb: Option<&ProgressFn>,
    cancel: &CancellationToken,
) -> Result<(), DownloadError> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let scheduler_cancel = cancel.child_token();
    let mut workers = JoinSet::new();

    for (index, chunk) in plan.chunks.iter().enumerate() {
        if chunk.is_complete() {
            continue;
        }
        let ctx = Arc::clone(&ctx);
        let semaphore = Arc::clone(&semaphore);
        let tx = tx.clone();
        let token = scheduler_cancel.child_token();
        let chunk = *chunk;
        workers.spawn(async move {
            let _permit = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(DownloadError::Cancelled),
                permit = semaphore.acquire_owned() =>
                    permit.map_err(|_| DownloadError::Cancelled)?,
            };
            run_chunk(ctx, index, chunk, retry_count, tx, token).await
        });
    }
    drop(tx);

    let mut first_error: Option<DownloadError> = None;
    let mut cancelled = false;
    let mut draining = true;
    let mut joining = true;
    while draining || joining {
        tokio::select! {
            update = rx.recv(), if draining => match update {
                Some(update) => {
                    let chunk = &mut plan.chunks[update.index];
                    chunk.downloaded = chunk.downloaded.max(update.downloaded);
                    if let Some(store) = store {
                        if let Err(err) = store.save(plan).await {
                            tracing::warn!(%err, "manifest save failed, progress may be re-downloaded on resume");
                            ctx.events.emit(DownloadEvent::DownloadError {
                                url: ctx.url.clone(),
                                dest: ctx.dest.clone(),
                                message: err.to_string(),
                            });
                        }
                    }
                    if let Some(callback) = progress_cb {
                        callback(plan.downloaded(), plan.total_size, plan);
                    }
                }
                None => draining = false,
            },
            joined = workers.join_next(), if joining => match joined {
                Some(Ok(Ok(()))) => {}
                Some(Ok(Err(err))) => {
                    if err.is_cancelled() {
                        cancelled = true;
                    } else if first_error.is_none() {
                        tracing::warn!(%err, "chunk failed terminally, cancelling remaining transfers");
                        first_error = Some(err);
                        scheduler_cancel.cancel();
                    }
                }
                Some(Err(join_err)) => {
                    if first_error.is_none() {
                        first_error = Some(DownloadError::FileSystem(std::io::Error::other(
                            format!("chunk worker panicked: {join_err}"),
                        )));
                        scheduler_cancel.cancel();
                    }
                }
                None => joining = false,
            },
        }
    }

    match first_error {
        Some(err) => Err(err),
        None if cancelled => Err(DownloadError::Cancelled),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::chaos_responders::{
        FailingTransport, FlakyTransport, GaugeTransport, StaticTransport,
    };
    use crate::events::EventBus;
    use crate::plan::build_plan;
    use crate::transport::Transport;
    use crate::types::ProbeResult;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn context(dest: PathBuf, transport: Arc<dyn Transport>) -> Arc<TransferContext> {
        Arc::new(TransferContext {
            url: "http://example.com/file.bin".to_string(),
            dest,
            ranged: true,
            transport,
            transform: None,
            events: Arc::new(EventBus::new()),
        })
    }

    fn plan_for(total: u64, chunk_size: u64) -> DownloadPlan {
        build_plan(
            &ProbeResult {
                url: "http://example.com/file.bin".to_string(),
                total_size: Some(total),
                accept_ranges: true,
            },
            chunk_size,
        )
    }

    #[test]
    fn test_backoff_is_quadratic() {
        assert_eq!(backoff_delay(1), Duration::from_millis(1000));
        assert_eq!(backoff_delay(2), Duration::from_millis(4000));
        assert_eq!(backoff_delay(3), Duration::from_millis(9000));
        assert_eq!(backoff_delay(10), Duration::from_millis(100_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_attempt_count() {
        let tmp = TempDir::new().unwrap();
        let transport = Arc::new(FailingTransport::new(4096));
        let ctx = context(tmp.path().join("dest.bin"), transport.clone());
        let mut plan = plan_for(4096, 4096);

        let started = tokio::time::Instant::now();
        let cancel = CancellationToken::new();
        let err = run_scheduler(ctx, &mut plan, 1, 3, None, None, &cancel)
            .await
            .unwrap_err();

        // One initial attempt plus three retries.
        assert_eq!(transport.fetch_count(), 4);
        match err {
            DownloadError::ChunkFailed { attempts, .. } => assert_eq!(attempts, 4),
            other => panic!("expected ChunkFailed, got: {other:?}"),
        }

        // Quadratic schedule: 1s + 4s + 9s between the four attempts.
        assert!(started.elapsed() >= Duration::from_millis(14_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_after_transient_failures() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("dest.bin");
        std::fs::write(&dest, vec![0u8; 4096]).unwrap();

        let body: Vec<u8> = (0..4096u32).map(|i| (i % 255) as u8).collect();
        let transport = Arc::new(FlakyTransport::new(body.clone(), 2));
        let ctx = context(dest.clone(), transport.clone());
        let mut plan = plan_for(4096, 4096);

        let cancel = CancellationToken::new();
        run_scheduler(ctx, &mut plan, 1, 10, None, None, &cancel)
            .await
            .unwrap();

        assert_eq!(transport.attempts(), 3);
        assert_eq!(std::fs::read(&dest).unwrap(), body);
        assert!(plan.is_complete());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_is_bounded() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("dest.bin");
        let total = 16 * 1024u64;
        std::fs::write(&dest, vec![0u8; total as usize]).unwrap();

        let body = vec![0x7Fu8; total as usize];
        let transport = Arc::new(GaugeTransport::new(body, Duration::from_millis(100)));
        let ctx = context(dest, transport.clone());
        let mut plan = plan_for(total, 1024); // 16 chunks

        let cancel = CancellationToken::new();
        run_scheduler(ctx, &mut plan, 3, 0, None, None, &cancel)
            .await
            .unwrap();

        assert_eq!(transport.max_active(), 3);
        assert!(plan.is_complete());
    }

    #[tokio::test]
    async fn test_complete_chunks_are_not_dispatched() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("dest.bin");
        let body: Vec<u8> = (0..8192u32).map(|i| (i * 31 % 256) as u8).collect();
        std::fs::write(&dest, vec![0u8; 8192]).unwrap();

        let transport = Arc::new(StaticTransport::new(body));
        let ctx = context(dest, transport.clone());

        let mut plan = plan_for(8192, 4096);
        plan.chunks[0].downloaded = 4096; // already done

        let cancel = CancellationToken::new();
        run_scheduler(ctx, &mut plan, 4, 0, None, None, &cancel)
            .await
            .unwrap();

        // Only the second chunk was fetched.
        assert_eq!(transport.fetch_count(), 1);
        assert_eq!(transport.last_range(), Some((4096, 8191)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_short_circuits_retries() {
        let tmp = TempDir::new().unwrap();
        let transport = Arc::new(FailingTransport::new(4096));
        let ctx = context(tmp.path().join("dest.bin"), transport.clone());
        let mut plan = plan_for(4096, 4096);

        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = run_scheduler(ctx, &mut plan, 1, 10, None, None, &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, DownloadError::Cancelled));
        assert_eq!(transport.fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_progress_callback_sees_monotone_aggregate() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("dest.bin");
        let total = 32 * 1024u64;
        std::fs::write(&dest, vec![0u8; total as usize]).unwrap();

        let body: Vec<u8> = (0..total).map(|i| (i % 209) as u8).collect();
        let transport = Arc::new(StaticTransport::new(body.clone()));
        let ctx = context(dest.clone(), transport);
        let mut plan = plan_for(total, 4096);

        let ticks = Arc::new(std::sync::Mutex::new(Vec::<u64>::new()));
        let ticks_for_callback = ticks.clone();
        let callback = move |downloaded: u64, total_size: Option<u64>, _plan: &DownloadPlan| {
            assert_eq!(total_size, Some(total));
            ticks_for_callback.lock().unwrap().push(downloaded);
        };
        let callback: &ProgressFn = &callback;

        let cancel = CancellationToken::new();
        run_scheduler(ctx, &mut plan, 4, 0, None, Some(callback), &cancel)
            .await
            .unwrap();

        let ticks = ticks.lock().unwrap().clone();
        assert!(!ticks.is_empty());
        for window in ticks.windows(2) {
            assert!(window[1] >= window[0], "aggregate progress regressed");
        }
        assert_eq!(*ticks.last().unwrap(), total);
        assert_eq!(std::fs::read(&dest).unwrap(), body);
    }
}
