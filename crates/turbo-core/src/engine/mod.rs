// Top-level download session: probe → plan → preallocate → schedule → finalize.

mod chaos_responders;
mod chunk;
pub mod prealloc;
mod scheduler;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::DownloadOptions;
use crate::events::{DownloadEvent, EventBus};
use crate::plan::{build_plan, PlanStore};
use crate::transport::{ByteStream, HttpTransport, TransformFn, Transport};
use crate::types::{DownloadError, DownloadPlan};

/// Progress callback: aggregate bytes written, total when known, and the
/// current plan. Invoked on the orchestrator's task after every persisted
/// progress tick.
pub type ProgressFn = dyn Fn(u64, Option<u64>, &DownloadPlan) + Send + Sync;

/// How a finished session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// Every chunk completed; the manifest was removed and the destination
    /// kept.
    Completed,
    /// The session was aborted; cleanup followed the save-progress flag.
    Aborted,
}

struct SessionState {
    started: AtomicBool,
    aborted: AtomicBool,
    save_progress_on_abort: AtomicBool,
    cancel: CancellationToken,
}

/// Control surface for an in-flight session, detachable from the task that
/// runs [`Downloader::download`].
#[derive(Clone)]
pub struct AbortHandle {
    state: Arc<SessionState>,
    events: Arc<EventBus>,
}

impl AbortHandle {
    /// Stop the session. Idempotent, and a no-op before `download()` is
    /// called. With `save_progress` the manifest and destination survive
    /// for a later resume; without it both are removed during finalization.
    pub fn abort(&self, save_progress: bool) {
        if !self.state.started.load(Ordering::SeqCst) {
            return;
        }
        if self.state.aborted.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state
            .save_progress_on_abort
            .store(save_progress, Ordering::SeqCst);
        tracing::info!(save_progress, "download aborted");
        self.events.emit(DownloadEvent::Aborted);
        self.state.cancel.cancel();
    }
}

/// A single-use download session.
///
/// Construction validates the options; `download()` runs the whole state
/// machine and may be called once. Collaborators that cannot live in
/// [`DownloadOptions`] — a custom transport, a transform stream, event
/// subscribers, the progress callback — attach through builder methods.
pub struct Downloader {
    options: DownloadOptions,
    transport: Arc<dyn Transport>,
    transform: Option<Arc<TransformFn>>,
    progress: Option<Box<ProgressFn>>,
    events: Arc<EventBus>,
    state: Arc<SessionState>,
}

impl Downloader {
    pub fn new(options: DownloadOptions) -> Result<Self, DownloadError> {
        options.validate()?;
        Ok(Self {
            options,
            transport: Arc::new(HttpTransport::new()?),
            transform: None,
            progress: None,
            events: Arc::new(EventBus::new()),
            state: Arc::new(SessionState {
                started: AtomicBool::new(false),
                aborted: AtomicBool::new(false),
                save_progress_on_abort: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            }),
        })
    }

    /// Replace the HTTP transport. Tests and embedders inject adapters here.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    /// Interpose a byte-stream transform between network and disk.
    pub fn with_transform(
        mut self,
        transform: impl Fn(ByteStream) -> ByteStream + Send + Sync + 'static,
    ) -> Self {
        self.transform = Some(Arc::new(transform));
        self
    }

    /// Register the progress callback `(downloaded, total, plan)`.
    pub fn on_progress(
        mut self,
        callback: impl Fn(u64, Option<u64>, &DownloadPlan) + Send + Sync + 'static,
    ) -> Self {
        self.progress = Some(Box::new(callback));
        self
    }

    /// Subscribe to session events.
    pub fn subscribe(&self, subscriber: impl Fn(&DownloadEvent) + Send + Sync + 'static) {
        self.events.subscribe(subscriber);
    }

    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            state: Arc::clone(&self.state),
            events: Arc::clone(&self.events),
        }
    }

    pub fn options(&self) -> &DownloadOptions {
        &self.options
    }

    /// Run the session to completion. Single-use: a second call fails with
    /// [`DownloadError::AlreadyStarted`].
    pub async fn download(&self) -> Result<DownloadOutcome, DownloadError> {
        if self.state.started.swap(true, Ordering::SeqCst) {
            return Err(DownloadError::AlreadyStarted);
        }
        self.events.emit(DownloadEvent::DownloadStarted {
            url: self.options.url.clone(),
            dest: self.options.dest_file.clone(),
        });

        let store = PlanStore::new(self.options.manifest_path());
        let result = self.run(&store).await;
        self.finalize(&store, result).await
    }

    async fn run(&self, store: &PlanStore) -> Result<(), DownloadError> {
        let probe = self
            .transport
            .probe(&self.options.url)
            .await
            .map_err(|err| DownloadError::Probe(Box::new(err)))?;
        tracing::debug!(
            url = %self.options.url,
            total_size = ?probe.total_size,
            accept_ranges = probe.accept_ranges,
            "probe complete"
        );

        if let Some(parent) = self.options.dest_file.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let mut resumed = None;
        if self.options.can_be_resumed {
            if let Some(plan) = store.load(&probe).await {
                if destination_intact(&self.options.dest_file, &plan).await {
                    resumed = Some(plan);
                }
            }
        }

        let mut plan = match resumed {
            Some(plan) => {
                tracing::info!(downloaded = plan.downloaded(), "resuming from manifest");
                plan
            }
            None => {
                let plan = build_plan(&probe, self.options.chunk_size);
                if let Some(total) = plan.total_size {
                    prealloc::preallocate(
                        &self.options.dest_file,
                        total,
                        self.options.fill_file_byte,
                        &self.events,
                    )
                    .await?;
                }
                plan
            }
        };
        self.events.emit(DownloadEvent::PlanReady { plan: plan.clone() });

        let store = self.options.can_be_resumed.then_some(store);
        if let Some(store) = store {
            if let Err(err) = store.save(&plan).await {
                tracing::warn!(%err, "initial manifest save failed");
            }
        }

        let ctx = Arc::new(chunk::TransferContext {
            url: self.options.url.clone(),
            dest: self.options.dest_file.clone(),
            ranged: plan.accept_ranges,
            transport: Arc::clone(&self.transport),
            transform: self.transform.clone(),
            events: Arc::clone(&self.events),
        });
        scheduler::run_scheduler(
            ctx,
            &mut plan,
            self.options.concurrency,
            self.options.retry_count,
            store,
            self.progress.as_deref(),
            &self.state.cancel,
        )
        .await
    }

    async fn finalize(
        &self,
        store: &PlanStore,
        result: Result<(), DownloadError>,
    ) -> Result<DownloadOutcome, DownloadError> {
        if self.state.aborted.load(Ordering::SeqCst) {
            // Abort wins over whatever the scheduler returned; it never
            // turns the session into a failure by itself.
            if self.state.save_progress_on_abort.load(Ordering::SeqCst) {
                tracing::info!("aborted, keeping manifest and destination for resume");
            } else {
                store.delete().await?;
                remove_if_present(&self.options.dest_file).await?;
                tracing::info!("aborted without saving progress, removed manifest and destination");
            }
            return Ok(DownloadOutcome::Aborted);
        }

        match result {
            Ok(()) => {
                store.delete().await?;
                self.events.emit(DownloadEvent::DownloadFinished {
                    url: self.options.url.clone(),
                    dest: self.options.dest_file.clone(),
                });
                tracing::info!(dest = %self.options.dest_file.display(), "download finished");
                Ok(DownloadOutcome::Completed)
            }
            Err(err) => {
                self.events.emit(DownloadEvent::DownloadError {
                    url: self.options.url.clone(),
                    dest: self.options.dest_file.clone(),
                    message: err.to_string(),
                });
                if !self.options.can_be_resumed {
                    store.delete().await?;
                }
                Err(err)
            }
        }
    }
}

/// A manifest is only trustworthy if the preallocated destination is still
/// in place; otherwise the bytes-on-disk claim cannot hold.
async fn destination_intact(path: &Path, plan: &DownloadPlan) -> bool {
    match (plan.total_size, tokio::fs::metadata(path).await) {
        (Some(total), Ok(meta)) => meta.len() == total,
        (None, Ok(_)) => true,
        (_, Err(_)) => false,
    }
}

async fn remove_if_present(path: &Path) -> Result<(), DownloadError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}
