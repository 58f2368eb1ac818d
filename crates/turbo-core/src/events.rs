// Session event surface: a synchronous observer registry.

use std::path::PathBuf;
use std::sync::RwLock;

use crate::types::{Chunk, DownloadPlan};

/// Everything observable about a session, emitted synchronously at the
/// point it happens. Dispatch is fire-and-forget; subscribers are supplied
/// by the host layer.
#[derive(Debug, Clone)]
pub enum DownloadEvent {
    DownloadStarted { url: String, dest: PathBuf },
    DownloadFinished { url: String, dest: PathBuf },
    DownloadError { url: String, dest: PathBuf, message: String },
    ChunkStarted { chunk: Chunk, attempt: u32 },
    ChunkProgress { chunk: Chunk },
    ChunkFinished { chunk: Chunk, attempt: u32 },
    ChunkError { chunk: Chunk, attempt: u32, message: String },
    PlanReady { plan: DownloadPlan },
    Aborted,
    ReservingSpaceStarted { size: u64 },
    ReservingSpaceFinished { size: u64 },
}

type Subscriber = Box<dyn Fn(&DownloadEvent) + Send + Sync>;

/// Observer registry shared by every component of a session. Subscribers
/// run in registration order on the emitting task; a subscriber cannot fail
/// a transfer.
#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<Vec<Subscriber>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, subscriber: impl Fn(&DownloadEvent) + Send + Sync + 'static) {
        if let Ok(mut subscribers) = self.subscribers.write() {
            subscribers.push(Box::new(subscriber));
        }
    }

    pub fn emit(&self, event: DownloadEvent) {
        // A poisoned registry means a subscriber panicked earlier; emission
        // stays fire-and-forget rather than propagating that.
        if let Ok(subscribers) = self.subscribers.read() {
            for subscriber in subscribers.iter() {
                subscriber(&event);
            }
        }
    }
}
