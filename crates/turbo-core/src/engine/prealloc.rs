// Destination preallocation: fill the file to its final size up front so
// concurrent positional writes land in fully materialized regions.

use std::path::Path;

use tokio::io::AsyncWriteExt;

use crate::events::{DownloadEvent, EventBus};
use crate::types::DownloadError;

const FILL_BUF_SIZE: usize = 64 * 1024;

/// Create (or truncate) `path` and write `size` bytes of `fill_byte`.
///
/// Skipped entirely by the orchestrator when the resource size is unknown;
/// that branch uses a single chunk that grows the file as it writes.
pub async fn preallocate(
    path: &Path,
    size: u64,
    fill_byte: u8,
    events: &EventBus,
) -> Result<(), DownloadError> {
    events.emit(DownloadEvent::ReservingSpaceStarted { size });
    tracing::debug!(path = %path.display(), size, "reserving space");

    let mut file = tokio::fs::File::create(path).await?;
    let buf = vec![fill_byte; FILL_BUF_SIZE];
    let mut remaining = size;
    while remaining > 0 {
        let n = remaining.min(FILL_BUF_SIZE as u64) as usize;
        file.write_all(&buf[..n]).await?;
        remaining -= n as u64;
    }
    file.flush().await?;

    events.emit(DownloadEvent::ReservingSpaceFinished { size });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_fills_file_with_byte() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("dest.bin");
        let events = EventBus::new();

        preallocate(&path, 150_000, 0x5A, &events).await.unwrap();

        let contents = std::fs::read(&path).unwrap();
        assert_eq!(contents.len(), 150_000);
        assert!(contents.iter().all(|&b| b == 0x5A));
    }

    #[tokio::test]
    async fn test_truncates_existing_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("dest.bin");
        std::fs::write(&path, vec![0xFF; 1_000_000]).unwrap();

        let events = EventBus::new();
        preallocate(&path, 1000, 0, &events).await.unwrap();

        let contents = std::fs::read(&path).unwrap();
        assert_eq!(contents.len(), 1000);
        assert!(contents.iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn test_zero_size() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("empty.bin");
        let events = EventBus::new();

        preallocate(&path, 0, 0, &events).await.unwrap();

        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_emits_bracketing_events() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("dest.bin");

        let events = EventBus::new();
        let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        events.subscribe(move |event| {
            let name = match event {
                DownloadEvent::ReservingSpaceStarted { size } => format!("started:{size}"),
                DownloadEvent::ReservingSpaceFinished { size } => format!("finished:{size}"),
                _ => return,
            };
            sink.lock().unwrap().push(name);
        });

        preallocate(&path, 2048, 0, &events).await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["started:2048".to_string(), "finished:2048".to_string()]
        );
    }
}
