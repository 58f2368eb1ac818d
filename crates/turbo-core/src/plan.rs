// Download plan construction and the on-disk manifest store.

use std::path::{Path, PathBuf};

use crate::types::{Chunk, DownloadError, DownloadPlan, ProbeResult};

/// Partition the resource described by `probe` into `chunk_size` pieces.
///
/// An unknown size collapses to a single growing chunk; a known size on a
/// server without range support gets a single full-size chunk, since
/// parallel ranged requests are impossible either way.
pub fn build_plan(probe: &ProbeResult, chunk_size: u64) -> DownloadPlan {
    let chunks = match probe.total_size {
        Some(total) if probe.accept_ranges => split_chunks(total, chunk_size),
        Some(total) => vec![Chunk {
            offset: 0,
            size: Some(total),
            downloaded: 0,
        }],
        None => vec![Chunk {
            offset: 0,
            size: None,
            downloaded: 0,
        }],
    };

    DownloadPlan {
        total_size: probe.total_size,
        accept_ranges: probe.accept_ranges,
        chunks,
    }
}

fn split_chunks(total: u64, chunk_size: u64) -> Vec<Chunk> {
    if total == 0 {
        return vec![Chunk {
            offset: 0,
            size: Some(0),
            downloaded: 0,
        }];
    }

    let mut chunks = Vec::with_capacity(total.div_ceil(chunk_size) as usize);
    let mut offset = 0;
    while offset < total {
        let size = chunk_size.min(total - offset);
        chunks.push(Chunk {
            offset,
            size: Some(size),
            downloaded: 0,
        });
        offset += size;
    }
    chunks
}

/// Persists the plan as a pretty-printed JSON manifest next to the
/// destination file. A manifest that cannot be read, parsed, or trusted is
/// treated as absent; saving replaces the file atomically.
pub struct PlanStore {
    path: PathBuf,
}

impl PlanStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the manifest if it exists, parses, matches the probe identity,
    /// and is structurally sound. Every failure mode degrades to `None`;
    /// resume is an optimization, never a correctness requirement.
    pub async fn load(&self, probe: &ProbeResult) -> Option<DownloadPlan> {
        let contents = tokio::fs::read_to_string(&self.path).await.ok()?;
        let plan: DownloadPlan = match serde_json::from_str(&contents) {
            Ok(plan) => plan,
            Err(err) => {
                tracing::debug!(path = %self.path.display(), %err, "ignoring unparsable manifest");
                return None;
            }
        };

        if !plan.matches(probe) {
            tracing::debug!(path = %self.path.display(), "manifest identity does not match probe, ignoring");
            return None;
        }
        if !is_well_formed(&plan) {
            tracing::debug!(path = %self.path.display(), "manifest chunks are inconsistent, ignoring");
            return None;
        }

        Some(plan)
    }

    /// Atomically replace the manifest with `plan`.
    pub async fn save(&self, plan: &DownloadPlan) -> Result<(), DownloadError> {
        let contents = serde_json::to_string_pretty(plan)
            .map_err(|err| DownloadError::PlanPersist(err.to_string()))?;

        let mut tmp_name = self.path.as_os_str().to_os_string();
        tmp_name.push(".tmp");
        let tmp = PathBuf::from(tmp_name);

        tokio::fs::write(&tmp, contents)
            .await
            .map_err(|err| DownloadError::PlanPersist(err.to_string()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|err| DownloadError::PlanPersist(err.to_string()))?;
        Ok(())
    }

    /// Remove the manifest if present. Idempotent.
    pub async fn delete(&self) -> Result<(), DownloadError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Structural invariants a trustworthy manifest must satisfy: contiguous
/// ascending chunks covering exactly `[0, total_size)`, with `downloaded`
/// never past a chunk's end.
fn is_well_formed(plan: &DownloadPlan) -> bool {
    let Some(total) = plan.total_size else {
        return plan.chunks.len() == 1
            && plan.chunks[0].offset == 0
            && plan.chunks[0].size.is_none();
    };

    if plan.chunks.is_empty() {
        return false;
    }
    let mut expected_offset = 0;
    for chunk in &plan.chunks {
        let Some(size) = chunk.size else {
            return false;
        };
        if chunk.offset != expected_offset || chunk.downloaded > size {
            return false;
        }
        expected_offset += size;
    }
    expected_offset == total
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn probe(total_size: Option<u64>, accept_ranges: bool) -> ProbeResult {
        ProbeResult {
            url: "http://example.com/file.bin".to_string(),
            total_size,
            accept_ranges,
        }
    }

    #[test]
    fn test_plan_partitions_resource_exactly() {
        let plan = build_plan(&probe(Some(102_400), true), 4096);

        assert_eq!(plan.chunks.len(), 25);
        let mut expected_offset = 0;
        for chunk in &plan.chunks {
            assert_eq!(chunk.offset, expected_offset);
            assert_eq!(chunk.size, Some(4096));
            assert_eq!(chunk.downloaded, 0);
            expected_offset += 4096;
        }
        assert_eq!(expected_offset, 102_400);
    }

    #[test]
    fn test_trailing_partial_chunk() {
        let plan = build_plan(&probe(Some(10_000), true), 4096);

        assert_eq!(plan.chunks.len(), 3);
        assert_eq!(plan.chunks[2].offset, 8192);
        assert_eq!(plan.chunks[2].size, Some(10_000 - 8192));

        let total: u64 = plan.chunks.iter().filter_map(|c| c.size).sum();
        assert_eq!(total, 10_000);
    }

    #[test]
    fn test_single_chunk_when_ranges_unsupported() {
        let plan = build_plan(&probe(Some(100_000), false), 4096);

        assert_eq!(plan.chunks.len(), 1);
        assert_eq!(plan.chunks[0].size, Some(100_000));
        assert!(!plan.accept_ranges);
    }

    #[test]
    fn test_single_growing_chunk_when_size_unknown() {
        let plan = build_plan(&probe(None, true), 4096);

        assert_eq!(plan.chunks.len(), 1);
        assert_eq!(plan.chunks[0].size, None);
        assert_eq!(plan.total_size, None);
    }

    #[test]
    fn test_zero_size_resource() {
        let plan = build_plan(&probe(Some(0), true), 4096);

        assert_eq!(plan.chunks.len(), 1);
        assert_eq!(plan.chunks[0].size, Some(0));
        assert!(plan.is_complete());
    }

    #[tokio::test]
    async fn test_save_load_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let store = PlanStore::new(tmp.path().join("file.bin.turbodownload"));

        let mut plan = build_plan(&probe(Some(10_000), true), 4096);
        plan.chunks[0].downloaded = 1234;
        store.save(&plan).await.unwrap();

        let loaded = store.load(&probe(Some(10_000), true)).await.unwrap();
        assert_eq!(loaded, plan);
    }

    #[tokio::test]
    async fn test_load_missing_manifest() {
        let tmp = TempDir::new().unwrap();
        let store = PlanStore::new(tmp.path().join("missing.turbodownload"));

        assert!(store.load(&probe(Some(10_000), true)).await.is_none());
    }

    #[tokio::test]
    async fn test_corrupt_manifest_treated_as_absent() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("file.bin.turbodownload");
        tokio::fs::write(&path, "{ not json at all").await.unwrap();

        let store = PlanStore::new(path);
        assert!(store.load(&probe(Some(10_000), true)).await.is_none());
    }

    #[tokio::test]
    async fn test_identity_mismatch_treated_as_absent() {
        let tmp = TempDir::new().unwrap();
        let store = PlanStore::new(tmp.path().join("file.bin.turbodownload"));

        let plan = build_plan(&probe(Some(10_000), true), 4096);
        store.save(&plan).await.unwrap();

        // Remote file changed size since the manifest was written.
        assert!(store.load(&probe(Some(20_000), true)).await.is_none());
        // Range support changed.
        assert!(store.load(&probe(Some(10_000), false)).await.is_none());
        // Unchanged identity still loads.
        assert!(store.load(&probe(Some(10_000), true)).await.is_some());
    }

    #[tokio::test]
    async fn test_inconsistent_chunks_treated_as_absent() {
        let tmp = TempDir::new().unwrap();
        let store = PlanStore::new(tmp.path().join("file.bin.turbodownload"));

        let mut plan = build_plan(&probe(Some(10_000), true), 4096);
        plan.chunks[1].downloaded = 9999; // past the chunk's end
        store.save(&plan).await.unwrap();
        assert!(store.load(&probe(Some(10_000), true)).await.is_none());

        let mut gap = build_plan(&probe(Some(10_000), true), 4096);
        gap.chunks[1].offset += 1; // hole between chunks
        store.save(&gap).await.unwrap();
        assert!(store.load(&probe(Some(10_000), true)).await.is_none());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let store = PlanStore::new(tmp.path().join("file.bin.turbodownload"));

        store.delete().await.unwrap();

        let plan = build_plan(&probe(Some(10_000), true), 4096);
        store.save(&plan).await.unwrap();
        assert!(store.path().exists());

        store.delete().await.unwrap();
        assert!(!store.path().exists());
        store.delete().await.unwrap();
    }

    #[tokio::test]
    async fn test_save_leaves_no_temp_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("file.bin.turbodownload");
        let store = PlanStore::new(path.clone());

        let plan = build_plan(&probe(Some(10_000), true), 4096);
        store.save(&plan).await.unwrap();

        let entries: Vec<_> = std::fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![path.file_name().unwrap().to_os_string()]);
    }
}
