//! Retention pruning queue
//!
//! Prune jobs go through a channel to a single background task. Every job's
//! result is published on an outcome channel so callers (and tests) can
//! observe failures instead of losing them in a detached thread.
//!
//! Each candidate slot is reset under its lease and only if its record has
//! not changed since the scan, so a prune never removes files an ingestion
//! is about to attach.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use super::lease::SlotLeases;
use crate::store::{remove_files, MetadataStore, StoreError};

/// Result of one prune run: number of slots emptied.
pub type PruneOutcome = Result<usize, StoreError>;

const OUTCOME_CAPACITY: usize = 32;

/// Handle to the background pruning task.
#[derive(Debug, Clone)]
pub struct Pruner {
    jobs: mpsc::UnboundedSender<usize>,
    outcomes: broadcast::Sender<PruneOutcome>,
}

impl Pruner {
    /// Start the pruning task. Must be called inside a Tokio runtime.
    ///
    /// The task exits once every `Pruner` clone is dropped.
    pub fn spawn(store: Arc<MetadataStore>, leases: Arc<SlotLeases>) -> (Self, JoinHandle<()>) {
        let (jobs, mut rx) = mpsc::unbounded_channel::<usize>();
        let (outcomes, _) = broadcast::channel(OUTCOME_CAPACITY);
        let publish = outcomes.clone();

        let handle = tokio::spawn(async move {
            while let Some(mut max_count) = rx.recv().await {
                // Queued jobs collapse into the latest one.
                while let Ok(next) = rx.try_recv() {
                    max_count = next;
                }

                let outcome = prune(&store, &leases, max_count).await;
                match &outcome {
                    Ok(0) => {}
                    Ok(pruned) => {
                        tracing::info!(target: "store", pruned, max_count, "Retention pruning finished")
                    }
                    Err(e) => {
                        tracing::error!(target: "store", error = %e, max_count, "Retention pruning failed")
                    }
                }
                let _ = publish.send(outcome);
            }
        });

        (Self { jobs, outcomes }, handle)
    }

    /// Queue a prune down to `max_count` media-bearing slots. Never blocks.
    pub fn submit(&self, max_count: usize) -> bool {
        self.jobs.send(max_count).is_ok()
    }

    /// Receive outcomes of jobs that finish after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<PruneOutcome> {
        self.outcomes.subscribe()
    }
}

async fn prune(
    store: &Arc<MetadataStore>,
    leases: &SlotLeases,
    max_count: usize,
) -> PruneOutcome {
    let mut pruned = 0;
    loop {
        let candidates = store.prune_candidates(max_count);
        if candidates.is_empty() {
            break;
        }

        let mut skipped = 0;
        for (id, modified_at) in candidates {
            let _lease = leases.acquire(&id).await;
            let Some(files) = store.reset_if_unchanged(&id, modified_at) else {
                // Re-ingested or deleted since the scan.
                skipped += 1;
                continue;
            };
            tokio::task::spawn_blocking(move || remove_files(&id, &files))
                .await
                .map_err(|e| StoreError::Io(format!("prune task failed: {}", e)))?;
            pruned += 1;
        }

        // Skipped slots changed the ordering; scan again.
        if skipped == 0 {
            break;
        }
    }

    if pruned > 0 {
        let store = Arc::clone(store);
        tokio::task::spawn_blocking(move || store.save())
            .await
            .map_err(|e| StoreError::Io(format!("prune task failed: {}", e)))??;
    }
    Ok(pruned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaKind;
    use crate::store::{StorageLayout, WallpaperRecord};
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_outcome_is_published() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MetadataStore::open(StorageLayout::new(dir.path())).unwrap());
        for (slot, mtime) in [("a", 1), ("b", 2), ("c", 3)] {
            let mut record = WallpaperRecord::empty(slot, "", 0);
            record.attach(MediaKind::Png, 1, mtime);
            store.set(slot, record);
        }

        let (pruner, _handle) = Pruner::spawn(Arc::clone(&store), Arc::new(SlotLeases::new()));
        let mut outcomes = pruner.subscribe();
        assert!(pruner.submit(2));

        let outcome = tokio::time::timeout(Duration::from_secs(5), outcomes.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.unwrap(), 1);
        assert!(!store.get("a").unwrap().has_image);
    }

    #[tokio::test]
    async fn test_save_failure_is_observable() {
        let dir = TempDir::new().unwrap();
        let layout = StorageLayout::new(dir.path().join("data"));
        let store = Arc::new(MetadataStore::new(layout));
        for (slot, mtime) in [("a", 1), ("b", 2)] {
            let mut record = WallpaperRecord::empty(slot, "", 0);
            record.attach(MediaKind::Png, 1, mtime);
            store.set(slot, record);
        }
        // A file where the data directory should be makes the save fail.
        std::fs::write(dir.path().join("data"), b"not a dir").unwrap();

        let (pruner, _handle) = Pruner::spawn(Arc::clone(&store), Arc::new(SlotLeases::new()));
        let mut outcomes = pruner.subscribe();
        pruner.submit(1);

        let outcome = tokio::time::timeout(Duration::from_secs(5), outcomes.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(outcome, Err(StoreError::Io(_))));
    }

    #[tokio::test]
    async fn test_prune_waits_for_slot_lease() {
        let dir = TempDir::new().unwrap();
        let layout = StorageLayout::new(dir.path());
        let store = Arc::new(MetadataStore::open(layout.clone()).unwrap());
        for (slot, mtime) in [("a", 1), ("b", 2), ("c", 3)] {
            let mut record = WallpaperRecord::empty(slot, "", 0);
            record.attach(MediaKind::Png, 1, mtime);
            store.set(slot, record);
            std::fs::write(layout.original_path(slot, MediaKind::Png), b"img").unwrap();
            std::fs::write(layout.preview_path(slot), b"thumb").unwrap();
        }

        let leases = Arc::new(SlotLeases::new());
        let (pruner, _handle) = Pruner::spawn(Arc::clone(&store), Arc::clone(&leases));
        let mut outcomes = pruner.subscribe();

        // An ingestion into "a" holds the lease: new files are on disk but the
        // record still carries the old modification time.
        let lease = leases.acquire("a").await;
        std::fs::write(layout.original_path("a", MediaKind::Png), b"new img").unwrap();
        std::fs::write(layout.preview_path("a"), b"new thumb").unwrap();
        assert!(pruner.submit(2));

        let pending = tokio::time::timeout(Duration::from_millis(200), outcomes.recv()).await;
        assert!(pending.is_err(), "prune finished while the slot was leased");
        assert!(layout.original_path("a", MediaKind::Png).exists());

        store
            .update("a", |record| record.attach(MediaKind::Png, 7, 100))
            .unwrap();
        drop(lease);

        let outcome = tokio::time::timeout(Duration::from_secs(5), outcomes.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.unwrap(), 1);

        let a = store.get("a").unwrap();
        assert!(a.has_image);
        assert_eq!(
            std::fs::read(layout.original_path("a", MediaKind::Png)).unwrap(),
            b"new img"
        );
        assert!(layout.preview_path("a").exists());

        // The next oldest slot went instead.
        assert!(!store.get("b").unwrap().has_image);
        assert!(!layout.original_path("b", MediaKind::Png).exists());
        assert!(store.get("c").unwrap().has_image);
    }
}
