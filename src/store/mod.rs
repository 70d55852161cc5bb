//! Metadata store
//!
//! In-memory map of slot -> [`WallpaperRecord`] behind a `parking_lot::RwLock`,
//! persisted to a single JSON file by atomic replace (temp file in the same
//! directory, fsync, rename). A sorted view of all records is memoized and
//! rebuilt lazily after any mutation.

mod layout;
mod record;

pub use layout::{StorageLayout, DEFAULT_IMAGES_DIR, DEFAULT_METADATA_FILE, DEFAULT_PREVIEWS_DIR};
pub use record::WallpaperRecord;

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

/// Error types for metadata store operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Slot not found: {0}")]
    NotFound(String),
    #[error("Slot already exists: {0}")]
    AlreadyExists(String),
    #[error("IO error: {0}")]
    Io(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

#[derive(Default)]
struct Inner {
    records: HashMap<String, WallpaperRecord>,
    /// Set by every mutation; cleared when `sorted` is rebuilt.
    dirty: bool,
    sorted: Arc<Vec<WallpaperRecord>>,
}

impl Inner {
    fn mark_dirty(&mut self) {
        self.dirty = true;
    }
}

/// Slot metadata with crash-safe JSON persistence.
pub struct MetadataStore {
    layout: StorageLayout,
    inner: RwLock<Inner>,
}

impl std::fmt::Debug for MetadataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataStore")
            .field("layout", &self.layout)
            .field("records", &self.len())
            .finish()
    }
}

impl MetadataStore {
    /// Create an empty store. Nothing is read from disk.
    pub fn new(layout: StorageLayout) -> Self {
        Self {
            layout,
            inner: RwLock::new(Inner {
                dirty: true,
                ..Default::default()
            }),
        }
    }

    /// Create the storage directories and load any existing metadata.
    pub fn open(layout: StorageLayout) -> Result<Self, StoreError> {
        layout.ensure_dirs()?;
        let store = Self::new(layout);
        store.load()?;
        Ok(store)
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.read().records.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<WallpaperRecord> {
        self.inner.read().records.get(id).cloned()
    }

    /// Insert or replace `id`. Derived paths are recomputed.
    pub fn set(&self, id: &str, mut record: WallpaperRecord) {
        record.derive_paths(&self.layout);
        let mut inner = self.inner.write();
        inner.records.insert(id.to_string(), record);
        inner.mark_dirty();
    }

    /// Insert `record` only if its id is not present yet.
    pub fn insert_new(&self, mut record: WallpaperRecord) -> Result<WallpaperRecord, StoreError> {
        record.derive_paths(&self.layout);
        let mut inner = self.inner.write();
        if inner.records.contains_key(&record.id) {
            return Err(StoreError::AlreadyExists(record.id));
        }
        inner.records.insert(record.id.clone(), record.clone());
        inner.mark_dirty();
        Ok(record)
    }

    /// Apply `f` to the record for `id` under the write lock.
    pub fn update<F>(&self, id: &str, f: F) -> Result<WallpaperRecord, StoreError>
    where
        F: FnOnce(&mut WallpaperRecord),
    {
        let mut inner = self.inner.write();
        let record = inner
            .records
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        f(record);
        record.derive_paths(&self.layout);
        let updated = record.clone();
        inner.mark_dirty();
        Ok(updated)
    }

    pub fn delete(&self, id: &str) -> Option<WallpaperRecord> {
        let mut inner = self.inner.write();
        let removed = inner.records.remove(id);
        if removed.is_some() {
            inner.mark_dirty();
        }
        removed
    }

    /// All records, media-bearing first (newest modified first), then empty
    /// slots (newest created first).
    ///
    /// The returned view is shared; repeated calls without a mutation in
    /// between return the same allocation.
    pub fn get_all_sorted(&self) -> Arc<Vec<WallpaperRecord>> {
        {
            let inner = self.inner.read();
            if !inner.dirty {
                return Arc::clone(&inner.sorted);
            }
        }

        let mut inner = self.inner.write();
        // Another reader may have rebuilt while we waited for the write lock.
        if inner.dirty {
            let mut sorted: Vec<WallpaperRecord> = inner.records.values().cloned().collect();
            sorted.sort_by(sort_order);
            inner.sorted = Arc::new(sorted);
            inner.dirty = false;
            tracing::trace!(target: "store", records = inner.sorted.len(), "Rebuilt sorted view");
        }
        Arc::clone(&inner.sorted)
    }

    /// Owned copy of the sorted view for callers that mutate the records.
    pub fn get_all_sorted_copy(&self) -> Vec<WallpaperRecord> {
        self.get_all_sorted().as_ref().clone()
    }

    /// Persist all records with an atomic replace of the metadata file.
    pub fn save(&self) -> Result<(), StoreError> {
        let temp = self.write_temp()?;
        self.commit(&temp)
    }

    /// Serialize a snapshot to a fresh temp file next to the metadata file.
    fn write_temp(&self) -> Result<PathBuf, StoreError> {
        let snapshot: BTreeMap<String, WallpaperRecord> = {
            let inner = self.inner.read();
            inner
                .records
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };

        let target = self.layout.metadata_path();
        let dir = target.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)?;

        let temp = dir.join(format!(
            ".{}.{}.tmp",
            self.layout.metadata_file,
            uuid::Uuid::new_v4().simple()
        ));

        let result = (|| -> Result<(), StoreError> {
            let file = File::create(&temp)?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, &snapshot)?;
            writer.flush()?;
            let file = writer
                .into_inner()
                .map_err(|e| StoreError::Io(e.error().to_string()))?;
            file.sync_all()?;
            Ok(())
        })();

        if let Err(e) = result {
            let _ = fs::remove_file(&temp);
            return Err(e);
        }
        Ok(temp)
    }

    fn commit(&self, temp: &Path) -> Result<(), StoreError> {
        let target = self.layout.metadata_path();
        if let Err(e) = fs::rename(temp, &target) {
            let _ = fs::remove_file(temp);
            return Err(e.into());
        }
        tracing::debug!(target: "store", path = %target.display(), "Saved metadata");
        Ok(())
    }

    /// Replace the in-memory records with the persisted ones.
    ///
    /// A missing metadata file is a first run and leaves the store empty.
    pub fn load(&self) -> Result<(), StoreError> {
        let path = self.layout.metadata_path();
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let mut inner = self.inner.write();
                inner.records.clear();
                inner.mark_dirty();
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let mut records: HashMap<String, WallpaperRecord> = serde_json::from_str(&content)?;
        for (key, record) in records.iter_mut() {
            if record.slot_name.is_empty() {
                record.slot_name = key.clone();
            }
            if record.id.is_empty() {
                record.id = key.clone();
            }
            record.derive_paths(&self.layout);
        }

        tracing::info!(target: "store", path = %path.display(), records = records.len(), "Loaded metadata");

        let mut inner = self.inner.write();
        inner.records = records;
        inner.mark_dirty();
        Ok(())
    }

    /// Keep at most `max_count` media-bearing slots, emptying the oldest by
    /// modification time. Returns how many slots were emptied. `0` disables.
    ///
    /// Takes no slot leases; callers running alongside ingestion go through
    /// [`crate::ingest::Pruner`] instead.
    pub fn prune_old_images(&self, max_count: usize) -> Result<usize, StoreError> {
        let mut pruned = 0;
        for (id, modified_at) in self.prune_candidates(max_count) {
            if let Some(files) = self.reset_if_unchanged(&id, modified_at) {
                remove_files(&id, &files);
                pruned += 1;
            }
        }
        if pruned > 0 {
            self.save()?;
        }
        Ok(pruned)
    }

    /// Slots to empty so at most `max_count` keep media, oldest first, with
    /// the `modified_at` seen by the scan. Empty when `max_count` is `0`.
    pub fn prune_candidates(&self, max_count: usize) -> Vec<(String, i64)> {
        if max_count == 0 {
            return Vec::new();
        }
        let inner = self.inner.read();
        let mut with_media: Vec<&WallpaperRecord> =
            inner.records.values().filter(|r| r.has_image).collect();
        if with_media.len() <= max_count {
            return Vec::new();
        }
        with_media.sort_by(|a, b| {
            a.modified_at
                .cmp(&b.modified_at)
                .then_with(|| a.slot_name.cmp(&b.slot_name))
        });
        let excess = with_media.len() - max_count;
        with_media
            .into_iter()
            .take(excess)
            .map(|r| (r.id.clone(), r.modified_at))
            .collect()
    }

    /// Reset `id` to empty if it still has media last modified at
    /// `modified_at`. Returns the files the record pointed at; the caller
    /// removes them and persists.
    pub fn reset_if_unchanged(&self, id: &str, modified_at: i64) -> Option<Vec<PathBuf>> {
        let mut inner = self.inner.write();
        let record = inner.records.get_mut(id)?;
        if !record.has_image || record.modified_at != modified_at {
            return None;
        }
        let files = [
            record.original_file_path.clone(),
            record.preview_file_path.clone(),
        ]
        .into_iter()
        .flatten()
        .collect();
        record.reset_to_empty();
        inner.mark_dirty();
        Some(files)
    }
}

/// Remove the media files of a pruned slot.
pub fn remove_files(slot: &str, files: &[PathBuf]) {
    for file in files {
        remove_file_if_exists(file);
    }
    tracing::info!(target: "store", slot, "Pruned media from slot");
}

/// Remove `path`, treating "already gone" as success and logging other failures.
pub fn remove_file_if_exists(path: &Path) -> bool {
    match fs::remove_file(path) {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(e) => {
            tracing::warn!(
                target: "store",
                path = %path.display(),
                error = %e,
                "Failed to remove media file"
            );
            false
        }
    }
}

fn sort_order(a: &WallpaperRecord, b: &WallpaperRecord) -> Ordering {
    match (a.has_image, b.has_image) {
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (true, true) => b.modified_at.cmp(&a.modified_at),
        (false, false) => b.created_at.cmp(&a.created_at),
    }
    .then_with(|| a.slot_name.cmp(&b.slot_name))
}
