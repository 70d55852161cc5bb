//! Ingestion orchestrator
//!
//! One ingestion runs
//! `gate -> slot check -> source -> validate -> transform -> commit files -> commit metadata`.
//! Nothing touches the filesystem until validation and transformation have
//! succeeded. File and metadata commits for one slot happen under a per-slot
//! lease so two ingestions into the same slot cannot interleave their writes.
//!
//! The orchestrator also owns slot creation and deletion, batch preview
//! regeneration, and triggers retention pruning after each commit.

mod commit;
mod lease;
pub mod pruner;
mod regenerate;
mod source;

pub use lease::SlotLeases;
pub use pruner::{PruneOutcome, Pruner};
pub use regenerate::RegenerateReport;
pub use source::{MediaSource, UploadedFile};

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;

use crate::config::SharedSettings;
use crate::media::validate::{self, DEFAULT_CATEGORY};
use crate::media::{transform, FetchError, MediaFetcher, MediaKind, TransformError, ValidationError};
use crate::server::upload_gate::{GateError, UploadGate};
use crate::store::{remove_file_if_exists, MetadataStore, StoreError, WallpaperRecord};

#[derive(Error, Debug)]
pub enum IngestError {
    #[error(transparent)]
    Gate(#[from] GateError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("slot not found: {0}")]
    SlotNotFound(String),

    #[error("no media source: send a file, a URL or a local path")]
    NoSource,

    #[error("more than one media source given")]
    MultipleSources,

    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: u64, max: u64 },

    #[error("local media paths are not enabled")]
    LocalMediaDisabled,

    #[error("I/O error: {0}")]
    Io(String),

    #[error("cancelled")]
    Cancelled,
}

/// How a failure should be treated by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed or unsupported input; never retried
    ClientInput,
    /// Rejected for safety (traversal, spoofing, SSRF); answered like
    /// client input but logged with the raw value
    Security,
    /// Network or filesystem failure
    Transient,
    /// Too many concurrent ingestions
    Busy,
    NotFound,
    Conflict,
}

impl IngestError {
    pub fn kind(&self) -> ErrorClass {
        match self {
            IngestError::Gate(GateError::TooManyUploads { .. }) => ErrorClass::Busy,
            IngestError::Gate(GateError::Closed) => ErrorClass::Transient,
            IngestError::Validation(e) if e.is_security() => ErrorClass::Security,
            IngestError::Validation(ValidationError::Io { .. }) => ErrorClass::Transient,
            IngestError::Validation(ValidationError::NotFound(_)) => ErrorClass::NotFound,
            IngestError::Validation(_) => ErrorClass::ClientInput,
            IngestError::Fetch(FetchError::Ssrf(_)) => ErrorClass::Security,
            IngestError::Fetch(
                FetchError::UrlTooLong { .. }
                | FetchError::InvalidUrl(_)
                | FetchError::ResponseTooLarge { .. },
            ) => ErrorClass::ClientInput,
            IngestError::Fetch(_) => ErrorClass::Transient,
            IngestError::Transform(TransformError::Encode(_)) => ErrorClass::Transient,
            IngestError::Transform(_) => ErrorClass::ClientInput,
            IngestError::Store(StoreError::NotFound(_)) => ErrorClass::NotFound,
            IngestError::Store(StoreError::AlreadyExists(_)) => ErrorClass::Conflict,
            IngestError::Store(_) => ErrorClass::Transient,
            IngestError::SlotNotFound(_) => ErrorClass::NotFound,
            IngestError::NoSource
            | IngestError::MultipleSources
            | IngestError::PayloadTooLarge { .. }
            | IngestError::LocalMediaDisabled => ErrorClass::ClientInput,
            IngestError::Io(_) | IngestError::Cancelled => ErrorClass::Transient,
        }
    }

    /// Stable machine-readable code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            IngestError::Gate(GateError::TooManyUploads { .. }) => "too_many_uploads",
            IngestError::Gate(GateError::Closed) => "unavailable",
            IngestError::Validation(e) => match e {
                ValidationError::InvalidPath(_) => "invalid_path",
                ValidationError::PathTraversal(_) => "path_traversal",
                ValidationError::SymlinkEscape(_) => "symlink_escape",
                ValidationError::NotFound(_) => "file_not_found",
                ValidationError::Io { .. } => "io_error",
                ValidationError::TooShort { .. } => "content_too_short",
                ValidationError::UnsupportedExtension(_) => "unsupported_extension",
                ValidationError::UnsupportedContentType(_) => "unsupported_content_type",
                ValidationError::MagicMismatch { .. } => "content_mismatch",
                ValidationError::InvalidSlotName(_) => "invalid_slot_name",
                ValidationError::ReservedSlotName(_) => "reserved_slot_name",
                ValidationError::InvalidCategory(_) => "invalid_category",
            },
            IngestError::Fetch(e) => match e {
                FetchError::Ssrf(_) => "blocked_url",
                FetchError::UrlTooLong { .. } => "url_too_long",
                FetchError::InvalidUrl(_) => "invalid_url",
                FetchError::ResponseTooLarge { .. } => "payload_too_large",
                FetchError::Timeout(_) => "fetch_timeout",
                FetchError::Cancelled => "cancelled",
                FetchError::Status(_) => "upstream_status",
                _ => "fetch_failed",
            },
            IngestError::Transform(e) => match e {
                TransformError::DimensionsTooLarge { .. } => "dimensions_too_large",
                TransformError::Decode { .. } => "decode_failed",
                TransformError::Encode(_) => "encode_failed",
                TransformError::NoPreview(_) => "no_preview",
            },
            IngestError::Store(StoreError::NotFound(_)) | IngestError::SlotNotFound(_) => {
                "slot_not_found"
            }
            IngestError::Store(StoreError::AlreadyExists(_)) => "slot_exists",
            IngestError::Store(_) => "store_error",
            IngestError::NoSource => "no_source",
            IngestError::MultipleSources => "multiple_sources",
            IngestError::PayloadTooLarge { .. } => "payload_too_large",
            IngestError::LocalMediaDisabled => "local_media_disabled",
            IngestError::Io(_) => "io_error",
            IngestError::Cancelled => "cancelled",
        }
    }
}

fn join_error(e: tokio::task::JoinError) -> IngestError {
    IngestError::Io(format!("worker task failed: {}", e))
}

/// Result of one successful ingestion.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestResult {
    pub slot: String,
    pub public_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview_url: Option<String>,
    /// Stored kind, after any re-encoding
    pub kind: MediaKind,
    pub size_bytes: u64,
    pub created_at: i64,
    pub modified_at: i64,
}

impl IngestResult {
    fn from_record(record: &WallpaperRecord, kind: MediaKind) -> Self {
        Self {
            slot: record.slot_name.clone(),
            public_url: record.public_url.clone(),
            preview_url: (!record.preview_url.is_empty()).then(|| record.preview_url.clone()),
            kind,
            size_bytes: record.size_bytes,
            created_at: record.created_at,
            modified_at: record.modified_at,
        }
    }
}

/// Runs ingestions and slot lifecycle operations against one store.
pub struct Ingestor {
    store: Arc<MetadataStore>,
    fetcher: Arc<MediaFetcher>,
    settings: SharedSettings,
    gate: UploadGate,
    pruner: Pruner,
    leases: Arc<SlotLeases>,
}

impl std::fmt::Debug for Ingestor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ingestor")
            .field("store", &self.store)
            .field("gate", &self.gate)
            .finish()
    }
}

impl Ingestor {
    /// Build the orchestrator and start its pruning task.
    ///
    /// Must be called inside a Tokio runtime. The upload gate is sized from
    /// the settings at this point; later reloads do not resize it.
    pub fn new(
        store: Arc<MetadataStore>,
        fetcher: Arc<MediaFetcher>,
        settings: SharedSettings,
    ) -> Self {
        let gate = UploadGate::new(settings.read().ingest.max_concurrent_uploads);
        let leases = Arc::new(SlotLeases::new());
        let (pruner, _) = Pruner::spawn(Arc::clone(&store), Arc::clone(&leases));
        Self {
            store,
            fetcher,
            settings,
            gate,
            pruner,
            leases,
        }
    }

    pub fn store(&self) -> &Arc<MetadataStore> {
        &self.store
    }

    pub fn settings(&self) -> &SharedSettings {
        &self.settings
    }

    pub fn gate(&self) -> &UploadGate {
        &self.gate
    }

    pub fn pruner(&self) -> &Pruner {
        &self.pruner
    }

    /// Exclusive lease on `slot` for file and metadata commits.
    async fn lease(&self, slot: &str) -> OwnedMutexGuard<()> {
        self.leases.acquire(slot).await
    }

    /// Persist metadata after a change that already took effect in memory.
    /// Failures are logged; the in-memory store stays authoritative.
    async fn persist(&self, slot: &str) {
        let store = Arc::clone(&self.store);
        let result = tokio::task::spawn_blocking(move || store.save())
            .await
            .map_err(|e| StoreError::Io(e.to_string()))
            .and_then(|r| r);
        if let Err(e) = result {
            tracing::error!(target: "store", slot, error = %e, "Failed to persist metadata");
        }
    }

    /// Create an empty slot.
    pub async fn create_slot(
        &self,
        name: &str,
        category: Option<&str>,
    ) -> Result<WallpaperRecord, IngestError> {
        validate::validate_slot_name(name)?;
        let category = category.unwrap_or_default();
        validate::validate_category(category)?;

        let now = chrono::Utc::now().timestamp();
        let record = self
            .store
            .insert_new(WallpaperRecord::empty(name, category, now))?;
        tracing::info!(target: "ingest", slot = name, "Slot created");
        self.persist(name).await;
        Ok(record)
    }

    /// Delete a slot and its files.
    pub async fn delete_slot(&self, name: &str) -> Result<(), IngestError> {
        let lease = self.lease(name).await;
        let removed = self
            .store
            .delete(name)
            .ok_or_else(|| IngestError::SlotNotFound(name.to_string()))?;

        let files: Vec<_> = [removed.original_file_path, removed.preview_file_path]
            .into_iter()
            .flatten()
            .collect();
        tokio::task::spawn_blocking(move || {
            for file in &files {
                remove_file_if_exists(file);
            }
        })
        .await
        .map_err(join_error)?;

        tracing::info!(target: "ingest", slot = name, "Slot deleted");
        self.persist(name).await;
        drop(lease);
        self.leases.forget(name);
        Ok(())
    }

    /// All slots in display order, with the default category applied.
    pub fn list_slots(&self) -> Vec<WallpaperRecord> {
        self.store
            .get_all_sorted()
            .iter()
            .cloned()
            .map(with_default_category)
            .collect()
    }

    pub fn get_slot(&self, name: &str) -> Option<WallpaperRecord> {
        self.store.get(name).map(with_default_category)
    }

    /// Ingest media from `source` into the existing slot `slot`.
    pub async fn ingest(
        &self,
        slot: &str,
        source: MediaSource,
        cancel: &CancellationToken,
    ) -> Result<IngestResult, IngestError> {
        let raw = source.describe();
        let label = source.label();

        match self.run(slot, source, cancel).await {
            Ok(result) => {
                tracing::info!(
                    target: "ingest",
                    slot,
                    source = label,
                    kind = %result.kind,
                    size = result.size_bytes,
                    "Media ingested"
                );
                Ok(result)
            }
            Err(e) => {
                match e.kind() {
                    ErrorClass::Security => tracing::warn!(
                        target: "security",
                        slot,
                        source = label,
                        value = %raw,
                        error = %e,
                        "Rejected media source"
                    ),
                    ErrorClass::Transient => tracing::error!(
                        target: "ingest",
                        slot,
                        source = label,
                        error = %e,
                        "Ingestion failed"
                    ),
                    _ => tracing::debug!(
                        target: "ingest",
                        slot,
                        source = label,
                        error = %e,
                        "Ingestion rejected"
                    ),
                }
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        slot: &str,
        source: MediaSource,
        cancel: &CancellationToken,
    ) -> Result<IngestResult, IngestError> {
        let _permit = self.gate.try_acquire()?;

        validate::validate_slot_name(slot)?;
        if !self.store.contains(slot) {
            return Err(IngestError::SlotNotFound(slot.to_string()));
        }
        let settings = self.settings.read().clone();

        let acquired = source::acquire(source, &settings, &self.fetcher, cancel).await?;
        let kind = source::detect_kind(&acquired)?;
        if cancel.is_cancelled() {
            return Err(IngestError::Cancelled);
        }

        let transform_config = settings.transform_config();
        let output = tokio::task::spawn_blocking(move || {
            transform::transform(acquired.bytes, kind, &transform_config)
        })
        .await
        .map_err(join_error)??;
        let stored_kind = output.kind;
        let size = output.original.len() as u64;

        let _lease = self.lease(slot).await;
        let previous = self
            .store
            .get(slot)
            .ok_or_else(|| IngestError::SlotNotFound(slot.to_string()))?;

        let layout = self.store.layout().clone();
        let slot_name = slot.to_string();
        let committed = tokio::task::spawn_blocking(move || {
            commit::commit_files(&layout, &slot_name, &output, &previous)
        })
        .await
        .map_err(join_error)?;

        let files = match committed {
            Ok(files) => files,
            Err(failure) => {
                if failure.original_lost {
                    if let Err(e) = self.store.update(slot, WallpaperRecord::reset_to_empty) {
                        tracing::error!(target: "store", slot, error = %e, "Failed to reset slot after lost original");
                    }
                    self.persist(slot).await;
                }
                return Err(IngestError::Io(format!(
                    "failed to commit media files: {}",
                    failure.error
                )));
            }
        };

        let now = chrono::Utc::now().timestamp();
        let record = match self
            .store
            .update(slot, |record| record.attach(stored_kind, size, now))
        {
            Ok(record) => record,
            Err(e) => {
                files.discard();
                return Err(e.into());
            }
        };
        self.persist(slot).await;

        let max_stored = settings.ingest.max_stored_images;
        if max_stored > 0 && !self.pruner.submit(max_stored) {
            tracing::warn!(target: "store", "Pruning task is not running");
        }

        Ok(IngestResult::from_record(&record, stored_kind))
    }
}

fn with_default_category(mut record: WallpaperRecord) -> WallpaperRecord {
    if record.category.is_empty() {
        record.category = DEFAULT_CATEGORY.to_string();
    }
    record
}
