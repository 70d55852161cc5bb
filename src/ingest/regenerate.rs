//! Batch preview regeneration

use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::commit::write_atomic;
use super::{join_error, IngestError, Ingestor};
use crate::media::{transform, TransformConfig};
use crate::store::WallpaperRecord;

/// Upper bound on regeneration workers
const MAX_WORKERS: usize = 4;

/// Summary of one regeneration run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegenerateReport {
    pub total: usize,
    pub ok: usize,
    /// Empty slots and videos
    pub skipped: usize,
    pub errors: usize,
    pub failed: Vec<String>,
    /// Set when the run stopped early; unvisited slots are in no count.
    pub cancelled: bool,
}

enum ItemOutcome {
    Regenerated,
    Skipped,
    Failed(String),
    Cancelled,
}

fn worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(MAX_WORKERS)
}

impl Ingestor {
    /// Rebuild every image preview from its stored original.
    ///
    /// Per-slot failures are collected in the report. Cancellation is checked
    /// before each slot; a slot already in progress runs to completion.
    pub async fn regenerate_previews(&self, cancel: &CancellationToken) -> RegenerateReport {
        let records = self.store.get_all_sorted_copy();
        let config = self.settings.read().transform_config();
        let total = records.len();

        let outcomes: Vec<(String, ItemOutcome)> = stream::iter(records)
            .map(|record| async move {
                let slot = record.slot_name.clone();
                let outcome = self.regenerate_one(record, config, cancel).await;
                (slot, outcome)
            })
            .buffer_unordered(worker_count())
            .collect()
            .await;

        let mut report = RegenerateReport {
            total,
            ..Default::default()
        };
        for (slot, outcome) in outcomes {
            match outcome {
                ItemOutcome::Regenerated => report.ok += 1,
                ItemOutcome::Skipped => report.skipped += 1,
                ItemOutcome::Failed(error) => {
                    tracing::warn!(target: "ingest", slot = %slot, error = %error, "Preview regeneration failed");
                    report.errors += 1;
                    report.failed.push(slot);
                }
                ItemOutcome::Cancelled => report.cancelled = true,
            }
        }
        report.failed.sort();

        tracing::info!(
            target: "ingest",
            total = report.total,
            ok = report.ok,
            skipped = report.skipped,
            errors = report.errors,
            cancelled = report.cancelled,
            "Preview regeneration finished"
        );
        report
    }

    async fn regenerate_one(
        &self,
        record: WallpaperRecord,
        config: TransformConfig,
        cancel: &CancellationToken,
    ) -> ItemOutcome {
        if cancel.is_cancelled() {
            return ItemOutcome::Cancelled;
        }
        if !record.has_preview() {
            return ItemOutcome::Skipped;
        }

        let _lease = self.lease(&record.slot_name).await;
        // Re-read under the lease; the copy may be stale.
        let Some(current) = self.store.get(&record.slot_name).filter(|r| r.has_preview()) else {
            return ItemOutcome::Skipped;
        };

        let result = tokio::task::spawn_blocking(move || rebuild_preview(&current, &config))
            .await
            .map_err(join_error)
            .and_then(|r| r);

        match result {
            Ok(()) => ItemOutcome::Regenerated,
            Err(e) => ItemOutcome::Failed(e.to_string()),
        }
    }
}

fn rebuild_preview(record: &WallpaperRecord, config: &TransformConfig) -> Result<(), IngestError> {
    let (Some(kind), Some(original), Some(preview)) = (
        record.mime_kind,
        record.original_file_path.as_deref(),
        record.preview_file_path.as_deref(),
    ) else {
        return Err(IngestError::Io(format!(
            "slot {} has no stored files",
            record.slot_name
        )));
    };

    let bytes = std::fs::read(original)
        .map_err(|e| IngestError::Io(format!("{}: {}", original.display(), e)))?;
    let jpeg = transform::generate_preview(&bytes, kind, config)?;
    write_atomic(preview, &record.slot_name, &jpeg)
        .map_err(|e| IngestError::Io(format!("{}: {}", preview.display(), e)))?;
    Ok(())
}
