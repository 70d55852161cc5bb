//! File commit for one ingestion
//!
//! New files are staged next to their destination and renamed into place.
//! The original goes first, then the preview; if the preview cannot be put
//! in place the new original is removed again so the slot never points at a
//! half-written pair. Stale files from the previous media are removed only
//! after both renames succeed.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::media::TransformOutput;
use crate::store::{remove_file_if_exists, StorageLayout, WallpaperRecord};

#[derive(Debug)]
pub(crate) struct CommitFailure {
    pub error: io::Error,
    /// The previous original was overwritten and then rolled back, so the
    /// slot no longer has media on disk.
    pub original_lost: bool,
}

impl CommitFailure {
    fn new(error: io::Error) -> Self {
        Self {
            error,
            original_lost: false,
        }
    }
}

/// Paths written by a successful commit.
#[derive(Debug, Clone)]
pub(crate) struct CommittedFiles {
    pub original: PathBuf,
    pub preview: Option<PathBuf>,
}

impl CommittedFiles {
    /// Remove both files, for when metadata cannot follow.
    pub fn discard(&self) {
        remove_file_if_exists(&self.original);
        if let Some(preview) = &self.preview {
            remove_file_if_exists(preview);
        }
    }
}

/// Write `bytes` to a fresh temp file in `dir` and fsync it.
fn stage(dir: &Path, slot: &str, bytes: &[u8]) -> io::Result<PathBuf> {
    let temp = dir.join(format!(".{}.{}.tmp", slot, uuid::Uuid::new_v4().simple()));
    let result = (|| {
        let mut file = File::create(&temp)?;
        file.write_all(bytes)?;
        file.sync_all()
    })();
    match result {
        Ok(()) => Ok(temp),
        Err(e) => {
            let _ = fs::remove_file(&temp);
            Err(e)
        }
    }
}

/// Replace `path` with `bytes` through a temp file in the same directory.
pub(crate) fn write_atomic(path: &Path, slot: &str, bytes: &[u8]) -> io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let temp = stage(dir, slot, bytes)?;
    fs::rename(&temp, path).inspect_err(|_| {
        let _ = fs::remove_file(&temp);
    })
}

pub(crate) fn commit_files(
    layout: &StorageLayout,
    slot: &str,
    output: &TransformOutput,
    previous: &WallpaperRecord,
) -> Result<CommittedFiles, CommitFailure> {
    layout.ensure_dirs().map_err(CommitFailure::new)?;

    let original_path = layout.original_path(slot, output.kind);
    let preview_path = output.preview.as_ref().map(|_| layout.preview_path(slot));

    let staged_original =
        stage(&layout.images_path(), slot, &output.original).map_err(CommitFailure::new)?;
    let staged_preview = match &output.preview {
        Some(bytes) => match stage(&layout.previews_path(), slot, bytes) {
            Ok(path) => Some(path),
            Err(e) => {
                let _ = fs::remove_file(&staged_original);
                return Err(CommitFailure::new(e));
            }
        },
        None => None,
    };

    if let Err(e) = fs::rename(&staged_original, &original_path) {
        let _ = fs::remove_file(&staged_original);
        if let Some(staged) = &staged_preview {
            let _ = fs::remove_file(staged);
        }
        return Err(CommitFailure::new(e));
    }

    if let (Some(staged), Some(dest)) = (&staged_preview, &preview_path) {
        if let Err(e) = fs::rename(staged, dest) {
            let _ = fs::remove_file(staged);
            remove_file_if_exists(&original_path);
            let original_lost =
                previous.original_file_path.as_deref() == Some(original_path.as_path());
            return Err(CommitFailure {
                error: e,
                original_lost,
            });
        }
    }

    if let Some(old) = &previous.original_file_path {
        if old != &original_path {
            remove_file_if_exists(old);
        }
    }
    if preview_path.is_none() {
        if let Some(old) = &previous.preview_file_path {
            remove_file_if_exists(old);
        }
    }

    Ok(CommittedFiles {
        original: original_path,
        preview: preview_path,
    })
}
