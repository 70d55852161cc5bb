//! Slot records

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::layout::StorageLayout;
use crate::media::MediaKind;

/// Metadata for one slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WallpaperRecord {
    pub id: String,
    pub slot_name: String,
    /// Empty means "use the default category"
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub has_image: bool,
    /// Canonical stored kind; `None` for empty slots
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_kind: Option<MediaKind>,
    #[serde(default)]
    pub size_bytes: u64,
    /// Unix seconds
    #[serde(default)]
    pub modified_at: i64,
    /// Unix seconds, set once
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub public_url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub preview_url: String,

    // Derived from slot name + kind whenever the record enters a store.
    #[serde(skip)]
    pub original_file_path: Option<PathBuf>,
    #[serde(skip)]
    pub preview_file_path: Option<PathBuf>,
}

impl WallpaperRecord {
    /// A new slot with no media attached.
    pub fn empty(slot_name: &str, category: &str, now: i64) -> Self {
        Self {
            id: slot_name.to_string(),
            slot_name: slot_name.to_string(),
            category: category.to_string(),
            has_image: false,
            mime_kind: None,
            size_bytes: 0,
            modified_at: now,
            created_at: now,
            public_url: String::new(),
            preview_url: String::new(),
            original_file_path: None,
            preview_file_path: None,
        }
    }

    /// Attach freshly committed media. `created_at` is left untouched.
    pub fn attach(&mut self, kind: MediaKind, size_bytes: u64, now: i64) {
        self.has_image = true;
        self.mime_kind = Some(kind);
        self.size_bytes = size_bytes;
        self.modified_at = now.max(self.created_at);
    }

    /// Drop media fields, keeping identity, category and creation time.
    pub fn reset_to_empty(&mut self) {
        self.has_image = false;
        self.mime_kind = None;
        self.size_bytes = 0;
        self.preview_url.clear();
        self.original_file_path = None;
        self.preview_file_path = None;
    }

    /// Whether a preview file belongs to this record.
    pub fn has_preview(&self) -> bool {
        self.has_image && self.mime_kind.is_some_and(|kind| !kind.is_video())
    }

    /// Recompute URLs and file paths from the slot name and kind.
    pub fn derive_paths(&mut self, layout: &StorageLayout) {
        self.public_url = layout.public_url(&self.slot_name);

        match self.mime_kind.filter(|_| self.has_image) {
            Some(kind) => {
                self.original_file_path = Some(layout.original_path(&self.slot_name, kind));
                if kind.is_video() {
                    self.preview_file_path = None;
                    self.preview_url.clear();
                } else {
                    self.preview_file_path = Some(layout.preview_path(&self.slot_name));
                    self.preview_url = layout.preview_url(&self.slot_name);
                }
            }
            None => {
                self.has_image = false;
                self.mime_kind = None;
                self.size_bytes = 0;
                self.original_file_path = None;
                self.preview_file_path = None;
                self.preview_url.clear();
            }
        }
    }
}
