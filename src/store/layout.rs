//! On-disk layout for slot media and metadata.

use std::path::{Path, PathBuf};

use crate::media::transform::PREVIEW_KIND;
use crate::media::MediaKind;

pub const DEFAULT_METADATA_FILE: &str = "wallpapers.json";
pub const DEFAULT_IMAGES_DIR: &str = "images";
pub const DEFAULT_PREVIEWS_DIR: &str = "previews";

/// Where a store keeps its files and how slots map to public URLs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLayout {
    pub data_dir: PathBuf,
    pub metadata_file: String,
    pub images_dir: String,
    pub previews_dir: String,
    /// Prefix for public URLs, without a trailing slash ("" serves at `/<slot>`).
    pub public_base: String,
}

impl StorageLayout {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            metadata_file: DEFAULT_METADATA_FILE.to_string(),
            images_dir: DEFAULT_IMAGES_DIR.to_string(),
            previews_dir: DEFAULT_PREVIEWS_DIR.to_string(),
            public_base: String::new(),
        }
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.data_dir.join(&self.metadata_file)
    }

    pub fn images_path(&self) -> PathBuf {
        self.data_dir.join(&self.images_dir)
    }

    pub fn previews_path(&self) -> PathBuf {
        self.data_dir.join(&self.previews_dir)
    }

    /// Original file for `slot` stored as `kind`.
    pub fn original_path(&self, slot: &str, kind: MediaKind) -> PathBuf {
        self.images_path().join(format!("{}.{}", slot, kind.extension()))
    }

    pub fn preview_path(&self, slot: &str) -> PathBuf {
        self.previews_path().join(format!("{}.{}", slot, PREVIEW_KIND.extension()))
    }

    pub fn public_url(&self, slot: &str) -> String {
        format!("{}/{}", self.public_base, slot)
    }

    pub fn preview_url(&self, slot: &str) -> String {
        format!("{}/preview/{}", self.public_base, slot)
    }

    /// Create the data, images and previews directories.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(self.images_path())?;
        std::fs::create_dir_all(self.previews_path())?;
        Ok(())
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}
