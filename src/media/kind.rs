//! Supported media kinds
//!
//! Every format the ingestion pipeline accepts is a variant of [`MediaKind`].
//! Format detection happens once, at the boundary where bytes enter the
//! pipeline; everything downstream (signature checks, canonical storage
//! format, preview strategy) dispatches on the variant instead of on
//! file-extension strings.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A media format accepted by the ingestion pipeline.
///
/// Serialized as its canonical extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    #[serde(rename = "jpg", alias = "jpeg")]
    Jpeg,
    Png,
    Gif,
    Bmp,
    Tiff,
    Webp,
    Mp4,
    Webm,
}

/// How a kind is turned into its stored representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreStrategy {
    /// Bytes are kept exactly as received; a preview is generated.
    Native,
    /// Decoded and re-encoded to JPEG; a preview is generated.
    ReencodeJpeg,
    /// Bytes are copied through; no preview.
    Passthrough,
}

impl MediaKind {
    /// All supported kinds, in signature-check order.
    pub const ALL: [MediaKind; 8] = [
        MediaKind::Jpeg,
        MediaKind::Png,
        MediaKind::Gif,
        MediaKind::Bmp,
        MediaKind::Tiff,
        MediaKind::Webp,
        MediaKind::Mp4,
        MediaKind::Webm,
    ];

    /// Canonical file extension (no leading dot).
    pub fn extension(self) -> &'static str {
        match self {
            MediaKind::Jpeg => "jpg",
            MediaKind::Png => "png",
            MediaKind::Gif => "gif",
            MediaKind::Bmp => "bmp",
            MediaKind::Tiff => "tiff",
            MediaKind::Webp => "webp",
            MediaKind::Mp4 => "mp4",
            MediaKind::Webm => "webm",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            MediaKind::Jpeg => "image/jpeg",
            MediaKind::Png => "image/png",
            MediaKind::Gif => "image/gif",
            MediaKind::Bmp => "image/bmp",
            MediaKind::Tiff => "image/tiff",
            MediaKind::Webp => "image/webp",
            MediaKind::Mp4 => "video/mp4",
            MediaKind::Webm => "video/webm",
        }
    }

    /// Parse a claimed extension. Accepts the usual aliases and ignores case
    /// and a leading dot.
    pub fn from_extension(ext: &str) -> Option<Self> {
        let ext = ext.trim_start_matches('.').to_ascii_lowercase();
        match ext.as_str() {
            "jpg" | "jpeg" | "jpe" => Some(MediaKind::Jpeg),
            "png" => Some(MediaKind::Png),
            "gif" => Some(MediaKind::Gif),
            "bmp" => Some(MediaKind::Bmp),
            "tif" | "tiff" => Some(MediaKind::Tiff),
            "webp" => Some(MediaKind::Webp),
            "mp4" | "m4v" => Some(MediaKind::Mp4),
            "webm" => Some(MediaKind::Webm),
            _ => None,
        }
    }

    /// Map a MIME type (parameters ignored) onto the allow-list.
    pub fn from_mime(mime: &str) -> Option<Self> {
        let essence = mime.split(';').next().unwrap_or("").trim();
        match essence.to_ascii_lowercase().as_str() {
            "image/jpeg" | "image/jpg" | "image/pjpeg" => Some(MediaKind::Jpeg),
            "image/png" => Some(MediaKind::Png),
            "image/gif" => Some(MediaKind::Gif),
            "image/bmp" | "image/x-ms-bmp" => Some(MediaKind::Bmp),
            "image/tiff" => Some(MediaKind::Tiff),
            "image/webp" => Some(MediaKind::Webp),
            "video/mp4" | "video/x-m4v" => Some(MediaKind::Mp4),
            "video/webm" => Some(MediaKind::Webm),
            _ => None,
        }
    }

    pub fn is_video(self) -> bool {
        matches!(self, MediaKind::Mp4 | MediaKind::Webm)
    }

    pub fn strategy(self) -> StoreStrategy {
        match self {
            MediaKind::Bmp | MediaKind::Tiff => StoreStrategy::ReencodeJpeg,
            MediaKind::Mp4 | MediaKind::Webm => StoreStrategy::Passthrough,
            _ => StoreStrategy::Native,
        }
    }

    /// The kind actually written to disk for this input kind.
    pub fn stored_kind(self) -> MediaKind {
        match self.strategy() {
            StoreStrategy::ReencodeJpeg => MediaKind::Jpeg,
            _ => self,
        }
    }

    /// The `image` crate format used to decode this kind, if it is an image.
    pub fn image_format(self) -> Option<image::ImageFormat> {
        match self {
            MediaKind::Jpeg => Some(image::ImageFormat::Jpeg),
            MediaKind::Png => Some(image::ImageFormat::Png),
            MediaKind::Gif => Some(image::ImageFormat::Gif),
            MediaKind::Bmp => Some(image::ImageFormat::Bmp),
            MediaKind::Tiff => Some(image::ImageFormat::Tiff),
            MediaKind::Webp => Some(image::ImageFormat::WebP),
            MediaKind::Mp4 | MediaKind::Webm => None,
        }
    }

    /// Check the magic-byte signature for this kind.
    ///
    /// Callers are expected to have enforced the minimum header length.
    pub fn matches_signature(self, bytes: &[u8]) -> bool {
        match self {
            MediaKind::Jpeg => bytes.starts_with(&[0xFF, 0xD8, 0xFF]),
            MediaKind::Png => {
                bytes.starts_with(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A])
            }
            MediaKind::Gif => bytes.starts_with(b"GIF8"),
            MediaKind::Bmp => bytes.starts_with(b"BM"),
            MediaKind::Tiff => {
                bytes.starts_with(&[0x49, 0x49, 0x2A, 0x00])
                    || bytes.starts_with(&[0x4D, 0x4D, 0x00, 0x2A])
            }
            MediaKind::Webp => {
                bytes.starts_with(b"RIFF") && bytes.get(8..12) == Some(b"WEBP".as_slice())
            }
            MediaKind::Mp4 => bytes.get(4..8) == Some(b"ftyp".as_slice()),
            MediaKind::Webm => bytes.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]),
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_aliases() {
        assert_eq!(MediaKind::from_extension("JPEG"), Some(MediaKind::Jpeg));
        assert_eq!(MediaKind::from_extension(".jpg"), Some(MediaKind::Jpeg));
        assert_eq!(MediaKind::from_extension("tif"), Some(MediaKind::Tiff));
        assert_eq!(MediaKind::from_extension("svg"), None);
        assert_eq!(MediaKind::from_extension(""), None);
    }

    #[test]
    fn test_from_mime_ignores_parameters() {
        assert_eq!(
            MediaKind::from_mime("image/png; charset=binary"),
            Some(MediaKind::Png)
        );
        assert_eq!(MediaKind::from_mime("video/quicktime"), None);
        assert_eq!(MediaKind::from_mime("image/svg+xml"), None);
    }

    #[test]
    fn test_stored_kind_canonicalizes_bmp_and_tiff() {
        assert_eq!(MediaKind::Bmp.stored_kind(), MediaKind::Jpeg);
        assert_eq!(MediaKind::Tiff.stored_kind(), MediaKind::Jpeg);
        assert_eq!(MediaKind::Png.stored_kind(), MediaKind::Png);
        assert_eq!(MediaKind::Webp.stored_kind(), MediaKind::Webp);
        assert_eq!(MediaKind::Mp4.stored_kind(), MediaKind::Mp4);
    }

    #[test]
    fn test_serializes_as_extension() {
        assert_eq!(serde_json::to_string(&MediaKind::Jpeg).unwrap(), "\"jpg\"");
        assert_eq!(serde_json::to_string(&MediaKind::Webm).unwrap(), "\"webm\"");
        let kind: MediaKind = serde_json::from_str("\"jpeg\"").unwrap();
        assert_eq!(kind, MediaKind::Jpeg);
        for kind in MediaKind::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.extension()));
        }
    }

    #[test]
    fn test_video_kinds_have_no_image_format() {
        for kind in MediaKind::ALL {
            assert_eq!(kind.is_video(), kind.image_format().is_none());
            assert_eq!(kind.is_video(), kind.strategy() == StoreStrategy::Passthrough);
        }
    }
}
