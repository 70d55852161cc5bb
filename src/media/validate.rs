//! Content validation
//!
//! Pure checks applied to untrusted input before anything touches the
//! filesystem:
//! - relative local paths (NUL bytes, absolute/drive/UNC forms, `..`)
//! - base-directory containment, including symlink resolution
//! - magic-byte signatures against a claimed extension
//! - slot names and categories
//! - content sniffing over the first 512 bytes

use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

use super::kind::MediaKind;

/// Minimum number of bytes any supported header needs.
pub const MIN_HEADER_LEN: usize = 16;

/// Number of leading bytes inspected when sniffing a content type.
pub const SNIFF_LEN: usize = 512;

/// Names that collide with routes or well-known files.
pub const RESERVED_SLOT_NAMES: &[&str] = &[
    "api",
    "admin",
    "preview",
    "previews",
    "images",
    "static",
    "assets",
    "health",
    "login",
    "logout",
    "favicon.ico",
    "robots.txt",
];

/// Categories a slot may be filed under. The empty string is also accepted.
pub const CATEGORIES: &[&str] = &["desktop", "mobile", "avatar", "banner"];

/// Category applied at read time when a record has none.
pub const DEFAULT_CATEGORY: &str = "desktop";

static SLOT_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,63}$").expect("slot name pattern is valid")
});

/// Validation failures. All of these are client-input or security errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("invalid local path: {0}")]
    InvalidPath(String),

    #[error("path escapes the media root: {0}")]
    PathTraversal(String),

    #[error("symlink resolves outside the media root: {0}")]
    SymlinkEscape(String),

    #[error("file not found: {0}")]
    NotFound(String),

    #[error("cannot inspect path {path}: {message}")]
    Io { path: String, message: String },

    #[error("content too short to be media ({len} bytes)")]
    TooShort { len: usize },

    #[error("unsupported file extension: {0}")]
    UnsupportedExtension(String),

    #[error("unsupported content type: {0}")]
    UnsupportedContentType(String),

    #[error("content does not match claimed type .{claimed}")]
    MagicMismatch { claimed: String },

    #[error("invalid slot name: {0}")]
    InvalidSlotName(String),

    #[error("slot name is reserved: {0}")]
    ReservedSlotName(String),

    #[error("unknown category: {0}")]
    InvalidCategory(String),
}

impl ValidationError {
    /// Whether this rejection is a security event (traversal, spoofing)
    /// rather than plain malformed input.
    pub fn is_security(&self) -> bool {
        matches!(
            self,
            ValidationError::InvalidPath(_)
                | ValidationError::PathTraversal(_)
                | ValidationError::SymlinkEscape(_)
                | ValidationError::MagicMismatch { .. }
        )
    }
}

/// Check that `path` is a safe relative path.
///
/// Rejects NUL bytes, POSIX-absolute paths, drive-letter and UNC forms, and
/// anything containing `..`. Pure; performs no I/O.
pub fn validate_local_path(path: &str) -> bool {
    if path.is_empty() || path.contains('\0') {
        return false;
    }
    if path.starts_with('/') || path.starts_with('\\') {
        return false;
    }
    let bytes = path.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        return false;
    }
    if path.contains("..") {
        return false;
    }

    // Whatever remains must name something below the root once cleaned.
    let segments: Vec<&str> = path
        .split(['/', '\\'])
        .filter(|s| !s.is_empty() && *s != ".")
        .collect();
    !segments.is_empty()
}

/// Lexically normalise a path: drop `.` components and fold `..` into its
/// parent without consulting the filesystem.
fn clean_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// A relative path resolved under a base directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    /// Cleaned `base/rel`.
    pub abs: PathBuf,
    /// `abs` with symlinks resolved. Equal to `abs` when the base does not exist.
    pub real: PathBuf,
}

/// Resolve `rel` under `base`, enforcing containment twice: once lexically
/// and once after symlink resolution against the resolved base.
///
/// When `base` itself does not exist only the lexical check applies.
pub fn resolve_within_base(base: &Path, rel: &str) -> Result<ResolvedPath, ValidationError> {
    if !validate_local_path(rel) {
        return Err(ValidationError::InvalidPath(rel.to_string()));
    }

    let base_abs = std::path::absolute(base).map_err(|e| ValidationError::Io {
        path: base.display().to_string(),
        message: e.to_string(),
    })?;
    let base_clean = clean_path(&base_abs);
    let abs = clean_path(&base_clean.join(rel));
    if !abs.starts_with(&base_clean) {
        return Err(ValidationError::PathTraversal(rel.to_string()));
    }

    let real_base = match std::fs::canonicalize(&base_clean) {
        Ok(p) => p,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Ok(ResolvedPath {
                real: abs.clone(),
                abs,
            });
        }
        Err(e) => {
            return Err(ValidationError::Io {
                path: base_clean.display().to_string(),
                message: e.to_string(),
            })
        }
    };

    let real = std::fs::canonicalize(&abs).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            ValidationError::NotFound(rel.to_string())
        } else {
            ValidationError::Io {
                path: abs.display().to_string(),
                message: e.to_string(),
            }
        }
    })?;
    if !real.starts_with(&real_base) {
        return Err(ValidationError::SymlinkEscape(rel.to_string()));
    }

    Ok(ResolvedPath { abs, real })
}

/// Check that `bytes` carry the signature of `claimed_ext`.
///
/// Fails closed: unknown extensions and inputs shorter than
/// [`MIN_HEADER_LEN`] are rejected.
pub fn validate_content_matches_extension(
    bytes: &[u8],
    claimed_ext: &str,
) -> Result<MediaKind, ValidationError> {
    if bytes.len() < MIN_HEADER_LEN {
        return Err(ValidationError::TooShort { len: bytes.len() });
    }
    let kind = MediaKind::from_extension(claimed_ext)
        .ok_or_else(|| ValidationError::UnsupportedExtension(claimed_ext.to_string()))?;
    if !kind.matches_signature(bytes) {
        return Err(ValidationError::MagicMismatch {
            claimed: claimed_ext.to_string(),
        });
    }
    Ok(kind)
}

/// Sniff the content type from the first [`SNIFF_LEN`] bytes.
///
/// Returns the detected MIME type, if any. It may be outside the allow-list.
pub fn sniff_content_type(bytes: &[u8]) -> Option<&'static str> {
    let window = &bytes[..bytes.len().min(SNIFF_LEN)];
    infer::get(window).map(|t| t.mime_type())
}

/// Reduce a client-supplied filename to a log-safe base name.
///
/// Only for log lines; stored files are always named after the slot.
pub fn sanitize_for_logging(filename: &str) -> String {
    let base = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default();
    base.chars()
        .map(|c| if c.is_control() { '_' } else { c })
        .collect()
}

/// Check a slot name against the reserved list and the allowed pattern.
pub fn validate_slot_name(name: &str) -> Result<(), ValidationError> {
    if RESERVED_SLOT_NAMES
        .iter()
        .any(|r| r.eq_ignore_ascii_case(name))
    {
        return Err(ValidationError::ReservedSlotName(name.to_string()));
    }
    if !SLOT_NAME_RE.is_match(name) {
        return Err(ValidationError::InvalidSlotName(name.to_string()));
    }
    Ok(())
}

pub fn validate_category(category: &str) -> Result<(), ValidationError> {
    if category.is_empty() || CATEGORIES.contains(&category) {
        Ok(())
    } else {
        Err(ValidationError::InvalidCategory(category.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal valid header for each kind, padded to 16 bytes.
    fn header(kind: MediaKind) -> Vec<u8> {
        let mut bytes: Vec<u8> = match kind {
            MediaKind::Jpeg => vec![0xFF, 0xD8, 0xFF, 0xE0],
            MediaKind::Png => vec![0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A],
            MediaKind::Gif => b"GIF89a".to_vec(),
            MediaKind::Bmp => b"BM".to_vec(),
            MediaKind::Tiff => vec![0x49, 0x49, 0x2A, 0x00],
            MediaKind::Webp => b"RIFF\x24\x00\x00\x00WEBPVP8 ".to_vec(),
            MediaKind::Mp4 => b"\x00\x00\x00\x18ftypisom".to_vec(),
            MediaKind::Webm => vec![0x1A, 0x45, 0xDF, 0xA3],
        };
        bytes.resize(MIN_HEADER_LEN, 0);
        bytes
    }

    #[test]
    fn test_local_path_rejects_unsafe_forms() {
        for bad in [
            "",
            "..",
            "../etc/passwd",
            "a/../../b",
            "a/..",
            "a\\..\\b",
            "/etc/passwd",
            "\\\\server\\share\\file.jpg",
            "\\windows\\file.jpg",
            "C:\\images\\a.jpg",
            "c:/images/a.jpg",
            "img\0.jpg",
            ".",
            "./",
        ] {
            assert!(!validate_local_path(bad), "should reject {:?}", bad);
        }
    }

    #[test]
    fn test_local_path_accepts_clean_relative_paths() {
        for good in ["a.jpg", "dir/a.jpg", "deep/nested/dir/a.webm", "./a.png", "a_b-c.gif"] {
            assert!(validate_local_path(good), "should accept {:?}", good);
        }
    }

    #[test]
    fn test_every_kind_passes_its_own_signature() {
        for kind in MediaKind::ALL {
            let bytes = header(kind);
            assert_eq!(
                validate_content_matches_extension(&bytes, kind.extension()),
                Ok(kind)
            );
        }
    }

    #[test]
    fn test_signatures_do_not_cross_match() {
        for kind in MediaKind::ALL {
            let bytes = header(kind);
            for other in MediaKind::ALL.into_iter().filter(|o| *o != kind) {
                assert!(
                    matches!(
                        validate_content_matches_extension(&bytes, other.extension()),
                        Err(ValidationError::MagicMismatch { .. })
                    ),
                    "{} header accepted as {}",
                    kind,
                    other
                );
            }
        }
    }

    #[test]
    fn test_short_input_always_fails() {
        for kind in MediaKind::ALL {
            let mut bytes = header(kind);
            bytes.truncate(MIN_HEADER_LEN - 1);
            assert_eq!(
                validate_content_matches_extension(&bytes, kind.extension()),
                Err(ValidationError::TooShort {
                    len: MIN_HEADER_LEN - 1
                })
            );
        }
    }

    #[test]
    fn test_unknown_extension_fails_closed() {
        let bytes = header(MediaKind::Png);
        assert!(matches!(
            validate_content_matches_extension(&bytes, "svg"),
            Err(ValidationError::UnsupportedExtension(_))
        ));
    }

    #[test]
    fn test_webp_needs_both_markers() {
        let mut bytes = b"RIFF\x24\x00\x00\x00WAVEfmt ".to_vec();
        bytes.resize(MIN_HEADER_LEN, 0);
        assert!(validate_content_matches_extension(&bytes, "webp").is_err());
    }

    #[test]
    fn test_sanitize_for_logging() {
        assert_eq!(sanitize_for_logging("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_for_logging("C:\\Users\\x\\cat.png"), "cat.png");
        assert_eq!(sanitize_for_logging("evil\nname.jpg"), "evil_name.jpg");
        assert_eq!(sanitize_for_logging("plain.gif"), "plain.gif");
    }

    #[test]
    fn test_slot_names() {
        assert!(validate_slot_name("sunset").is_ok());
        assert!(validate_slot_name("Sunset_2024-v2").is_ok());
        assert!(validate_slot_name("9lives").is_ok());
        assert!(matches!(
            validate_slot_name("API"),
            Err(ValidationError::ReservedSlotName(_))
        ));
        for bad in ["", "-lead", "_lead", "has space", "dot.name", "a/b", &"x".repeat(65)] {
            assert!(
                matches!(
                    validate_slot_name(bad),
                    Err(ValidationError::InvalidSlotName(_))
                ),
                "should reject {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_categories() {
        assert!(validate_category("").is_ok());
        assert!(validate_category("mobile").is_ok());
        assert!(validate_category("wallpapers").is_err());
    }

    #[test]
    fn test_resolve_within_base_plain_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/a.jpg"), b"x").unwrap();

        let resolved = resolve_within_base(dir.path(), "sub/a.jpg").unwrap();
        assert!(resolved.abs.ends_with("sub/a.jpg"));
        assert_eq!(
            resolved.real,
            std::fs::canonicalize(dir.path().join("sub/a.jpg")).unwrap()
        );
    }

    #[test]
    fn test_resolve_within_base_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            resolve_within_base(dir.path(), "../outside.jpg"),
            Err(ValidationError::InvalidPath(_))
        ));
    }

    #[test]
    fn test_resolve_within_base_missing_base_is_lexical_only() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("not-yet");
        let resolved = resolve_within_base(&base, "a.png").unwrap();
        assert_eq!(resolved.abs, resolved.real);
        assert!(resolved.abs.starts_with(&base));
    }

    #[test]
    fn test_resolve_within_base_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            resolve_within_base(dir.path(), "nope.png"),
            Err(ValidationError::NotFound(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_within_base_rejects_symlink_escape() {
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret.jpg"), b"x").unwrap();

        let base = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(
            outside.path().join("secret.jpg"),
            base.path().join("link.jpg"),
        )
        .unwrap();

        assert!(matches!(
            resolve_within_base(base.path(), "link.jpg"),
            Err(ValidationError::SymlinkEscape(_))
        ));
    }

    #[test]
    fn test_sniff_content_type() {
        let mut png = Vec::new();
        image::RgbImage::new(2, 2)
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();
        assert_eq!(sniff_content_type(&png), Some("image/png"));
        assert_eq!(sniff_content_type(b"just some text, nothing else"), None);
    }
}
