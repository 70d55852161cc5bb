//! Media sources and content detection

use std::path::Path;

use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

use super::IngestError;
use crate::config::Settings;
use crate::media::fetch::MediaFetcher;
use crate::media::validate::{self, ValidationError};
use crate::media::{FetchError, MediaKind, SsrfError};

/// A file received in a multipart body.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub filename: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

/// Where the bytes for one ingestion come from.
#[derive(Debug, Clone)]
pub enum MediaSource {
    Upload(UploadedFile),
    /// Absolute http(s) URL
    Remote(String),
    /// Path relative to the external media root
    Local(String),
}

impl MediaSource {
    /// Pick the single source from a request. `reference` is an http(s) URL
    /// or a path under the external media root. Blank values count as absent.
    pub fn select(
        upload: Option<UploadedFile>,
        reference: Option<String>,
    ) -> Result<Self, IngestError> {
        let upload = upload.filter(|u| !u.bytes.is_empty() || !u.filename.is_empty());
        let reference = reference
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty());

        match (upload, reference) {
            (Some(_), Some(_)) => Err(IngestError::MultipleSources),
            (None, None) => Err(IngestError::NoSource),
            (Some(upload), None) => Ok(MediaSource::Upload(upload)),
            (None, Some(reference)) => Self::from_reference(&reference),
        }
    }

    /// Classify a reference string as remote URL or local path.
    pub fn from_reference(reference: &str) -> Result<Self, IngestError> {
        let lower = reference.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            return Ok(MediaSource::Remote(reference.to_string()));
        }
        if let Some((scheme, _)) = reference.split_once("://") {
            return Err(FetchError::Ssrf(SsrfError::SchemeNotAllowed(scheme.to_string())).into());
        }
        Ok(MediaSource::Local(reference.to_string()))
    }

    /// Raw value identifying the source in logs.
    pub fn describe(&self) -> String {
        match self {
            MediaSource::Upload(file) => validate::sanitize_for_logging(&file.filename),
            MediaSource::Remote(url) => url.clone(),
            MediaSource::Local(path) => path.clone(),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            MediaSource::Upload(_) => "upload",
            MediaSource::Remote(_) => "url",
            MediaSource::Local(_) => "local",
        }
    }
}

/// Bytes plus whatever the source claimed about their type.
#[derive(Debug)]
pub(crate) struct Acquired {
    pub bytes: Vec<u8>,
    /// Extension from the filename, URL path or local path
    pub claimed_ext: Option<String>,
    /// Content-Type from the client or remote server
    pub declared_mime: Option<String>,
}

fn extension_of(path: &str) -> Option<String> {
    Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

pub(crate) async fn acquire(
    source: MediaSource,
    settings: &Settings,
    fetcher: &MediaFetcher,
    cancel: &CancellationToken,
) -> Result<Acquired, IngestError> {
    let max = settings.ingest.max_upload_bytes();

    match source {
        MediaSource::Upload(file) => {
            let size = file.bytes.len() as u64;
            if size > max {
                return Err(IngestError::PayloadTooLarge { size, max });
            }
            Ok(Acquired {
                claimed_ext: extension_of(&file.filename),
                declared_mime: file.content_type,
                bytes: file.bytes,
            })
        }
        MediaSource::Remote(url) => {
            let result = fetcher.fetch(&url, &settings.fetch_config(), cancel).await?;
            let claimed_ext = url::Url::parse(&url)
                .ok()
                .and_then(|u| extension_of(u.path()));
            Ok(Acquired {
                bytes: result.bytes,
                claimed_ext,
                declared_mime: result.content_type,
            })
        }
        MediaSource::Local(rel) => {
            let root = settings
                .ingest
                .external_media_root
                .clone()
                .ok_or(IngestError::LocalMediaDisabled)?;
            let rel_for_resolve = rel.clone();
            let resolved = tokio::task::spawn_blocking(move || {
                validate::resolve_within_base(&root, &rel_for_resolve)
            })
            .await
            .map_err(|e| IngestError::Io(e.to_string()))??;

            let bytes = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(IngestError::Cancelled),
                read = read_capped(&resolved.real, max) => read.map_err(|e| match e {
                    ReadError::TooLarge(size) => IngestError::PayloadTooLarge { size, max },
                    ReadError::NotFile => ValidationError::InvalidPath(rel.clone()).into(),
                    ReadError::Io(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        ValidationError::NotFound(rel.clone()).into()
                    }
                    ReadError::Io(e) => ValidationError::Io {
                        path: rel.clone(),
                        message: e.to_string(),
                    }
                    .into(),
                })?,
            };

            Ok(Acquired {
                bytes,
                claimed_ext: extension_of(&rel),
                declared_mime: None,
            })
        }
    }
}

enum ReadError {
    TooLarge(u64),
    NotFile,
    Io(std::io::Error),
}

async fn read_capped(path: &Path, max: u64) -> Result<Vec<u8>, ReadError> {
    let file = tokio::fs::File::open(path).await.map_err(ReadError::Io)?;
    let meta = file.metadata().await.map_err(ReadError::Io)?;
    if !meta.is_file() {
        return Err(ReadError::NotFile);
    }
    if meta.len() > max {
        return Err(ReadError::TooLarge(meta.len()));
    }

    let mut bytes = Vec::with_capacity(meta.len() as usize);
    file.take(max + 1)
        .read_to_end(&mut bytes)
        .await
        .map_err(ReadError::Io)?;
    if bytes.len() as u64 > max {
        return Err(ReadError::TooLarge(bytes.len() as u64));
    }
    Ok(bytes)
}

/// Decide the media kind: sniffed type must be on the allow-list, and the
/// claimed (or sniffed) extension must match the magic bytes.
pub(crate) fn detect_kind(acquired: &Acquired) -> Result<MediaKind, IngestError> {
    let bytes = &acquired.bytes;
    if bytes.len() < validate::MIN_HEADER_LEN {
        return Err(ValidationError::TooShort { len: bytes.len() }.into());
    }

    let sniffed = validate::sniff_content_type(bytes);
    let sniffed_kind = match sniffed {
        Some(mime) => Some(
            MediaKind::from_mime(mime)
                .ok_or_else(|| ValidationError::UnsupportedContentType(mime.to_string()))?,
        ),
        None => None,
    };

    let claimed = match acquired.claimed_ext.as_deref() {
        Some(ext) => Some(ext.to_string()),
        None => acquired
            .declared_mime
            .as_deref()
            .and_then(MediaKind::from_mime)
            .or(sniffed_kind)
            .map(|k| k.extension().to_string()),
    };

    let claimed = claimed.ok_or_else(|| {
        ValidationError::UnsupportedContentType(
            acquired
                .declared_mime
                .clone()
                .unwrap_or_else(|| "unknown".to_string()),
        )
    })?;

    Ok(validate::validate_content_matches_extension(bytes, &claimed)?)
}
