//! Media transform engine
//!
//! Turns validated source bytes into the stored original plus an optional
//! JPEG preview. The dimension guard reads only the image header and runs
//! before any full decode.

use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageReader};
use thiserror::Error;

use super::kind::{MediaKind, StoreStrategy};

/// Largest accepted width or height in pixels.
pub const MAX_DIMENSION: u32 = 16384;

/// Default preview bounding box.
pub const DEFAULT_PREVIEW_WIDTH: u32 = 400;
pub const DEFAULT_PREVIEW_HEIGHT: u32 = 400;

/// Default JPEG quality for previews and re-encoded originals.
pub const DEFAULT_JPEG_QUALITY: u8 = 85;

/// Preview files are always JPEG.
pub const PREVIEW_KIND: MediaKind = MediaKind::Jpeg;

#[derive(Error, Debug)]
pub enum TransformError {
    #[error("image dimensions too large: {width}x{height} (max {max})")]
    DimensionsTooLarge { width: u32, height: u32, max: u32 },

    #[error("failed to decode {kind}: {message}")]
    Decode { kind: MediaKind, message: String },

    #[error("failed to encode: {0}")]
    Encode(String),

    #[error("{0} has no preview")]
    NoPreview(MediaKind),
}

#[derive(Debug, Clone, Copy)]
pub struct TransformConfig {
    pub preview_width: u32,
    pub preview_height: u32,
    pub jpeg_quality: u8,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            preview_width: DEFAULT_PREVIEW_WIDTH,
            preview_height: DEFAULT_PREVIEW_HEIGHT,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

/// Stored representation of one ingested item.
#[derive(Debug)]
pub struct TransformOutput {
    /// Kind of `original` as written to disk.
    pub kind: MediaKind,
    pub original: Vec<u8>,
    /// JPEG preview; `None` for video.
    pub preview: Option<Vec<u8>>,
}

/// Read width and height from the header without decoding pixel data.
pub fn read_dimensions(bytes: &[u8], kind: MediaKind) -> Result<(u32, u32), TransformError> {
    let format = kind.image_format().ok_or(TransformError::NoPreview(kind))?;
    ImageReader::with_format(Cursor::new(bytes), format)
        .into_dimensions()
        .map_err(|e| TransformError::Decode {
            kind,
            message: e.to_string(),
        })
}

/// Reject images whose header declares a side longer than [`MAX_DIMENSION`].
pub fn check_dimensions(bytes: &[u8], kind: MediaKind) -> Result<(u32, u32), TransformError> {
    let (width, height) = read_dimensions(bytes, kind)?;
    if width > MAX_DIMENSION || height > MAX_DIMENSION {
        return Err(TransformError::DimensionsTooLarge {
            width,
            height,
            max: MAX_DIMENSION,
        });
    }
    Ok((width, height))
}

/// Transform source bytes of `kind` into the stored original and preview.
///
/// CPU bound; async callers should run it on the blocking pool.
pub fn transform(
    bytes: Vec<u8>,
    kind: MediaKind,
    config: &TransformConfig,
) -> Result<TransformOutput, TransformError> {
    match kind.strategy() {
        StoreStrategy::Passthrough => Ok(TransformOutput {
            kind,
            original: bytes,
            preview: None,
        }),
        StoreStrategy::Native => {
            let image = decode_guarded(&bytes, kind)?;
            let preview = encode_jpeg(&fit_within(&image, config), config.jpeg_quality)?;
            Ok(TransformOutput {
                kind,
                original: bytes,
                preview: Some(preview),
            })
        }
        StoreStrategy::ReencodeJpeg => {
            let image = decode_guarded(&bytes, kind)?;
            let original = encode_jpeg(&image, config.jpeg_quality)?;
            let preview = encode_jpeg(&fit_within(&image, config), config.jpeg_quality)?;
            Ok(TransformOutput {
                kind: kind.stored_kind(),
                original,
                preview: Some(preview),
            })
        }
    }
}

/// Build a preview from an already stored original.
pub fn generate_preview(
    bytes: &[u8],
    kind: MediaKind,
    config: &TransformConfig,
) -> Result<Vec<u8>, TransformError> {
    if kind.is_video() {
        return Err(TransformError::NoPreview(kind));
    }
    let image = decode_guarded(bytes, kind)?;
    encode_jpeg(&fit_within(&image, config), config.jpeg_quality)
}

fn decode_guarded(bytes: &[u8], kind: MediaKind) -> Result<DynamicImage, TransformError> {
    check_dimensions(bytes, kind)?;
    let format = kind.image_format().ok_or(TransformError::NoPreview(kind))?;
    ImageReader::with_format(Cursor::new(bytes), format)
        .decode()
        .map_err(|e| TransformError::Decode {
            kind,
            message: e.to_string(),
        })
}

/// Scale down to fit the preview box in one bilinear pass. Never upscales.
pub fn fit_within(image: &DynamicImage, config: &TransformConfig) -> DynamicImage {
    if image.width() <= config.preview_width && image.height() <= config.preview_height {
        return image.clone();
    }
    image.resize(config.preview_width, config.preview_height, FilterType::Triangle)
}

fn encode_jpeg(image: &DynamicImage, quality: u8) -> Result<Vec<u8>, TransformError> {
    let mut buf = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100));
    DynamicImage::ImageRgb8(image.to_rgb8())
        .write_with_encoder(encoder)
        .map_err(|e| TransformError::Encode(e.to_string()))?;
    Ok(buf)
}
