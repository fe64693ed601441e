use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use std::io::Cursor;
use std::sync::Arc;

use crate::errors::{AppError, AppResult};

pub const MAX_WIDTH: u32 = 800;
pub const MAX_HEIGHT: u32 = 600;

/// Images at or below this size never keep a thumbnail.
pub const IMAGE_SIZE_THRESHOLD_THUMBNAIL: u64 = 1 << 15; // 32KB
/// A thumbnail is only worth uploading if it saves more than this many bytes...
pub const IMAGE_THUMBNAIL_MIN_REDUCTION_SIZE: u64 = 1 << 16; // 64KB
/// ...or more than this fraction of the original.
pub const IMAGE_THUMBNAIL_MIN_REDUCTION_PERCENT: f64 = 0.1;

/// Formats with patchy client support: the thumbnail is the only reliable preview.
pub const ALWAYS_KEEP_THUMBNAIL_TYPES: &[&str] = &["image/avif", "image/webp"];

const THUMBNAIL_JPEG_QUALITY: u8 = 92;
const BLURHASH_COMPONENTS_X: u32 = 4;
const BLURHASH_COMPONENTS_Y: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThumbnailFormat {
    Png,
    Jpeg,
}

impl ThumbnailFormat {
    pub fn mime_type(&self) -> &'static str {
        match self {
            ThumbnailFormat::Png => "image/png",
            ThumbnailFormat::Jpeg => "image/jpeg",
        }
    }

    /// JPEG sources get JPEG thumbnails; everything else is re-encoded as PNG.
    pub fn for_image(source_mime: Option<&str>) -> Self {
        if source_mime == Some("image/jpeg") {
            ThumbnailFormat::Jpeg
        } else {
            ThumbnailFormat::Png
        }
    }
}

#[derive(Debug, Clone)]
pub struct ThumbnailResult {
    pub width: u32,
    pub height: u32,
    pub source_width: u32,
    pub source_height: u32,
    pub blob: Bytes,
    pub mime_type: String,
    pub blurhash: Option<String>,
}

impl ThumbnailResult {
    pub fn size(&self) -> u64 {
        self.blob.len() as u64
    }
}

/// Bound `width`x`height` to MAX_WIDTH x MAX_HEIGHT keeping the aspect ratio.
/// Height is fitted first, then width. Never upscales.
pub fn thumbnail_dimensions(width: u32, height: u32) -> (u32, u32) {
    let mut target_width = width;
    let mut target_height = height;

    if target_height > MAX_HEIGHT {
        target_width =
            (target_width as f64 * (MAX_HEIGHT as f64 / target_height as f64)).floor() as u32;
        target_height = MAX_HEIGHT;
    }
    if target_width > MAX_WIDTH {
        target_height =
            (target_height as f64 * (MAX_WIDTH as f64 / target_width as f64)).floor() as u32;
        target_width = MAX_WIDTH;
    }

    (target_width.max(1), target_height.max(1))
}

/// Render `source` at bounded dimensions, encode it as `format`, and (optionally)
/// compute a blurhash of the rendered pixels. Encode and hash run concurrently.
pub async fn make_thumbnail(
    source: DynamicImage,
    source_width: u32,
    source_height: u32,
    format: ThumbnailFormat,
    calculate_blurhash: bool,
) -> AppResult<ThumbnailResult> {
    let (width, height) = thumbnail_dimensions(source_width, source_height);
    log::debug!(
        "Thumbnailing {}x{} -> {}x{} as {}",
        source_width,
        source_height,
        width,
        height,
        format.mime_type()
    );

    let rendered = run_blocking(move || Ok(source.resize_exact(width, height, FilterType::Triangle)))
        .await?;
    let rendered = Arc::new(rendered);

    let encode_source = Arc::clone(&rendered);
    let encode = run_blocking(move || encode_thumbnail(&encode_source, format));

    let hash_source = Arc::clone(&rendered);
    let hash = async move {
        if calculate_blurhash {
            run_blocking(move || encode_blurhash(&hash_source))
                .await
                .map(Some)
        } else {
            Ok(None)
        }
    };

    let (blob, blurhash) = tokio::try_join!(encode, hash)?;

    log::debug!(
        "Thumbnail encoded: {} bytes (blurhash: {})",
        blob.len(),
        blurhash.is_some()
    );

    Ok(ThumbnailResult {
        width,
        height,
        source_width,
        source_height,
        blob,
        mime_type: format.mime_type().to_string(),
        blurhash,
    })
}

fn encode_thumbnail(image: &DynamicImage, format: ThumbnailFormat) -> AppResult<Bytes> {
    let mut output = Vec::new();

    match format {
        ThumbnailFormat::Png => {
            image.write_to(&mut Cursor::new(&mut output), ImageFormat::Png)?;
        }
        ThumbnailFormat::Jpeg => {
            // JPEG has no alpha channel
            let rgb = DynamicImage::ImageRgb8(image.to_rgb8());
            let encoder = JpegEncoder::new_with_quality(&mut output, THUMBNAIL_JPEG_QUALITY);
            rgb.write_with_encoder(encoder)?;
        }
    }

    Ok(Bytes::from(output))
}

pub fn encode_blurhash(image: &DynamicImage) -> AppResult<String> {
    let rgba = image.to_rgba8();
    blurhash::encode(
        BLURHASH_COMPONENTS_X,
        BLURHASH_COMPONENTS_Y,
        rgba.width(),
        rgba.height(),
        rgba.as_raw(),
    )
    .map_err(|e| AppError::Internal(format!("Blurhash encoding failed: {}", e)))
}

/// Whether an image thumbnail is worth uploading next to its original.
pub fn should_keep_image_thumbnail(
    original_mime: Option<&str>,
    original_size: u64,
    thumbnail_size: u64,
) -> bool {
    if let Some(mime) = original_mime {
        if ALWAYS_KEEP_THUMBNAIL_TYPES.contains(&mime) {
            return true;
        }
    }

    if original_size <= IMAGE_SIZE_THRESHOLD_THUMBNAIL {
        return false;
    }

    let size_difference = original_size as i128 - thumbnail_size as i128;
    let not_worth_it = size_difference <= IMAGE_THUMBNAIL_MIN_REDUCTION_SIZE as i128
        && (size_difference as f64)
            <= original_size as f64 * IMAGE_THUMBNAIL_MIN_REDUCTION_PERCENT;

    !not_worth_it
}

pub(crate) async fn run_blocking<T, F>(f: F) -> AppResult<T>
where
    F: FnOnce() -> AppResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AppError::Internal(format!("Blocking task failed: {}", e)))?
}
