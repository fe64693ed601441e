//! Turn raw attachment bytes into a decoded raster plus the dimensions to report.
//!
//! Still images are decoded with the `image` crate. PNGs are additionally scanned
//! for a `pHYs` chunk matching the density macOS writes into hi-dpi screenshots;
//! those report half their pixel size so they display at their visual size.
//! Videos go through a [`FrameExtractor`] that yields the first renderable frame.

use async_trait::async_trait;
use bytes::Bytes;
use image::{DynamicImage, GenericImageView, ImageFormat};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;

use crate::content::AttachmentFile;
use crate::errors::{AppError, AppResult};
use crate::image_processor::run_blocking;
use crate::security::FileSystemGuard;

const PNG_SIGNATURE: [u8; 8] = [137, 80, 78, 71, 13, 10, 26, 10];

// scraped out of a macOS hidpi (5669 px/m) screenshot png:
// 5669 px (x-axis), 5669 px (y-axis), unit = metre
pub const PHYS_HIDPI: [u8; 9] = [0x00, 0x00, 0x16, 0x25, 0x00, 0x00, 0x16, 0x25, 0x01];

#[derive(Debug, Clone)]
pub struct ProbedMedia {
    pub source: DynamicImage,
    pub width: u32,
    pub height: u32,
}

/// Decodes the first renderable frame of a video.
#[async_trait]
pub trait FrameExtractor: Send + Sync {
    async fn first_frame(&self, data: Bytes, mime_type: &str) -> AppResult<DynamicImage>;
}

#[derive(Clone)]
pub struct MediaProbe {
    frames: Arc<dyn FrameExtractor>,
}

impl MediaProbe {
    pub fn new(frames: Arc<dyn FrameExtractor>) -> Self {
        Self { frames }
    }

    /// Decode an image; PNG density parsing runs alongside the decode.
    pub async fn load_image(&self, file: &AttachmentFile) -> AppResult<ProbedMedia> {
        let decode_data = file.data.clone();
        let decode = run_blocking(move || Ok(image::load_from_memory(&decode_data)?));

        let is_png = file.mime_type.as_deref() == Some("image/png");
        let parse_data = file.data.clone();
        let parse = async move {
            if is_png {
                run_blocking(move || is_hidpi_png(&parse_data)).await
            } else {
                Ok(false)
            }
        };

        let (source, hidpi) = tokio::try_join!(decode, parse)?;
        let (raw_width, raw_height) = source.dimensions();
        let (width, height) = if hidpi {
            log::debug!(
                "Hi-dpi PNG {}: reporting {}x{} as {}x{}",
                file.display_name(),
                raw_width,
                raw_height,
                raw_width >> 1,
                raw_height >> 1
            );
            (raw_width >> 1, raw_height >> 1)
        } else {
            (raw_width, raw_height)
        };

        Ok(ProbedMedia {
            source,
            width,
            height,
        })
    }

    pub async fn load_video(&self, file: &AttachmentFile) -> AppResult<ProbedMedia> {
        let mime_type = normalize_video_mime(file.mime_type.as_deref().unwrap_or("video/mp4"));
        let frame = self.frames.first_frame(file.data.clone(), mime_type).await?;
        let (width, height) = frame.dimensions();

        Ok(ProbedMedia {
            source: frame,
            width,
            height,
        })
    }
}

/// Quicktime is decoded as mp4; the container is compatible and decoders handle it better.
pub fn normalize_video_mime(mime_type: &str) -> &str {
    if mime_type == "video/quicktime" {
        "video/mp4"
    } else {
        mime_type
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PngChunk<'a> {
    pub name: [u8; 4],
    pub data: &'a [u8],
}

/// Split a PNG into its chunks. Stops after IEND. CRCs are not verified.
pub fn extract_png_chunks(data: &[u8]) -> AppResult<Vec<PngChunk<'_>>> {
    if data.len() < PNG_SIGNATURE.len() || data[..8] != PNG_SIGNATURE {
        return Err(AppError::decode("Invalid PNG signature"));
    }

    let mut chunks = Vec::new();
    let mut offset = PNG_SIGNATURE.len();

    while offset < data.len() {
        let header = data
            .get(offset..offset + 8)
            .ok_or_else(|| AppError::decode("Truncated PNG chunk header"))?;
        let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let name = [header[4], header[5], header[6], header[7]];

        let data_start = offset + 8;
        let data_end = data_start
            .checked_add(length)
            .ok_or_else(|| AppError::decode("PNG chunk length overflow"))?;
        let chunk_data = data.get(data_start..data_end).ok_or_else(|| {
            AppError::decode(format!(
                "Truncated PNG chunk {}",
                String::from_utf8_lossy(&name)
            ))
        })?;

        chunks.push(PngChunk {
            name,
            data: chunk_data,
        });

        // data + CRC
        offset = data_end + 4;

        if &name == b"IEND" {
            break;
        }
    }

    Ok(chunks)
}

/// True when the first `pHYs` chunk is byte-for-byte the macOS hi-dpi signature.
pub fn is_hidpi_png(data: &[u8]) -> AppResult<bool> {
    let chunks = extract_png_chunks(data)?;
    Ok(chunks
        .iter()
        .find(|chunk| &chunk.name == b"pHYs")
        .map(|chunk| chunk.data == PHYS_HIDPI)
        .unwrap_or(false))
}

/// Frame extraction through an `ffmpeg` binary.
pub struct FfmpegFrameExtractor {
    ffmpeg_path: String,
}

impl FfmpegFrameExtractor {
    pub fn new(ffmpeg_path: impl Into<String>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
        }
    }

    fn extension_for(mime_type: &str) -> &'static str {
        match mime_type {
            "video/webm" => "webm",
            "video/x-matroska" => "mkv",
            "video/ogg" => "ogv",
            "video/x-msvideo" => "avi",
            _ => "mp4",
        }
    }

    async fn run_ffmpeg(&self, input: &PathBuf) -> AppResult<Vec<u8>> {
        let output = Command::new(&self.ffmpeg_path)
            .args(["-hide_banner", "-loglevel", "error", "-i"])
            .arg(input)
            .args(["-frames:v", "1", "-f", "image2pipe", "-c:v", "png", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| AppError::decode(format!("Failed to run ffmpeg: {}", e)))?;

        if !output.status.success() || output.stdout.is_empty() {
            return Err(AppError::decode(format!(
                "ffmpeg could not decode a frame: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(output.stdout)
    }
}

#[async_trait]
impl FrameExtractor for FfmpegFrameExtractor {
    async fn first_frame(&self, data: Bytes, mime_type: &str) -> AppResult<DynamicImage> {
        let temp_path = FileSystemGuard::create_secure_temp_file(Self::extension_for(mime_type))?;
        tokio::fs::write(&temp_path, &data).await?;

        let result = self.run_ffmpeg(&temp_path).await;

        if let Err(e) = tokio::fs::remove_file(&temp_path).await {
            log::warn!(
                "Failed to remove temp video {}: {}",
                temp_path.display(),
                e
            );
        }

        let frame_png = result?;
        run_blocking(move || {
            image::load_from_memory_with_format(&frame_png, ImageFormat::Png)
                .map_err(|e| AppError::decode(format!("Invalid frame from ffmpeg: {}", e)))
        })
        .await
    }
}
