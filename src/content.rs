//! Outgoing message content and the attachment metadata carried inside it.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::errors::AppResult;
use crate::security::InputValidator;

pub const BLURHASH_FIELD: &str = "xyz.amorgan.blurhash";
pub const THREAD_RELATION_TYPE: &str = "m.thread";

/// A user-selected file, fully read into memory.
#[derive(Debug, Clone)]
pub struct AttachmentFile {
    pub name: String,
    pub mime_type: Option<String>,
    pub data: Bytes,
}

impl AttachmentFile {
    pub fn new(name: impl Into<String>, mime_type: Option<&str>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.filter(|m| !m.is_empty()).map(str::to_string),
            data: data.into(),
        }
    }

    pub async fn from_path(file_path: &str) -> AppResult<Self> {
        InputValidator::validate_file_path(file_path)?;

        let data = tokio::fs::read(file_path).await?;
        let path = Path::new(file_path);
        let name = path
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();
        let mime_type = path
            .extension()
            .and_then(|e| e.to_str())
            .and_then(mime_from_extension);

        Ok(Self::new(
            InputValidator::sanitize_filename(&name),
            mime_type,
            data,
        ))
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Name used for the message body and upload display.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            "Attachment"
        } else {
            &self.name
        }
    }
}

fn mime_from_extension(extension: &str) -> Option<&'static str> {
    let mime = match extension.to_ascii_lowercase().as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "avif" => "image/avif",
        "bmp" => "image/bmp",
        "mp4" | "m4v" => "video/mp4",
        "mov" => "video/quicktime",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mp3" => "audio/mpeg",
        "ogg" | "oga" => "audio/ogg",
        "opus" => "audio/opus",
        "wav" => "audio/wav",
        "flac" => "audio/flac",
        "m4a" => "audio/mp4",
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        "zip" => "application/zip",
        _ => return None,
    };
    Some(mime)
}

/// Message kind, chosen once per file from its declared MIME prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaKind {
    #[serde(rename = "m.image")]
    Image,
    #[serde(rename = "m.audio")]
    Audio,
    #[serde(rename = "m.video")]
    Video,
    #[serde(rename = "m.file")]
    File,
}

impl MediaKind {
    pub fn from_mime(mime_type: Option<&str>) -> Self {
        match mime_type {
            Some(m) if m.starts_with("image/") => MediaKind::Image,
            Some(m) if m.starts_with("audio/") => MediaKind::Audio,
            Some(m) if m.starts_with("video/") => MediaKind::Video,
            _ => MediaKind::File,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InReplyTo {
    pub event_id: String,
}

/// Relation of an outgoing message to an existing event (thread, reply, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rel_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(rename = "m.in_reply_to", skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<InReplyTo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_falling_back: Option<bool>,
}

impl Relation {
    pub fn thread(root_event_id: impl Into<String>) -> Self {
        Self {
            rel_type: Some(THREAD_RELATION_TYPE.to_string()),
            event_id: Some(root_event_id.into()),
            ..Default::default()
        }
    }

    pub fn is_thread(&self) -> bool {
        self.rel_type.as_deref() == Some(THREAD_RELATION_TYPE)
    }

    /// Thread root to send into, when this relation is a thread linkage.
    pub fn thread_id(&self) -> Option<&str> {
        if self.is_thread() {
            self.event_id.as_deref()
        } else {
            None
        }
    }

    /// Same relation type and target event; reply and fallback markers are ignored.
    pub fn matches(&self, other: &Relation) -> bool {
        self.rel_type == other.rel_type && self.event_id == other.event_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonWebKey {
    pub kty: String,
    pub key_ops: Vec<String>,
    pub alg: String,
    pub k: String,
    pub ext: bool,
}

/// Everything a recipient needs to decrypt an attachment, minus its location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionInfo {
    pub key: JsonWebKey,
    pub iv: String,
    pub hashes: BTreeMap<String, String>,
    pub v: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedFile {
    pub url: String,
    #[serde(flatten)]
    pub info: EncryptionInfo,
}

/// Where uploaded bytes ended up: a plain content URI, or ciphertext plus keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadedContent {
    Plain { url: String },
    Encrypted(EncryptedFile),
}

impl UploadedContent {
    pub fn into_parts(self) -> (Option<String>, Option<EncryptedFile>) {
        match self {
            UploadedContent::Plain { url } => (Some(url), None),
            UploadedContent::Encrypted(file) => (None, Some(file)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThumbnailInfo {
    pub w: u32,
    pub h: u32,
    pub mimetype: String,
    pub size: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaInfo {
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mimetype: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub w: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub h: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_info: Option<ThumbnailInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_file: Option<EncryptedFile>,
    #[serde(rename = "xyz.amorgan.blurhash", skip_serializing_if = "Option::is_none")]
    pub blurhash: Option<String>,
}

/// Visual metadata derived while thumbnailing an image or video.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VisualInfo {
    pub w: u32,
    pub h: u32,
    pub blurhash: Option<String>,
    pub thumbnail_info: Option<ThumbnailInfo>,
    pub thumbnail: Option<UploadedContent>,
}

impl MediaInfo {
    pub fn apply_visual(&mut self, visual: VisualInfo) {
        self.w = Some(visual.w);
        self.h = Some(visual.h);
        self.blurhash = visual.blurhash;
        // Thumbnail metadata only travels together with an uploaded thumbnail.
        match (visual.thumbnail_info, visual.thumbnail) {
            (Some(info), Some(uploaded)) => {
                self.thumbnail_info = Some(info);
                let (url, file) = uploaded.into_parts();
                self.thumbnail_url = url;
                self.thumbnail_file = file;
            }
            _ => {
                self.thumbnail_info = None;
                self.thumbnail_url = None;
                self.thumbnail_file = None;
            }
        }
    }
}

/// Sticker metadata; same shape as image info.
pub type ImageInfo = MediaInfo;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageContent {
    pub body: String,
    pub msgtype: MediaKind,
    pub info: MediaInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<EncryptedFile>,
    #[serde(rename = "m.relates_to", skip_serializing_if = "Option::is_none")]
    pub relates_to: Option<Relation>,
    #[serde(
        rename = "io.element.performance_metrics.startTime",
        skip_serializing_if = "Option::is_none"
    )]
    pub start_time: Option<i64>,
}

impl MessageContent {
    /// Skeleton for an attachment; kind and references are filled in by the pipeline.
    pub fn skeleton(file: &AttachmentFile) -> Self {
        Self {
            body: file.display_name().to_string(),
            msgtype: MediaKind::File,
            info: MediaInfo {
                size: file.size(),
                mimetype: file.mime_type.clone(),
                ..Default::default()
            },
            url: None,
            file: None,
            relates_to: None,
            start_time: None,
        }
    }

    pub fn with_relation(mut self, relation: Option<&Relation>) -> Self {
        if let Some(relation) = relation {
            self.relates_to = Some(relation.clone());
        }
        self
    }

    /// Mark this message as a reply, without a legacy fallback body.
    pub fn add_reply_to(&mut self, reply_to_event_id: &str) {
        let relation = self.relates_to.get_or_insert_with(Relation::default);
        relation.in_reply_to = Some(InReplyTo {
            event_id: reply_to_event_id.to_string(),
        });
        if relation.is_thread() {
            relation.is_falling_back = Some(false);
        }
    }

    pub fn decorate_start_sending_time(&mut self) {
        self.start_time = Some(chrono::Utc::now().timestamp_millis());
    }

    pub fn set_uploaded(&mut self, uploaded: UploadedContent) {
        let (url, file) = uploaded.into_parts();
        self.url = url;
        self.file = file;
    }
}
