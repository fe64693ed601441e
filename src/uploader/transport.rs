//! Contracts for the network collaborators the pipeline drives.
//!
//! `HomeserverClient` implements all three against a real server; tests plug in
//! in-memory recorders.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::content::{ImageInfo, MessageContent};
use crate::errors::AppResult;

/// Called with `(loaded, total)` bytes as an upload makes progress.
pub type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

#[async_trait]
pub trait ContentUploader: Send + Sync {
    /// Store `data` and return its content URI.
    ///
    /// Implementations must stop and return a cancellation error once `cancel` fires.
    async fn upload_content(
        &self,
        data: Bytes,
        content_type: Option<&str>,
        progress: Option<ProgressCallback>,
        cancel: CancellationToken,
    ) -> AppResult<String>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConfig {
    #[serde(rename = "m.upload.size", skip_serializing_if = "Option::is_none")]
    pub upload_size: Option<u64>,
}

#[async_trait]
pub trait MediaConfigSource: Send + Sync {
    async fn fetch_media_config(&self) -> AppResult<MediaConfig>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendResponse {
    pub event_id: String,
}

#[async_trait]
pub trait Destination: Send + Sync {
    async fn is_guest(&self) -> bool;

    /// Whether attachments to this room must be encrypted before upload.
    async fn is_room_encrypted(&self, room_id: &str) -> AppResult<bool>;

    async fn send_message(
        &self,
        room_id: &str,
        thread_id: Option<&str>,
        content: &MessageContent,
    ) -> AppResult<SendResponse>;

    async fn send_sticker(
        &self,
        room_id: &str,
        thread_id: Option<&str>,
        url: &str,
        info: &ImageInfo,
        text: &str,
    ) -> AppResult<SendResponse>;
}
