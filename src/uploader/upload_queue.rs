use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use uuid::Uuid;

use crate::content::{AttachmentFile, ImageInfo, Relation};
use crate::errors::AppResult;
use crate::notifications::{TimelineContext, UploadEvent};

use super::pipeline::{
    spawn_file_pipeline, FileOutcome, FileStatus, MessageTarget, PipelineContext, SendTurn,
};
use super::registry::UploadSnapshot;
use super::transport::{MediaConfigSource, SendResponse};

/// Answer to the per-file confirmation question.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileDecision {
    Send,
    /// Send this file and every remaining one without asking again.
    SendAll,
    Skip,
    /// Stop here; files already dispatched keep going.
    Abort,
}

#[async_trait]
pub trait ConfirmationPrompt: Send + Sync {
    /// Some files exceed `limit`. Return false to cancel the whole batch.
    async fn confirm_over_limit(&self, too_big: &[AttachmentFile], limit: Option<u64>) -> bool;

    async fn confirm_file(&self, file: &AttachmentFile, index: usize, total: usize)
        -> FileDecision;
}

#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub room_id: String,
    pub relation: Option<Relation>,
    pub reply_to: Option<String>,
    pub context: TimelineContext,
}

impl BatchRequest {
    pub fn room(room_id: impl Into<String>) -> Self {
        let room_id = room_id.into();
        Self {
            context: TimelineContext::Room {
                room_id: room_id.clone(),
            },
            room_id,
            relation: None,
            reply_to: None,
        }
    }

    pub fn thread(room_id: impl Into<String>, thread_root: impl Into<String>) -> Self {
        let room_id = room_id.into();
        let thread_root = thread_root.into();
        Self {
            context: TimelineContext::Thread {
                room_id: room_id.clone(),
                thread_id: thread_root.clone(),
            },
            relation: Some(Relation::thread(thread_root)),
            room_id,
            reply_to: None,
        }
    }

    pub fn replying_to(mut self, event_id: impl Into<String>) -> Self {
        self.reply_to = Some(event_id.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// One entry per dispatched file, in submission order.
    pub outcomes: Vec<FileOutcome>,
    pub rejected_oversize: Vec<String>,
    pub skipped: Vec<String>,
    pub aborted: bool,
    pub registration_required: bool,
}

impl BatchReport {
    pub fn sent_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, FileStatus::Sent { .. }))
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, FileStatus::Failed { .. }))
            .count()
    }
}

/// Drives batches of attachments through the per-file pipeline.
pub struct UploadQueue {
    ctx: PipelineContext,
    media_source: Arc<dyn MediaConfigSource>,
    prompt: Arc<dyn ConfirmationPrompt>,
}

impl UploadQueue {
    pub fn new(
        ctx: PipelineContext,
        media_source: Arc<dyn MediaConfigSource>,
        prompt: Arc<dyn ConfirmationPrompt>,
    ) -> Self {
        Self {
            ctx,
            media_source,
            prompt,
        }
    }

    /// Cached upload limit; `None` when unknown, unbounded, or not fetched yet.
    pub fn upload_limit(&self) -> Option<u64> {
        self.ctx.media_config.upload_limit()
    }

    /// Fetch the limit if needed and return it.
    pub async fn fetch_upload_limit(&self) -> Option<u64> {
        self.ctx
            .media_config
            .ensure_fetched(self.media_source.as_ref())
            .await;
        self.upload_limit()
    }

    pub fn current_uploads(&self, relation: Option<&Relation>) -> Vec<UploadSnapshot> {
        self.ctx.registry.current_uploads(relation)
    }

    /// Flag an upload as cancelled and abort its network work.
    /// Returns false when the upload is unknown or already cancelled.
    pub fn cancel_upload(&self, upload_id: Uuid) -> bool {
        match self.ctx.registry.request_cancel(upload_id) {
            Some(upload) => {
                self.ctx.events.publish(UploadEvent::UploadCanceled { upload });
                true
            }
            None => {
                log::debug!("Cancel ignored for unknown upload {}", upload_id);
                false
            }
        }
    }

    pub async fn send_sticker_content_to_room(
        &self,
        url: &str,
        room_id: &str,
        thread_id: Option<&str>,
        info: &ImageInfo,
        text: &str,
    ) -> AppResult<SendResponse> {
        self.ctx
            .destination
            .send_sticker(room_id, thread_id, url, info, text)
            .await
            .map_err(|e| {
                log::warn!("Failed to send content with URL {} to room {}: {}", url, room_id, e);
                e
            })
    }

    pub async fn send_content_list_to_room(
        &self,
        files: Vec<AttachmentFile>,
        request: BatchRequest,
    ) -> AppResult<BatchReport> {
        let mut report = BatchReport::default();

        if files.is_empty() {
            log::debug!("No files to send to {}", request.room_id);
            return Ok(report);
        }

        if self.ctx.destination.is_guest().await {
            log::info!("Guest accounts cannot upload; registration required");
            self.ctx.events.publish(UploadEvent::RequireRegistration);
            report.registration_required = true;
            return Ok(report);
        }

        self.ctx
            .media_config
            .ensure_fetched(self.media_source.as_ref())
            .await;

        let (ok_files, too_big): (Vec<_>, Vec<_>) = files
            .into_iter()
            .partition(|f| self.ctx.media_config.is_file_size_acceptable(f.size()));

        if !too_big.is_empty() {
            log::warn!(
                "{} file(s) exceed the upload limit of {:?} bytes",
                too_big.len(),
                self.upload_limit()
            );
            report.rejected_oversize = too_big.iter().map(|f| f.display_name().to_string()).collect();

            if !self
                .prompt
                .confirm_over_limit(&too_big, self.upload_limit())
                .await
            {
                log::info!("Batch for {} cancelled at size check", request.room_id);
                report.aborted = true;
                self.finish_composer(&request);
                return Ok(report);
            }
        }

        let target = MessageTarget {
            room_id: request.room_id.clone(),
            relation: request.relation.clone(),
            reply_to: request.reply_to.clone(),
        };

        let total = ok_files.len();
        let mut upload_all = false;
        let mut previous_turn = None;
        let mut pipelines = Vec::with_capacity(total);

        for (index, file) in ok_files.into_iter().enumerate() {
            if !upload_all {
                match self.prompt.confirm_file(&file, index, total).await {
                    FileDecision::Send => {}
                    FileDecision::SendAll => upload_all = true,
                    FileDecision::Skip => {
                        log::info!("Skipping {}", file.display_name());
                        report.skipped.push(file.display_name().to_string());
                        continue;
                    }
                    FileDecision::Abort => {
                        log::info!(
                            "Batch aborted at file {} of {}; {} already dispatched",
                            index + 1,
                            total,
                            pipelines.len()
                        );
                        report.aborted = true;
                        break;
                    }
                }
            }

            let (turn, released) = SendTurn::new(previous_turn.take());
            previous_turn = Some(released);
            pipelines.push(spawn_file_pipeline(&self.ctx, file, target.clone(), turn));
        }

        log::info!(
            "Dispatched {} of {} file(s) to {}",
            pipelines.len(),
            total,
            request.room_id
        );
        self.finish_composer(&request);

        report.outcomes = join_all(pipelines.into_iter().map(|p| p.join())).await;

        log::info!(
            "Batch for {} finished: {} sent, {} failed",
            request.room_id,
            report.sent_count(),
            report.failed_count()
        );
        Ok(report)
    }

    fn finish_composer(&self, request: &BatchRequest) {
        if request.reply_to.is_some() {
            self.ctx.events.publish(UploadEvent::ReplyCleared {
                context: request.context.clone(),
            });
        }
        self.ctx.events.publish(UploadEvent::FocusComposer {
            context: request.context.clone(),
        });
    }
}
