//! Per-file ingestion: thumbnail, upload, wait for the send turn, send.

use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::content::{
    AttachmentFile, EncryptedFile, MediaKind, MessageContent, Relation, ThumbnailInfo,
    UploadedContent, VisualInfo,
};
use crate::errors::{failure_description, AppError, AppResult};
use crate::image_processor::{
    make_thumbnail, run_blocking, should_keep_image_thumbnail, ThumbnailFormat, ThumbnailResult,
};
use crate::media_probe::MediaProbe;
use crate::notifications::{EventSink, UploadEvent};

use super::encryption::AttachmentEncryptor;
use super::media_config::MediaConfigCache;
use super::registry::{PipelineStage, UploadRegistry, UploadSnapshot};
use super::transport::{ContentUploader, Destination, ProgressCallback};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineSettings {
    pub send_timing_metadata: bool,
}

/// Everything a file pipeline needs; cheap to clone into spawned tasks.
#[derive(Clone)]
pub struct PipelineContext {
    pub uploader: Arc<dyn ContentUploader>,
    pub destination: Arc<dyn Destination>,
    pub encryptor: Arc<dyn AttachmentEncryptor>,
    pub events: Arc<dyn EventSink>,
    pub registry: UploadRegistry,
    pub media_config: MediaConfigCache,
    pub probe: MediaProbe,
    pub settings: PipelineSettings,
}

/// A spawned upload; cancel it through the token passed to [`upload_file`].
pub struct UploadTask<T> {
    handle: JoinHandle<AppResult<T>>,
}

impl<T> UploadTask<T> {
    pub async fn join(self) -> AppResult<T> {
        self.handle
            .await
            .map_err(|e| AppError::Internal(format!("Upload task failed: {}", e)))?
    }
}

/// Upload `data`, encrypting it first when `encrypt` is set.
pub fn upload_file(
    ctx: &PipelineContext,
    encrypt: bool,
    data: Bytes,
    content_type: Option<String>,
    progress: Option<ProgressCallback>,
    cancel: CancellationToken,
    file_name: &str,
) -> UploadTask<UploadedContent> {
    let uploader = Arc::clone(&ctx.uploader);
    let encryptor = Arc::clone(&ctx.encryptor);
    let token = cancel;
    let file_name = file_name.to_string();

    let handle = tokio::spawn(async move {
        let check = |phase: &str| {
            if token.is_cancelled() {
                Err(AppError::upload_cancelled(phase, &file_name))
            } else {
                Ok(())
            }
        };

        if encrypt {
            let encrypted = run_blocking(move || encryptor.encrypt(&data)).await?;
            check("encrypt")?;

            let url = uploader
                .upload_content(encrypted.data, None, progress, token.clone())
                .await
                .map_err(|e| e.with_file_name(&file_name))?;
            check("upload")?;

            Ok(UploadedContent::Encrypted(EncryptedFile {
                url,
                info: encrypted.info,
            }))
        } else {
            let url = uploader
                .upload_content(data, content_type.as_deref(), progress, token.clone())
                .await
                .map_err(|e| e.with_file_name(&file_name))?;
            check("upload")?;

            Ok(UploadedContent::Plain { url })
        }
    });

    UploadTask { handle }
}

/// Position of one file in its batch's send order.
///
/// Holds the signal released by the previous file and the one this file
/// releases for the next.
pub struct SendTurn {
    previous: Option<oneshot::Receiver<()>>,
    next: oneshot::Sender<()>,
}

impl SendTurn {
    pub fn new(previous: Option<oneshot::Receiver<()>>) -> (Self, oneshot::Receiver<()>) {
        let (next, next_rx) = oneshot::channel();
        (Self { previous, next }, next_rx)
    }

    /// Resolves once the previous file is done. A dropped sender also counts as done.
    pub async fn wait_previous(&mut self) {
        if let Some(previous) = self.previous.take() {
            let _ = previous.await;
        }
    }

    pub fn release(self) {
        let _ = self.next.send(());
    }
}

/// Where a batch is being sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageTarget {
    pub room_id: String,
    pub relation: Option<Relation>,
    pub reply_to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileStatus {
    Sent {
        event_id: String,
    },
    Failed {
        error: String,
        size_limit_exceeded: bool,
    },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileOutcome {
    pub file_name: String,
    pub upload_id: Uuid,
    pub status: FileStatus,
}

pub struct FilePipeline {
    pub upload: UploadSnapshot,
    handle: JoinHandle<FileOutcome>,
}

impl FilePipeline {
    pub async fn join(self) -> FileOutcome {
        let upload = self.upload;
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(e) => {
                log::error!("Pipeline task for {} panicked: {}", upload.file_name, e);
                FileOutcome {
                    file_name: upload.file_name,
                    upload_id: upload.id,
                    status: FileStatus::Failed {
                        error: e.to_string(),
                        size_limit_exceeded: false,
                    },
                }
            }
        }
    }
}

/// Register `file`, announce it, and run its pipeline on a new task.
pub fn spawn_file_pipeline(
    ctx: &PipelineContext,
    file: AttachmentFile,
    target: MessageTarget,
    turn: SendTurn,
) -> FilePipeline {
    let cancel = CancellationToken::new();
    let upload = ctx.registry.insert(
        file.display_name(),
        &target.room_id,
        target.relation.as_ref(),
        file.size(),
        cancel.clone(),
    );
    ctx.events.publish(UploadEvent::UploadStarted {
        upload: upload.clone(),
    });

    let handle = tokio::spawn(run_file(ctx.clone(), file, target, upload.id, cancel, turn));
    FilePipeline { upload, handle }
}

async fn run_file(
    ctx: PipelineContext,
    file: AttachmentFile,
    target: MessageTarget,
    upload_id: Uuid,
    cancel: CancellationToken,
    mut turn: SendTurn,
) -> FileOutcome {
    let file_name = file.display_name().to_string();
    let result = process_file(&ctx, &file, &target, upload_id, &cancel, &mut turn).await;
    let status = settle(&ctx, &file_name, &target.room_id, upload_id, result);

    // Keep the chain linear even when this file never reached its turn.
    turn.wait_previous().await;
    turn.release();

    FileOutcome {
        file_name,
        upload_id,
        status,
    }
}

async fn process_file(
    ctx: &PipelineContext,
    file: &AttachmentFile,
    target: &MessageTarget,
    upload_id: Uuid,
    cancel: &CancellationToken,
    turn: &mut SendTurn,
) -> AppResult<String> {
    let file_name = file.display_name();
    let checkpoint = |phase: &str| {
        if ctx.registry.is_cancelled(upload_id) {
            log::info!("Cancellation observed for {} before {}", file_name, phase);
            Err(AppError::upload_cancelled(phase, file_name))
        } else {
            Ok(())
        }
    };

    let mut content = MessageContent::skeleton(file).with_relation(target.relation.as_ref());
    if let Some(reply_to) = &target.reply_to {
        content.add_reply_to(reply_to);
    }
    if ctx.settings.send_timing_metadata {
        content.decorate_start_sending_time();
    }

    checkpoint("start")?;
    ctx.registry.set_stage(upload_id, PipelineStage::TypeDispatch);
    let encrypt = ctx.destination.is_room_encrypted(&target.room_id).await?;

    content.msgtype = MediaKind::from_mime(file.mime_type.as_deref());
    let visual = match content.msgtype {
        MediaKind::Image => {
            ctx.registry.set_stage(upload_id, PipelineStage::Thumbnailing);
            Some(image_visual(ctx, file, encrypt, cancel).await)
        }
        MediaKind::Video => {
            ctx.registry.set_stage(upload_id, PipelineStage::Thumbnailing);
            Some(video_visual(ctx, file, encrypt, cancel).await)
        }
        MediaKind::Audio | MediaKind::File => None,
    };

    match visual {
        Some(Ok(visual)) => content.info.apply_visual(visual),
        Some(Err(e)) if e.is_cancelled() => return Err(e),
        Some(Err(e)) => {
            log::error!(
                "Could not derive a thumbnail for {}, sending as a plain file: {}",
                file_name,
                e
            );
            content.msgtype = MediaKind::File;
        }
        None => {}
    }

    checkpoint("upload")?;
    ctx.registry.set_stage(upload_id, PipelineStage::Uploading);
    let uploaded = upload_file(
        ctx,
        encrypt,
        file.data.clone(),
        file.mime_type.clone(),
        Some(progress_reporter(ctx, upload_id)),
        cancel.clone(),
        file_name,
    )
    .join()
    .await?;
    content.set_uploaded(uploaded);

    ctx.registry.set_stage(upload_id, PipelineStage::AwaitingTurn);
    turn.wait_previous().await;
    checkpoint("send")?;

    ctx.registry.set_stage(upload_id, PipelineStage::Sending);
    let thread_id = target.relation.as_ref().and_then(Relation::thread_id);
    let started = Instant::now();
    let response = ctx
        .destination
        .send_message(&target.room_id, thread_id, &content)
        .await?;

    if ctx.settings.send_timing_metadata {
        log::info!(
            "Message {} round trip: {}ms",
            response.event_id,
            started.elapsed().as_millis()
        );
    }

    Ok(response.event_id)
}

fn progress_reporter(ctx: &PipelineContext, upload_id: Uuid) -> ProgressCallback {
    let registry = ctx.registry.clone();
    let events = Arc::clone(&ctx.events);
    Arc::new(move |loaded, total| {
        if let Some(upload) = registry.update_progress(upload_id, loaded, total) {
            events.publish(UploadEvent::UploadProgress { upload });
        }
    })
}

async fn image_visual(
    ctx: &PipelineContext,
    file: &AttachmentFile,
    encrypt: bool,
    cancel: &CancellationToken,
) -> AppResult<VisualInfo> {
    let probed = ctx.probe.load_image(file).await?;
    let format = ThumbnailFormat::for_image(file.mime_type.as_deref());
    let thumbnail = make_thumbnail(probed.source, probed.width, probed.height, format, true).await?;

    let mut visual = VisualInfo {
        w: probed.width,
        h: probed.height,
        blurhash: thumbnail.blurhash.clone(),
        ..Default::default()
    };

    if !should_keep_image_thumbnail(file.mime_type.as_deref(), file.size(), thumbnail.size()) {
        log::debug!(
            "Dropping thumbnail for {} ({} bytes, original {} bytes)",
            file.display_name(),
            thumbnail.size(),
            file.size()
        );
        return Ok(visual);
    }

    attach_thumbnail(ctx, &mut visual, thumbnail, encrypt, cancel, file.display_name()).await?;
    Ok(visual)
}

/// Video thumbnails are always kept.
async fn video_visual(
    ctx: &PipelineContext,
    file: &AttachmentFile,
    encrypt: bool,
    cancel: &CancellationToken,
) -> AppResult<VisualInfo> {
    let probed = ctx.probe.load_video(file).await?;
    let thumbnail = make_thumbnail(
        probed.source,
        probed.width,
        probed.height,
        ThumbnailFormat::Jpeg,
        true,
    )
    .await?;

    let mut visual = VisualInfo {
        w: probed.width,
        h: probed.height,
        blurhash: thumbnail.blurhash.clone(),
        ..Default::default()
    };
    attach_thumbnail(ctx, &mut visual, thumbnail, encrypt, cancel, file.display_name()).await?;
    Ok(visual)
}

async fn attach_thumbnail(
    ctx: &PipelineContext,
    visual: &mut VisualInfo,
    thumbnail: ThumbnailResult,
    encrypt: bool,
    cancel: &CancellationToken,
    file_name: &str,
) -> AppResult<()> {
    let info = ThumbnailInfo {
        w: thumbnail.width,
        h: thumbnail.height,
        mimetype: thumbnail.mime_type.clone(),
        size: thumbnail.size(),
    };
    log::debug!(
        "Uploading {}x{} thumbnail for {} ({} bytes)",
        info.w,
        info.h,
        file_name,
        info.size
    );

    let uploaded = upload_file(
        ctx,
        encrypt,
        thumbnail.blob,
        Some(thumbnail.mime_type),
        None,
        cancel.clone(),
        file_name,
    )
    .join()
    .await?;

    visual.thumbnail_info = Some(info);
    visual.thumbnail = Some(uploaded);
    Ok(())
}

/// Terminal step: drop the handle, then report the result.
fn settle(
    ctx: &PipelineContext,
    file_name: &str,
    room_id: &str,
    upload_id: Uuid,
    result: AppResult<String>,
) -> FileStatus {
    let removed = ctx.registry.remove(upload_id);
    let was_cancelled = removed.as_ref().map_or(false, |u| u.canceled);

    match result {
        Ok(event_id) => {
            log::info!("Sent {} as {}", file_name, event_id);
            if let Some(mut upload) = removed {
                upload.stage = PipelineStage::Done;
                ctx.events.publish(UploadEvent::UploadFinished { upload });
            }
            ctx.events.publish(UploadEvent::MessageSent {
                room_id: room_id.to_string(),
                event_id: event_id.clone(),
            });
            FileStatus::Sent { event_id }
        }
        Err(e) if e.is_cancelled() || was_cancelled => {
            log::info!("Upload of {} stopped after cancellation: {}", file_name, e);
            FileStatus::Cancelled
        }
        Err(e) => {
            let size_limit_exceeded = e.is_size_limit_exceeded();
            if size_limit_exceeded {
                ctx.media_config.invalidate();
            }
            log::error!("Upload of {} failed: {}", file_name, e);

            if let Some(mut upload) = removed {
                upload.stage = PipelineStage::Failed;
                ctx.events.publish(UploadEvent::UploadFailed {
                    upload,
                    error: e.to_string(),
                    description: failure_description(file_name, &e),
                    size_limit_exceeded,
                });
            }
            FileStatus::Failed {
                error: e.to_string(),
                size_limit_exceeded,
            }
        }
    }
}
