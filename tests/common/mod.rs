#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use std::collections::{HashMap, HashSet, VecDeque};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use attachment_uploader::content::{AttachmentFile, ImageInfo, MessageContent};
use attachment_uploader::errors::{AppError, AppResult};
use attachment_uploader::media_probe::{FrameExtractor, MediaProbe};
use attachment_uploader::notifications::{BroadcastEvents, UploadEvent};
use attachment_uploader::uploader::encryption::AesCtrEncryptor;
use attachment_uploader::uploader::media_config::MediaConfigCache;
use attachment_uploader::uploader::registry::UploadRegistry;
use attachment_uploader::uploader::transport::{
    ContentUploader, Destination, MediaConfig, MediaConfigSource, ProgressCallback, SendResponse,
};
use attachment_uploader::uploader::{
    ConfirmationPrompt, FileDecision, PipelineContext, PipelineSettings, UploadQueue,
};

pub const ROOM: &str = "!room:example.org";

#[derive(Debug, Clone)]
pub struct UploadRecord {
    pub url: String,
    pub data: Bytes,
    pub content_type: Option<String>,
}

/// Content store that keeps every payload in memory.
#[derive(Default)]
pub struct RecordingUploader {
    counter: AtomicUsize,
    delays: Mutex<HashMap<Bytes, Duration>>,
    held: Mutex<HashSet<Bytes>>,
    failures: Mutex<HashMap<Bytes, u16>>,
    started: Mutex<Vec<Bytes>>,
    completed: Mutex<Vec<UploadRecord>>,
}

impl RecordingUploader {
    pub fn delay(&self, data: &[u8], delay: Duration) {
        self.delays
            .lock()
            .unwrap()
            .insert(Bytes::copy_from_slice(data), delay);
    }

    /// Uploads of `data` never finish on their own; only cancellation ends them.
    pub fn hold(&self, data: &[u8]) {
        self.held.lock().unwrap().insert(Bytes::copy_from_slice(data));
    }

    pub fn fail(&self, data: &[u8], status: u16) {
        self.failures
            .lock()
            .unwrap()
            .insert(Bytes::copy_from_slice(data), status);
    }

    pub fn has_started(&self, data: &[u8]) -> bool {
        self.started.lock().unwrap().iter().any(|d| d.as_ref() == data)
    }

    pub fn completed(&self) -> Vec<UploadRecord> {
        self.completed.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContentUploader for RecordingUploader {
    async fn upload_content(
        &self,
        data: Bytes,
        content_type: Option<&str>,
        progress: Option<ProgressCallback>,
        cancel: CancellationToken,
    ) -> AppResult<String> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let total = data.len() as u64;
        self.started.lock().unwrap().push(data.clone());
        if let Some(progress) = &progress {
            progress(0, total);
        }

        let delay = self.delays.lock().unwrap().get(&data).copied();
        let held = self.held.lock().unwrap().contains(&data);
        let failure = self.failures.lock().unwrap().get(&data).copied();

        let wait = async move {
            if held {
                futures::future::pending::<()>().await;
            } else if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(AppError::upload_cancelled("upload", "test"));
            }
            _ = wait => {}
        }

        if let Some(status) = failure {
            return Err(AppError::upload_failed("rejected by test store", Some(status)));
        }

        if let Some(progress) = &progress {
            progress(total, total);
        }

        let url = format!("mxc://test/{}", n);
        self.completed.lock().unwrap().push(UploadRecord {
            url: url.clone(),
            data,
            content_type: content_type.map(str::to_string),
        });
        Ok(url)
    }
}

#[derive(Debug, Clone)]
pub struct SentMessage {
    pub room_id: String,
    pub thread_id: Option<String>,
    pub content: MessageContent,
}

#[derive(Default)]
pub struct RecordingDestination {
    pub guest: bool,
    pub encrypted: bool,
    send_failures: Mutex<HashMap<String, u16>>,
    sent: Mutex<Vec<SentMessage>>,
    stickers: Mutex<Vec<(String, String)>>,
}

impl RecordingDestination {
    /// Fail the send of the message whose body is `body`.
    pub fn fail_send(&self, body: &str, status: u16) {
        self.send_failures
            .lock()
            .unwrap()
            .insert(body.to_string(), status);
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_bodies(&self) -> Vec<String> {
        self.sent().into_iter().map(|m| m.content.body).collect()
    }

    pub fn stickers(&self) -> Vec<(String, String)> {
        self.stickers.lock().unwrap().clone()
    }
}

#[async_trait]
impl Destination for RecordingDestination {
    async fn is_guest(&self) -> bool {
        self.guest
    }

    async fn is_room_encrypted(&self, _room_id: &str) -> AppResult<bool> {
        Ok(self.encrypted)
    }

    async fn send_message(
        &self,
        room_id: &str,
        thread_id: Option<&str>,
        content: &MessageContent,
    ) -> AppResult<SendResponse> {
        if let Some(status) = self.send_failures.lock().unwrap().get(&content.body).copied() {
            return Err(AppError::send_failed("rejected by test room", Some(status)));
        }

        let mut sent = self.sent.lock().unwrap();
        sent.push(SentMessage {
            room_id: room_id.to_string(),
            thread_id: thread_id.map(str::to_string),
            content: content.clone(),
        });
        Ok(SendResponse {
            event_id: format!("$event{}", sent.len()),
        })
    }

    async fn send_sticker(
        &self,
        room_id: &str,
        _thread_id: Option<&str>,
        url: &str,
        _info: &ImageInfo,
        _text: &str,
    ) -> AppResult<SendResponse> {
        if url.is_empty() {
            return Err(AppError::send_failed("missing sticker url", Some(400)));
        }
        self.stickers
            .lock()
            .unwrap()
            .push((room_id.to_string(), url.to_string()));
        Ok(SendResponse {
            event_id: "$sticker".to_string(),
        })
    }
}

/// Confirmation answers fed from a script; answers SendAll once the script runs out.
pub struct ScriptedPrompt {
    pub accept_over_limit: bool,
    decisions: Mutex<VecDeque<FileDecision>>,
    pub over_limit_calls: AtomicUsize,
    pub file_calls: AtomicUsize,
}

impl ScriptedPrompt {
    pub fn new(accept_over_limit: bool, decisions: Vec<FileDecision>) -> Self {
        Self {
            accept_over_limit,
            decisions: Mutex::new(decisions.into()),
            over_limit_calls: AtomicUsize::new(0),
            file_calls: AtomicUsize::new(0),
        }
    }

    pub fn dialogs_shown(&self) -> usize {
        self.over_limit_calls.load(Ordering::SeqCst) + self.file_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConfirmationPrompt for ScriptedPrompt {
    async fn confirm_over_limit(&self, _too_big: &[AttachmentFile], _limit: Option<u64>) -> bool {
        self.over_limit_calls.fetch_add(1, Ordering::SeqCst);
        self.accept_over_limit
    }

    async fn confirm_file(&self, _file: &AttachmentFile, _index: usize, _total: usize) -> FileDecision {
        self.file_calls.fetch_add(1, Ordering::SeqCst);
        self.decisions
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(FileDecision::SendAll)
    }
}

pub struct CountingConfigSource {
    pub limit: Option<u64>,
    pub calls: AtomicUsize,
}

impl CountingConfigSource {
    pub fn fetches(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaConfigSource for CountingConfigSource {
    async fn fetch_media_config(&self) -> AppResult<MediaConfig> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(MediaConfig {
            upload_size: self.limit,
        })
    }
}

pub struct FixedFrame {
    pub width: u32,
    pub height: u32,
}

#[async_trait]
impl FrameExtractor for FixedFrame {
    async fn first_frame(&self, _data: Bytes, _mime_type: &str) -> AppResult<DynamicImage> {
        Ok(DynamicImage::ImageRgb8(RgbImage::from_pixel(
            self.width,
            self.height,
            Rgb([200, 40, 40]),
        )))
    }
}

pub struct FailingFrames;

#[async_trait]
impl FrameExtractor for FailingFrames {
    async fn first_frame(&self, _data: Bytes, mime_type: &str) -> AppResult<DynamicImage> {
        Err(AppError::decode(format!("no decoder for {}", mime_type)))
    }
}

pub struct HarnessOptions {
    pub limit: Option<u64>,
    pub encrypted: bool,
    pub guest: bool,
    pub accept_over_limit: bool,
    pub decisions: Vec<FileDecision>,
    pub frames: Arc<dyn FrameExtractor>,
    pub settings: PipelineSettings,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            limit: None,
            encrypted: false,
            guest: false,
            accept_over_limit: true,
            decisions: Vec::new(),
            frames: Arc::new(FixedFrame {
                width: 640,
                height: 360,
            }),
            settings: PipelineSettings::default(),
        }
    }
}

pub struct Harness {
    pub queue: UploadQueue,
    pub uploader: Arc<RecordingUploader>,
    pub destination: Arc<RecordingDestination>,
    pub prompt: Arc<ScriptedPrompt>,
    pub config_source: Arc<CountingConfigSource>,
    pub events: broadcast::Receiver<UploadEvent>,
}

impl Harness {
    pub fn new(options: HarnessOptions) -> Self {
        let uploader = Arc::new(RecordingUploader::default());
        let destination = Arc::new(RecordingDestination {
            guest: options.guest,
            encrypted: options.encrypted,
            ..Default::default()
        });
        let prompt = Arc::new(ScriptedPrompt::new(
            options.accept_over_limit,
            options.decisions,
        ));
        let config_source = Arc::new(CountingConfigSource {
            limit: options.limit,
            calls: AtomicUsize::new(0),
        });
        let broadcast = Arc::new(BroadcastEvents::new());
        let events = broadcast.subscribe();

        let ctx = PipelineContext {
            uploader: uploader.clone(),
            destination: destination.clone(),
            encryptor: Arc::new(AesCtrEncryptor),
            events: broadcast,
            registry: UploadRegistry::new(),
            media_config: MediaConfigCache::new(),
            probe: MediaProbe::new(options.frames),
            settings: options.settings,
        };
        let queue = UploadQueue::new(ctx, config_source.clone(), prompt.clone());

        Self {
            queue,
            uploader,
            destination,
            prompt,
            config_source,
            events,
        }
    }

    pub fn default_setup() -> Self {
        Self::new(HarnessOptions::default())
    }

    pub fn drain_events(&mut self) -> Vec<UploadEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

pub fn event_names(events: &[UploadEvent]) -> Vec<&'static str> {
    events.iter().map(UploadEvent::name).collect()
}

pub fn text_file(name: &str, contents: &str) -> AttachmentFile {
    AttachmentFile::new(name, Some("text/plain"), contents.as_bytes().to_vec())
}

pub fn encode_png(image: &DynamicImage) -> Vec<u8> {
    let mut out = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
        .unwrap();
    out
}

/// Incompressible image content, so the PNG stays large and thumbnails pay off.
pub fn noise_png(width: u32, height: u32) -> Vec<u8> {
    let mut state = 0x2545_F491u32;
    let image = RgbImage::from_fn(width, height, |_, _| {
        let mut next = || {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state & 0xFF) as u8
        };
        Rgb([next(), next(), next()])
    });
    encode_png(&DynamicImage::ImageRgb8(image))
}

pub fn solid_png(width: u32, height: u32) -> Vec<u8> {
    encode_png(&DynamicImage::ImageRgb8(RgbImage::from_pixel(
        width,
        height,
        Rgb([30, 120, 200]),
    )))
}

/// Poll `condition` until it holds, failing the test after two seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
