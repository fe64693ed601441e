use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use attachment_uploader::config;
use attachment_uploader::content::AttachmentFile;
use attachment_uploader::media_probe::{FfmpegFrameExtractor, MediaProbe};
use attachment_uploader::notifications::{BroadcastEvents, UploadEvent};
use attachment_uploader::security::{FileSystemGuard, InputValidator};
use attachment_uploader::uploader::encryption::AesCtrEncryptor;
use attachment_uploader::uploader::media_config::MediaConfigCache;
use attachment_uploader::uploader::registry::UploadRegistry;
use attachment_uploader::uploader::{
    BatchRequest, ConfirmationPrompt, FileDecision, FileStatus, HomeserverClient,
    PipelineContext, UploadQueue,
};

#[derive(Parser)]
#[command(name = "attachment-uploader", version, about = "Send files to a chat room")]
struct Cli {
    /// Settings file to use instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Upload files and post one message per file, in order
    Send {
        #[arg(long)]
        room: String,
        /// Thread root event to post into
        #[arg(long)]
        thread: Option<String>,
        #[arg(long = "reply-to")]
        reply_to: Option<String>,
        /// Skip all confirmation prompts
        #[arg(long)]
        yes: bool,
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Print the homeserver's upload size limit
    Limit,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let level_from_env = init_logging();
    let config =
        config::load_config(cli.config.as_deref()).context("Failed to load configuration")?;
    if !level_from_env {
        log::set_max_level(config.log_level_filter());
    }

    let client = Arc::new(HomeserverClient::new(&config)?);
    let events = Arc::new(BroadcastEvents::new());
    let ctx = PipelineContext {
        uploader: client.clone(),
        destination: client.clone(),
        encryptor: Arc::new(AesCtrEncryptor),
        events: events.clone(),
        registry: UploadRegistry::new(),
        media_config: MediaConfigCache::new(),
        probe: MediaProbe::new(Arc::new(FfmpegFrameExtractor::new(
            config.ffmpeg_path.clone(),
        ))),
        settings: config.pipeline_settings(),
    };

    let result = match cli.command {
        Command::Limit => {
            let queue = UploadQueue::new(ctx, client, Arc::new(AutoConfirm));
            match queue.fetch_upload_limit().await {
                Some(limit) => println!("{}", limit),
                None => println!("unlimited"),
            }
            Ok(())
        }
        Command::Send {
            room,
            thread,
            reply_to,
            yes,
            files,
        } => {
            let prompt: Arc<dyn ConfirmationPrompt> = if yes {
                Arc::new(AutoConfirm)
            } else {
                Arc::new(TerminalPrompt)
            };
            let queue = UploadQueue::new(ctx, client, prompt);
            send(&queue, &events, room, thread, reply_to, files).await
        }
    };

    if let Err(e) = FileSystemGuard::cleanup_temp_files() {
        log::warn!("Failed to clean up temp files: {}", e);
    }

    result
}

/// Start logging at info so config loading is visible; RUST_LOG takes over when set.
fn init_logging() -> bool {
    let from_env = std::env::var_os("RUST_LOG").is_some();
    let mut logger = env_logger::Builder::new();
    if from_env {
        logger.parse_default_env();
    } else {
        logger.filter_level(log::LevelFilter::Trace);
    }
    logger.init();
    if !from_env {
        log::set_max_level(log::LevelFilter::Info);
    }
    from_env
}

async fn send(
    queue: &UploadQueue,
    events: &BroadcastEvents,
    room: String,
    thread: Option<String>,
    reply_to: Option<String>,
    paths: Vec<PathBuf>,
) -> Result<()> {
    InputValidator::validate_room_id(&room)?;

    let mut files = Vec::with_capacity(paths.len());
    for path in &paths {
        let file = AttachmentFile::from_path(&path.to_string_lossy())
            .await
            .with_context(|| format!("Cannot read {}", path.display()))?;
        files.push(file);
    }

    let mut request = match thread {
        Some(thread) => BatchRequest::thread(room, thread),
        None => BatchRequest::room(room),
    };
    if let Some(reply_to) = reply_to {
        request = request.replying_to(reply_to);
    }

    let stop = CancellationToken::new();
    let event_logger = tokio::spawn(log_events(events.subscribe(), stop.clone()));
    let report = queue.send_content_list_to_room(files, request).await;
    stop.cancel();
    if let Err(e) = event_logger.await {
        log::warn!("Event logger stopped abnormally: {}", e);
    }
    let report = report?;

    if report.registration_required {
        bail!("Guest accounts must register before uploading files");
    }

    for outcome in &report.outcomes {
        match &outcome.status {
            FileStatus::Sent { event_id } => println!("sent    {} ({})", outcome.file_name, event_id),
            FileStatus::Failed { error, .. } => println!("failed  {}: {}", outcome.file_name, error),
            FileStatus::Cancelled => println!("stopped {}", outcome.file_name),
        }
    }
    for name in &report.rejected_oversize {
        println!("too big {}", name);
    }

    if report.failed_count() > 0 {
        bail!("{} file(s) failed to upload", report.failed_count());
    }
    Ok(())
}

/// Log events until `stop` fires, then flush whatever is still queued.
/// Returns how many events were logged.
async fn log_events(
    mut rx: tokio::sync::broadcast::Receiver<UploadEvent>,
    stop: CancellationToken,
) -> usize {
    let mut logged = 0;
    loop {
        tokio::select! {
            biased;
            received = rx.recv() => match received {
                Ok(event) => {
                    log_event(event);
                    logged += 1;
                }
                Err(RecvError::Lagged(skipped)) => {
                    log::debug!("Event logger skipped {} events", skipped)
                }
                Err(RecvError::Closed) => return logged,
            },
            _ = stop.cancelled() => break,
        }
    }

    while let Ok(event) = rx.try_recv() {
        log_event(event);
        logged += 1;
    }
    logged
}

fn log_event(event: UploadEvent) {
    match event {
        UploadEvent::UploadStarted { upload } => {
            log::info!("Uploading {} ({} bytes)", upload.file_name, upload.total)
        }
        UploadEvent::UploadProgress { upload } => {
            log::debug!("{}: {:.0}%", upload.file_name, upload.progress_percent())
        }
        UploadEvent::UploadFailed { description, .. } => log::error!("{}", description),
        event => log::debug!("Event: {}", event.name()),
    }
}

/// Answers every question with "go ahead".
struct AutoConfirm;

#[async_trait]
impl ConfirmationPrompt for AutoConfirm {
    async fn confirm_over_limit(&self, too_big: &[AttachmentFile], limit: Option<u64>) -> bool {
        log::warn!(
            "Leaving out {} file(s) over the {:?} byte limit",
            too_big.len(),
            limit
        );
        true
    }

    async fn confirm_file(&self, _file: &AttachmentFile, _index: usize, _total: usize) -> FileDecision {
        FileDecision::SendAll
    }
}

struct TerminalPrompt;

#[async_trait]
impl ConfirmationPrompt for TerminalPrompt {
    async fn confirm_over_limit(&self, too_big: &[AttachmentFile], limit: Option<u64>) -> bool {
        let names: Vec<&str> = too_big.iter().map(|f| f.display_name()).collect();
        let question = format!(
            "Too large to upload (limit {} bytes): {}\nSend the remaining files? [y/n] ",
            limit.map_or_else(|| "unknown".to_string(), |l| l.to_string()),
            names.join(", ")
        );
        matches!(ask(question).await.as_deref(), Some("y" | "yes"))
    }

    async fn confirm_file(&self, file: &AttachmentFile, index: usize, total: usize) -> FileDecision {
        let question = format!(
            "Upload {} ({} of {}, {} bytes)? [y]es/[n]o/[a]ll/[s]kip ",
            file.display_name(),
            index + 1,
            total,
            file.size()
        );
        match ask(question).await.as_deref() {
            Some("y" | "yes") => FileDecision::Send,
            Some("a" | "all") => FileDecision::SendAll,
            Some("s" | "skip") => FileDecision::Skip,
            _ => FileDecision::Abort,
        }
    }
}

async fn ask(question: String) -> Option<String> {
    tokio::task::spawn_blocking(move || {
        print!("{}", question);
        io::stdout().flush().ok()?;
        let mut line = String::new();
        io::stdin().read_line(&mut line).ok()?;
        Some(line.trim().to_lowercase())
    })
    .await
    .ok()
    .flatten()
}
