use serde::Serialize;
use tokio::sync::broadcast;

use crate::uploader::registry::UploadSnapshot;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Which composer a batch was sent from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TimelineContext {
    Room { room_id: String },
    Thread { room_id: String, thread_id: String },
}

/// Upload lifecycle notifications. Fire-and-forget.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "action")]
pub enum UploadEvent {
    UploadStarted {
        upload: UploadSnapshot,
    },
    UploadProgress {
        upload: UploadSnapshot,
    },
    UploadFinished {
        upload: UploadSnapshot,
    },
    UploadFailed {
        upload: UploadSnapshot,
        error: String,
        description: String,
        size_limit_exceeded: bool,
    },
    UploadCanceled {
        upload: UploadSnapshot,
    },
    MessageSent {
        room_id: String,
        event_id: String,
    },
    ReplyCleared {
        context: TimelineContext,
    },
    FocusComposer {
        context: TimelineContext,
    },
    RequireRegistration,
}

impl UploadEvent {
    pub fn name(&self) -> &'static str {
        match self {
            UploadEvent::UploadStarted { .. } => "upload_started",
            UploadEvent::UploadProgress { .. } => "upload_progress",
            UploadEvent::UploadFinished { .. } => "upload_finished",
            UploadEvent::UploadFailed { .. } => "upload_failed",
            UploadEvent::UploadCanceled { .. } => "upload_canceled",
            UploadEvent::MessageSent { .. } => "message_sent",
            UploadEvent::ReplyCleared { .. } => "reply_cleared",
            UploadEvent::FocusComposer { .. } => "focus_composer",
            UploadEvent::RequireRegistration => "require_registration",
        }
    }
}

pub trait EventSink: Send + Sync {
    /// Returns whether anyone received the event.
    fn publish(&self, event: UploadEvent) -> bool;
}

/// Event sink backed by a tokio broadcast channel.
#[derive(Clone)]
pub struct BroadcastEvents {
    sender: broadcast::Sender<UploadEvent>,
}

impl BroadcastEvents {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastEvents {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for BroadcastEvents {
    fn publish(&self, event: UploadEvent) -> bool {
        let name = event.name();
        match self.sender.send(event) {
            Ok(receivers) => {
                log::debug!("Emitted event '{}' to {} receiver(s)", name, receivers);
                true
            }
            Err(_) => {
                log::debug!("Event '{}' dropped: no subscribers", name);
                false
            }
        }
    }
}
