use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::content::Relation;
use crate::errors::lock_or_recover;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Pending,
    TypeDispatch,
    Thumbnailing,
    Uploading,
    AwaitingTurn,
    Sending,
    Done,
    Failed,
    Canceled,
}

/// One in-flight upload. Lives only inside the registry.
#[derive(Debug)]
struct UploadHandle {
    id: Uuid,
    file_name: String,
    room_id: String,
    relation: Option<Relation>,
    total: u64,
    loaded: u64,
    canceled: bool,
    stage: PipelineStage,
    cancel_token: CancellationToken,
}

impl UploadHandle {
    fn snapshot(&self) -> UploadSnapshot {
        UploadSnapshot {
            id: self.id,
            file_name: self.file_name.clone(),
            room_id: self.room_id.clone(),
            relation: self.relation.clone(),
            total: self.total,
            loaded: self.loaded,
            canceled: self.canceled,
            stage: self.stage,
        }
    }
}

/// Read-only copy of an upload handle, handed out to callers and events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadSnapshot {
    pub id: Uuid,
    pub file_name: String,
    pub room_id: String,
    pub relation: Option<Relation>,
    pub total: u64,
    pub loaded: u64,
    pub canceled: bool,
    pub stage: PipelineStage,
}

impl UploadSnapshot {
    pub fn progress_percent(&self) -> f32 {
        if self.total == 0 {
            return 0.0;
        }
        (self.loaded as f64 / self.total as f64 * 100.0) as f32
    }
}

/// In-flight uploads in insertion order.
#[derive(Debug, Clone, Default)]
pub struct UploadRegistry {
    uploads: Arc<Mutex<Vec<UploadHandle>>>,
}

impl UploadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &self,
        file_name: &str,
        room_id: &str,
        relation: Option<&Relation>,
        total: u64,
        cancel_token: CancellationToken,
    ) -> UploadSnapshot {
        let handle = UploadHandle {
            id: Uuid::new_v4(),
            file_name: file_name.to_string(),
            room_id: room_id.to_string(),
            relation: relation.cloned(),
            total,
            loaded: 0,
            canceled: false,
            stage: PipelineStage::Pending,
            cancel_token,
        };
        let snapshot = handle.snapshot();

        lock_or_recover(&self.uploads, "upload insert").push(handle);
        log::debug!("Registered upload {} for {}", snapshot.id, snapshot.file_name);
        snapshot
    }

    fn update<R>(
        &self,
        id: Uuid,
        operation: &str,
        f: impl FnOnce(&mut UploadHandle) -> R,
    ) -> Option<R> {
        let mut uploads = lock_or_recover(&self.uploads, operation);
        uploads.iter_mut().find(|h| h.id == id).map(f)
    }

    pub fn update_progress(&self, id: Uuid, loaded: u64, total: u64) -> Option<UploadSnapshot> {
        self.update(id, "progress update", |handle| {
            handle.loaded = loaded;
            handle.total = total;
            handle.snapshot()
        })
    }

    /// A cancelled handle stays at `Canceled`; later stage changes are ignored.
    pub fn set_stage(&self, id: Uuid, stage: PipelineStage) {
        self.update(id, "stage update", |handle| {
            if handle.canceled {
                return;
            }
            log::debug!(
                "Upload {} ({}): {:?} -> {:?}",
                handle.id,
                handle.file_name,
                handle.stage,
                stage
            );
            handle.stage = stage;
        });
    }

    /// A handle that is no longer registered counts as cancelled.
    pub fn is_cancelled(&self, id: Uuid) -> bool {
        self.update(id, "cancellation check", |handle| handle.canceled)
            .unwrap_or(true)
    }

    /// Flag the handle and abort its in-flight network work. Returns the snapshot
    /// when the upload was found and not already cancelled.
    pub fn request_cancel(&self, id: Uuid) -> Option<UploadSnapshot> {
        self.update(id, "mark cancelled", |handle| {
            if handle.canceled {
                return None;
            }
            handle.canceled = true;
            handle.stage = PipelineStage::Canceled;
            handle.cancel_token.cancel();
            log::info!("Cancellation requested for {}", handle.file_name);
            Some(handle.snapshot())
        })
        .flatten()
    }

    pub fn remove(&self, id: Uuid) -> Option<UploadSnapshot> {
        let mut uploads = lock_or_recover(&self.uploads, "upload removal");
        let index = uploads.iter().position(|h| h.id == id)?;
        Some(uploads.remove(index).snapshot())
    }

    pub fn snapshot(&self, id: Uuid) -> Option<UploadSnapshot> {
        self.update(id, "snapshot", |handle| handle.snapshot())
    }

    /// Non-cancelled uploads whose relation matches `relation` (both absent counts).
    pub fn current_uploads(&self, relation: Option<&Relation>) -> Vec<UploadSnapshot> {
        let uploads = lock_or_recover(&self.uploads, "current uploads");
        uploads
            .iter()
            .filter(|h| !h.canceled)
            .filter(|h| match (h.relation.as_ref(), relation) {
                (None, None) => true,
                (Some(a), Some(b)) => a.matches(b),
                _ => false,
            })
            .map(UploadHandle::snapshot)
            .collect()
    }

    pub fn len(&self) -> usize {
        lock_or_recover(&self.uploads, "registry length").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
