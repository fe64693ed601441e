use std::sync::{Arc, Mutex};

use crate::errors::lock_or_recover;

use super::transport::{MediaConfig, MediaConfigSource};

/// Lazily fetched server media config, kept for the life of the process
/// until an upload is rejected for size.
#[derive(Clone, Default)]
pub struct MediaConfigCache {
    config: Arc<Mutex<Option<MediaConfig>>>,
    fetch_lock: Arc<tokio::sync::Mutex<()>>,
}

impl MediaConfigCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch once; concurrent callers wait on the same fetch. A failed fetch is
    /// cached as "no limit".
    pub async fn ensure_fetched(&self, source: &dyn MediaConfigSource) {
        if self.is_fetched() {
            return;
        }

        let _guard = self.fetch_lock.lock().await;
        if self.is_fetched() {
            return;
        }

        log::info!("[Media Config] Fetching");
        let config = match source.fetch_media_config().await {
            Ok(config) => {
                log::info!("[Media Config] Fetched upload size limit: {:?}", config.upload_size);
                config
            }
            Err(e) => {
                log::warn!("[Media Config] Fetch failed, assuming no limit: {}", e);
                MediaConfig::default()
            }
        };

        *lock_or_recover(&self.config, "media config store") = Some(config);
    }

    pub fn is_fetched(&self) -> bool {
        lock_or_recover(&self.config, "media config read").is_some()
    }

    /// Maximum upload size in bytes; `None` when unknown or unbounded.
    pub fn upload_limit(&self) -> Option<u64> {
        lock_or_recover(&self.config, "media config read")
            .as_ref()
            .and_then(|c| c.upload_size)
    }

    pub fn is_file_size_acceptable(&self, size: u64) -> bool {
        match self.upload_limit() {
            Some(limit) => size <= limit,
            None => true,
        }
    }

    /// Forget the cached config so the next batch re-fetches it.
    pub fn invalidate(&self) {
        log::info!("[Media Config] Invalidated after size-limit rejection");
        *lock_or_recover(&self.config, "media config invalidate") = None;
    }
}
