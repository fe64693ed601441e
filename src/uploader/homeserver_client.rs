use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Body, Client, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use serde_json::json;
use std::cmp::min;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::time::{sleep, Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::content::{ImageInfo, MessageContent, Relation};
use crate::errors::{lock_or_recover, AppError, AppResult};

use super::transport::{
    ContentUploader, Destination, MediaConfig, MediaConfigSource, ProgressCallback, SendResponse,
};

const UPLOAD_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub exponential_base: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(120),
            exponential_base: 2.0,
        }
    }
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    content_uri: String,
}

#[derive(Debug, Deserialize)]
struct WhoAmIResponse {
    #[serde(default)]
    is_guest: bool,
}

/// Client-server API client covering media upload, media config and message sends.
pub struct HomeserverClient {
    client: Client,
    base_url: Url,
    access_token: Option<String>,
    rate_limiter: Arc<Mutex<HashMap<String, Instant>>>,
    min_request_interval: Duration,
    retry_config: RetryConfig,
    encrypted_rooms: Arc<Mutex<HashMap<String, bool>>>,
}

impl HomeserverClient {
    pub fn new(config: &Config) -> AppResult<Self> {
        let base_url = Url::parse(config.homeserver_url.trim())
            .map_err(|e| AppError::Config(format!("Invalid homeserver URL: {}", e)))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url,
            access_token: config.access_token.clone(),
            rate_limiter: Arc::new(Mutex::new(HashMap::new())),
            min_request_interval: Duration::from_millis(config.rate_limit_delay_ms),
            retry_config: RetryConfig {
                max_retries: config.max_retry_attempts,
                ..RetryConfig::default()
            },
            encrypted_rooms: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> AppResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| AppError::Config("Homeserver URL cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.access_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Send a request, retrying rate limits and server errors with backoff.
    async fn execute_with_retry<F>(
        &self,
        label: &str,
        rate_key: &str,
        build: F,
        make_error: fn(String, Option<u16>) -> AppError,
    ) -> AppResult<Response>
    where
        F: Fn() -> AppResult<RequestBuilder>,
    {
        let mut attempt = 0;

        loop {
            self.wait_for_rate_limit(rate_key).await;

            let response = self.authorize(build()?).send().await?;
            let status = response.status();
            self.update_rate_limit(rate_key);

            if status.is_success() {
                return Ok(response);
            }

            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            let error = make_error(
                format!("Homeserver error {} for {}: {}", status, label, error_text),
                Some(status.as_u16()),
            );

            attempt += 1;
            if should_retry_error(status.as_u16()) && attempt <= self.retry_config.max_retries {
                let delay = if status == StatusCode::TOO_MANY_REQUESTS {
                    extract_retry_after(&error_text)
                        .unwrap_or_else(|| self.calculate_backoff_delay(attempt))
                } else {
                    self.calculate_backoff_delay(attempt)
                };

                log::warn!(
                    "{} attempt {} failed, retrying in {:?}: {}",
                    label,
                    attempt,
                    delay,
                    error
                );
                sleep(delay).await;
                continue;
            }

            return Err(error);
        }
    }

    async fn wait_for_rate_limit(&self, key: &str) {
        if self.min_request_interval.is_zero() {
            return;
        }

        let wait_time = {
            let rate_limiter = lock_or_recover(&self.rate_limiter, "rate limiter read");
            rate_limiter.get(key).and_then(|last_request| {
                let elapsed = last_request.elapsed();
                (elapsed < self.min_request_interval).then(|| self.min_request_interval - elapsed)
            })
        };

        if let Some(wait_time) = wait_time {
            sleep(wait_time).await;
        }
    }

    fn update_rate_limit(&self, key: &str) {
        lock_or_recover(&self.rate_limiter, "rate limiter update")
            .insert(key.to_string(), Instant::now());
    }

    fn calculate_backoff_delay(&self, attempt: u32) -> Duration {
        let delay_ms = self.retry_config.base_delay.as_millis() as f64
            * self.retry_config.exponential_base.powi(attempt as i32 - 1);

        let delay = Duration::from_millis(delay_ms as u64);
        min(delay, self.retry_config.max_delay)
    }

    async fn send_event(
        &self,
        room_id: &str,
        event_type: &str,
        body: serde_json::Value,
    ) -> AppResult<SendResponse> {
        let txn_id = uuid::Uuid::new_v4().simple().to_string();
        let url = self.endpoint(&[
            "_matrix",
            "client",
            "v3",
            "rooms",
            room_id,
            "send",
            event_type,
            txn_id.as_str(),
        ])?;

        let response = self
            .execute_with_retry(
                event_type,
                room_id,
                || Ok(self.client.put(url.clone()).json(&body)),
                |reason, status| AppError::send_failed(reason, status),
            )
            .await?;

        Ok(response.json::<SendResponse>().await?)
    }
}

#[async_trait]
impl ContentUploader for HomeserverClient {
    async fn upload_content(
        &self,
        data: Bytes,
        content_type: Option<&str>,
        progress: Option<ProgressCallback>,
        cancel: CancellationToken,
    ) -> AppResult<String> {
        let url = self.endpoint(&["_matrix", "media", "v3", "upload"])?;
        let content_type = content_type.unwrap_or("application/octet-stream").to_string();
        let total = data.len();

        let request = self.execute_with_retry(
            "media upload",
            "media",
            || {
                Ok(self
                    .client
                    .post(url.clone())
                    .header(CONTENT_TYPE, content_type.as_str())
                    .header(CONTENT_LENGTH, total)
                    .body(progress_body(data.clone(), progress.clone())))
            },
            |reason, status| AppError::upload_failed(reason, status),
        );

        let response = tokio::select! {
            _ = cancel.cancelled() => {
                log::info!("Upload of {} bytes aborted", total);
                return Err(AppError::upload_cancelled("upload", ""));
            }
            response = request => response?,
        };

        let uploaded: UploadResponse = response.json().await?;
        log::debug!("Uploaded {} bytes as {}", total, uploaded.content_uri);
        Ok(uploaded.content_uri)
    }
}

#[async_trait]
impl MediaConfigSource for HomeserverClient {
    async fn fetch_media_config(&self) -> AppResult<MediaConfig> {
        let url = self.endpoint(&["_matrix", "media", "v3", "config"])?;
        let response = self
            .execute_with_retry(
                "media config",
                "media",
                || Ok(self.client.get(url.clone())),
                |reason, status| AppError::upload_failed(reason, status),
            )
            .await?;
        Ok(response.json::<MediaConfig>().await?)
    }
}

#[async_trait]
impl Destination for HomeserverClient {
    async fn is_guest(&self) -> bool {
        let url = match self.endpoint(&["_matrix", "client", "v3", "account", "whoami"]) {
            Ok(url) => url,
            Err(_) => return false,
        };

        let result = self
            .execute_with_retry(
                "whoami",
                "account",
                || Ok(self.client.get(url.clone())),
                |reason, status| AppError::send_failed(reason, status),
            )
            .await;

        match result {
            Ok(response) => match response.json::<WhoAmIResponse>().await {
                Ok(whoami) => whoami.is_guest,
                Err(e) => {
                    log::warn!("Unreadable whoami response (assuming full account): {}", e);
                    false
                }
            },
            Err(e) => {
                log::warn!("whoami failed (assuming full account): {}", e);
                false
            }
        }
    }

    async fn is_room_encrypted(&self, room_id: &str) -> AppResult<bool> {
        let cached = lock_or_recover(&self.encrypted_rooms, "encryption cache read")
            .get(room_id)
            .copied();
        if let Some(encrypted) = cached {
            return Ok(encrypted);
        }

        let url = self.endpoint(&[
            "_matrix",
            "client",
            "v3",
            "rooms",
            room_id,
            "state",
            "m.room.encryption",
            "",
        ])?;
        let response = self.authorize(self.client.get(url)).send().await?;

        let encrypted = match response.status() {
            status if status.is_success() => true,
            StatusCode::NOT_FOUND => false,
            status => {
                return Err(AppError::send_failed(
                    format!("Could not read encryption state of {}", room_id),
                    Some(status.as_u16()),
                ));
            }
        };

        log::debug!("Room {} encrypted: {}", room_id, encrypted);
        lock_or_recover(&self.encrypted_rooms, "encryption cache update")
            .insert(room_id.to_string(), encrypted);
        Ok(encrypted)
    }

    async fn send_message(
        &self,
        room_id: &str,
        thread_id: Option<&str>,
        content: &MessageContent,
    ) -> AppResult<SendResponse> {
        let mut content = content.clone();
        if let (Some(thread_id), None) = (thread_id, &content.relates_to) {
            content.relates_to = Some(Relation::thread(thread_id));
        }

        self.send_event(room_id, "m.room.message", serde_json::to_value(&content)?)
            .await
    }

    async fn send_sticker(
        &self,
        room_id: &str,
        thread_id: Option<&str>,
        url: &str,
        info: &ImageInfo,
        text: &str,
    ) -> AppResult<SendResponse> {
        let mut body = json!({
            "body": text,
            "url": url,
            "info": info,
        });
        if let Some(thread_id) = thread_id {
            body["m.relates_to"] = serde_json::to_value(Relation::thread(thread_id))?;
        }

        self.send_event(room_id, "m.sticker", body).await
    }
}

/// Request body that reports `(loaded, total)` as each chunk is handed to the connection.
fn progress_body(data: Bytes, progress: Option<ProgressCallback>) -> Body {
    let total = data.len() as u64;
    let mut loaded = 0u64;

    let chunks = split_chunks(data, UPLOAD_CHUNK_SIZE)
        .into_iter()
        .map(move |chunk| {
            loaded += chunk.len() as u64;
            if let Some(progress) = &progress {
                progress(loaded, total);
            }
            Ok::<Bytes, std::io::Error>(chunk)
        });

    Body::wrap_stream(futures::stream::iter(chunks))
}

fn split_chunks(data: Bytes, chunk_size: usize) -> Vec<Bytes> {
    (0..data.len())
        .step_by(chunk_size)
        .map(|start| data.slice(start..min(start + chunk_size, data.len())))
        .collect()
}

fn should_retry_error(status_code: u16) -> bool {
    matches!(status_code, 429 | 500 | 502 | 503 | 504)
}

/// `retry_after_ms` from a standard error body.
fn extract_retry_after(error_text: &str) -> Option<Duration> {
    let body: serde_json::Value = serde_json::from_str(error_text).ok()?;
    body.get("retry_after_ms")
        .and_then(|v| v.as_u64())
        .map(Duration::from_millis)
}
