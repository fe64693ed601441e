use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::errors::{AppError, AppResult};

pub struct InputValidator;

impl InputValidator {
    pub fn validate_homeserver_url(url: &str) -> AppResult<()> {
        let trimmed = url.trim();

        if trimmed.is_empty() {
            return Err(AppError::validation(
                "homeserver_url",
                "Homeserver URL cannot be empty",
            ));
        }

        let parsed = reqwest::Url::parse(trimmed)
            .map_err(|e| AppError::validation("homeserver_url", &e.to_string()))?;

        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(AppError::validation(
                "homeserver_url",
                "Homeserver URL must use http or https",
            ));
        }

        if parsed.host_str().is_none() {
            return Err(AppError::validation(
                "homeserver_url",
                "Homeserver URL has no host",
            ));
        }

        Ok(())
    }

    /// Room ids look like `!opaque:server.name`.
    pub fn validate_room_id(room_id: &str) -> AppResult<()> {
        static ROOM_ID: OnceLock<Regex> = OnceLock::new();
        let pattern = ROOM_ID.get_or_init(|| {
            Regex::new(r"^![^:\s]+:[A-Za-z0-9.\-\[\]]+(:\d{1,5})?$").expect("static regex")
        });

        if !pattern.is_match(room_id.trim()) {
            return Err(AppError::validation("room_id", "Invalid room id"));
        }

        Ok(())
    }

    pub fn validate_file_path(path: &str) -> AppResult<()> {
        if path.trim().is_empty() {
            return Err(AppError::validation(
                "file_path",
                "File path cannot be empty",
            ));
        }

        let path_obj = Path::new(path);

        if !path_obj.exists() {
            return Err(AppError::validation("file_path", "File does not exist"));
        }

        if !path_obj.is_file() {
            return Err(AppError::validation("file_path", "Path is not a file"));
        }

        Ok(())
    }

    /// Display name for an attachment, stripped of control and path characters.
    pub fn sanitize_filename(filename: &str) -> String {
        static UNSAFE: OnceLock<Regex> = OnceLock::new();
        let unsafe_chars =
            UNSAFE.get_or_init(|| Regex::new(r#"[<>:"/\\|?*\x00-\x1f]"#).expect("static regex"));
        let sanitized = unsafe_chars.replace_all(filename.trim(), "_");

        if sanitized.chars().count() > 255 {
            let truncated: String = sanitized.chars().take(252).collect();
            format!("{}...", truncated)
        } else {
            sanitized.to_string()
        }
    }
}

pub struct FileSystemGuard;

impl FileSystemGuard {
    /// Random temp path with the given extension, inside the app's private temp dir.
    pub fn create_secure_temp_file(extension: &str) -> AppResult<PathBuf> {
        let temp_dir = crate::config::get_temp_directory()?.join("secure");
        std::fs::create_dir_all(&temp_dir)?;

        let random_name = uuid::Uuid::new_v4().to_string();
        let extension = if extension.is_empty() { "tmp" } else { extension };

        Ok(temp_dir.join(format!("{}.{}", random_name, extension)))
    }

    pub fn cleanup_temp_files() -> AppResult<()> {
        let temp_dir = crate::config::get_temp_directory()?.join("secure");
        if temp_dir.exists() {
            std::fs::remove_dir_all(&temp_dir)?;
        }
        Ok(())
    }
}
