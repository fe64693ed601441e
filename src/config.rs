use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::{AppError, AppResult};
use crate::uploader::pipeline::PipelineSettings;

const APP_DIR_NAME: &str = "attachment-uploader";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub homeserver_url: String,
    pub access_token: Option<String>,
    pub send_timing_metadata: bool,
    pub max_retry_attempts: u32,
    pub request_timeout_secs: u64,
    pub rate_limit_delay_ms: u64,
    pub ffmpeg_path: String,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            homeserver_url: "https://matrix.org".to_string(),
            access_token: None,
            send_timing_metadata: false,
            max_retry_attempts: 3,
            request_timeout_secs: 120,
            rate_limit_delay_ms: 0,
            ffmpeg_path: "ffmpeg".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            send_timing_metadata: self.send_timing_metadata,
        }
    }

    pub fn log_level_filter(&self) -> log::LevelFilter {
        self.log_level.parse().unwrap_or(log::LevelFilter::Info)
    }
}

pub fn get_config_path() -> AppResult<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| AppError::Config("Could not find config directory".to_string()))?
        .join(APP_DIR_NAME);

    fs::create_dir_all(&config_dir)?;
    Ok(config_dir.join("config.json"))
}

/// Load the config at `path`, or the default location when none is given.
/// A missing file is created with defaults.
pub fn load_config(path: Option<&Path>) -> AppResult<Config> {
    let config_path = match path {
        Some(p) => p.to_path_buf(),
        None => get_config_path()?,
    };

    if config_path.exists() {
        let config_str = fs::read_to_string(&config_path)?;
        let config: Config = serde_json::from_str(&config_str).unwrap_or_else(|e| {
            log::warn!("Failed to parse config file: {}. Using defaults.", e);
            Config::default()
        });

        validate_config(&config)?;
        Ok(config)
    } else {
        let default_config = Config::default();
        save_config_to(&default_config, &config_path)?;
        Ok(default_config)
    }
}

pub fn save_config_to(config: &Config, config_path: &Path) -> AppResult<()> {
    validate_config(config)?;

    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent)?;
    }

    if config_path.exists() {
        let backup_path = config_path.with_extension("json.bak");
        if let Err(e) = fs::copy(config_path, &backup_path) {
            log::warn!("Failed to create config backup: {}", e);
        }
    }

    let config_str = serde_json::to_string_pretty(config)?;
    fs::write(config_path, config_str)?;

    log::info!("Configuration saved to {}", config_path.display());
    Ok(())
}

pub fn get_temp_directory() -> AppResult<PathBuf> {
    let temp_dir = std::env::temp_dir().join("attachment_uploader");
    fs::create_dir_all(&temp_dir)?;
    Ok(temp_dir)
}

pub fn validate_config(config: &Config) -> AppResult<()> {
    crate::security::InputValidator::validate_homeserver_url(&config.homeserver_url)?;

    if config.max_retry_attempts > 10 {
        return Err(AppError::validation(
            "max_retry_attempts",
            "Must be 10 or fewer",
        ));
    }

    if config.request_timeout_secs == 0 {
        return Err(AppError::validation(
            "request_timeout_secs",
            "Must be greater than 0",
        ));
    }

    if config.rate_limit_delay_ms > 10_000 {
        return Err(AppError::validation(
            "rate_limit_delay_ms",
            "Must be at most 10000ms",
        ));
    }

    if config.ffmpeg_path.trim().is_empty() {
        return Err(AppError::validation("ffmpeg_path", "Cannot be empty"));
    }

    let valid_log_levels = ["off", "error", "warn", "info", "debug", "trace"];
    if !valid_log_levels.contains(&config.log_level.as_str()) {
        return Err(AppError::validation(
            "log_level",
            "Must be a valid log level",
        ));
    }

    Ok(())
}
