pub mod config;
pub mod content;
pub mod errors;
pub mod image_processor;
pub mod media_probe;
pub mod notifications;
pub mod security;
pub mod uploader;
