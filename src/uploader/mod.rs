// Uploader module - turns selected files into sent room messages
//
// Per-file work lives in `pipeline`; `upload_queue` drives whole batches.

pub mod encryption;
pub mod homeserver_client;
pub mod media_config;
pub mod pipeline;
pub mod registry;
pub mod transport;
pub mod upload_queue;

pub use homeserver_client::HomeserverClient;
pub use pipeline::{upload_file, FileOutcome, FileStatus, PipelineContext, PipelineSettings};
pub use upload_queue::{BatchReport, BatchRequest, ConfirmationPrompt, FileDecision, UploadQueue};
