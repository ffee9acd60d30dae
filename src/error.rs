use thiserror::Error;

use crate::ipc::command::CommandError;
use crate::ipc::FileError;
use crate::venue::adapter::VenueError;

/// Top-level error for startup and controller operations. Per-cycle failures inside the
/// agent loop never surface as this type; they are logged and the cycle is skipped.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),
    #[error("File error: {0}")]
    File(#[from] FileError),
    #[error("Command error: {0}")]
    Command(#[from] CommandError),
    #[error("Venue error: {0}")]
    Venue(#[from] VenueError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
