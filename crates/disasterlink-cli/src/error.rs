use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] disasterlink_core::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("No alert message provided")]
    EmptyMessage,
    #[error("No message body provided")]
    EmptyBody,
    #[error("Alert ID cannot be empty")]
    EmptyAlertId,
    #[error("Alert not found for id/prefix: {0}")]
    AlertNotFound(String),
    #[error("{0}")]
    AmbiguousAlertId(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error(
        "No remote authority configured. Run `dlink config init --remote-url <URL>`, pass --remote-url, or set DLINK_REMOTE_URL."
    )]
    RemoteNotConfigured,
}
