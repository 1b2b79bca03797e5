use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] fieldsync_core::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("Invalid id '{0}'")]
    InvalidId(String),
    #[error("Fields must be a JSON object, e.g. '{{\"title\":\"Boiler service\"}}'")]
    InvalidFields,
    #[error("Configuration error: {0}")]
    Config(String),
    #[error(
        "Sync is not configured. Run `fieldsync config init --remote-url <URL>` or set FIELDSYNC_REMOTE_URL."
    )]
    SyncNotConfigured,
}
