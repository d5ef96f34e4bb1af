use crate::config::ConfigError;
use crate::provider::ArchiveError;
use thiserror::Error;

/// Failures that stop the server from starting or serving.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error("network error: {0}")]
    Io(#[from] std::io::Error),
}
