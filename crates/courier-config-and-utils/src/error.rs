//! Errors raised while loading configuration and resolving paths.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    /// A setting is missing, malformed or out of range.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// `config.json` is not valid JSON for [`crate::Config`].
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// No usable base directory (no home directory and no `--base-dir`).
    #[error("Path error: {0}")]
    Path(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
