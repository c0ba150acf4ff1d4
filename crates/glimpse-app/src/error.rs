//! Application-level error type shared across binaries and services.

use std::path::PathBuf;

use glimpse_server::{SearchError, ServerError};
use thiserror::Error;

use crate::config;
use crate::services::ContextError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    ConfigLoad(#[from] config::AppConfigError),
    #[error("configuration error: {0}")]
    Context(#[from] ContextError),
    #[error(transparent)]
    Server(#[from] ServerError),
    #[error("search failed: {0}")]
    Search(#[from] SearchError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("failed to read input file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid {flag} argument: {reason}")]
    InvalidArgument { flag: &'static str, reason: String },
}
