//! CLI error type.

use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the `polari` binary.
#[derive(Debug, Error)]
pub enum CliError {
    /// A file could not be read.
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A file is not valid JSON for what it should contain.
    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A fixture refers to something it never defined.
    #[error("fixture error: {0}")]
    Fixture(String),

    /// Bad command-line arguments.
    #[error("usage error: {0}")]
    Usage(String),

    /// Error from the object store.
    #[error(transparent)]
    Core(#[from] polari_core::Error),
}

pub type Result<T> = std::result::Result<T, CliError>;
