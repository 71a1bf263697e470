//! Error types for p4ci-workspace.

use std::path::PathBuf;

use thiserror::Error;

use p4ci_core::{ChangeNumber, ClientName, ConfigError};
use p4ci_server::ServerError;

/// Why a shelved change cannot be applied.
#[derive(Debug, Error)]
pub enum ShelfError {
    /// The server does not know the change.
    #[error("shelved change {change} does not exist: {message}")]
    NotFound { change: ChangeNumber, message: String },

    #[error("change {change} contains no shelved files")]
    Empty { change: ChangeNumber },

    /// Exclusive-lock files cannot be shared between concurrent build agents.
    #[error(
        "change {change} contains files with the exclusive lock (+l) modifier, \
         which build agents are not allowed to apply: {}",
        .files.join(", ")
    )]
    ExclusiveLock {
        change: ChangeNumber,
        files: Vec<String>,
    },
}

/// All errors that can arise while managing a workspace.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error(transparent)]
    Shelf(#[from] ShelfError),

    /// The server refused to change the storage type of an existing client.
    #[error("cannot change the storage type of client {client}: {message}")]
    StorageTypeConflict { client: ClientName, message: String },

    /// Some shelved files could not be written.
    #[error("failed to materialize {failed} of {total} shelved files: {first}")]
    Materialize {
        failed: usize,
        total: usize,
        first: String,
    },

    /// Reading or writing build metadata failed.
    #[error("build metadata {key}: {message}")]
    Metadata { key: String, message: String },

    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Patch list JSON error.
    #[error("patch list JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience constructor for [`WorkspaceError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> WorkspaceError {
    WorkspaceError::Io {
        path: path.into(),
        source,
    }
}
