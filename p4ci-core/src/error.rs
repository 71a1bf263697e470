//! Error types for p4ci-core.

use std::path::PathBuf;

use thiserror::Error;

/// Malformed caller input. Raised before any server call is attempted.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A flat view token list must alternate depot and client paths.
    #[error("invalid view format: expected pairs of depot and client paths, got {count} tokens")]
    OddView { count: usize },

    /// A stream client derives its view from the stream definition.
    #[error("stream {stream} and an explicit view are mutually exclusive")]
    StreamAndView { stream: String },

    /// A view line that could not be split into a depot and a client path.
    #[error("invalid view mapping '{line}'")]
    InvalidMapping { line: String },

    /// Storage types the server does not know about.
    #[error("unknown client type '{0}'; expected: writeable, readonly, partitioned")]
    UnknownStorageType(String),

    /// A numeric setting that failed to parse.
    #[error("invalid value '{value}' for {key}")]
    InvalidValue { key: String, value: String },

    /// Custom workspace roots are only honoured for local runs.
    #[error("custom P4 root is for use in local runs only")]
    CustomRootOutsideLocalRun,

    /// Neither a configured root nor a checkout path was available.
    #[error("no workspace root configured")]
    MissingRoot,

    /// Underlying I/O failure while loading a configuration file.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML parse error on load, with the file path for context.
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}
