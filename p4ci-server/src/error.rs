//! Error types for p4ci-server.

use std::path::PathBuf;

use thiserror::Error;

/// Failures talking to the version-control server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The command-line client could not be started at all.
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Connection or authentication failure.
    #[error("cannot connect to {port}: {message}")]
    Connection { port: String, message: String },

    /// The server's SSL fingerprint does not match a trusted one.
    #[error("the authenticity of {port} can't be established: {message}")]
    Untrusted { port: String, message: String },

    /// The server rejected a command. `message` is the server's text verbatim.
    #[error("{command} failed: {message}")]
    Command { command: String, message: String },

    /// Output that could not be decoded.
    #[error("malformed output from {command}: {message}")]
    Decode { command: String, message: String },

    /// Local file I/O performed on the server's behalf.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ServerError {
    /// Connection, authentication and trust failures.
    pub fn is_communication(&self) -> bool {
        matches!(
            self,
            ServerError::Spawn { .. } | ServerError::Connection { .. } | ServerError::Untrusted { .. }
        )
    }

    /// The server does not know the change a command named.
    pub fn is_unknown_change(&self) -> bool {
        let ServerError::Command { message, .. } = self else {
            return false;
        };
        let message = message.to_lowercase();
        message.contains("change")
            && (message.contains("unknown") || message.contains("no such"))
    }

    /// Server text for command failures, the rendered error otherwise.
    pub fn server_message(&self) -> String {
        match self {
            ServerError::Command { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

/// Convenience constructor for [`ServerError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> ServerError {
    ServerError::Io {
        path: path.into(),
        source,
    }
}

pub(crate) fn command_err(command: &str, message: impl Into<String>) -> ServerError {
    ServerError::Command {
        command: command.to_owned(),
        message: message.into(),
    }
}
