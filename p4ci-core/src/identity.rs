//! Client workspace naming.
//!
//! A client name is derived from the build agent name and the absolute
//! workspace root, so two agents (or one agent with two checkout directories)
//! never share a server-side client record.

use std::path::Path;

use sha2::{Digest, Sha256};

use crate::types::ClientName;

/// Prefix of every client created by this tool.
pub const CLIENT_PREFIX: &str = "bk-p4";

/// Derive the client name for `agent` checking out into `root`.
///
/// `bk-p4-<agent>-<first 8 hex chars of sha256(root)>`, with every character
/// outside `[A-Za-z0-9_-]` replaced by `-`. Pure and deterministic.
pub fn client_identity(agent: &str, root: &Path) -> ClientName {
    let digest = {
        let mut h = Sha256::new();
        h.update(root.to_string_lossy().as_bytes());
        hex::encode(h.finalize())
    };
    let raw = format!("{CLIENT_PREFIX}-{agent}-{}", &digest[..8]);
    ClientName(sanitize(&raw))
}

/// Replace every character the server does not accept in identifiers.
pub fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Host name recorded by the system, used when neither the agent nor the
/// environment names the machine.
pub fn host_name() -> String {
    std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "localhost".to_owned())
}
