//! On-disk markers at the workspace root.
//!
//! Two files live next to the synced content:
//!
//! - `p4config`: which client last owned the directory, in `KEY=value` form so
//!   it doubles as a `P4CONFIG` file for humans poking at the workspace.
//! - `.p4ci-patched.json`: local paths written by shelf materialization, as a
//!   sorted JSON array, so a later revert can restore them.
//!
//! Both are written to a `.tmp` sibling and renamed into place.

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use tracing::warn;

use p4ci_core::{ChangeNumber, ClientName, Connection};

use crate::error::{io_err, WorkspaceError};

pub const MARKER_FILE: &str = "p4config";
pub const PATCH_LIST_FILE: &str = ".p4ci-patched.json";

// ---------------------------------------------------------------------------
// Workspace marker
// ---------------------------------------------------------------------------

/// Who owns the workspace directory and where its content came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceMarker {
    pub client: ClientName,
    pub user: Option<String>,
    pub port: Option<String>,
    /// Stream the client was bound to when the marker was written.
    pub stream: Option<String>,
    /// Last change the workspace was concretely synced to.
    pub change: Option<ChangeNumber>,
}

impl WorkspaceMarker {
    pub fn new(client: ClientName, connection: &Connection) -> Self {
        Self {
            client,
            user: connection.user.clone(),
            port: connection.port.clone(),
            stream: None,
            change: None,
        }
    }

    fn render(&self) -> String {
        let mut out = format!("P4CLIENT={}\n", self.client);
        if let Some(user) = &self.user {
            let _ = writeln!(out, "P4USER={user}");
        }
        if let Some(port) = &self.port {
            let _ = writeln!(out, "P4PORT={port}");
        }
        if let Some(stream) = &self.stream {
            let _ = writeln!(out, "# stream={stream}");
        }
        if let Some(change) = self.change {
            let _ = writeln!(out, "# change={change}");
        }
        out
    }

    /// `None` when the text names no client.
    fn parse(text: &str) -> Option<Self> {
        let mut client = None;
        let mut marker = Self {
            client: ClientName::from(""),
            user: None,
            port: None,
            stream: None,
            change: None,
        };
        for line in text.lines() {
            let line = line.trim();
            let (key, value) = match line.strip_prefix('#') {
                Some(comment) => match comment.trim().split_once('=') {
                    Some((k, v)) => (k.trim(), v.trim()),
                    None => continue,
                },
                None => match line.split_once('=') {
                    Some((k, v)) => (k.trim(), v.trim()),
                    None => continue,
                },
            };
            if value.is_empty() {
                continue;
            }
            match key {
                "P4CLIENT" => client = Some(ClientName::from(value)),
                "P4USER" => marker.user = Some(value.to_owned()),
                "P4PORT" => marker.port = Some(value.to_owned()),
                "stream" => marker.stream = Some(value.to_owned()),
                "change" => marker.change = value.parse().ok(),
                _ => {}
            }
        }
        marker.client = client?;
        Some(marker)
    }
}

pub fn marker_path(root: &Path) -> PathBuf {
    root.join(MARKER_FILE)
}

pub fn patch_list_path(root: &Path) -> PathBuf {
    root.join(PATCH_LIST_FILE)
}

/// Read the marker. A missing file, or one naming no client, reads as absent.
pub fn read_marker(root: &Path) -> Result<Option<WorkspaceMarker>, WorkspaceError> {
    let path = marker_path(root);
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_err(&path, e)),
    };
    let marker = WorkspaceMarker::parse(&contents);
    if marker.is_none() {
        warn!("{} names no client, ignoring it", path.display());
    }
    Ok(marker)
}

/// Write the marker, creating the root when needed.
pub fn write_marker(root: &Path, marker: &WorkspaceMarker) -> Result<(), WorkspaceError> {
    std::fs::create_dir_all(root).map_err(|e| io_err(root, e))?;
    atomic_write(&marker_path(root), marker.render().as_bytes())
}

// ---------------------------------------------------------------------------
// Patch list
// ---------------------------------------------------------------------------

/// Local paths written by the last materialization; empty if none.
pub fn read_patch_list(root: &Path) -> Result<BTreeSet<PathBuf>, WorkspaceError> {
    let path = patch_list_path(root);
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
        Err(e) => return Err(io_err(&path, e)),
    };
    Ok(serde_json::from_str(&contents)?)
}

/// Add `paths` to the patch list. Never drops existing entries.
pub fn write_patch_list<I>(root: &Path, paths: I) -> Result<(), WorkspaceError>
where
    I: IntoIterator<Item = PathBuf>,
{
    let mut all = read_patch_list(root)?;
    all.extend(paths);
    std::fs::create_dir_all(root).map_err(|e| io_err(root, e))?;
    let json = serde_json::to_string_pretty(&all)?;
    atomic_write(&patch_list_path(root), json.as_bytes())
}

pub fn clear_patch_list(root: &Path) -> Result<(), WorkspaceError> {
    let path = patch_list_path(root);
    match std::fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_err(&path, e)),
    }
}

// ---------------------------------------------------------------------------
// Atomic write
// ---------------------------------------------------------------------------

/// Write `<path>.tmp` then rename it over `path`. The temporary file is
/// removed if the rename fails.
pub(crate) fn atomic_write(path: &Path, contents: &[u8]) -> Result<(), WorkspaceError> {
    let tmp = PathBuf::from(format!("{}.tmp", path.display()));
    std::fs::write(&tmp, contents).map_err(|e| io_err(&tmp, e))?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(io_err(path, e));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn marker() -> WorkspaceMarker {
        WorkspaceMarker {
            client: ClientName::from("bk-p4-agent-1234abcd"),
            user: Some("ci".into()),
            port: Some("ssl:perforce:1666".into()),
            stream: Some("//stream-depot/main".into()),
            change: Some(ChangeNumber(42)),
        }
    }

    #[test]
    fn missing_marker_reads_as_absent() {
        let tmp = TempDir::new().unwrap();
        assert_eq!(read_marker(tmp.path()).unwrap(), None);
    }

    #[test]
    fn marker_is_a_p4config_file() {
        let tmp = TempDir::new().unwrap();
        write_marker(tmp.path(), &marker()).unwrap();
        let text = std::fs::read_to_string(marker_path(tmp.path())).unwrap();
        assert!(text.starts_with("P4CLIENT=bk-p4-agent-1234abcd\nP4USER=ci\nP4PORT=ssl:perforce:1666\n"));
        assert_eq!(read_marker(tmp.path()).unwrap(), Some(marker()));
    }

    #[test]
    fn legacy_marker_without_extras() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            marker_path(tmp.path()),
            "P4CLIENT=bk-p4-old\nP4USER=ci\nP4PORT=perforce:1666\n",
        )
        .unwrap();
        let read = read_marker(tmp.path()).unwrap().unwrap();
        assert_eq!(read.client, ClientName::from("bk-p4-old"));
        assert_eq!(read.stream, None);
        assert_eq!(read.change, None);
    }

    #[test]
    fn garbage_marker_reads_as_absent() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(marker_path(tmp.path()), "\0\0corrupt").unwrap();
        assert_eq!(read_marker(tmp.path()).unwrap(), None);
    }

    #[test]
    fn write_marker_creates_root() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("nested").join("ws");
        write_marker(&root, &marker()).unwrap();
        assert!(marker_path(&root).exists());
        assert!(!PathBuf::from(format!("{}.tmp", marker_path(&root).display())).exists());
    }

    #[test]
    fn patch_list_unions_and_clears() {
        let tmp = TempDir::new().unwrap();
        assert!(read_patch_list(tmp.path()).unwrap().is_empty());

        write_patch_list(tmp.path(), [tmp.path().join("b.txt")]).unwrap();
        write_patch_list(tmp.path(), [tmp.path().join("a.txt"), tmp.path().join("b.txt")]).unwrap();
        let list: Vec<_> = read_patch_list(tmp.path()).unwrap().into_iter().collect();
        assert_eq!(list, vec![tmp.path().join("a.txt"), tmp.path().join("b.txt")]);

        clear_patch_list(tmp.path()).unwrap();
        assert!(!patch_list_path(tmp.path()).exists());
        clear_patch_list(tmp.path()).unwrap();
    }

    #[test]
    fn patch_list_is_a_json_array() {
        let tmp = TempDir::new().unwrap();
        write_patch_list(tmp.path(), [PathBuf::from("/ws/a.txt")]).unwrap();
        let raw = std::fs::read_to_string(patch_list_path(tmp.path())).unwrap();
        let parsed: Vec<String> = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed, vec!["/ws/a.txt"]);
    }

    #[test]
    #[cfg(unix)]
    fn rename_failure_cleans_tmp() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("dir-in-the-way");
        std::fs::create_dir_all(target.join("child")).unwrap();
        let err = atomic_write(&target, b"data").expect_err("cannot rename over a non-empty dir");
        assert!(matches!(err, WorkspaceError::Io { .. }));
        assert!(!PathBuf::from(format!("{}.tmp", target.display())).exists());
    }
}
