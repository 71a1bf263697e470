//! Applying shelved changes to a workspace.
//!
//! A shelf can be opened the tracked way (`unshelve`), or its content can be
//! written straight into the workspace without the server's knowledge
//! (`materialize_shelf`). Materialized paths are listed in the patch list so
//! the next revert can put them back.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info};

use p4ci_core::{view, ChangeDescription, ChangeNumber, FileType};
use p4ci_server::{FileMapping, P4Server};

use crate::engine::Repo;
use crate::error::{io_err, ShelfError, WorkspaceError};
use crate::marker;

/// Description given to backup copies of a shelf.
pub fn backup_description(change: ChangeNumber) -> String {
    format!("Backup of {change} for precommit testing in Buildkite")
}

/// What a materialization wrote.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct MaterializeReport {
    /// Files present in the shelf.
    pub shelved: usize,
    /// Local paths written or removed.
    pub touched: Vec<PathBuf>,
    /// Shelved files outside the sync scope.
    pub skipped: usize,
}

/// One unit of work for a materialization worker.
#[derive(Debug, Clone)]
struct Patch {
    mapping: FileMapping,
    file_type: FileType,
    removed: bool,
}

impl<S: P4Server> Repo<S> {
    /// Describe `change` and refuse shelves build agents must not apply.
    fn validate_shelf(&self, change: ChangeNumber) -> Result<ChangeDescription, WorkspaceError> {
        let described = match self.server.describe(change, true) {
            Ok(described) => described,
            Err(e) if e.is_unknown_change() => {
                return Err(ShelfError::NotFound {
                    change,
                    message: e.server_message(),
                }
                .into())
            }
            Err(e) => return Err(e.into()),
        };
        if described.files.is_empty() {
            return Err(ShelfError::Empty { change }.into());
        }
        let locked: Vec<String> = described
            .exclusive_files()
            .into_iter()
            .map(|f| f.depot_path.clone())
            .collect();
        if !locked.is_empty() {
            return Err(ShelfError::ExclusiveLock {
                change,
                files: locked,
            }
            .into());
        }
        Ok(described)
    }

    /// Open the files of a shelved change in the default pending change.
    pub fn unshelve(&mut self, change: ChangeNumber) -> Result<(), WorkspaceError> {
        self.validate_shelf(change)?;
        self.reconcile()?;
        self.server.unshelve(&self.desired.name, change)?;
        info!("unshelved {change}");
        Ok(())
    }

    /// Copy a shelf into a new pending change owned by this client and shelve
    /// it there. Returns the new change.
    pub fn backup_shelf(&mut self, change: ChangeNumber) -> Result<ChangeNumber, WorkspaceError> {
        self.revert()?;
        self.unshelve(change)?;

        let mut pending = self.server.fetch_change(&self.desired.name)?;
        pending.description = backup_description(change);
        let backup = self.server.save_change(&pending)?;
        self.server.shelve(&self.desired.name, backup)?;
        info!("backed up shelf {change} as {backup}");
        Ok(backup)
    }

    /// Write the content of a shelved change into the workspace without
    /// opening any file.
    ///
    /// Files outside the sync scope are skipped. Every path about to be
    /// touched is added to the patch list first, so an interrupted run is
    /// still undone by the next revert.
    pub fn materialize_shelf(
        &mut self,
        change: ChangeNumber,
    ) -> Result<MaterializeReport, WorkspaceError> {
        let described = self.validate_shelf(change)?;
        self.reconcile()?;

        let scopes: Vec<String> = self
            .config
            .sync_paths()
            .iter()
            .map(|p| view::split_revision(p).0.to_owned())
            .collect();
        let (in_scope, skipped): (Vec<_>, Vec<_>) = described
            .files
            .iter()
            .partition(|f| scopes.iter().any(|s| view::matches(s, &f.depot_path)));
        for file in &skipped {
            debug!("{} is outside the sync scope, skipping", file.depot_path);
        }

        let depot_paths: Vec<String> = in_scope.iter().map(|f| f.depot_path.clone()).collect();
        let mappings = if depot_paths.is_empty() {
            Vec::new()
        } else {
            self.server.where_files(&self.desired.name, &depot_paths)?
        };
        // Overlay views report one row per matching line; the last one wins.
        let mut by_depot: BTreeMap<String, FileMapping> = mappings
            .into_iter()
            .map(|m| (m.depot_path.clone(), m))
            .collect();
        let patches: Vec<Patch> = in_scope
            .iter()
            .filter_map(|file| {
                let mapping = by_depot.remove(&file.depot_path)?;
                Some(Patch {
                    file_type: file.file_type.clone(),
                    removed: file.action.removes_file(),
                    mapping,
                })
            })
            .collect();
        let unmapped = in_scope.len() - patches.len();

        let mut report = MaterializeReport {
            shelved: described.files.len(),
            touched: Vec::new(),
            skipped: skipped.len() + unmapped,
        };
        if patches.is_empty() {
            info!("shelf {change} has no files in the sync scope");
            return Ok(report);
        }

        marker::write_patch_list(
            &self.desired.root,
            patches.iter().map(|p| p.mapping.local_path.clone()),
        )?;

        let workers = self.config.shelf_workers.clamp(1, patches.len());
        info!(
            "materializing {} files from shelf {change} with {workers} workers",
            patches.len()
        );
        let failures = run_workers(&self.server, change, &patches, workers);

        if let Some(first) = failures.first() {
            return Err(WorkspaceError::Materialize {
                failed: failures.len(),
                total: patches.len(),
                first: first.clone(),
            });
        }
        report.touched = patches.into_iter().map(|p| p.mapping.local_path).collect();
        Ok(report)
    }
}

/// Apply `patches` across `workers` threads; returns one message per failure.
fn run_workers<S: P4Server>(
    server: &S,
    change: ChangeNumber,
    patches: &[Patch],
    workers: usize,
) -> Vec<String> {
    let mut partitions: Vec<Vec<&Patch>> = vec![Vec::new(); workers];
    for (i, patch) in patches.iter().enumerate() {
        partitions[i % workers].push(patch);
    }

    std::thread::scope(|s| {
        let handles: Vec<_> = partitions
            .into_iter()
            .map(|work| {
                s.spawn(move || {
                    work.into_iter()
                        .filter_map(|patch| {
                            apply_patch(server, change, patch)
                                .err()
                                .map(|e| format!("{}: {e}", patch.mapping.depot_path))
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|h| {
                h.join()
                    .unwrap_or_else(|_| vec!["materialization worker panicked".to_owned()])
            })
            .collect()
    })
}

fn apply_patch<S: P4Server>(
    server: &S,
    change: ChangeNumber,
    patch: &Patch,
) -> Result<(), WorkspaceError> {
    let local = &patch.mapping.local_path;
    remove_existing(local)?;
    if patch.removed {
        return Ok(());
    }

    let content = server.print(&format!("{}@={change}", patch.mapping.depot_path))?;
    let content = if patch.file_type.is_binary() {
        content
    } else {
        native_line_endings(content)
    };
    if let Some(parent) = local.parent() {
        std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }
    marker::atomic_write(local, &content)
}

/// Delete `path`, clearing the read-only flag a sync leaves behind.
fn remove_existing(path: &Path) -> Result<(), WorkspaceError> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(io_err(path, e)),
    };
    let mut permissions = metadata.permissions();
    if permissions.readonly() {
        #[allow(clippy::permissions_set_readonly_false)]
        permissions.set_readonly(false);
        std::fs::set_permissions(path, permissions).map_err(|e| io_err(path, e))?;
    }
    std::fs::remove_file(path).map_err(|e| io_err(path, e))
}

/// Text files are stored with `\n`; Windows workspaces get `\r\n`.
fn native_line_endings(content: Vec<u8>) -> Vec<u8> {
    if !cfg!(windows) {
        return content;
    }
    let mut out = Vec::with_capacity(content.len());
    let mut previous = 0u8;
    for byte in content {
        if byte == b'\n' && previous != b'\r' {
            out.push(b'\r');
        }
        out.push(byte);
        previous = byte;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn backup_description_names_the_shelf() {
        assert_eq!(
            backup_description(ChangeNumber(77)),
            "Backup of 77 for precommit testing in Buildkite"
        );
    }

    #[test]
    fn remove_existing_clears_read_only() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("synced.txt");
        std::fs::write(&path, "old").unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_readonly(true);
        std::fs::set_permissions(&path, perms).unwrap();

        remove_existing(&path).unwrap();
        assert!(!path.exists());
        remove_existing(&path).unwrap();
    }

    #[test]
    #[cfg(not(windows))]
    fn line_endings_untouched_off_windows() {
        assert_eq!(native_line_endings(b"a\nb\n".to_vec()), b"a\nb\n");
    }

    #[test]
    #[cfg(windows)]
    fn line_endings_converted_on_windows() {
        assert_eq!(native_line_endings(b"a\nb\r\n".to_vec()), b"a\r\nb\r\n");
    }
}
