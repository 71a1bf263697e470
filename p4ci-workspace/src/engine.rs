//! The workspace engine: one connected client bound to one directory.

use std::path::Path;

use serde::Serialize;
use tracing::{debug, info, warn};

use p4ci_core::{
    ChangeNumber, CheckoutConfig, ClientName, RevisionSpec, SyncedFile,
};
use p4ci_server::{ChangesQuery, P4Server};

use crate::error::WorkspaceError;
use crate::marker;
use crate::reconcile::{self, DesiredClient, Reconciliation};

/// Counter holding the highest submitted change on the server.
pub const MAX_COMMIT_COUNTER: &str = "maxCommitChange";

// ---------------------------------------------------------------------------
// Sync result
// ---------------------------------------------------------------------------

/// Summary of one sync.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct SyncResult {
    pub files_count: u64,
    pub total_bytes: u64,
    pub files: Vec<SyncedFile>,
}

impl SyncResult {
    /// Totals come from the first record when the server reports them.
    pub fn from_files(files: Vec<SyncedFile>) -> Self {
        let reported = files
            .first()
            .and_then(|f| f.total_file_count.zip(f.total_file_size));
        let (files_count, total_bytes) = reported.unwrap_or_else(|| {
            (
                files.len() as u64,
                files.iter().filter_map(|f| f.file_size).sum(),
            )
        });
        Self {
            files_count,
            total_bytes,
            files,
        }
    }
}

/// Human-readable binary size, e.g. `1.5KiB`.
pub fn format_size(bytes: u64) -> String {
    let mut value = bytes as f64;
    for unit in ["", "Ki", "Mi", "Gi", "Ti"] {
        if value < 1024.0 {
            return format!("{value:.1}{unit}B");
        }
        value /= 1024.0;
    }
    format!("{value:.1}PiB")
}

// ---------------------------------------------------------------------------
// Repo
// ---------------------------------------------------------------------------

/// A workspace bound to a connected server.
///
/// Reconciliation runs once, lazily, before the first operation that touches
/// the client. The connection is released when the repo is dropped.
pub struct Repo<S: P4Server> {
    pub(crate) server: S,
    pub(crate) config: CheckoutConfig,
    pub(crate) desired: DesiredClient,
    reconciliation: Option<Reconciliation>,
}

impl<S: P4Server> Repo<S> {
    /// Validate `config`, trust and connect to `server`.
    ///
    /// Configuration errors are reported before the server is contacted.
    pub fn open(server: S, config: CheckoutConfig) -> Result<Self, WorkspaceError> {
        let desired = DesiredClient::from_config(&config)?;
        connect(&server, &config.fingerprints)?;
        Ok(Self {
            server,
            config,
            desired,
            reconciliation: None,
        })
    }

    pub fn server(&self) -> &S {
        &self.server
    }

    pub fn config(&self) -> &CheckoutConfig {
        &self.config
    }

    pub fn client_name(&self) -> &ClientName {
        &self.desired.name
    }

    pub fn root(&self) -> &Path {
        &self.desired.root
    }

    /// Reconcile the client record with the workspace. Repeat calls return
    /// the first outcome.
    pub fn reconcile(&mut self) -> Result<&Reconciliation, WorkspaceError> {
        let outcome = match self.reconciliation.take() {
            Some(outcome) => outcome,
            None => reconcile::reconcile(&self.server, &self.desired)?,
        };
        Ok(self.reconciliation.insert(outcome))
    }

    /// Depot patterns covering the configured view or stream.
    fn view_scopes(&self) -> Vec<String> {
        match &self.desired.stream {
            Some(stream) => vec![format!("{}/...", stream.trim_end_matches('/'))],
            None => self
                .desired
                .view
                .iter()
                .filter(|m| !m.is_exclusion())
                .map(|m| m.depot_pattern().to_owned())
                .collect(),
        }
    }

    /// Last submitted change under `scope`, `None` if nothing was ever
    /// submitted there.
    pub fn head_of_view(&self, scope: &str) -> Result<Option<ChangeNumber>, WorkspaceError> {
        let changes = self
            .server
            .changes(&ChangesQuery::latest_submitted(vec![scope.to_owned()]))?;
        Ok(changes.first().map(|c| c.change))
    }

    fn latest_in_scopes(&self, suffix: &str) -> Result<Option<ChangeNumber>, WorkspaceError> {
        let mut latest = None;
        for scope in self.view_scopes() {
            latest = latest.max(self.head_of_view(&format!("{scope}{suffix}"))?);
        }
        Ok(latest)
    }

    /// Head revision of the view, or of the whole server when the view has
    /// no history.
    pub fn head(&self) -> Result<RevisionSpec, WorkspaceError> {
        if let Some(change) = self.latest_in_scopes("")? {
            return Ok(RevisionSpec::at_change(change));
        }
        let counter = self.server.counter(MAX_COMMIT_COUNTER)?;
        debug!("view has no submitted changes, server head is {counter}");
        match counter.trim().parse::<u64>() {
            Ok(0) | Err(_) => Ok(RevisionSpec::latest()),
            Ok(n) => Ok(RevisionSpec::at_change(ChangeNumber(n))),
        }
    }

    /// Latest submitted change in the view at `revision`.
    ///
    /// Labels that store a concrete change answer directly.
    pub fn head_at_revision(
        &self,
        revision: &RevisionSpec,
    ) -> Result<Option<ChangeNumber>, WorkspaceError> {
        if let Some(label) = revision.label() {
            let stored = self.server.label_revision(label)?;
            if let Some(change) = stored.and_then(|r| RevisionSpec::new(r).change()) {
                return Ok(Some(change));
            }
        }
        self.latest_in_scopes(revision.as_suffix())
    }

    /// Description text of a change.
    pub fn description(&self, change: ChangeNumber) -> Result<String, WorkspaceError> {
        Ok(self.server.describe(change, false)?.description)
    }

    /// Sync every configured scope to `revision`, reverting first.
    pub fn sync(&mut self, revision: &RevisionSpec) -> Result<SyncResult, WorkspaceError> {
        self.revert()?;

        let paths: Vec<String> = self
            .config
            .sync_paths()
            .into_iter()
            .map(|p| format!("{p}{}", revision.as_suffix()))
            .collect();
        info!("syncing {} to {revision}", paths.join(" "));

        let mut position = 0u64;
        let files = self.server.sync(
            &self.desired.name,
            &paths,
            self.config.parallel,
            &mut |_| {
                position += 1;
                debug!("Syncing file #{position}...");
            },
        )?;
        let result = SyncResult::from_files(files);
        if result.files_count > 0 {
            info!(
                "Synced {} files ({})",
                result.files_count,
                format_size(result.total_bytes)
            );
        } else {
            info!("workspace already at {revision}");
        }

        self.record_synced_change(revision)?;
        Ok(result)
    }

    fn record_synced_change(&self, revision: &RevisionSpec) -> Result<(), WorkspaceError> {
        let change = match revision.change() {
            Some(change) => Some(change),
            None => self.head_at_revision(revision)?,
        };
        if let Some(mut current) = marker::read_marker(self.root())? {
            current.change = change;
            marker::write_marker(self.root(), &current)?;
        }
        Ok(())
    }

    /// Discard opened files and restore anything a shelf materialization
    /// wrote behind the server's back.
    pub fn revert(&mut self) -> Result<(), WorkspaceError> {
        self.reconcile()?;
        let name = &self.desired.name;
        let reverted = self.server.revert(name, &name.all_files())?;
        if reverted > 0 {
            info!("reverted {reverted} open files");
        }

        let patched = marker::read_patch_list(&self.desired.root)?;
        if !patched.is_empty() {
            info!("restoring {} files written from a shelf", patched.len());
            let paths: Vec<String> = patched
                .iter()
                .map(|p| p.to_string_lossy().into_owned())
                .collect();
            self.server.clean(name, &paths, true)?;
            marker::clear_patch_list(&self.desired.root)?;
        }
        Ok(())
    }

    /// Restore deleted files and remove files unknown to the server.
    /// Modified files are left alone.
    pub fn clean(&mut self) -> Result<(), WorkspaceError> {
        self.reconcile()?;
        let root = self.desired.root.clone();
        let current = marker::read_marker(&root)?;
        let patched = marker::read_patch_list(&root)?;

        self.server
            .clean(&self.desired.name, &[self.desired.name.all_files()], false)?;

        // The markers are unknown to the server and were just removed.
        match current {
            Some(m) => marker::write_marker(&root, &m)?,
            None => warn!("no workspace marker to restore after clean"),
        }
        if !patched.is_empty() {
            marker::write_patch_list(&root, patched)?;
        }
        Ok(())
    }
}

impl<S: P4Server> Drop for Repo<S> {
    fn drop(&mut self) {
        self.server.disconnect();
    }
}

/// Install trust for `ssl` ports, then connect.
pub fn connect<S: P4Server>(server: &S, fingerprints: &[String]) -> Result<(), WorkspaceError> {
    if server.connection().is_ssl() {
        if fingerprints.is_empty() {
            warn!("no fingerprint configured for an ssl server, trusting whatever it presents");
            server.trust(None)?;
        }
        for fingerprint in fingerprints {
            server.trust(Some(fingerprint))?;
        }
    }
    let info = server.connect()?;
    debug!("connected to {} ({}) as {}", info.address, info.version, info.user);
    Ok(())
}
