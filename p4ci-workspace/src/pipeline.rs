//! The build-agent checkout flow, on top of [`Repo`].
//!
//! Build metadata (which revision this build pinned, which backup shelf it
//! created) is shared between the jobs of one build through a
//! [`BuildMetadata`] store, so every job syncs the same content.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use tracing::info;

use p4ci_core::{ChangeNumber, EnvContext, RevisionSpec};
use p4ci_server::P4Server;

use crate::engine::{Repo, SyncResult};
use crate::error::WorkspaceError;
use crate::shelf::MaterializeReport;

/// Revision pinned by the first job of a build.
pub const REVISION_KEY: &str = "buildkite-perforce-revision";
/// Older spelling of [`REVISION_KEY`], still read and written.
pub const LEGACY_REVISION_KEY: &str = "buildkite:perforce:revision";
/// Backup copy of the user's shelf.
pub const SHELVE_KEY: &str = "buildkite-perforce-shelve";
/// Commit line the build UI shows.
pub const COMMIT_INFO_KEY: &str = "buildkite:git:commit";

/// Key/value store shared by the jobs of one build.
pub trait BuildMetadata {
    fn get(&self, key: &str) -> Result<Option<String>, WorkspaceError>;

    /// Write `value` unless `key` already holds one.
    fn set(&self, key: &str, value: &str) -> Result<(), WorkspaceError>;
}

/// Metadata kept in process, for local runs and tests.
#[derive(Debug, Default)]
pub struct MemoryMetadata {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemoryMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl BuildMetadata for MemoryMetadata {
    fn get(&self, key: &str) -> Result<Option<String>, WorkspaceError> {
        Ok(self.snapshot().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), WorkspaceError> {
        let mut values = self
            .values
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        values
            .entry(key.to_owned())
            .or_insert_with(|| value.to_owned());
        Ok(())
    }
}

/// Concrete revision for this build, if one was pinned or requested.
///
/// Looks at the pinned metadata first, then the build's commit.
pub fn build_revision(
    env: &EnvContext,
    metadata: &dyn BuildMetadata,
) -> Result<Option<RevisionSpec>, WorkspaceError> {
    let raw = match metadata.get(REVISION_KEY)? {
        Some(raw) => Some(raw),
        None => metadata.get(LEGACY_REVISION_KEY)?,
    };
    let raw = raw.or_else(|| env.get("BUILDKITE_COMMIT").map(str::to_owned));
    Ok(raw.as_deref().and_then(RevisionSpec::from_build_revision))
}

/// Pin `revision` for the remaining jobs of the build.
pub fn set_build_revision(
    metadata: &dyn BuildMetadata,
    revision: &RevisionSpec,
) -> Result<(), WorkspaceError> {
    metadata.set(REVISION_KEY, revision.as_suffix())?;
    metadata.set(LEGACY_REVISION_KEY, revision.as_suffix())
}

/// Commit text shown by the build UI. The revision must look like a sha.
pub fn commit_info(revision: &RevisionSpec, description: &str) -> String {
    let bare = revision.as_suffix().trim_start_matches(['@', '#']);
    format!("commit {bare}\n\n\t{description}")
}

/// What a checkout did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutOutcome {
    pub revision: RevisionSpec,
    pub sync: SyncResult,
    /// User shelf named by the branch and the backup copy applied for it.
    pub shelf: Option<(ChangeNumber, ChangeNumber)>,
    pub materialized: Option<MaterializeReport>,
}

/// Sync the build's revision and apply the shelf named by its branch.
pub fn checkout<S: P4Server>(
    repo: &mut Repo<S>,
    env: &EnvContext,
    metadata: &dyn BuildMetadata,
) -> Result<CheckoutOutcome, WorkspaceError> {
    let revision = match build_revision(env, metadata)? {
        Some(revision) => revision,
        None => {
            let head = repo.head()?;
            if head.is_latest() {
                info!("server has no submitted changes, syncing without pinning");
            } else {
                info!("no revision pinned for this build, using {head}");
                set_build_revision(metadata, &head)?;
            }
            head
        }
    };

    let sync = repo.sync(&revision)?;

    let mut shelf = None;
    let mut materialized = None;
    if let Some(user_change) = env.stream_and_shelf().shelf {
        let backup = match metadata
            .get(SHELVE_KEY)?
            .and_then(|raw| raw.trim().parse::<ChangeNumber>().ok())
        {
            Some(existing) => existing,
            None => {
                let backup = repo.backup_shelf(user_change)?;
                metadata.set(SHELVE_KEY, &backup.to_string())?;
                // The backup was unshelved into this workspace; start clean.
                repo.revert()?;
                backup
            }
        };
        info!("applying shelf {user_change} from its backup {backup}");
        materialized = Some(repo.materialize_shelf(backup)?);
        shelf = Some((user_change, backup));
    }

    let described = match shelf {
        Some((user_change, _)) => Some(user_change),
        None => match revision.change() {
            Some(change) => Some(change),
            None => repo.head_at_revision(&revision)?,
        },
    };
    if let Some(change) = described {
        let description = repo.description(change)?;
        metadata.set(COMMIT_INFO_KEY, &commit_info(&revision, &description))?;
    }

    Ok(CheckoutOutcome {
        revision,
        sync,
        shelf,
        materialized,
    })
}
