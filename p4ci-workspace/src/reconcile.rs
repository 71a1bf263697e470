//! Client record reconciliation.
//!
//! Before anything touches files, the server-side client record is created or
//! updated to match the configuration, and its have table is brought in line
//! with what is actually on disk. The workspace marker decides which of four
//! situations applies:
//!
//! | marker              | server history | state           | action                       |
//! |---------------------|----------------|-----------------|------------------------------|
//! | absent              | none           | `Uninitialized` | flush to `@0`                |
//! | absent              | present        | `Stale`         | flush to `@0` (warn)         |
//! | names this client   | any            | `Consistent`    | nothing                      |
//! | names other client  | any            | `Migrated`      | flush to the other's position|
//!
//! A migration flush references the previous client directly when the server
//! supports it for this storage type, otherwise the change recorded in the
//! marker, otherwise the workspace is cleaned.

use std::path::PathBuf;

use tracing::{debug, info, warn};

use p4ci_core::{
    view, ChangeNumber, CheckoutConfig, ClientName, ClientOptions, ClientSpec, ConfigError,
    StorageType, ViewMapping,
};
use p4ci_server::{P4Server, ServerError};

use crate::error::WorkspaceError;
use crate::marker::{self, WorkspaceMarker};

// ---------------------------------------------------------------------------
// Desired client
// ---------------------------------------------------------------------------

/// The client record a configuration asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredClient {
    pub name: ClientName,
    pub root: PathBuf,
    pub stream: Option<String>,
    /// Localized view; empty for stream clients.
    pub view: Vec<ViewMapping>,
    pub storage_type: StorageType,
    pub options: ClientOptions,
}

impl DesiredClient {
    /// Validate `config` and derive the client identity and view from it.
    pub fn from_config(config: &CheckoutConfig) -> Result<Self, ConfigError> {
        let raw_view = config.view_mappings()?;
        let root = config.absolute_root()?;
        let name = p4ci_core::client_identity(&config.agent_name(), &root);
        Ok(Self {
            view: view::localize(&raw_view, &name),
            name,
            root,
            stream: config.stream.clone(),
            storage_type: config.client_type,
            options: config.options(),
        })
    }

    fn apply_to(&self, spec: &mut ClientSpec) {
        spec.root = self.root.clone();
        spec.stream = self.stream.clone();
        if self.stream.is_none() {
            spec.view = self.view.clone();
        }
        spec.storage_type = self.storage_type;
        spec.options = self.options.clone();
    }
}

// ---------------------------------------------------------------------------
// States and actions
// ---------------------------------------------------------------------------

/// What the marker says about the have table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkspaceState {
    /// No marker and a client the server has never seen.
    Uninitialized,
    /// No marker, but the server remembers the client.
    Stale,
    /// The marker names this client.
    Consistent,
    /// The marker names another client that used this directory.
    Migrated { previous: WorkspaceMarker },
}

impl WorkspaceState {
    pub fn assess(
        client: &ClientName,
        marker: Option<WorkspaceMarker>,
        server_has_history: bool,
    ) -> Self {
        match marker {
            None if server_has_history => Self::Stale,
            None => Self::Uninitialized,
            Some(m) if &m.client == client => Self::Consistent,
            Some(previous) => Self::Migrated { previous },
        }
    }
}

/// Correction applied to the have table before the first sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorrectiveAction {
    None,
    /// Forget every file so the next sync fetches everything.
    FlushToZero { reason: &'static str },
    /// Copy the previous client's have table. `via_stream` is set when the
    /// record must be bound to the previous stream while flushing.
    FlushToClient {
        previous: ClientName,
        via_stream: Option<String>,
    },
    /// Flush to the change the previous client last synced.
    FlushToChange {
        change: ChangeNumber,
        via_stream: Option<String>,
    },
    /// Nothing to flush against: make disk match the current have table.
    Clean { previous: ClientName },
}

/// Pick the correction for `state`.
///
/// `client_flush` is whether flushing against the previous client is possible
/// (the server supports it for this storage type and that client still
/// exists).
pub fn corrective_action(
    state: &WorkspaceState,
    desired_stream: Option<&str>,
    client_flush: bool,
) -> CorrectiveAction {
    match state {
        WorkspaceState::Consistent => CorrectiveAction::None,
        WorkspaceState::Uninitialized => CorrectiveAction::FlushToZero {
            reason: "new client",
        },
        WorkspaceState::Stale => CorrectiveAction::FlushToZero {
            reason: "workspace marker is missing but the client has history",
        },
        WorkspaceState::Migrated { previous } => {
            let via_stream = match (previous.stream.as_deref(), desired_stream) {
                (Some(before), Some(now)) if before != now => Some(before.to_owned()),
                _ => None,
            };
            if client_flush {
                CorrectiveAction::FlushToClient {
                    previous: previous.client.clone(),
                    via_stream,
                }
            } else if let Some(change) = previous.change {
                CorrectiveAction::FlushToChange { change, via_stream }
            } else {
                CorrectiveAction::Clean {
                    previous: previous.client.clone(),
                }
            }
        }
    }
}

/// Outcome of one reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    pub state: WorkspaceState,
    pub action: CorrectiveAction,
    /// Marker written at the end.
    pub marker: WorkspaceMarker,
}

// ---------------------------------------------------------------------------
// Reconcile
// ---------------------------------------------------------------------------

/// Create or update the client record, correct its have table and write the
/// workspace marker.
pub fn reconcile<S: P4Server>(
    server: &S,
    desired: &DesiredClient,
) -> Result<Reconciliation, WorkspaceError> {
    let name = &desired.name;
    let mut record = server.fetch_client(name)?;
    let had_history = record.exists_on_server();
    let previous_type = record.storage_type;

    desired.apply_to(&mut record);
    if had_history {
        // Opened files make the save fail on stream switches.
        let reverted = server.revert(name, &name.all_files())?;
        if reverted > 0 {
            debug!("reverted {reverted} open files before updating {name}");
        }
    }
    save_client(server, &record, had_history && previous_type != desired.storage_type)?;
    info!(
        "using client {name} at {} ({})",
        desired.root.display(),
        desired.stream.as_deref().unwrap_or("explicit view")
    );

    let marker = marker::read_marker(&desired.root)?;
    let recorded_change = marker.as_ref().and_then(|m| m.change);
    let state = WorkspaceState::assess(name, marker, had_history);
    let client_flush = match &state {
        WorkspaceState::Migrated { previous } => {
            server.supports_client_flush(desired.storage_type)
                && server.fetch_client(&previous.client)?.exists_on_server()
        }
        _ => false,
    };
    let action = corrective_action(&state, desired.stream.as_deref(), client_flush);
    apply(server, desired, &mut record, &action)?;

    let mut written = WorkspaceMarker::new(name.clone(), server.connection());
    written.stream = desired.stream.clone();
    written.change = match (&state, &action) {
        (WorkspaceState::Consistent, _)
        | (_, CorrectiveAction::FlushToClient { .. })
        | (_, CorrectiveAction::FlushToChange { .. }) => recorded_change,
        _ => None,
    };
    marker::write_marker(&desired.root, &written)?;

    Ok(Reconciliation {
        state,
        action,
        marker: written,
    })
}

fn save_client<S: P4Server>(
    server: &S,
    record: &ClientSpec,
    changes_storage_type: bool,
) -> Result<(), WorkspaceError> {
    match server.save_client(record) {
        Err(ServerError::Command { message, .. }) if changes_storage_type => {
            Err(WorkspaceError::StorageTypeConflict {
                client: record.name.clone(),
                message,
            })
        }
        other => Ok(other?),
    }
}

fn apply<S: P4Server>(
    server: &S,
    desired: &DesiredClient,
    record: &mut ClientSpec,
    action: &CorrectiveAction,
) -> Result<(), WorkspaceError> {
    let name = &desired.name;
    let all = name.all_files();
    match action {
        CorrectiveAction::None => {
            debug!("workspace marker matches {name}, have table is trusted");
        }
        CorrectiveAction::FlushToZero { reason } => {
            warn!("{reason}: flushing {name} to revision zero, the next sync fetches every file");
            server.flush(name, &format!("{all}@0"))?;
        }
        CorrectiveAction::FlushToClient {
            previous,
            via_stream,
        } => {
            warn!("workspace was last used by {previous}: flushing {name} to its have table");
            with_stream(server, desired, record, via_stream.as_deref(), || {
                server.flush(name, &format!("{all}@{previous}"))
            })?;
        }
        CorrectiveAction::FlushToChange { change, via_stream } => {
            warn!(
                "workspace was last used by another client at change {change}: flushing {name} to @{change}"
            );
            with_stream(server, desired, record, via_stream.as_deref(), || {
                server.flush(name, &format!("{all}@{change}"))
            })?;
        }
        CorrectiveAction::Clean { previous } => {
            warn!(
                "workspace was last used by {previous} and no position is known: cleaning {name}"
            );
            server.clean(name, &[all], true)?;
        }
    }
    Ok(())
}

/// Run `flush` with the record temporarily bound to `via_stream`.
fn with_stream<S, F>(
    server: &S,
    desired: &DesiredClient,
    record: &mut ClientSpec,
    via_stream: Option<&str>,
    flush: F,
) -> Result<(), WorkspaceError>
where
    S: P4Server,
    F: FnOnce() -> Result<(), ServerError>,
{
    let Some(stream) = via_stream else {
        return Ok(flush()?);
    };
    info!("binding {} to {stream} for the flush", desired.name);
    record.stream = Some(stream.to_owned());
    server.save_client(record)?;
    flush()?;
    record.stream = desired.stream.clone();
    server.save_client(record)?;
    Ok(())
}
