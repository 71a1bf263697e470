//! Removing build-agent clients nobody has used for a while.
//!
//! Every agent/root pair gets its own client, so retired agents leave
//! records behind. Only clients named with the build-agent prefix are
//! considered; files under their roots are never touched.

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use p4ci_core::identity::CLIENT_PREFIX;
use p4ci_core::ClientName;
use p4ci_server::{ClientSummary, P4Server, ServerError};

use crate::error::WorkspaceError;

/// Build-agent clients on the server, and those idle past the cutoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrunePlan {
    /// Number of clients named like build-agent clients.
    pub managed: usize,
    pub idle: Vec<ClientSummary>,
}

/// Outcome of [`delete_clients`].
#[derive(Debug, Default)]
pub struct PruneReport {
    pub deleted: Vec<ClientName>,
    pub failed: Vec<(ClientName, ServerError)>,
}

/// Build-agent clients last accessed more than `max_idle` before `now`.
///
/// A client whose access time the server does not report is kept.
pub fn idle_clients<S: P4Server>(
    server: &S,
    max_idle: Duration,
    now: DateTime<Utc>,
) -> Result<PrunePlan, WorkspaceError> {
    let cutoff = now - max_idle;
    let prefix = format!("{CLIENT_PREFIX}-");
    let managed: Vec<ClientSummary> = server
        .clients()?
        .into_iter()
        .filter(|c| c.name.as_str().starts_with(&prefix))
        .collect();
    let idle = managed
        .iter()
        .filter(|c| matches!(c.accessed, Some(at) if at < cutoff))
        .cloned()
        .collect();
    Ok(PrunePlan {
        managed: managed.len(),
        idle,
    })
}

/// Delete every idle client in `plan`. A failed delete is logged and the
/// rest still run.
pub fn delete_clients<S: P4Server>(server: &S, plan: &PrunePlan) -> PruneReport {
    let mut report = PruneReport::default();
    for client in &plan.idle {
        match server.delete_client(&client.name) {
            Ok(()) => {
                info!("deleted client {}", client.name);
                report.deleted.push(client.name.clone());
            }
            Err(e) => {
                warn!("failed to delete client {}: {e}", client.name);
                report.failed.push((client.name.clone(), e));
            }
        }
    }
    report
}
