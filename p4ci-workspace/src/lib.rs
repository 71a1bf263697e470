//! # p4ci-workspace
//!
//! Workspace reconciliation, sync and shelf materialization.
//!
//! Open a [`Repo`] over any [`p4ci_server::P4Server`], then [`Repo::sync`] it.
//! The first operation reconciles the server-side client record with what the
//! on-disk marker says about the directory; see [`reconcile`].

pub mod engine;
pub mod error;
pub mod marker;
pub mod pipeline;
pub mod prune;
pub mod reconcile;
pub mod shelf;

pub use engine::{connect, format_size, Repo, SyncResult};
pub use error::{ShelfError, WorkspaceError};
pub use marker::WorkspaceMarker;
pub use pipeline::{checkout, BuildMetadata, CheckoutOutcome, MemoryMetadata};
pub use prune::{delete_clients, idle_clients, PrunePlan, PruneReport};
pub use reconcile::{CorrectiveAction, DesiredClient, Reconciliation, WorkspaceState};
pub use shelf::MaterializeReport;
