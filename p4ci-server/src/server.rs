//! The server capability consumed by the workspace engine.

use std::path::PathBuf;

use chrono::{DateTime, Utc};

use p4ci_core::{
    ChangeDescription, ChangeNumber, ChangeStatus, ClientName, ClientSpec, Connection,
    PendingChange, StorageType, SyncedFile,
};

use crate::error::ServerError;

/// Result alias for server calls.
pub type ServerResult<T> = Result<T, ServerError>;

/// Called once per file as a sync streams its results.
pub type Progress<'a> = &'a mut dyn FnMut(&SyncedFile);

/// Facts reported by the server when a connection is established.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServerInfo {
    pub address: String,
    pub version: String,
    pub user: String,
}

/// Where one depot file lands in a client workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMapping {
    pub depot_path: String,
    pub client_path: String,
    pub local_path: PathBuf,
}

/// One row of the server's client list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSummary {
    pub name: ClientName,
    pub owner: String,
    pub root: PathBuf,
    /// Last time the client was used. `None` when the server did not say.
    pub accessed: Option<DateTime<Utc>>,
}

/// Filter for change history queries.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChangesQuery {
    /// Depot or client patterns, optionally suffixed with a revision.
    pub paths: Vec<String>,
    pub status: Option<ChangeStatus>,
    pub max: Option<usize>,
    pub client: Option<ClientName>,
}

impl ChangesQuery {
    /// Most recent submitted change affecting `paths`.
    pub fn latest_submitted(paths: Vec<String>) -> Self {
        Self {
            paths,
            status: Some(ChangeStatus::Submitted),
            max: Some(1),
            client: None,
        }
    }
}

/// Operations the version-control server must support.
///
/// Every call is synchronous and may block on network I/O. Implementations
/// are shared across shelf-materialization workers, hence `Send + Sync` and
/// `&self` receivers.
pub trait P4Server: Send + Sync {
    /// Connection parameters this server was opened with.
    fn connection(&self) -> &Connection;

    /// Trust the server's SSL fingerprint: install `fingerprint` when given,
    /// otherwise accept whatever the server presents.
    fn trust(&self, fingerprint: Option<&str>) -> ServerResult<()>;

    /// Establish (and verify) the connection.
    fn connect(&self) -> ServerResult<ServerInfo>;

    /// Release the connection. Called exactly once by the owner on teardown.
    fn disconnect(&self);

    /// Fetch a client record, or the server's default form for an unknown name.
    fn fetch_client(&self, name: &ClientName) -> ServerResult<ClientSpec>;

    fn save_client(&self, spec: &ClientSpec) -> ServerResult<()>;

    /// Every client record on the server.
    fn clients(&self) -> ServerResult<Vec<ClientSummary>>;

    /// Delete a client record. Files under its root are left alone.
    fn delete_client(&self, name: &ClientName) -> ServerResult<()>;

    /// Revert open files matching `pattern`. Returns the number of files reverted.
    fn revert(&self, client: &ClientName, pattern: &str) -> ServerResult<usize>;

    /// Make on-disk content match the have table: restore deleted files and
    /// remove files unknown to the server; with `include_edited`, also restore
    /// modified files.
    fn clean(&self, client: &ClientName, paths: &[String], include_edited: bool)
        -> ServerResult<()>;

    /// Sync `paths` (each optionally revision-suffixed). `parallel` of 0 leaves
    /// the server default. An up-to-date workspace yields an empty list.
    fn sync(
        &self,
        client: &ClientName,
        paths: &[String],
        parallel: usize,
        progress: Progress<'_>,
    ) -> ServerResult<Vec<SyncedFile>>;

    /// Update the have table to `path_spec` without transferring content.
    fn flush(&self, client: &ClientName, path_spec: &str) -> ServerResult<()>;

    fn changes(&self, query: &ChangesQuery) -> ServerResult<Vec<ChangeDescription>>;

    fn counter(&self, name: &str) -> ServerResult<String>;

    /// The revision stored on a label, `None` when the label has none (or
    /// does not exist).
    fn label_revision(&self, label: &str) -> ServerResult<Option<String>>;

    /// Describe a change; with `shelved`, list its shelved files.
    fn describe(&self, change: ChangeNumber, shelved: bool) -> ServerResult<ChangeDescription>;

    /// Content of a file revision, e.g. `//depot/a.txt@=123` for shelved content.
    fn print(&self, file_spec: &str) -> ServerResult<Vec<u8>>;

    /// Map depot files into the client. Files outside the view are omitted.
    fn where_files(
        &self,
        client: &ClientName,
        depot_paths: &[String],
    ) -> ServerResult<Vec<FileMapping>>;

    /// Open the files of a shelved change in the client's default change.
    fn unshelve(&self, client: &ClientName, change: ChangeNumber) -> ServerResult<()>;

    /// The client's default pending change form.
    fn fetch_change(&self, client: &ClientName) -> ServerResult<PendingChange>;

    /// Save a change form as a new numbered pending change.
    fn save_change(&self, change: &PendingChange) -> ServerResult<ChangeNumber>;

    fn shelve(&self, client: &ClientName, change: ChangeNumber) -> ServerResult<()>;

    /// Whether a client of this storage type can flush to another client's
    /// have table (`//client/...@other-client`).
    fn supports_client_flush(&self, storage_type: StorageType) -> bool;
}

/// Shared handles, so one server can back several engines in turn.
impl<T: P4Server + ?Sized> P4Server for std::sync::Arc<T> {
    fn connection(&self) -> &Connection {
        (**self).connection()
    }

    fn trust(&self, fingerprint: Option<&str>) -> ServerResult<()> {
        (**self).trust(fingerprint)
    }

    fn connect(&self) -> ServerResult<ServerInfo> {
        (**self).connect()
    }

    fn disconnect(&self) {
        (**self).disconnect()
    }

    fn fetch_client(&self, name: &ClientName) -> ServerResult<ClientSpec> {
        (**self).fetch_client(name)
    }

    fn save_client(&self, spec: &ClientSpec) -> ServerResult<()> {
        (**self).save_client(spec)
    }

    fn clients(&self) -> ServerResult<Vec<ClientSummary>> {
        (**self).clients()
    }

    fn delete_client(&self, name: &ClientName) -> ServerResult<()> {
        (**self).delete_client(name)
    }

    fn revert(&self, client: &ClientName, pattern: &str) -> ServerResult<usize> {
        (**self).revert(client, pattern)
    }

    fn clean(
        &self,
        client: &ClientName,
        paths: &[String],
        include_edited: bool,
    ) -> ServerResult<()> {
        (**self).clean(client, paths, include_edited)
    }

    fn sync(
        &self,
        client: &ClientName,
        paths: &[String],
        parallel: usize,
        progress: Progress<'_>,
    ) -> ServerResult<Vec<SyncedFile>> {
        (**self).sync(client, paths, parallel, progress)
    }

    fn flush(&self, client: &ClientName, path_spec: &str) -> ServerResult<()> {
        (**self).flush(client, path_spec)
    }

    fn changes(&self, query: &ChangesQuery) -> ServerResult<Vec<ChangeDescription>> {
        (**self).changes(query)
    }

    fn counter(&self, name: &str) -> ServerResult<String> {
        (**self).counter(name)
    }

    fn label_revision(&self, label: &str) -> ServerResult<Option<String>> {
        (**self).label_revision(label)
    }

    fn describe(&self, change: ChangeNumber, shelved: bool) -> ServerResult<ChangeDescription> {
        (**self).describe(change, shelved)
    }

    fn print(&self, file_spec: &str) -> ServerResult<Vec<u8>> {
        (**self).print(file_spec)
    }

    fn where_files(
        &self,
        client: &ClientName,
        depot_paths: &[String],
    ) -> ServerResult<Vec<FileMapping>> {
        (**self).where_files(client, depot_paths)
    }

    fn unshelve(&self, client: &ClientName, change: ChangeNumber) -> ServerResult<()> {
        (**self).unshelve(client, change)
    }

    fn fetch_change(&self, client: &ClientName) -> ServerResult<PendingChange> {
        (**self).fetch_change(client)
    }

    fn save_change(&self, change: &PendingChange) -> ServerResult<ChangeNumber> {
        (**self).save_change(change)
    }

    fn shelve(&self, client: &ClientName, change: ChangeNumber) -> ServerResult<()> {
        (**self).shelve(client, change)
    }

    fn supports_client_flush(&self, storage_type: StorageType) -> bool {
        (**self).supports_client_flush(storage_type)
    }
}
