#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use p4ci_core::{
    ChangeDescription, ChangeNumber, CheckoutConfig, ClientName, ClientSpec, Connection,
    PendingChange, StorageType, SyncedFile,
};
use p4ci_server::{
    ChangesQuery, ClientSummary, FileMapping, MemoryServer, P4Server, Progress, ServerError,
    ServerInfo, ServerResult,
};

pub const MAIN_C: &[u8] = b"int main(void) { return 0; }\n";
pub const README: &[u8] = b"read me\n";
pub const GUIDE: &[u8] = b"# Guide\n";

/// A server with one submitted change of three files.
pub fn seeded_server(server: MemoryServer) -> Arc<MemoryServer> {
    server.submit(
        "initial import",
        &[
            ("//depot/app/main.c", MAIN_C),
            ("//depot/app/README", README),
            ("//depot/docs/guide.md", GUIDE),
        ],
    );
    Arc::new(server)
}

pub fn config(root: &Path, agent: &str) -> CheckoutConfig {
    CheckoutConfig {
        root: root.to_path_buf(),
        agent: Some(agent.to_owned()),
        ..CheckoutConfig::default()
    }
}

/// Every file under `root` except the workspace markers, with its content.
pub fn snapshot(root: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
    let mut out = BTreeMap::new();
    collect(root, root, &mut out);
    out
}

fn collect(root: &Path, dir: &Path, out: &mut BTreeMap<PathBuf, Vec<u8>>) {
    for entry in std::fs::read_dir(dir).expect("read dir") {
        let path = entry.expect("dir entry").path();
        if path.is_dir() {
            collect(root, &path, out);
            continue;
        }
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        if name == "p4config" || name == ".p4ci-patched.json" {
            continue;
        }
        let relative = path.strip_prefix(root).expect("under root").to_path_buf();
        out.insert(relative, std::fs::read(&path).expect("read file"));
    }
}

/// A [`MemoryServer`] that answers some calls the way a real server
/// sometimes does.
pub struct Quirky {
    pub inner: Arc<MemoryServer>,
    /// Report every `where` row twice, like a view with an overlay line.
    pub overlay_rows: bool,
    /// Fail `describe` with this server message.
    pub describe_failure: Option<String>,
}

impl Quirky {
    pub fn new(inner: Arc<MemoryServer>) -> Self {
        Self {
            inner,
            overlay_rows: false,
            describe_failure: None,
        }
    }
}

impl P4Server for Quirky {
    fn connection(&self) -> &Connection {
        self.inner.connection()
    }

    fn trust(&self, fingerprint: Option<&str>) -> ServerResult<()> {
        self.inner.trust(fingerprint)
    }

    fn connect(&self) -> ServerResult<ServerInfo> {
        self.inner.connect()
    }

    fn disconnect(&self) {
        self.inner.disconnect()
    }

    fn fetch_client(&self, name: &ClientName) -> ServerResult<ClientSpec> {
        self.inner.fetch_client(name)
    }

    fn save_client(&self, spec: &ClientSpec) -> ServerResult<()> {
        self.inner.save_client(spec)
    }

    fn clients(&self) -> ServerResult<Vec<ClientSummary>> {
        self.inner.clients()
    }

    fn delete_client(&self, name: &ClientName) -> ServerResult<()> {
        self.inner.delete_client(name)
    }

    fn revert(&self, client: &ClientName, pattern: &str) -> ServerResult<usize> {
        self.inner.revert(client, pattern)
    }

    fn clean(
        &self,
        client: &ClientName,
        paths: &[String],
        include_edited: bool,
    ) -> ServerResult<()> {
        self.inner.clean(client, paths, include_edited)
    }

    fn sync(
        &self,
        client: &ClientName,
        paths: &[String],
        parallel: usize,
        progress: Progress<'_>,
    ) -> ServerResult<Vec<SyncedFile>> {
        self.inner.sync(client, paths, parallel, progress)
    }

    fn flush(&self, client: &ClientName, path_spec: &str) -> ServerResult<()> {
        self.inner.flush(client, path_spec)
    }

    fn changes(&self, query: &ChangesQuery) -> ServerResult<Vec<ChangeDescription>> {
        self.inner.changes(query)
    }

    fn counter(&self, name: &str) -> ServerResult<String> {
        self.inner.counter(name)
    }

    fn label_revision(&self, label: &str) -> ServerResult<Option<String>> {
        self.inner.label_revision(label)
    }

    fn describe(&self, change: ChangeNumber, shelved: bool) -> ServerResult<ChangeDescription> {
        match &self.describe_failure {
            Some(message) => Err(ServerError::Command {
                command: "describe".to_owned(),
                message: message.clone(),
            }),
            None => self.inner.describe(change, shelved),
        }
    }

    fn print(&self, file_spec: &str) -> ServerResult<Vec<u8>> {
        self.inner.print(file_spec)
    }

    fn where_files(
        &self,
        client: &ClientName,
        depot_paths: &[String],
    ) -> ServerResult<Vec<FileMapping>> {
        let rows = self.inner.where_files(client, depot_paths)?;
        if !self.overlay_rows {
            return Ok(rows);
        }
        Ok(rows.into_iter().flat_map(|row| [row.clone(), row]).collect())
    }

    fn unshelve(&self, client: &ClientName, change: ChangeNumber) -> ServerResult<()> {
        self.inner.unshelve(client, change)
    }

    fn fetch_change(&self, client: &ClientName) -> ServerResult<PendingChange> {
        self.inner.fetch_change(client)
    }

    fn save_change(&self, change: &PendingChange) -> ServerResult<ChangeNumber> {
        self.inner.save_change(change)
    }

    fn shelve(&self, client: &ClientName, change: ChangeNumber) -> ServerResult<()> {
        self.inner.shelve(client, change)
    }

    fn supports_client_flush(&self, storage_type: StorageType) -> bool {
        self.inner.supports_client_flush(storage_type)
    }
}
