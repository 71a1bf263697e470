//! In-memory [`P4Server`] for tests.
//!
//! Models a single depot with per-file revision history, submitted, pending
//! and shelved changes, labels, counters and client records with have and
//! opened tables. Syncs, cleans, reverts and unshelves touch real files under
//! the client root so workspace behaviour can be checked on disk.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

use p4ci_core::view::{self, View};
use p4ci_core::{
    ChangeDescription, ChangeNumber, ChangeStatus, ClientName, ClientOptions, ClientSpec,
    Connection, FileAction, FileType, PendingChange, ShelvedFile, StorageType, SyncedFile,
    ViewMapping,
};

use crate::error::{command_err, io_err, ServerError};
use crate::server::{ChangesQuery, ClientSummary, FileMapping, P4Server, Progress, ServerInfo, ServerResult};

/// Fingerprint the server presents on `ssl` ports unless configured otherwise.
pub const DEFAULT_FINGERPRINT: &str =
    "5A:1C:9E:3B:77:0D:41:A8:2F:C6:93:5E:B0:12:7D:E4:68:AF:30:5B";

const STORAGE_TYPE_FIXED: &str = "Client storage type cannot be changed after client is created.";

// ---------------------------------------------------------------------------
// Fixture types
// ---------------------------------------------------------------------------

/// One file of a shelved change fixture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShelfEntry {
    pub depot_path: String,
    pub action: FileAction,
    pub file_type: FileType,
    /// `None` for deletes.
    pub content: Option<Vec<u8>>,
}

impl ShelfEntry {
    pub fn edit(depot_path: &str, content: impl Into<Vec<u8>>) -> Self {
        Self {
            depot_path: depot_path.to_owned(),
            action: FileAction::Edit,
            file_type: FileType::text(),
            content: Some(content.into()),
        }
    }

    pub fn add(depot_path: &str, content: impl Into<Vec<u8>>) -> Self {
        Self {
            action: FileAction::Add,
            ..Self::edit(depot_path, content)
        }
    }

    pub fn delete(depot_path: &str) -> Self {
        Self {
            depot_path: depot_path.to_owned(),
            action: FileAction::Delete,
            file_type: FileType::text(),
            content: None,
        }
    }

    /// Override the file type, e.g. `binary+l`.
    pub fn with_type(mut self, raw: &str) -> Self {
        self.file_type = FileType::parse(raw);
        self
    }
}

#[derive(Debug, Clone)]
struct FileRev {
    change: u64,
    /// `None` for a deleted revision.
    content: Option<Vec<u8>>,
    file_type: FileType,
}

#[derive(Debug, Clone)]
struct Change {
    description: String,
    user: String,
    client: String,
    status: ChangeStatus,
    submitted: Vec<(String, FileAction, FileType)>,
    shelved: Vec<ShelfEntry>,
}

#[derive(Debug, Clone)]
struct Opened {
    action: FileAction,
    file_type: FileType,
    change: Option<u64>,
}

#[derive(Debug, Clone)]
struct ClientState {
    spec: ClientSpec,
    have: BTreeMap<String, u32>,
    opened: BTreeMap<String, Opened>,
    accessed: DateTime<Utc>,
}

impl ClientState {
    fn view(&self) -> View {
        match &self.spec.stream {
            Some(stream) => View::new(vec![view::stream_mapping(stream, &self.spec.name)]),
            None => View::new(self.spec.view.clone()),
        }
    }

    /// Client path of `depot` when it is mapped and selected by `pattern`.
    fn select(&self, view: &View, pattern: &str, depot: &str) -> Option<String> {
        let client_path = view.depot_to_client(depot)?;
        let prefix = format!("//{}/", self.spec.name);
        let hit = if pattern.starts_with(&prefix) {
            view::matches(pattern, &client_path)
        } else {
            view::matches(pattern, depot)
        };
        hit.then_some(client_path)
    }

    fn local_path(&self, client_path: &str) -> Option<PathBuf> {
        view::client_path_to_local(&self.spec.name, &self.spec.root, client_path)
    }

    fn writable(&self) -> bool {
        self.spec.options.contains("allwrite")
    }
}

#[derive(Debug, Clone)]
struct Label {
    revision: Option<String>,
    /// Highest change tagged when the label carries no revision.
    tagged_at: u64,
}

/// Where a path argument points in each file's history.
#[derive(Debug, Clone)]
enum Target {
    /// Latest revision submitted at or before the change; `None` for head.
    Bound(Option<u64>),
    Revision(u32),
    Client(String),
}

#[derive(Debug, Default)]
struct State {
    depot: BTreeMap<String, Vec<FileRev>>,
    changes: BTreeMap<u64, Change>,
    labels: BTreeMap<String, Label>,
    counters: BTreeMap<String, String>,
    clients: BTreeMap<String, ClientState>,
    trusted: Option<String>,
    connected: bool,
    flushes: Vec<(ClientName, String)>,
    flush_streams: Vec<Option<String>>,
    cleans: Vec<(ClientName, Vec<String>)>,
    prints: usize,
    disconnects: usize,
}

impl State {
    fn next_change(&self) -> u64 {
        self.changes.keys().next_back().map_or(1, |n| n + 1)
    }

    fn max_submitted(&self) -> u64 {
        self.changes
            .iter()
            .filter(|(_, c)| c.status == ChangeStatus::Submitted)
            .map(|(n, _)| *n)
            .max()
            .unwrap_or(0)
    }

    fn client(&self, name: &ClientName) -> ServerResult<&ClientState> {
        self.clients.get(name.as_str()).ok_or_else(|| unknown_client(name))
    }

    fn client_mut(&mut self, name: &ClientName) -> ServerResult<&mut ClientState> {
        self.clients
            .get_mut(name.as_str())
            .ok_or_else(|| unknown_client(name))
    }

    fn target(&self, rev: &str, command: &str) -> ServerResult<Target> {
        let rev = rev.trim();
        if rev.is_empty() || rev == "#head" || rev == "@now" {
            return Ok(Target::Bound(None));
        }
        if rev == "#none" {
            return Ok(Target::Bound(Some(0)));
        }
        if let Some(n) = rev.strip_prefix('#') {
            return n
                .parse()
                .map(Target::Revision)
                .map_err(|_| command_err(command, format!("Invalid revision '{rev}'.")));
        }
        let Some(name) = rev.strip_prefix('@') else {
            return Err(command_err(command, format!("Invalid revision '{rev}'.")));
        };
        if let Ok(n) = name.parse::<u64>() {
            return Ok(Target::Bound(Some(n)));
        }
        if let Some(label) = self.labels.get(name) {
            return match &label.revision {
                Some(inner) if inner != rev => self.target(inner, command),
                _ => Ok(Target::Bound(Some(label.tagged_at))),
            };
        }
        if self.clients.contains_key(name) {
            return Ok(Target::Client(name.to_owned()));
        }
        Err(command_err(
            command,
            format!("Invalid changelist/client/label/date '{rev}'."),
        ))
    }

    /// Upper change bound for history queries.
    fn bound(&self, rev: &str, command: &str) -> ServerResult<Option<u64>> {
        Ok(match self.target(rev, command)? {
            Target::Bound(bound) => bound,
            Target::Revision(_) => None,
            Target::Client(name) => Some(
                self.clients
                    .get(&name)
                    .map(|c| {
                        c.have
                            .iter()
                            .filter_map(|(depot, rev)| self.rev(depot, *rev))
                            .map(|r| r.change)
                            .max()
                            .unwrap_or(0)
                    })
                    .unwrap_or(0),
            ),
        })
    }

    fn rev(&self, depot: &str, rev: u32) -> Option<&FileRev> {
        let index = usize::try_from(rev).ok()?.checked_sub(1)?;
        self.depot.get(depot)?.get(index)
    }

    /// Revision number of `depot` at `target`, `None` when absent or deleted.
    fn resolve(&self, depot: &str, target: &Target) -> Option<u32> {
        let revs = self.depot.get(depot)?;
        let rev = match target {
            Target::Bound(bound) => {
                let index = revs
                    .iter()
                    .rposition(|r| bound.map_or(true, |b| r.change <= b))?;
                u32::try_from(index + 1).ok()?
            }
            Target::Revision(n) => *n,
            Target::Client(name) => *self.clients.get(name)?.have.get(depot)?,
        };
        self.rev(depot, rev)?.content.as_ref().map(|_| rev)
    }

    /// Desired have revision of every file selected by `paths`.
    fn plan(
        &self,
        client: &ClientState,
        paths: &[String],
        command: &str,
    ) -> ServerResult<BTreeMap<String, (String, Option<u32>)>> {
        let view = client.view();
        let mut desired = BTreeMap::new();
        for spec in paths {
            let (pattern, rev) = view::split_revision(spec);
            let target = self.target(rev, command)?;
            let candidates: BTreeSet<&String> =
                self.depot.keys().chain(client.have.keys()).collect();
            for depot in candidates {
                if let Some(client_path) = client.select(&view, pattern, depot) {
                    desired.insert(depot.clone(), (client_path, self.resolve(depot, &target)));
                }
            }
        }
        Ok(desired)
    }

    fn submit(&mut self, description: &str, files: Vec<(String, FileType, Option<Vec<u8>>)>) -> u64 {
        let number = self.next_change();
        let mut submitted = Vec::new();
        for (depot, file_type, content) in files {
            let revs = self.depot.entry(depot.clone()).or_default();
            let action = match (&content, revs.last()) {
                (None, _) => FileAction::Delete,
                (Some(_), Some(last)) if last.content.is_some() => FileAction::Edit,
                (Some(_), _) => FileAction::Add,
            };
            revs.push(FileRev {
                change: number,
                content,
                file_type: file_type.clone(),
            });
            submitted.push((depot, action, file_type));
        }
        self.changes.insert(
            number,
            Change {
                description: description.to_owned(),
                user: "fixture".to_owned(),
                client: "fixture-ws".to_owned(),
                status: ChangeStatus::Submitted,
                submitted,
                shelved: Vec::new(),
            },
        );
        number
    }
}

fn unknown_client(name: &ClientName) -> ServerError {
    command_err(
        "client",
        format!("Client '{name}' unknown - use 'client' command to create it."),
    )
}

// ---------------------------------------------------------------------------
// Disk helpers
// ---------------------------------------------------------------------------

fn remove_local(path: &Path) -> ServerResult<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(io_err(path, e)),
    }
}

fn write_local(path: &Path, content: &[u8], writable: bool) -> ServerResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }
    remove_local(path)?;
    fs::write(path, content).map_err(|e| io_err(path, e))?;
    if !writable {
        let mut perms = fs::metadata(path).map_err(|e| io_err(path, e))?.permissions();
        perms.set_readonly(true);
        fs::set_permissions(path, perms).map_err(|e| io_err(path, e))?;
    }
    Ok(())
}

fn is_writable_file(path: &Path) -> bool {
    fs::metadata(path)
        .map(|m| m.is_file() && !m.permissions().readonly())
        .unwrap_or(false)
}

fn walk_files(dir: &Path, out: &mut Vec<PathBuf>) -> ServerResult<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(io_err(dir, e)),
    };
    for entry in entries {
        let path = entry.map_err(|e| io_err(dir, e))?.path();
        if path.is_dir() {
            walk_files(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// MemoryServer
// ---------------------------------------------------------------------------

/// A self-contained server holding everything in memory.
#[derive(Debug)]
pub struct MemoryServer {
    connection: Connection,
    fingerprint: String,
    client_flush: Vec<StorageType>,
    state: Mutex<State>,
}

impl Default for MemoryServer {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryServer {
    pub fn new() -> Self {
        Self {
            connection: Connection {
                port: Some("memory:1666".to_owned()),
                user: Some("ci".to_owned()),
                env: BTreeMap::new(),
            },
            fingerprint: DEFAULT_FINGERPRINT.to_owned(),
            client_flush: vec![StorageType::Writeable],
            state: Mutex::new(State::default()),
        }
    }

    /// Serve over `ssl`, presenting `fingerprint`.
    pub fn with_ssl_fingerprint(mut self, fingerprint: &str) -> Self {
        self.connection.port = Some("ssl:memory:1666".to_owned());
        self.fingerprint = fingerprint.to_owned();
        self
    }

    /// Pretend `name` was last used at `when`.
    pub fn set_client_access(&self, name: &ClientName, when: DateTime<Utc>) {
        if let Some(ws) = self.lock().clients.get_mut(name.as_str()) {
            ws.accessed = when;
        }
    }

    /// Storage types able to flush to another client's have table.
    pub fn with_client_flush(mut self, storage_types: &[StorageType]) -> Self {
        self.client_flush = storage_types.to_vec();
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn connected(&self) -> ServerResult<MutexGuard<'_, State>> {
        let state = self.lock();
        if !state.connected {
            return Err(ServerError::Connection {
                port: self.port(),
                message: "not connected".to_owned(),
            });
        }
        Ok(state)
    }

    fn port(&self) -> String {
        self.connection.port.clone().unwrap_or_default()
    }

    // -- fixtures ----------------------------------------------------------

    /// Submit text files; returns the new change.
    pub fn submit(&self, description: &str, files: &[(&str, &[u8])]) -> ChangeNumber {
        let files = files
            .iter()
            .map(|(path, content)| ((*path).to_owned(), FileType::text(), Some(content.to_vec())))
            .collect();
        ChangeNumber(self.lock().submit(description, files))
    }

    /// Submit files with explicit types such as `binary` or `text+l`.
    pub fn submit_typed(&self, description: &str, files: &[(&str, &str, &[u8])]) -> ChangeNumber {
        let files = files
            .iter()
            .map(|(path, raw_type, content)| {
                (
                    (*path).to_owned(),
                    FileType::parse(raw_type),
                    Some(content.to_vec()),
                )
            })
            .collect();
        ChangeNumber(self.lock().submit(description, files))
    }

    pub fn submit_delete(&self, description: &str, paths: &[&str]) -> ChangeNumber {
        let files = paths
            .iter()
            .map(|path| ((*path).to_owned(), FileType::text(), None))
            .collect();
        ChangeNumber(self.lock().submit(description, files))
    }

    /// Create a pending change owned by `client` holding `entries` shelved.
    pub fn shelve_files(&self, description: &str, client: &str, entries: Vec<ShelfEntry>) -> ChangeNumber {
        let mut state = self.lock();
        let number = state.next_change();
        state.changes.insert(
            number,
            Change {
                description: description.to_owned(),
                user: "developer".to_owned(),
                client: client.to_owned(),
                status: ChangeStatus::Pending,
                submitted: Vec::new(),
                shelved: entries,
            },
        );
        ChangeNumber(number)
    }

    /// Create or replace a label. Without a revision it tags head as of now.
    pub fn set_label(&self, name: &str, revision: Option<&str>) {
        let mut state = self.lock();
        let tagged_at = state.max_submitted();
        state.labels.insert(
            name.to_owned(),
            Label {
                revision: revision.map(str::to_owned),
                tagged_at,
            },
        );
    }

    pub fn set_counter(&self, name: &str, value: &str) {
        self.lock().counters.insert(name.to_owned(), value.to_owned());
    }

    // -- inspection --------------------------------------------------------

    pub fn client(&self, name: &ClientName) -> Option<ClientSpec> {
        self.lock().clients.get(name.as_str()).map(|c| c.spec.clone())
    }

    /// Have table of `name`: depot path to revision.
    pub fn have(&self, name: &ClientName) -> BTreeMap<String, u32> {
        self.lock()
            .clients
            .get(name.as_str())
            .map(|c| c.have.clone())
            .unwrap_or_default()
    }

    /// Depot paths `name` has open.
    pub fn opened(&self, name: &ClientName) -> Vec<String> {
        self.lock()
            .clients
            .get(name.as_str())
            .map(|c| c.opened.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Every flush performed, as `(client, path spec)`.
    pub fn flushes(&self) -> Vec<(ClientName, String)> {
        self.lock().flushes.clone()
    }

    /// Stream each client was bound to when its flush ran, in flush order.
    pub fn flush_streams(&self) -> Vec<Option<String>> {
        self.lock().flush_streams.clone()
    }

    /// Every clean performed, as `(client, paths)`.
    pub fn cleans(&self) -> Vec<(ClientName, Vec<String>)> {
        self.lock().cleans.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    pub fn disconnect_count(&self) -> usize {
        self.lock().disconnects
    }

    /// Number of content fetches served.
    pub fn print_count(&self) -> usize {
        self.lock().prints
    }

    /// Shelved files of a change, for checking backups.
    pub fn shelved(&self, change: ChangeNumber) -> Vec<ShelfEntry> {
        self.lock()
            .changes
            .get(&change.0)
            .map(|c| c.shelved.clone())
            .unwrap_or_default()
    }
}

impl P4Server for MemoryServer {
    fn connection(&self) -> &Connection {
        &self.connection
    }

    fn trust(&self, fingerprint: Option<&str>) -> ServerResult<()> {
        if !self.connection.is_ssl() {
            return Ok(());
        }
        let installed = fingerprint.unwrap_or(&self.fingerprint).to_owned();
        self.lock().trusted = Some(installed);
        Ok(())
    }

    fn connect(&self) -> ServerResult<ServerInfo> {
        let mut state = self.lock();
        if self.connection.is_ssl() && state.trusted.as_deref() != Some(self.fingerprint.as_str()) {
            return Err(ServerError::Untrusted {
                port: self.port(),
                message: format!(
                    "the fingerprint for the key sent to your client is\n{}",
                    self.fingerprint
                ),
            });
        }
        state.connected = true;
        Ok(ServerInfo {
            address: self.port(),
            version: "P4D/MEMORY/2024.1".to_owned(),
            user: self.connection.user.clone().unwrap_or_default(),
        })
    }

    fn disconnect(&self) {
        let mut state = self.lock();
        state.connected = false;
        state.disconnects += 1;
    }

    fn fetch_client(&self, name: &ClientName) -> ServerResult<ClientSpec> {
        let state = self.connected()?;
        if let Some(client) = state.clients.get(name.as_str()) {
            return Ok(client.spec.clone());
        }
        let mut spec = ClientSpec::new(name.clone(), PathBuf::new());
        spec.options = ClientOptions(
            ["noallwrite", "noclobber", "nocompress", "unlocked", "nomodtime", "normdir"]
                .iter()
                .map(|s| (*s).to_owned())
                .collect(),
        );
        spec.view = vec![ViewMapping::new("//depot/...", name.all_files())];
        spec.extra
            .insert("Owner".to_owned(), self.connection.user.clone().unwrap_or_default());
        Ok(spec)
    }

    fn save_client(&self, spec: &ClientSpec) -> ServerResult<()> {
        let mut state = self.connected()?;
        let mut saved = spec.clone();
        saved.updated_at = Some(Utc::now());
        match state.clients.get_mut(spec.name.as_str()) {
            Some(existing) => {
                if existing.spec.storage_type != spec.storage_type {
                    return Err(command_err("client", STORAGE_TYPE_FIXED));
                }
                if existing.spec.stream != spec.stream && !existing.opened.is_empty() {
                    return Err(command_err(
                        "client",
                        format!(
                            "Client '{}' has files opened. To switch streams, revert or shelve opened files.",
                            spec.name
                        ),
                    ));
                }
                existing.spec = saved;
                existing.accessed = Utc::now();
            }
            None => {
                state.clients.insert(
                    spec.name.as_str().to_owned(),
                    ClientState {
                        spec: saved,
                        have: BTreeMap::new(),
                        opened: BTreeMap::new(),
                        accessed: Utc::now(),
                    },
                );
            }
        }
        Ok(())
    }

    fn clients(&self) -> ServerResult<Vec<ClientSummary>> {
        let state = self.connected()?;
        Ok(state
            .clients
            .values()
            .map(|ws| ClientSummary {
                name: ws.spec.name.clone(),
                owner: ws.spec.extra.get("Owner").cloned().unwrap_or_default(),
                root: ws.spec.root.clone(),
                accessed: Some(ws.accessed),
            })
            .collect())
    }

    fn delete_client(&self, name: &ClientName) -> ServerResult<()> {
        let mut state = self.connected()?;
        let ws = state.client(name)?;
        if !ws.opened.is_empty() {
            return Err(command_err(
                "client",
                format!("Client '{name}' has files opened; use -f to force the delete."),
            ));
        }
        state.clients.remove(name.as_str());
        Ok(())
    }

    fn revert(&self, client: &ClientName, pattern: &str) -> ServerResult<usize> {
        let mut guard = self.connected()?;
        let state = &mut *guard;
        let ws = state.clients.get_mut(client.as_str()).ok_or_else(|| unknown_client(client))?;
        let view = ws.view();
        let selected: Vec<(String, String)> = ws
            .opened
            .keys()
            .filter_map(|depot| Some((depot.clone(), ws.select(&view, pattern, depot)?)))
            .collect();
        for (depot, client_path) in &selected {
            let Some(opened) = ws.opened.remove(depot) else {
                continue;
            };
            let Some(local) = ws.local_path(client_path) else {
                continue;
            };
            if opened.action == FileAction::Add {
                continue;
            }
            let have_content = ws
                .have
                .get(depot)
                .and_then(|rev| {
                    let index = usize::try_from(*rev).ok()?.checked_sub(1)?;
                    state.depot.get(depot)?.get(index)?.content.clone()
                });
            match have_content {
                Some(content) => write_local(&local, &content, ws.writable())?,
                None => {
                    remove_local(&local)?;
                }
            }
        }
        Ok(selected.len())
    }

    fn clean(
        &self,
        client: &ClientName,
        paths: &[String],
        include_edited: bool,
    ) -> ServerResult<()> {
        let mut guard = self.connected()?;
        let state = &mut *guard;
        state.cleans.push((client.clone(), paths.to_vec()));
        let ws = state.clients.get(client.as_str()).ok_or_else(|| unknown_client(client))?;
        let view = ws.view();
        let root = ws.spec.root.clone();

        // Local paths select exactly one file.
        let patterns: Vec<String> = if paths.is_empty() {
            vec![client.all_files()]
        } else {
            paths
                .iter()
                .filter_map(|p| {
                    if p.starts_with("//") {
                        Some(p.clone())
                    } else {
                        view::local_to_client_path(client, &root, Path::new(p))
                    }
                })
                .collect()
        };
        let selected = |depot: &str| patterns.iter().find_map(|p| ws.select(&view, p, depot));

        let mut tracked = BTreeSet::new();
        for (depot, rev) in &ws.have {
            let Some(client_path) = view.depot_to_client(depot) else {
                continue;
            };
            tracked.insert(client_path.clone());
            if ws.opened.contains_key(depot) || selected(depot).is_none() {
                continue;
            }
            let (Some(local), Some(content)) = (
                ws.local_path(&client_path),
                state.rev(depot, *rev).and_then(|r| r.content.as_ref()),
            ) else {
                continue;
            };
            let differs = match fs::read(&local) {
                Ok(current) => include_edited && current != *content,
                Err(e) if e.kind() == io::ErrorKind::NotFound => true,
                Err(e) => return Err(io_err(&local, e)),
            };
            if differs {
                write_local(&local, content, ws.writable())?;
            }
        }
        for depot in ws.opened.keys() {
            if let Some(client_path) = view.depot_to_client(depot) {
                tracked.insert(client_path);
            }
        }

        let mut on_disk = Vec::new();
        walk_files(&root, &mut on_disk)?;
        for local in on_disk {
            let Some(client_path) = view::local_to_client_path(client, &root, &local) else {
                continue;
            };
            // Files outside the view are not the client's to remove.
            if tracked.contains(&client_path) || view.client_to_depot(&client_path).is_none() {
                continue;
            }
            if patterns.iter().any(|p| view::matches(p, &client_path)) {
                remove_local(&local)?;
            }
        }
        Ok(())
    }

    fn sync(
        &self,
        client: &ClientName,
        paths: &[String],
        _parallel: usize,
        progress: Progress<'_>,
    ) -> ServerResult<Vec<SyncedFile>> {
        let mut guard = self.connected()?;
        let plan = {
            let ws = guard.client(client)?;
            guard.plan(ws, paths, "sync")?
        };
        let state = &mut *guard;
        let ws = state.clients.get_mut(client.as_str()).ok_or_else(|| unknown_client(client))?;
        let clobber = ws.spec.options.contains("clobber");
        ws.accessed = Utc::now();

        let mut synced = Vec::new();
        for (depot, (client_path, desired)) in plan {
            let current = ws.have.get(&depot).copied();
            if current == desired || ws.opened.contains_key(&depot) {
                continue;
            }
            let Some(local) = ws.local_path(&client_path) else {
                continue;
            };
            let (action, size) = match desired {
                Some(rev) => {
                    let content = state
                        .depot
                        .get(&depot)
                        .and_then(|revs| revs.get(usize::try_from(rev).ok()?.checked_sub(1)?))
                        .and_then(|r| r.content.clone())
                        .unwrap_or_default();
                    if !clobber && is_writable_file(&local) {
                        return Err(command_err(
                            "sync",
                            format!("Can't clobber writable file {}", local.display()),
                        ));
                    }
                    write_local(&local, &content, ws.writable())?;
                    ws.have.insert(depot.clone(), rev);
                    let action = if current.is_some() { "updated" } else { "added" };
                    (action, Some(content.len() as u64))
                }
                None => {
                    remove_local(&local)?;
                    ws.have.remove(&depot);
                    ("deleted", None)
                }
            };
            let file = SyncedFile {
                depot_path: depot,
                local_path: Some(local),
                revision: desired.or(current),
                action: action.to_owned(),
                file_size: size,
                total_file_count: None,
                total_file_size: None,
            };
            progress(&file);
            synced.push(file);
        }
        let total_size = synced.iter().filter_map(|f| f.file_size).sum();
        let total_count = synced.len() as u64;
        if let Some(first) = synced.first_mut() {
            first.total_file_count = Some(total_count);
            first.total_file_size = Some(total_size);
        }
        Ok(synced)
    }

    fn flush(&self, client: &ClientName, path_spec: &str) -> ServerResult<()> {
        let mut guard = self.connected()?;
        let plan = {
            let ws = guard.client(client)?;
            guard.plan(ws, &[path_spec.to_owned()], "flush")?
        };
        let ws = guard.client_mut(client)?;
        let bound = ws.spec.stream.clone();
        for (depot, (_, desired)) in plan {
            match desired {
                Some(rev) => ws.have.insert(depot, rev),
                None => ws.have.remove(&depot),
            };
        }
        guard.flushes.push((client.clone(), path_spec.to_owned()));
        guard.flush_streams.push(bound);
        Ok(())
    }

    fn changes(&self, query: &ChangesQuery) -> ServerResult<Vec<ChangeDescription>> {
        let state = self.connected()?;
        let mut scopes = Vec::new();
        for spec in &query.paths {
            let (pattern, rev) = view::split_revision(spec);
            let bound = state.bound(rev, "changes")?;
            // Client-syntax patterns select through that client's view.
            let client = pattern
                .strip_prefix("//")
                .and_then(|p| p.split('/').next())
                .and_then(|name| state.clients.get(name));
            scopes.push((pattern.to_owned(), bound, client));
        }
        let affects = |change: &Change, number: u64| {
            scopes.is_empty()
                || scopes.iter().any(|(pattern, bound, client)| {
                    bound.map_or(true, |b| number <= b)
                        && change.submitted.iter().any(|(depot, _, _)| match client {
                            Some(ws) => ws.select(&ws.view(), pattern, depot).is_some(),
                            None => view::matches(pattern, depot),
                        })
                })
        };
        let mut out = Vec::new();
        for (number, change) in state.changes.iter().rev() {
            let status_ok = match query.status {
                Some(ChangeStatus::Submitted) => change.status == ChangeStatus::Submitted,
                Some(ChangeStatus::Pending) => change.status == ChangeStatus::Pending,
                Some(ChangeStatus::Shelved) => !change.shelved.is_empty(),
                None => true,
            };
            let client_ok = query
                .client
                .as_ref()
                .map_or(true, |c| c.as_str() == change.client);
            let scope_ok = change.status != ChangeStatus::Submitted || affects(change, *number);
            if status_ok && client_ok && scope_ok {
                out.push(describe_change(*number, change, false));
            }
            if query.max.is_some_and(|max| out.len() >= max) {
                break;
            }
        }
        Ok(out)
    }

    fn counter(&self, name: &str) -> ServerResult<String> {
        let state = self.connected()?;
        if let Some(value) = state.counters.get(name) {
            return Ok(value.clone());
        }
        Ok(match name {
            "change" | "maxCommitChange" => state.max_submitted().to_string(),
            _ => "0".to_owned(),
        })
    }

    fn label_revision(&self, label: &str) -> ServerResult<Option<String>> {
        let state = self.connected()?;
        Ok(state.labels.get(label).and_then(|l| l.revision.clone()))
    }

    fn describe(&self, change: ChangeNumber, shelved: bool) -> ServerResult<ChangeDescription> {
        let state = self.connected()?;
        state
            .changes
            .get(&change.0)
            .map(|c| describe_change(change.0, c, shelved))
            .ok_or_else(|| command_err("describe", format!("Change {change} unknown.")))
    }

    fn print(&self, file_spec: &str) -> ServerResult<Vec<u8>> {
        let mut state = self.connected()?;
        state.prints += 1;
        let (depot, rev) = view::split_revision(file_spec);
        let missing = || command_err("print", format!("{file_spec} - no such file(s)."));
        if let Some(shelf) = rev.strip_prefix("@=") {
            let number: u64 = shelf.parse().map_err(|_| missing())?;
            return state
                .changes
                .get(&number)
                .and_then(|c| c.shelved.iter().find(|e| e.depot_path == depot))
                .and_then(|e| e.content.clone())
                .ok_or_else(missing);
        }
        let target = state.target(rev, "print")?;
        let rev = state.resolve(depot, &target).ok_or_else(missing)?;
        state
            .rev(depot, rev)
            .and_then(|r| r.content.clone())
            .ok_or_else(missing)
    }

    fn where_files(
        &self,
        client: &ClientName,
        depot_paths: &[String],
    ) -> ServerResult<Vec<FileMapping>> {
        let state = self.connected()?;
        let ws = state.client(client)?;
        let view = ws.view();
        Ok(depot_paths
            .iter()
            .filter_map(|depot| {
                let client_path = view.depot_to_client(depot)?;
                let local_path = ws.local_path(&client_path)?;
                Some(FileMapping {
                    depot_path: depot.clone(),
                    client_path,
                    local_path,
                })
            })
            .collect())
    }

    fn unshelve(&self, client: &ClientName, change: ChangeNumber) -> ServerResult<()> {
        let mut guard = self.connected()?;
        let state = &mut *guard;
        let entries = state
            .changes
            .get(&change.0)
            .map(|c| c.shelved.clone())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                command_err("unshelve", format!("Change {change} - no such shelved change."))
            })?;
        let ws = state.client_mut(client)?;
        let view = ws.view();
        for entry in entries {
            let Some(local) = view
                .depot_to_client(&entry.depot_path)
                .and_then(|cp| ws.local_path(&cp))
            else {
                continue;
            };
            match &entry.content {
                Some(content) => write_local(&local, content, true)?,
                None => {
                    remove_local(&local)?;
                }
            }
            ws.opened.insert(
                entry.depot_path.clone(),
                Opened {
                    action: entry.action.clone(),
                    file_type: entry.file_type.clone(),
                    change: None,
                },
            );
        }
        Ok(())
    }

    fn fetch_change(&self, client: &ClientName) -> ServerResult<PendingChange> {
        let state = self.connected()?;
        let ws = state.client(client)?;
        Ok(PendingChange {
            change: None,
            client: client.clone(),
            description: "<enter description here>".to_owned(),
            files: ws
                .opened
                .iter()
                .filter(|(_, o)| o.change.is_none())
                .map(|(depot, _)| depot.clone())
                .collect(),
        })
    }

    fn save_change(&self, change: &PendingChange) -> ServerResult<ChangeNumber> {
        let mut state = self.connected()?;
        let number = match change.change {
            Some(existing) => existing.0,
            None => state.next_change(),
        };
        let user = self.connection.user.clone().unwrap_or_default();
        let ws = state.client_mut(&change.client)?;
        for file in &change.files {
            let depot = file.split('\t').next().unwrap_or_default();
            if let Some(opened) = ws.opened.get_mut(depot) {
                opened.change = Some(number);
            }
        }
        let entry = state.changes.entry(number).or_insert_with(|| Change {
            description: String::new(),
            user,
            client: change.client.as_str().to_owned(),
            status: ChangeStatus::Pending,
            submitted: Vec::new(),
            shelved: Vec::new(),
        });
        entry.description = change.description.clone();
        Ok(ChangeNumber(number))
    }

    fn shelve(&self, client: &ClientName, change: ChangeNumber) -> ServerResult<()> {
        let mut guard = self.connected()?;
        let state = &mut *guard;
        let ws = state.client(client)?;
        let view = ws.view();
        let mut entries = Vec::new();
        for (depot, opened) in ws.opened.iter().filter(|(_, o)| o.change == Some(change.0)) {
            let content = if opened.action.removes_file() {
                None
            } else {
                let local = view
                    .depot_to_client(depot)
                    .and_then(|cp| ws.local_path(&cp))
                    .ok_or_else(|| command_err("shelve", format!("{depot} - not in client view.")))?;
                Some(fs::read(&local).map_err(|e| io_err(&local, e))?)
            };
            entries.push(ShelfEntry {
                depot_path: depot.clone(),
                action: opened.action.clone(),
                file_type: opened.file_type.clone(),
                content,
            });
        }
        let target = state
            .changes
            .get_mut(&change.0)
            .ok_or_else(|| command_err("shelve", format!("Change {change} unknown.")))?;
        if entries.is_empty() {
            return Err(command_err("shelve", "No files to shelve."));
        }
        target.shelved = entries;
        Ok(())
    }

    fn supports_client_flush(&self, storage_type: StorageType) -> bool {
        self.client_flush.contains(&storage_type)
    }
}

fn describe_change(number: u64, change: &Change, shelved: bool) -> ChangeDescription {
    let files = if shelved {
        change
            .shelved
            .iter()
            .map(|e| ShelvedFile {
                depot_path: e.depot_path.clone(),
                action: e.action.clone(),
                file_type: e.file_type.clone(),
            })
            .collect()
    } else {
        change
            .submitted
            .iter()
            .map(|(depot, action, file_type)| ShelvedFile {
                depot_path: depot.clone(),
                action: action.clone(),
                file_type: file_type.clone(),
            })
            .collect()
    };
    ChangeDescription {
        change: ChangeNumber(number),
        description: change.description.clone(),
        user: change.user.clone(),
        client: change.client.clone(),
        status: change.status.to_string(),
        files,
    }
}
