//! [`P4Server`] backed by the `p4` command-line client in `-G` mode.

use std::io::{BufReader, BufWriter, Read, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use tracing::{debug, warn};

use p4ci_core::{
    ChangeDescription, ChangeNumber, ClientName, ClientOptions, ClientSpec, Connection,
    FileAction, FileType, PendingChange, ShelvedFile, StorageType, SyncedFile, ViewMapping,
};

use crate::error::{command_err, ServerError};
use crate::marshal::{self, Record};
use crate::server::{ChangesQuery, ClientSummary, FileMapping, P4Server, Progress, ServerInfo, ServerResult};

/// Client spec fields the engine manages itself; everything else is carried
/// through `ClientSpec::extra`.
const MANAGED_CLIENT_FIELDS: &[&str] = &[
    "Client", "Root", "Stream", "Type", "Options", "Update", "Access", "code",
];

/// Runs `p4 -G ...` for every call.
#[derive(Debug, Clone)]
pub struct CliServer {
    program: PathBuf,
    connection: Connection,
}

impl CliServer {
    pub fn new(connection: Connection) -> Self {
        Self {
            program: PathBuf::from("p4"),
            connection,
        }
    }

    /// Use a specific `p4` executable.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    fn port_label(&self) -> String {
        self.connection
            .port
            .clone()
            .unwrap_or_else(|| "<default port>".to_owned())
    }

    fn command(&self, client: Option<&ClientName>, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("-G");
        if let Some(port) = &self.connection.port {
            cmd.args(["-p", port]);
        }
        if let Some(user) = &self.connection.user {
            cmd.args(["-u", user]);
        }
        if let Some(client) = client {
            cmd.args(["-c", client.as_str()]);
        }
        cmd.args(args);
        for (key, value) in &self.connection.env {
            cmd.env(key, value);
        }
        cmd
    }

    /// Run one command, streaming each non-message record to `on_record`.
    fn run_streaming(
        &self,
        client: Option<&ClientName>,
        args: &[String],
        input: Option<&Record>,
        on_record: &mut dyn FnMut(Record),
    ) -> ServerResult<()> {
        let label = args.first().cloned().unwrap_or_default();
        debug!("p4 {}", args.join(" "));

        let mut child = self
            .command(client, args)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ServerError::Spawn {
                program: self.program.display().to_string(),
                source,
            })?;

        if let (Some(record), Some(stdin)) = (input, child.stdin.take()) {
            let mut writer = BufWriter::new(stdin);
            marshal::write_record(&mut writer, record)
                .and_then(|_| writer.flush())
                .map_err(|e| decode_err(&label, e))?;
        }

        let stderr_reader = child.stderr.take().map(|mut stderr| {
            std::thread::spawn(move || {
                let mut text = String::new();
                let _ = stderr.read_to_string(&mut text);
                text
            })
        });

        let mut failures = Vec::new();
        let mut decode_failure = None;
        if let Some(stdout) = child.stdout.take() {
            let mut reader = BufReader::new(stdout);
            loop {
                match marshal::read_record(&mut reader) {
                    Ok(Some(record)) if record.is_error() => failures.push(record.message()),
                    Ok(Some(record)) if record.is_warning() => {
                        debug!("p4 {label}: {}", record.message())
                    }
                    Ok(Some(record)) => on_record(record),
                    Ok(None) => break,
                    Err(e) => {
                        decode_failure = Some(e);
                        break;
                    }
                }
            }
        }

        let status = child.wait().map_err(|source| ServerError::Spawn {
            program: self.program.display().to_string(),
            source,
        })?;
        let stderr = stderr_reader
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();

        if !failures.is_empty() {
            return Err(self.classify(&label, failures.join("\n")));
        }
        if let Some(e) = decode_failure {
            return Err(decode_err(&label, e));
        }
        if !status.success() {
            let message = if stderr.trim().is_empty() {
                format!("exited with {status}")
            } else {
                stderr.trim().to_owned()
            };
            return Err(self.classify(&label, message));
        }
        Ok(())
    }

    fn run(
        &self,
        client: Option<&ClientName>,
        args: &[String],
        input: Option<&Record>,
    ) -> ServerResult<Vec<Record>> {
        let mut records = Vec::new();
        self.run_streaming(client, args, input, &mut |r| records.push(r))?;
        Ok(records)
    }

    /// Sort a failure message into the communication or command bucket.
    fn classify(&self, command: &str, message: String) -> ServerError {
        let lower = message.to_ascii_lowercase();
        if lower.contains("authenticity") || lower.contains("fingerprint") || lower.contains("identification has changed") {
            ServerError::Untrusted {
                port: self.port_label(),
                message,
            }
        } else if lower.contains("connect to server failed")
            || lower.contains("tcp connect")
            || lower.contains("password invalid")
            || lower.contains("session has expired")
            || lower.contains("please login")
        {
            ServerError::Connection {
                port: self.port_label(),
                message,
            }
        } else {
            command_err(command, message)
        }
    }
}

fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

fn decode_err(command: &str, e: std::io::Error) -> ServerError {
    ServerError::Decode {
        command: command.to_owned(),
        message: e.to_string(),
    }
}

/// Spec form dates are `YYYY/MM/DD hh:mm:ss`; some servers report epoch seconds.
fn parse_spec_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(secs) = raw.parse::<i64>() {
        return Utc.timestamp_opt(secs, 0).single();
    }
    NaiveDateTime::parse_from_str(raw, "%Y/%m/%d %H:%M:%S")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn client_from_record(name: &ClientName, record: &Record) -> ServerResult<ClientSpec> {
    let mut spec = ClientSpec::new(
        record
            .get("Client")
            .map(ClientName::from)
            .unwrap_or_else(|| name.clone()),
        PathBuf::from(record.get("Root").unwrap_or_default()),
    );
    spec.stream = record.get("Stream").filter(|s| !s.is_empty());
    spec.storage_type = record
        .get("Type")
        .unwrap_or_default()
        .parse()
        .unwrap_or_default();
    spec.options = ClientOptions(
        record
            .get("Options")
            .unwrap_or_default()
            .split_whitespace()
            .map(str::to_owned)
            .collect(),
    );
    spec.updated_at = record.get("Update").as_deref().and_then(parse_spec_date);
    spec.view = record
        .indexed("View")
        .iter()
        .map(|line| ViewMapping::parse(line))
        .collect::<Result<_, _>>()
        .map_err(|e| command_err("client", e.to_string()))?;
    for key in record.keys() {
        if MANAGED_CLIENT_FIELDS.contains(&key) || key.starts_with("View") {
            continue;
        }
        if let Some(value) = record.get(key) {
            spec.extra.insert(key.to_owned(), value);
        }
    }
    Ok(spec)
}

/// `clients` rows name the client in lower case; `Access` is epoch seconds.
fn client_summary(record: &Record) -> Option<ClientSummary> {
    Some(ClientSummary {
        name: ClientName::from(record.get("client")?),
        owner: record.get("Owner").unwrap_or_default(),
        root: PathBuf::from(record.get("Root").unwrap_or_default()),
        accessed: record.get("Access").as_deref().and_then(parse_spec_date),
    })
}

fn client_to_record(spec: &ClientSpec) -> Record {
    let mut record = Record::new()
        .with("Client", spec.name.as_str())
        .with("Root", spec.root.to_string_lossy().as_bytes())
        .with("Options", spec.options.to_string())
        .with("Type", spec.storage_type.to_string());
    for (key, value) in &spec.extra {
        record.insert(key.clone(), value.as_bytes());
    }
    match &spec.stream {
        Some(stream) => record.insert("Stream", stream.as_bytes()),
        None => {
            for (i, mapping) in spec.view.iter().enumerate() {
                record.insert(format!("View{i}"), mapping.to_string());
            }
        }
    }
    record
}

fn change_from_record(record: &Record) -> ServerResult<ChangeDescription> {
    let change = record
        .get_u64("change")
        .map(ChangeNumber)
        .ok_or_else(|| command_err("describe", "record has no change number"))?;
    let depot_files = record.indexed("depotFile");
    let actions = record.indexed("action");
    let types = record.indexed("type");
    let files = depot_files
        .into_iter()
        .enumerate()
        .map(|(i, depot_path)| ShelvedFile {
            depot_path,
            action: actions
                .get(i)
                .map(|a| a.parse().unwrap_or(FileAction::Edit))
                .unwrap_or(FileAction::Edit),
            file_type: types
                .get(i)
                .map(|t| FileType::parse(t))
                .unwrap_or_else(FileType::text),
        })
        .collect();
    Ok(ChangeDescription {
        change,
        description: record.get("desc").unwrap_or_default(),
        user: record.get("user").unwrap_or_default(),
        client: record.get("client").unwrap_or_default(),
        status: record.get("status").unwrap_or_default(),
        files,
    })
}

fn synced_from_record(record: &Record) -> SyncedFile {
    SyncedFile {
        depot_path: record.get("depotFile").unwrap_or_default(),
        local_path: record.get("clientFile").map(PathBuf::from),
        revision: record.get_u64("rev").and_then(|r| u32::try_from(r).ok()),
        action: record.get("action").unwrap_or_default(),
        file_size: record.get_u64("fileSize"),
        total_file_count: record.get_u64("totalFileCount"),
        total_file_size: record.get_u64("totalFileSize"),
    }
}

impl P4Server for CliServer {
    fn connection(&self) -> &Connection {
        &self.connection
    }

    fn trust(&self, fingerprint: Option<&str>) -> ServerResult<()> {
        if !self.connection.is_ssl() {
            return Ok(());
        }
        match fingerprint {
            Some(fp) => self.run(None, &args(["trust", "-i", fp]), None).map(drop),
            None => {
                warn!(
                    "no trusted fingerprint configured for {}; accepting the server's",
                    self.port_label()
                );
                self.run(None, &args(["trust", "-y"]), None).map(drop)
            }
        }
    }

    fn connect(&self) -> ServerResult<ServerInfo> {
        let records = self.run(None, &args(["info"]), None).map_err(|e| match e {
            ServerError::Command { message, .. } => ServerError::Connection {
                port: self.port_label(),
                message,
            },
            other => other,
        })?;
        let info = records.into_iter().next().unwrap_or_default();
        Ok(ServerInfo {
            address: info.get("serverAddress").unwrap_or_default(),
            version: info.get("serverVersion").unwrap_or_default(),
            user: info.get("userName").unwrap_or_default(),
        })
    }

    fn disconnect(&self) {
        debug!("released connection to {}", self.port_label());
    }

    fn fetch_client(&self, name: &ClientName) -> ServerResult<ClientSpec> {
        let records = self.run(None, &args(["client", "-o", name.as_str()]), None)?;
        let record = records
            .first()
            .ok_or_else(|| command_err("client", format!("no form returned for {name}")))?;
        client_from_record(name, record)
    }

    fn save_client(&self, spec: &ClientSpec) -> ServerResult<()> {
        self.run(None, &args(["client", "-i"]), Some(&client_to_record(spec)))
            .map(drop)
    }

    fn clients(&self) -> ServerResult<Vec<ClientSummary>> {
        let records = self.run(None, &args(["clients"]), None)?;
        Ok(records.iter().filter_map(client_summary).collect())
    }

    fn delete_client(&self, name: &ClientName) -> ServerResult<()> {
        self.run(None, &args(["client", "-d", name.as_str()]), None)
            .map(drop)
    }

    fn revert(&self, client: &ClientName, pattern: &str) -> ServerResult<usize> {
        Ok(self.run(Some(client), &args(["revert", pattern]), None)?.len())
    }

    fn clean(
        &self,
        client: &ClientName,
        paths: &[String],
        include_edited: bool,
    ) -> ServerResult<()> {
        let mut argv = args(["clean", "-a", "-d"]);
        if include_edited {
            argv.push("-e".to_owned());
        }
        argv.extend(paths.iter().cloned());
        self.run(Some(client), &argv, None).map(drop)
    }

    fn sync(
        &self,
        client: &ClientName,
        paths: &[String],
        parallel: usize,
        progress: Progress<'_>,
    ) -> ServerResult<Vec<SyncedFile>> {
        let mut argv = args(["sync"]);
        if parallel > 0 {
            argv.push(format!("--parallel=threads={parallel}"));
        }
        argv.extend(paths.iter().cloned());
        let mut synced = Vec::new();
        self.run_streaming(Some(client), &argv, None, &mut |record| {
            if record.contains("depotFile") {
                let file = synced_from_record(&record);
                progress(&file);
                synced.push(file);
            }
        })?;
        Ok(synced)
    }

    fn flush(&self, client: &ClientName, path_spec: &str) -> ServerResult<()> {
        self.run(Some(client), &args(["flush", "-q", path_spec]), None)
            .map(drop)
    }

    fn changes(&self, query: &ChangesQuery) -> ServerResult<Vec<ChangeDescription>> {
        let mut argv = args(["changes", "-l"]);
        if let Some(max) = query.max {
            argv.push("-m".to_owned());
            argv.push(max.to_string());
        }
        if let Some(status) = query.status {
            argv.push("-s".to_owned());
            argv.push(status.to_string());
        }
        if let Some(client) = &query.client {
            argv.push("-c".to_owned());
            argv.push(client.to_string());
        }
        argv.extend(query.paths.iter().cloned());
        self.run(None, &argv, None)?
            .iter()
            .map(change_from_record)
            .collect()
    }

    fn counter(&self, name: &str) -> ServerResult<String> {
        let records = self.run(None, &args(["counter", name]), None)?;
        Ok(records
            .first()
            .and_then(|r| r.get("value"))
            .unwrap_or_else(|| "0".to_owned()))
    }

    fn label_revision(&self, label: &str) -> ServerResult<Option<String>> {
        let records = self.run(None, &args(["label", "-o", label]), None)?;
        let Some(record) = records.first() else {
            return Ok(None);
        };
        if !record.contains("Update") {
            return Ok(None);
        }
        Ok(record.get("Revision").filter(|r| !r.trim().is_empty()))
    }

    fn describe(&self, change: ChangeNumber, shelved: bool) -> ServerResult<ChangeDescription> {
        let mut argv = args(["describe", "-s"]);
        if shelved {
            argv.push("-S".to_owned());
        }
        argv.push(change.to_string());
        let records = self.run(None, &argv, None)?;
        let record = records
            .first()
            .ok_or_else(|| command_err("describe", format!("Change {change} unknown.")))?;
        change_from_record(record)
    }

    fn print(&self, file_spec: &str) -> ServerResult<Vec<u8>> {
        let mut content = Vec::new();
        self.run_streaming(None, &args(["print", file_spec]), None, &mut |record| {
            if matches!(record.code().as_deref(), Some("text") | Some("binary")) {
                if let Some(data) = record.bytes("data") {
                    content.extend_from_slice(data);
                }
            }
        })?;
        Ok(content)
    }

    fn where_files(
        &self,
        client: &ClientName,
        depot_paths: &[String],
    ) -> ServerResult<Vec<FileMapping>> {
        if depot_paths.is_empty() {
            return Ok(Vec::new());
        }
        let mut argv = args(["where"]);
        argv.extend(depot_paths.iter().cloned());
        Ok(self
            .run(Some(client), &argv, None)?
            .into_iter()
            .filter(|r| !r.contains("unmap"))
            .filter_map(|r| {
                Some(FileMapping {
                    depot_path: r.get("depotFile")?,
                    client_path: r.get("clientFile")?,
                    local_path: PathBuf::from(r.get("path")?),
                })
            })
            .collect())
    }

    fn unshelve(&self, client: &ClientName, change: ChangeNumber) -> ServerResult<()> {
        self.run(Some(client), &args(["unshelve", "-s", change.to_string().as_str()]), None)
            .map(drop)
    }

    fn fetch_change(&self, client: &ClientName) -> ServerResult<PendingChange> {
        let records = self.run(Some(client), &args(["change", "-o"]), None)?;
        let record = records
            .first()
            .ok_or_else(|| command_err("change", "no change form returned"))?;
        Ok(PendingChange {
            change: record.get("Change").and_then(|c| c.parse().ok()),
            client: record
                .get("Client")
                .map(ClientName::from)
                .unwrap_or_else(|| client.clone()),
            description: record.get("Description").unwrap_or_default(),
            files: record.indexed("Files"),
        })
    }

    fn save_change(&self, change: &PendingChange) -> ServerResult<ChangeNumber> {
        let mut record = Record::new()
            .with(
                "Change",
                change
                    .change
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "new".to_owned()),
            )
            .with("Client", change.client.as_str())
            .with("Description", change.description.as_str());
        for (i, file) in change.files.iter().enumerate() {
            record.insert(format!("Files{i}"), file.as_bytes());
        }
        let records = self.run(Some(&change.client), &args(["change", "-i"]), Some(&record))?;
        // "Change 1234 created."
        records
            .iter()
            .filter_map(|r| r.get("data"))
            .find_map(|text| {
                text.split_whitespace()
                    .nth(1)
                    .and_then(|n| n.parse().ok())
                    .map(ChangeNumber)
            })
            .ok_or_else(|| command_err("change", "server did not report the new change number"))
    }

    fn shelve(&self, client: &ClientName, change: ChangeNumber) -> ServerResult<()> {
        self.run(Some(client), &args(["shelve", "-c", change.to_string().as_str()]), None)
            .map(drop)
    }

    fn supports_client_flush(&self, storage_type: StorageType) -> bool {
        storage_type == StorageType::Writeable
    }
}
