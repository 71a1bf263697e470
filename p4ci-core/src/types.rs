//! Domain types for workspace management.
//!
//! Path fields that name local files use `PathBuf`; depot and client-syntax
//! paths (`//depot/...`, `//client/...`) stay as `String` because they are
//! server identifiers, not filesystem locations.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Name of a server-side client workspace record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientName(pub String);

impl ClientName {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `//<client>/...`, the pattern covering every file the client maps.
    pub fn all_files(&self) -> String {
        format!("//{}/...", self.0)
    }
}

impl fmt::Display for ClientName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for ClientName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ClientName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// A pending, shelved or submitted change number.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ChangeNumber(pub u64);

impl fmt::Display for ChangeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ChangeNumber {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().trim_start_matches('@').parse().map(Self)
    }
}

impl From<u64> for ChangeNumber {
    fn from(n: u64) -> Self {
        Self(n)
    }
}

// ---------------------------------------------------------------------------
// Client record
// ---------------------------------------------------------------------------

/// Storage type of a client record. Fixed once the record exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    #[default]
    Writeable,
    Readonly,
    Partitioned,
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageType::Writeable => write!(f, "writeable"),
            StorageType::Readonly => write!(f, "readonly"),
            StorageType::Partitioned => write!(f, "partitioned"),
        }
    }
}

impl FromStr for StorageType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "writeable" => Ok(Self::Writeable),
            "readonly" => Ok(Self::Readonly),
            "partitioned" => Ok(Self::Partitioned),
            other => Err(ConfigError::UnknownStorageType(other.to_owned())),
        }
    }
}

/// Option flags of a client record, kept in caller order.
///
/// Built through [`ClientOptions::with_clobber`] so that writeable-but-unopened
/// files left behind by interrupted syncs are always overwritten.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClientOptions(pub Vec<String>);

impl ClientOptions {
    /// Parse whitespace-separated option tokens, replacing `noclobber` with
    /// `clobber`.
    pub fn with_clobber(raw: &str) -> Self {
        let mut tokens: Vec<String> = raw
            .split_whitespace()
            .filter(|t| *t != "noclobber" && *t != "clobber")
            .map(str::to_owned)
            .collect();
        tokens.push("clobber".to_owned());
        Self(tokens)
    }

    pub fn contains(&self, token: &str) -> bool {
        self.0.iter().any(|t| t == token)
    }
}

impl fmt::Display for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(" "))
    }
}

/// One `depot-path client-path` line of a client view.
///
/// A depot path starting with `-` excludes the matched files, `+` overlays them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ViewMapping {
    pub depot: String,
    pub client: String,
}

impl ViewMapping {
    pub fn new(depot: impl Into<String>, client: impl Into<String>) -> Self {
        Self {
            depot: depot.into(),
            client: client.into(),
        }
    }

    /// Parse a view line, honouring double-quoted paths containing spaces.
    pub fn parse(line: &str) -> Result<Self, ConfigError> {
        let tokens = split_quoted(line);
        match tokens.as_slice() {
            [depot, client] => Ok(Self::new(depot.clone(), client.clone())),
            _ => Err(ConfigError::InvalidMapping {
                line: line.to_owned(),
            }),
        }
    }

    pub fn is_exclusion(&self) -> bool {
        self.depot.starts_with('-')
    }

    /// Depot pattern without the exclusion/overlay marker.
    pub fn depot_pattern(&self) -> &str {
        self.depot.trim_start_matches(['-', '+'])
    }
}

impl fmt::Display for ViewMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", quote(&self.depot), quote(&self.client))
    }
}

fn quote(path: &str) -> String {
    if path.contains(char::is_whitespace) {
        format!("\"{path}\"")
    } else {
        path.to_owned()
    }
}

fn split_quoted(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for c in line.trim().chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Server-side client workspace record.
///
/// Fetched, mutated field by field and handed back to the server's save call.
/// Fields the engine never touches (owner, host, description, line endings...)
/// ride along in `extra` so a save does not reset them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSpec {
    pub name: ClientName,
    pub root: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<String>,
    #[serde(default)]
    pub view: Vec<ViewMapping>,
    #[serde(default)]
    pub storage_type: StorageType,
    #[serde(default)]
    pub options: ClientOptions,
    /// Last time the record was updated on the server. `None` for a record
    /// that has never been saved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

impl ClientSpec {
    /// Default record for a client the server has never seen.
    pub fn new(name: ClientName, root: PathBuf) -> Self {
        Self {
            name,
            root,
            stream: None,
            view: Vec::new(),
            storage_type: StorageType::default(),
            options: ClientOptions::default(),
            updated_at: None,
            extra: BTreeMap::new(),
        }
    }

    /// Whether the server has any record of this client being saved before.
    pub fn exists_on_server(&self) -> bool {
        self.updated_at.is_some()
    }
}

/// Connection parameters for the server.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Connection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Extra `P4*` variables handed to the server backend (tickets, trust file).
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Connection {
    pub fn is_ssl(&self) -> bool {
        self.port
            .as_deref()
            .map(|p| p.starts_with("ssl"))
            .unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Files and changes
// ---------------------------------------------------------------------------

/// What a change does to a file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileAction {
    Add,
    Edit,
    Delete,
    Branch,
    Integrate,
    MoveAdd,
    MoveDelete,
    Import,
    Purge,
    Archive,
    Other(String),
}

impl FileAction {
    /// Actions after which the file no longer exists in the workspace.
    pub fn removes_file(&self) -> bool {
        matches!(
            self,
            FileAction::Delete | FileAction::MoveDelete | FileAction::Purge | FileAction::Archive
        )
    }
}

impl FromStr for FileAction {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "add" => Self::Add,
            "edit" => Self::Edit,
            "delete" => Self::Delete,
            "branch" => Self::Branch,
            "integrate" => Self::Integrate,
            "move/add" => Self::MoveAdd,
            "move/delete" => Self::MoveDelete,
            "import" => Self::Import,
            "purge" => Self::Purge,
            "archive" => Self::Archive,
            other => Self::Other(other.to_owned()),
        })
    }
}

impl fmt::Display for FileAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Add => "add",
            Self::Edit => "edit",
            Self::Delete => "delete",
            Self::Branch => "branch",
            Self::Integrate => "integrate",
            Self::MoveAdd => "move/add",
            Self::MoveDelete => "move/delete",
            Self::Import => "import",
            Self::Purge => "purge",
            Self::Archive => "archive",
            Self::Other(other) => other,
        };
        f.write_str(s)
    }
}

/// A file type such as `text`, `binary+l` or `xtext`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileType {
    pub base: String,
    pub modifiers: String,
}

impl FileType {
    pub fn parse(raw: &str) -> Self {
        match raw.split_once('+') {
            Some((base, modifiers)) => Self {
                base: base.to_owned(),
                modifiers: modifiers.to_owned(),
            },
            None => Self {
                base: raw.to_owned(),
                modifiers: String::new(),
            },
        }
    }

    pub fn text() -> Self {
        Self::parse("text")
    }

    /// `+l`: only one workspace may have the file open at a time.
    pub fn is_exclusive(&self) -> bool {
        self.modifiers.contains('l')
    }

    pub fn is_binary(&self) -> bool {
        self.base.contains("binary") || self.base == "apple" || self.base == "resource"
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.modifiers.is_empty() {
            f.write_str(&self.base)
        } else {
            write!(f, "{}+{}", self.base, self.modifiers)
        }
    }
}

/// One file of a shelved change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShelvedFile {
    pub depot_path: String,
    pub action: FileAction,
    pub file_type: FileType,
}

/// A change as reported by `describe`. `files` holds the shelved files when
/// described with the shelved flag, the submitted files otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeDescription {
    pub change: ChangeNumber,
    pub description: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub client: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub files: Vec<ShelvedFile>,
}

impl ChangeDescription {
    pub fn exclusive_files(&self) -> Vec<&ShelvedFile> {
        self.files
            .iter()
            .filter(|f| f.file_type.is_exclusive())
            .collect()
    }
}

/// Status filter for change history queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeStatus {
    Pending,
    Shelved,
    Submitted,
}

impl fmt::Display for ChangeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeStatus::Pending => write!(f, "pending"),
            ChangeStatus::Shelved => write!(f, "shelved"),
            ChangeStatus::Submitted => write!(f, "submitted"),
        }
    }
}

/// Pending change form, as fetched for the default change and saved back
/// under a new number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingChange {
    /// `None` for the default change.
    pub change: Option<ChangeNumber>,
    pub client: ClientName,
    pub description: String,
    #[serde(default)]
    pub files: Vec<String>,
}

/// Per-file record returned by a sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncedFile {
    pub depot_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<u32>,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    /// Totals the server reports on the first record of a sync, when it does.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_file_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_file_size: Option<u64>,
}

// ---------------------------------------------------------------------------
// Revision specifiers
// ---------------------------------------------------------------------------

/// A revision suffix appended to depot path patterns: empty for "latest",
/// `@123`, `@label`, `@2024/01/31`, `@client`, `#head`...
///
/// Treated as opaque everywhere except the few helpers below.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct RevisionSpec(String);

impl RevisionSpec {
    pub fn new(spec: impl Into<String>) -> Self {
        Self(spec.into())
    }

    /// No constraint: sync everything at latest.
    pub fn latest() -> Self {
        Self(String::new())
    }

    pub fn at_change(change: ChangeNumber) -> Self {
        Self(format!("@{change}"))
    }

    pub fn is_latest(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_suffix(&self) -> &str {
        &self.0
    }

    /// `@N` → `N`.
    pub fn change(&self) -> Option<ChangeNumber> {
        let rest = self.0.strip_prefix('@')?;
        if !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()) {
            rest.parse().ok().map(ChangeNumber)
        } else {
            None
        }
    }

    /// `@name` where name is neither a change number nor a date.
    ///
    /// The same syntax also names client workspaces; callers resolving a
    /// label must tolerate the server reporting no such label.
    pub fn label(&self) -> Option<&str> {
        let rest = self.0.strip_prefix('@')?;
        let is_label = !rest.is_empty()
            && !rest.bytes().all(|b| b.is_ascii_digit())
            && !rest.contains(['/', ':', '=', '<', '>', ','])
            && rest != "now";
        is_label.then_some(rest)
    }

    /// Convert a build-supplied revision into a concrete specifier.
    ///
    /// Bare digits become `@N`; `@`/`#` prefixed values pass through. Anything
    /// else (`HEAD`, a git sha, an empty string) has no concrete revision.
    pub fn from_build_revision(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit()) {
            return Some(Self(format!("@{raw}")));
        }
        if raw.starts_with('@') || raw.starts_with('#') {
            return Some(Self(raw.to_owned()));
        }
        None
    }
}

impl fmt::Display for RevisionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("#head")
        } else {
            f.write_str(&self.0)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn newtype_display() {
        assert_eq!(ClientName::from("bk-p4-a").to_string(), "bk-p4-a");
        assert_eq!(ChangeNumber(42).to_string(), "42");
        assert_eq!(ClientName::from("ws").all_files(), "//ws/...");
    }

    #[test]
    fn change_number_accepts_at_prefix() {
        assert_eq!("@17".parse::<ChangeNumber>().unwrap(), ChangeNumber(17));
        assert!("@label".parse::<ChangeNumber>().is_err());
    }

    #[test]
    fn options_always_clobber() {
        let opts = ClientOptions::with_clobber("allwrite noclobber rmdir");
        assert_eq!(opts.to_string(), "allwrite rmdir clobber");
        assert!(!opts.contains("noclobber"));
        assert_eq!(ClientOptions::with_clobber("").to_string(), "clobber");
        assert_eq!(ClientOptions::with_clobber("clobber").to_string(), "clobber");
    }

    #[rstest]
    #[case("writeable", StorageType::Writeable)]
    #[case("", StorageType::Writeable)]
    #[case("READONLY", StorageType::Readonly)]
    #[case("partitioned", StorageType::Partitioned)]
    fn storage_type_parse(#[case] raw: &str, #[case] expected: StorageType) {
        assert_eq!(raw.parse::<StorageType>().unwrap(), expected);
    }

    #[test]
    fn storage_type_rejects_unknown() {
        assert!(matches!(
            "graph".parse::<StorageType>(),
            Err(ConfigError::UnknownStorageType(_))
        ));
    }

    #[test]
    fn view_mapping_parses_quoted_paths() {
        let m = ViewMapping::parse(r#""//depot/my dir/..." "//ws/my dir/...""#).unwrap();
        assert_eq!(m.depot, "//depot/my dir/...");
        assert_eq!(m.client, "//ws/my dir/...");
        assert_eq!(m.to_string(), r#""//depot/my dir/..." "//ws/my dir/...""#);
        assert!(ViewMapping::parse("//depot/...").is_err());
    }

    #[test]
    fn exclusion_mapping() {
        let m = ViewMapping::parse("-//depot/secret/... //ws/secret/...").unwrap();
        assert!(m.is_exclusion());
        assert_eq!(m.depot_pattern(), "//depot/secret/...");
    }

    #[rstest]
    #[case("text", false, false)]
    #[case("binary+l", true, true)]
    #[case("text+kl", false, true)]
    #[case("ubinary", true, false)]
    #[case("xtext", false, false)]
    fn file_type_flags(#[case] raw: &str, #[case] binary: bool, #[case] exclusive: bool) {
        let ft = FileType::parse(raw);
        assert_eq!(ft.is_binary(), binary);
        assert_eq!(ft.is_exclusive(), exclusive);
        assert_eq!(ft.to_string(), raw);
    }

    #[test]
    fn file_action_roundtrip_and_removal() {
        let action: FileAction = "move/delete".parse().unwrap();
        assert_eq!(action, FileAction::MoveDelete);
        assert!(action.removes_file());
        assert!(!FileAction::Edit.removes_file());
        assert_eq!(FileAction::MoveAdd.to_string(), "move/add");
    }

    #[rstest]
    #[case("123", Some("@123"))]
    #[case("@123", Some("@123"))]
    #[case("#head", Some("#head"))]
    #[case("@my-label", Some("@my-label"))]
    #[case("HEAD", None)]
    #[case("0a1b2c3d", None)]
    #[case("", None)]
    fn build_revision(#[case] raw: &str, #[case] expected: Option<&str>) {
        assert_eq!(
            RevisionSpec::from_build_revision(raw).map(|r| r.as_suffix().to_owned()),
            expected.map(str::to_owned)
        );
    }

    #[test]
    fn revision_helpers() {
        assert_eq!(RevisionSpec::new("@42").change(), Some(ChangeNumber(42)));
        assert_eq!(RevisionSpec::new("@release-1").label(), Some("release-1"));
        assert_eq!(RevisionSpec::new("@2024/01/31").label(), None);
        assert_eq!(RevisionSpec::new("@42").label(), None);
        assert_eq!(RevisionSpec::new("#head").label(), None);
        assert!(RevisionSpec::latest().is_latest());
        assert_eq!(RevisionSpec::latest().to_string(), "#head");
    }

    #[test]
    fn new_client_spec_has_no_server_history() {
        let spec = ClientSpec::new(ClientName::from("ws"), PathBuf::from("/ws"));
        assert!(!spec.exists_on_server());
    }

    #[test]
    fn exclusive_files_are_reported() {
        let desc = ChangeDescription {
            change: ChangeNumber(5),
            description: "wip".into(),
            user: "dev".into(),
            client: "dev-ws".into(),
            status: "pending".into(),
            files: vec![
                ShelvedFile {
                    depot_path: "//depot/a.txt".into(),
                    action: FileAction::Edit,
                    file_type: FileType::text(),
                },
                ShelvedFile {
                    depot_path: "//depot/b.bin".into(),
                    action: FileAction::Edit,
                    file_type: FileType::parse("binary+l"),
                },
            ],
        };
        let locked = desc.exclusive_files();
        assert_eq!(locked.len(), 1);
        assert_eq!(locked[0].depot_path, "//depot/b.bin");
    }
}
