//! Checkout configuration and the environment it is read from.
//!
//! Configuration reaches the engine either from the build agent's plugin
//! variables ([`CheckoutConfig::from_plugin_env`]) or from a YAML file
//! ([`CheckoutConfig::load`]). Environment access always goes through an
//! explicit [`EnvContext`] so tests never touch the process environment.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::identity;
use crate::types::{ChangeNumber, ClientOptions, Connection, StorageType, ViewMapping};
use crate::view;

/// Plugin variable prefix set by the build agent.
pub const PLUGIN_PREFIX: &str = "BUILDKITE_PLUGIN_PERFORCE_";

/// Default view when neither a stream nor a view is configured.
pub const DEFAULT_VIEW: &str = "//... ...";

/// Default sync scope: everything the client maps.
pub const DEFAULT_SYNC: &str = "//...";

/// Default number of concurrent content fetches during shelf materialization.
pub const DEFAULT_SHELF_WORKERS: usize = 16;

// ---------------------------------------------------------------------------
// Environment context
// ---------------------------------------------------------------------------

/// Snapshot of the variables the tool reads, plus the build-agent facts
/// derived from them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvContext {
    vars: BTreeMap<String, String>,
}

impl EnvContext {
    /// Snapshot the current process environment.
    pub fn from_process() -> Self {
        Self {
            vars: std::env::vars().collect(),
        }
    }

    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: vars
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Value of `key`; empty values read as absent.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    fn plugin(&self, name: &str) -> Option<&str> {
        self.get(&format!("{PLUGIN_PREFIX}{name}"))
    }

    /// Token that lets us talk to the build agent. Absent outside a build.
    pub fn access_token(&self) -> Option<&str> {
        self.get("BUILDKITE_AGENT_ACCESS_TOKEN")
    }

    /// `bk local run` names its agent `local`.
    pub fn is_local_run(&self) -> bool {
        self.get("BUILDKITE_AGENT_NAME") == Some("local")
    }

    /// Build agent name, falling back to the host name.
    pub fn agent_name(&self) -> String {
        ["BUILDKITE_AGENT_NAME", "HOSTNAME", "COMPUTERNAME"]
            .iter()
            .find_map(|var| self.get(var))
            .map(|name| name.trim().to_owned())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(identity::host_name)
    }

    /// Read a list from either `VAR` or `VAR_0`, `VAR_1`, ...
    pub fn list(&self, var: &str) -> Vec<String> {
        if let Some(single) = self.get(var) {
            return vec![single.to_owned()];
        }
        (0..)
            .map(|i| self.get(&format!("{var}_{i}")))
            .take_while(Option::is_some)
            .flatten()
            .map(str::to_owned)
            .collect()
    }

    /// Server connection parameters, honouring plugin overrides.
    pub fn connection(&self) -> Connection {
        let port = self
            .plugin("P4PORT")
            .or_else(|| self.get("P4PORT"))
            .or_else(|| self.get("BUILDKITE_REPO"))
            .map(str::to_owned);
        let user = self
            .plugin("P4USER")
            .or_else(|| self.get("P4USER"))
            .map(str::to_owned);
        let mut env = BTreeMap::new();
        for var in ["P4TICKETS", "P4TRUST"] {
            if let Some(value) = self.plugin(var).or_else(|| self.get(var)) {
                env.insert(var.to_owned(), value.to_owned());
            }
        }
        Connection { port, user, env }
    }

    /// Stream and optional shelf encoded in the build branch.
    pub fn stream_and_shelf(&self) -> StreamAndShelf {
        StreamAndShelf::parse_branch(self.get("BUILDKITE_BRANCH").unwrap_or(""))
    }
}

// ---------------------------------------------------------------------------
// Branch parsing
// ---------------------------------------------------------------------------

/// `<depot>/<stream>[!<shelf>]`, the branch naming convention for builds.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamAndShelf {
    /// `//<depot>/<stream>`, empty when the branch is not a stream name.
    pub stream: String,
    pub shelf: Option<ChangeNumber>,
}

impl StreamAndShelf {
    pub fn parse_branch(branch: &str) -> Self {
        fn segment(s: &str) -> usize {
            s.find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '-'))
                .unwrap_or(s.len())
        }

        let depot_len = segment(branch);
        let Some(after_slash) = branch[depot_len..].strip_prefix('/') else {
            return Self::default();
        };
        let stream_len = segment(after_slash);
        if depot_len == 0 || stream_len == 0 {
            return Self::default();
        }
        let stream = format!("//{}/{}", &branch[..depot_len], &after_slash[..stream_len]);

        let shelf = after_slash[stream_len..].strip_prefix('!').and_then(|rest| {
            let digits = &rest[..rest
                .find(|c: char| !c.is_ascii_digit())
                .unwrap_or(rest.len())];
            digits.parse().ok().map(ChangeNumber)
        });
        Self { stream, shelf }
    }
}

// ---------------------------------------------------------------------------
// Checkout configuration
// ---------------------------------------------------------------------------

/// Everything needed to bind, reconcile and sync one workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckoutConfig {
    /// Workspace root directory.
    pub root: PathBuf,
    /// Flat `depot client depot client ...` tokens. Empty means the default
    /// view unless a stream is set.
    pub view: Vec<String>,
    pub stream: Option<String>,
    /// Depot patterns to sync, each suffixed with the revision on sync.
    pub sync: Vec<String>,
    /// Server-side transfer threads; 0 leaves the server default.
    pub parallel: usize,
    pub client_options: String,
    pub client_type: StorageType,
    /// Trusted server fingerprints for `ssl` ports.
    pub fingerprints: Vec<String>,
    /// Concurrent content fetches when materializing a shelf.
    pub shelf_workers: usize,
    /// Agent name used in the client identity; host name when absent.
    pub agent: Option<String>,
    pub connection: Connection,
}

impl Default for CheckoutConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::new(),
            view: Vec::new(),
            stream: None,
            sync: Vec::new(),
            parallel: 0,
            client_options: String::new(),
            client_type: StorageType::default(),
            fingerprints: Vec::new(),
            shelf_workers: DEFAULT_SHELF_WORKERS,
            agent: None,
            connection: Connection::default(),
        }
    }
}

impl CheckoutConfig {
    /// Load a YAML configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Build the configuration from the build agent's plugin variables.
    pub fn from_plugin_env(env: &EnvContext) -> Result<Self, ConfigError> {
        let stream = Some(env.stream_and_shelf().stream).filter(|s| !s.is_empty());
        let substitute = |entry: String| match &stream {
            Some(s) => entry.replace("<stream>", s),
            None => entry,
        };

        let custom_root = env.plugin("ROOT");
        if custom_root.is_some() && !env.is_local_run() {
            return Err(ConfigError::CustomRootOutsideLocalRun);
        }
        let root = custom_root
            .or_else(|| env.get("BUILDKITE_BUILD_CHECKOUT_PATH"))
            .map(PathBuf::from)
            .ok_or(ConfigError::MissingRoot)?;

        let parallel = match env.plugin("PARALLEL") {
            Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: format!("{PLUGIN_PREFIX}PARALLEL"),
                value: raw.to_owned(),
            })?,
            None => 0,
        };

        let sync = env
            .list(&format!("{PLUGIN_PREFIX}SYNC"))
            .into_iter()
            .map(substitute)
            .collect();

        let config = Self {
            root,
            view: env
                .plugin("VIEW")
                .map(|v| v.split_whitespace().map(str::to_owned).collect())
                .unwrap_or_default(),
            stream,
            sync,
            parallel,
            client_options: env.plugin("CLIENT_OPTIONS").unwrap_or("").to_owned(),
            client_type: env.plugin("CLIENT_TYPE").unwrap_or("").parse()?,
            fingerprints: env.list(&format!("{PLUGIN_PREFIX}FINGERPRINT")),
            shelf_workers: DEFAULT_SHELF_WORKERS,
            agent: Some(env.agent_name()),
            connection: env.connection(),
        };
        config.view_mappings()?;
        Ok(config)
    }

    /// Raw (not yet localized) view mappings. Validates the token list and
    /// the stream/view exclusivity; empty for stream clients.
    pub fn view_mappings(&self) -> Result<Vec<ViewMapping>, ConfigError> {
        match (&self.stream, self.view.is_empty()) {
            (Some(stream), false) => Err(ConfigError::StreamAndView {
                stream: stream.clone(),
            }),
            (Some(_), true) => Ok(Vec::new()),
            (None, true) => view::parse_view_string(DEFAULT_VIEW),
            (None, false) => view::pair_tokens(&self.view),
        }
    }

    pub fn sync_paths(&self) -> Vec<String> {
        if self.sync.is_empty() {
            vec![DEFAULT_SYNC.to_owned()]
        } else {
            self.sync.clone()
        }
    }

    pub fn options(&self) -> ClientOptions {
        ClientOptions::with_clobber(&self.client_options)
    }

    /// Root made absolute against the current directory.
    pub fn absolute_root(&self) -> Result<PathBuf, ConfigError> {
        if self.root.as_os_str().is_empty() {
            return Err(ConfigError::MissingRoot);
        }
        if self.root.is_absolute() {
            return Ok(self.root.clone());
        }
        let cwd = std::env::current_dir().map_err(|source| ConfigError::Io {
            path: self.root.clone(),
            source,
        })?;
        Ok(cwd.join(&self.root))
    }

    pub fn agent_name(&self) -> String {
        self.agent.clone().unwrap_or_else(identity::host_name)
    }
}
