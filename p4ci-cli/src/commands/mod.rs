//! Subcommands, and the workspace flags they share.

pub mod describe;
pub mod head;
pub mod hooks;
pub mod maintenance;
pub mod prune;
pub mod shelf;
pub mod sync;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use p4ci_core::{CheckoutConfig, EnvContext};
use p4ci_server::CliServer;
use p4ci_workspace::{Repo, WorkspaceError};

/// Where the workspace lives and how it maps the depot.
///
/// Without `--config` or `--root` the build agent's plugin variables are read.
#[derive(Args, Debug, Default, Clone)]
pub struct WorkspaceArgs {
    /// YAML checkout configuration file.
    #[arg(long, conflicts_with = "root")]
    pub config: Option<PathBuf>,

    /// Workspace root directory.
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// Stream to bind the client to, e.g. `//depot/main`.
    #[arg(long)]
    pub stream: Option<String>,

    /// Client view as depot/client pairs: `--view //depot/dev/... dev/...`.
    #[arg(long, num_args = 1..)]
    pub view: Vec<String>,

    /// Depot pattern to sync; repeatable. Defaults to everything mapped.
    #[arg(long = "sync-path")]
    pub sync_paths: Vec<String>,

    /// Server-side transfer threads.
    #[arg(long)]
    pub parallel: Option<usize>,

    /// Client storage type: writeable, readonly or partitioned.
    #[arg(long)]
    pub client_type: Option<String>,

    /// Client options, e.g. `"allwrite nocompress"`.
    #[arg(long)]
    pub client_options: Option<String>,

    /// Trusted SSL fingerprint; repeatable.
    #[arg(long)]
    pub fingerprint: Vec<String>,

    /// Server address (P4PORT).
    #[arg(long)]
    pub port: Option<String>,

    /// Server user (P4USER).
    #[arg(long)]
    pub user: Option<String>,

    /// The `p4` executable.
    #[arg(long, default_value = "p4")]
    pub p4: PathBuf,
}

impl WorkspaceArgs {
    /// Resolve the checkout configuration: file, flags or plugin variables,
    /// with explicit flags winning.
    pub fn checkout_config(&self, env: &EnvContext) -> Result<CheckoutConfig> {
        let mut config = match (&self.config, &self.root) {
            (Some(path), _) => CheckoutConfig::load(path)
                .with_context(|| format!("failed to load {}", path.display()))?,
            (None, Some(root)) => CheckoutConfig {
                root: root.clone(),
                agent: Some(env.agent_name()),
                connection: env.connection(),
                ..CheckoutConfig::default()
            },
            (None, None) => CheckoutConfig::from_plugin_env(env)
                .context("failed to read the build plugin configuration")?,
        };

        if config.agent.is_none() {
            config.agent = Some(env.agent_name());
        }
        if self.stream.is_some() {
            config.stream = self.stream.clone();
        }
        if !self.view.is_empty() {
            config.view = self.view.clone();
        }
        if !self.sync_paths.is_empty() {
            config.sync = self.sync_paths.clone();
        }
        if let Some(parallel) = self.parallel {
            config.parallel = parallel;
        }
        if let Some(raw) = &self.client_type {
            config.client_type = raw.parse().context("invalid --client-type")?;
        }
        if let Some(options) = &self.client_options {
            config.client_options = options.clone();
        }
        config.fingerprints.extend(self.fingerprint.iter().cloned());

        if config.connection.port.is_none() {
            config.connection.port = env.connection().port;
        }
        if self.port.is_some() {
            config.connection.port = self.port.clone();
        }
        if self.user.is_some() {
            config.connection.user = self.user.clone();
        }
        Ok(config)
    }

    /// Connect to the server and bind the workspace.
    pub fn open(&self, env: &EnvContext) -> Result<Repo<CliServer>> {
        let config = self.checkout_config(env)?;
        let server = CliServer::new(config.connection.clone()).with_program(&self.p4);
        let root = config.root.display().to_string();
        let port = config.connection.port.clone().unwrap_or_else(|| "P4PORT".to_owned());
        Repo::open(server, config).map_err(|e| {
            let reason = match &e {
                WorkspaceError::Server(server) if server.is_communication() => {
                    format!("cannot reach the server at {port}")
                }
                _ => format!("failed to open workspace at {root}"),
            };
            anyhow::Error::new(e).context(reason)
        })
    }
}
