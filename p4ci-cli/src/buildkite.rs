//! Build metadata and job environment through the `buildkite-agent` binary.

use std::path::PathBuf;
use std::process::{Command, Output};

use tracing::debug;

use p4ci_core::EnvContext;
use p4ci_workspace::{BuildMetadata, WorkspaceError};

/// Job variable naming the stream of the build.
pub const STREAM_ENV_VAR: &str = "PERFORCE_PLUGIN_STREAM";
/// Job variable naming the user's shelf, when the branch names one.
pub const SHELF_ENV_VAR: &str = "PERFORCE_PLUGIN_SHELF";

/// `meta-data exists` exit status for a missing key.
const MISSING_KEY_STATUS: i32 = 100;

/// Talks to the agent running the current job.
///
/// Outside a job (no access token) reads find nothing and writes are
/// dropped; `bk local run` cannot store anything either.
pub struct BuildkiteAgent {
    program: PathBuf,
    has_token: bool,
    local_run: bool,
}

impl BuildkiteAgent {
    pub fn new(env: &EnvContext) -> Self {
        Self {
            program: PathBuf::from("buildkite-agent"),
            has_token: env.access_token().is_some(),
            local_run: env.is_local_run(),
        }
    }

    fn can_write(&self) -> bool {
        self.has_token && !self.local_run
    }

    fn run(&self, key: &str, args: &[&str]) -> Result<Output, WorkspaceError> {
        Command::new(&self.program)
            .args(args)
            .output()
            .map_err(|e| WorkspaceError::Metadata {
                key: key.to_owned(),
                message: format!("failed to run {}: {e}", self.program.display()),
            })
    }

    fn exists(&self, key: &str) -> Result<Option<i32>, WorkspaceError> {
        Ok(self.run(key, &["meta-data", "exists", key])?.status.code())
    }

    /// Export `key=value` to the remaining phases of the job.
    pub fn set_env(&self, key: &str, value: &str) -> Result<(), WorkspaceError> {
        if !self.can_write() {
            debug!("not in a build job, {key} stays unset");
            return Ok(());
        }
        let assignment = format!("{key}={value}");
        let output = self.run(key, &["env", "set", &assignment])?;
        check(key, &output)
    }
}

impl BuildMetadata for BuildkiteAgent {
    fn get(&self, key: &str) -> Result<Option<String>, WorkspaceError> {
        if !self.has_token {
            return Ok(None);
        }
        if self.exists(key)? != Some(0) {
            return Ok(None);
        }
        let output = self.run(key, &["meta-data", "get", key])?;
        check(key, &output)?;
        let value = String::from_utf8_lossy(&output.stdout);
        Ok(Some(value.trim_end_matches(['\r', '\n']).to_owned()))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), WorkspaceError> {
        if !self.can_write() {
            debug!("not in a build job, metadata {key} not stored");
            return Ok(());
        }
        if self.exists(key)? != Some(MISSING_KEY_STATUS) {
            debug!("metadata {key} already set");
            return Ok(());
        }
        let output = self.run(key, &["meta-data", "set", key, value])?;
        check(key, &output)
    }
}

fn check(key: &str, output: &Output) -> Result<(), WorkspaceError> {
    if output.status.success() {
        return Ok(());
    }
    Err(WorkspaceError::Metadata {
        key: key.to_owned(),
        message: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outside_a_job_nothing_is_read_or_written() {
        let agent = BuildkiteAgent::new(&EnvContext::default());
        assert_eq!(agent.get("buildkite-perforce-revision").unwrap(), None);
        agent.set("buildkite-perforce-revision", "@1").unwrap();
        agent.set_env(STREAM_ENV_VAR, "//depot/main").unwrap();
    }

    #[test]
    fn local_runs_do_not_write() {
        let env = EnvContext::from_vars([
            ("BUILDKITE_AGENT_ACCESS_TOKEN", "token"),
            ("BUILDKITE_AGENT_NAME", "local"),
        ]);
        let agent = BuildkiteAgent::new(&env);
        assert!(!agent.can_write());
        agent.set("buildkite-perforce-revision", "@1").unwrap();
    }
}
