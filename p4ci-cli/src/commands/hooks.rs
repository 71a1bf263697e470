//! `p4ci checkout` and `p4ci pre-exit`: the build-agent hooks.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use p4ci_core::EnvContext;
use p4ci_workspace::{checkout, format_size};

use crate::buildkite::{BuildkiteAgent, SHELF_ENV_VAR, STREAM_ENV_VAR};
use crate::commands::WorkspaceArgs;

/// Arguments for `p4ci checkout`.
#[derive(Args, Debug)]
pub struct CheckoutArgs {
    #[command(flatten)]
    pub workspace: WorkspaceArgs,
}

impl CheckoutArgs {
    pub fn run(self) -> Result<()> {
        let env = EnvContext::from_process();
        let agent = BuildkiteAgent::new(&env);

        let branch = env.stream_and_shelf();
        if !branch.stream.is_empty() {
            agent
                .set_env(STREAM_ENV_VAR, &branch.stream)
                .context("failed to export the build stream")?;
        }
        if let Some(shelf) = branch.shelf {
            agent
                .set_env(SHELF_ENV_VAR, &shelf.to_string())
                .context("failed to export the build shelf")?;
        }

        let mut repo = self.workspace.open(&env)?;
        let outcome = checkout(&mut repo, &env, &agent).context("checkout failed")?;

        println!(
            "{} {} at {} ({} files, {})",
            "✓".green(),
            repo.client_name(),
            outcome.revision,
            outcome.sync.files_count,
            format_size(outcome.sync.total_bytes)
        );
        if let (Some((user, backup)), Some(report)) = (outcome.shelf, &outcome.materialized) {
            println!(
                "{} applied shelf {user} (backup {backup}): {} files written, {} outside the sync scope",
                "✓".green(),
                report.touched.len(),
                report.skipped
            );
        }
        Ok(())
    }
}

/// Arguments for `p4ci pre-exit`.
#[derive(Args, Debug)]
pub struct PreExitArgs {
    #[command(flatten)]
    pub workspace: WorkspaceArgs,
}

impl PreExitArgs {
    pub fn run(self) -> Result<()> {
        let env = EnvContext::from_process();
        let mut repo = self.workspace.open(&env)?;
        repo.revert().context("revert failed")?;
        Ok(())
    }
}
