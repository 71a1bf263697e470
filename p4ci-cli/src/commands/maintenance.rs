//! `p4ci revert` and `p4ci clean`.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use p4ci_core::EnvContext;

use crate::commands::WorkspaceArgs;

/// Arguments for `p4ci revert`.
#[derive(Args, Debug)]
pub struct RevertArgs {
    #[command(flatten)]
    pub workspace: WorkspaceArgs,
}

impl RevertArgs {
    pub fn run(self) -> Result<()> {
        let env = EnvContext::from_process();
        let mut repo = self.workspace.open(&env)?;
        repo.revert().context("revert failed")?;
        println!("{} reverted {}", "✓".green(), repo.client_name());
        Ok(())
    }
}

/// Arguments for `p4ci clean`.
#[derive(Args, Debug)]
pub struct CleanArgs {
    #[command(flatten)]
    pub workspace: WorkspaceArgs,
}

impl CleanArgs {
    pub fn run(self) -> Result<()> {
        let env = EnvContext::from_process();
        let mut repo = self.workspace.open(&env)?;
        repo.clean().context("clean failed")?;
        println!("{} cleaned {}", "✓".green(), repo.client_name());
        Ok(())
    }
}
