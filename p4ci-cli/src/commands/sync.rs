//! `p4ci sync`: sync the workspace to a revision.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use p4ci_core::{EnvContext, RevisionSpec};
use p4ci_workspace::format_size;

use crate::commands::WorkspaceArgs;

/// Arguments for `p4ci sync`.
#[derive(Args, Debug)]
pub struct SyncArgs {
    #[command(flatten)]
    pub workspace: WorkspaceArgs,

    /// Revision to sync: `123`, `@123`, `@label`, `#head`... Head of the view
    /// when omitted.
    #[arg(long)]
    pub revision: Option<String>,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

impl SyncArgs {
    pub fn run(self) -> Result<()> {
        let env = EnvContext::from_process();
        let mut repo = self.workspace.open(&env)?;

        let revision = match &self.revision {
            Some(raw) => RevisionSpec::from_build_revision(raw)
                .with_context(|| format!("'{raw}' is not a revision specifier"))?,
            None => repo.head().context("failed to resolve head")?,
        };
        let result = repo
            .sync(&revision)
            .with_context(|| format!("sync to {revision} failed"))?;

        if self.json {
            println!("{}", serde_json::to_string_pretty(&result)?);
            return Ok(());
        }
        if result.files_count == 0 {
            println!("{} {} already at {revision}", "✓".green(), repo.client_name());
        } else {
            println!(
                "{} {} synced to {revision}: {} files ({})",
                "✓".green(),
                repo.client_name(),
                result.files_count,
                format_size(result.total_bytes)
            );
        }
        Ok(())
    }
}
