//! `p4ci unshelve`, `p4ci materialize` and `p4ci backup`.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use p4ci_core::{ChangeNumber, EnvContext};

use crate::commands::WorkspaceArgs;

/// Arguments shared by the shelf commands.
#[derive(Args, Debug)]
pub struct ShelfArgs {
    #[command(flatten)]
    pub workspace: WorkspaceArgs,

    /// Shelved change number.
    pub change: ChangeNumber,
}

#[derive(Debug, Clone, Copy)]
pub enum ShelfOperation {
    Unshelve,
    Materialize,
    Backup,
}

impl ShelfArgs {
    pub fn run(self, operation: ShelfOperation) -> Result<()> {
        let env = EnvContext::from_process();
        let mut repo = self.workspace.open(&env)?;
        let change = self.change;

        match operation {
            ShelfOperation::Unshelve => {
                repo.unshelve(change)
                    .with_context(|| format!("failed to unshelve {change}"))?;
                println!("{} opened shelf {change} in {}", "✓".green(), repo.client_name());
            }
            ShelfOperation::Materialize => {
                let report = repo
                    .materialize_shelf(change)
                    .with_context(|| format!("failed to apply shelf {change}"))?;
                println!(
                    "{} wrote {} of {} shelved files from {change}",
                    "✓".green(),
                    report.touched.len(),
                    report.shelved
                );
                if report.skipped > 0 {
                    println!(
                        "  {} files are outside the sync scope",
                        report.skipped.to_string().yellow()
                    );
                }
            }
            ShelfOperation::Backup => {
                let backup = repo
                    .backup_shelf(change)
                    .with_context(|| format!("failed to back up shelf {change}"))?;
                println!("{backup}");
            }
        }
        Ok(())
    }
}
