//! `p4ci head`: resolve the head revision of the workspace view.

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;

use p4ci_core::{EnvContext, RevisionSpec};

use crate::commands::WorkspaceArgs;

/// Arguments for `p4ci head`.
#[derive(Args, Debug)]
pub struct HeadArgs {
    #[command(flatten)]
    pub workspace: WorkspaceArgs,

    /// Resolve the latest change at this revision instead, e.g. `@release`.
    #[arg(long)]
    pub at: Option<String>,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Serialize)]
struct HeadJson {
    client: String,
    revision: String,
    change: Option<u64>,
}

impl HeadArgs {
    pub fn run(self) -> Result<()> {
        let env = EnvContext::from_process();
        let repo = self.workspace.open(&env)?;

        let (revision, change) = match &self.at {
            Some(raw) => {
                let revision = RevisionSpec::new(raw.clone());
                let change = repo
                    .head_at_revision(&revision)
                    .with_context(|| format!("failed to resolve {revision}"))?;
                (revision, change)
            }
            None => {
                let revision = repo.head().context("failed to resolve head")?;
                let change = revision.change();
                (revision, change)
            }
        };

        if self.json {
            let json = HeadJson {
                client: repo.client_name().to_string(),
                revision: revision.to_string(),
                change: change.map(|c| c.0),
            };
            println!("{}", serde_json::to_string_pretty(&json)?);
            return Ok(());
        }
        match change {
            Some(change) => println!("{change}"),
            None => println!("{revision}"),
        }
        Ok(())
    }
}
