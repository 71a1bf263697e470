//! `p4ci describe <change>`: show a change and its files.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use p4ci_core::{ChangeNumber, EnvContext};
use p4ci_server::P4Server;

use crate::commands::WorkspaceArgs;

/// Arguments for `p4ci describe`.
#[derive(Args, Debug)]
pub struct DescribeArgs {
    #[command(flatten)]
    pub workspace: WorkspaceArgs,

    /// Change number.
    pub change: ChangeNumber,

    /// List the shelved files instead of the submitted ones.
    #[arg(long)]
    pub shelved: bool,
}

#[derive(Tabled)]
struct FileRow {
    #[tabled(rename = "file")]
    depot_path: String,
    #[tabled(rename = "action")]
    action: String,
    #[tabled(rename = "type")]
    file_type: String,
}

impl DescribeArgs {
    pub fn run(self) -> Result<()> {
        let env = EnvContext::from_process();
        let repo = self.workspace.open(&env)?;

        let described = repo
            .server()
            .describe(self.change, self.shelved)
            .with_context(|| format!("failed to describe change {}", self.change))?;

        println!(
            "{} {} by {}@{} ({})",
            "Change".bold(),
            described.change,
            described.user,
            described.client,
            described.status
        );
        println!();
        for line in described.description.lines() {
            println!("    {line}");
        }
        if described.files.is_empty() {
            return Ok(());
        }

        let rows: Vec<FileRow> = described
            .files
            .iter()
            .map(|f| FileRow {
                depot_path: f.depot_path.clone(),
                action: f.action.to_string(),
                file_type: if f.file_type.is_exclusive() {
                    f.file_type.to_string().yellow().to_string()
                } else {
                    f.file_type.to_string()
                },
            })
            .collect();
        println!();
        println!("{}", Table::new(rows).with(Style::rounded()));
        Ok(())
    }
}
