//! `p4ci prune`: delete build-agent clients that have not been used recently.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use clap::Args;
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use p4ci_core::EnvContext;
use p4ci_server::{CliServer, ClientSummary, P4Server};
use p4ci_workspace::{connect, delete_clients, idle_clients};

/// Arguments for `p4ci prune`.
#[derive(Args, Debug)]
pub struct PruneArgs {
    /// Delete clients last used more than this many days ago.
    #[arg(long, default_value_t = 30)]
    pub days: u32,

    /// Delete without asking for confirmation.
    #[arg(long, short = 'y', conflicts_with = "dry_run")]
    pub yes: bool,

    /// Only list the clients that would be deleted.
    #[arg(long)]
    pub dry_run: bool,

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

#[derive(Tabled)]
struct ClientRow {
    client: String,
    owner: String,
    root: String,
    #[tabled(rename = "last used")]
    last_used: String,
}

impl From<&ClientSummary> for ClientRow {
    fn from(c: &ClientSummary) -> Self {
        Self {
            client: c.name.to_string(),
            owner: c.owner.clone(),
            root: c.root.display().to_string(),
            last_used: c
                .accessed
                .map(|at| format!("{} days ago", (Utc::now() - at).num_days()))
                .unwrap_or_else(|| "never".to_owned()),
        }
    }
}

impl PruneArgs {
    pub fn run(self) -> Result<()> {
        let env = EnvContext::from_process();
        let mut connection = env.connection();
        if self.port.is_some() {
            connection.port = self.port.clone();
        }
        if self.user.is_some() {
            connection.user = self.user.clone();
        }
        let port = connection.port.clone().unwrap_or_else(|| "P4PORT".to_owned());
        let server = CliServer::new(connection).with_program(&self.p4);
        connect(&server, &self.fingerprint)
            .with_context(|| format!("cannot reach the server at {port}"))?;

        let result = self.prune(&server);
        server.disconnect();
        result
    }

    fn prune(&self, server: &CliServer) -> Result<()> {
        let plan = idle_clients(server, Duration::days(i64::from(self.days)), Utc::now())
            .context("failed to list clients")?;
        if plan.idle.is_empty() {
            println!(
                "No build-agent clients idle for more than {} days ({} checked).",
                self.days, plan.managed
            );
            return Ok(());
        }

        let rows: Vec<ClientRow> = plan.idle.iter().map(ClientRow::from).collect();
        println!("{}", Table::new(rows).with(Style::rounded()));
        if self.dry_run {
            return Ok(());
        }
        if !self.yes
            && !confirm(&format!(
                "Will delete {}/{} build-agent clients. Continue? (y/n) ",
                plan.idle.len(),
                plan.managed
            ))?
        {
            println!("Nothing deleted.");
            return Ok(());
        }

        let report = delete_clients(server, &plan);
        println!("{} deleted {} clients", "✓".green(), report.deleted.len());
        for (name, e) in &report.failed {
            eprintln!("{} {name}: {e}", "✗".red());
        }
        Ok(())
    }
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{prompt}");
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(answer.trim().eq_ignore_ascii_case("y"))
}
