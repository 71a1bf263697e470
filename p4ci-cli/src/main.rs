//! p4ci: Perforce workspaces for CI build agents.
//!
//! # Usage
//!
//! ```text
//! p4ci checkout                      # build-agent checkout hook
//! p4ci pre-exit                      # build-agent pre-exit hook
//! p4ci sync [--revision @123] [--root DIR --stream //depot/main | --view ... | --config FILE]
//! p4ci head [--at @label]
//! p4ci describe <change> [--shelved]
//! p4ci revert | clean
//! p4ci unshelve | materialize | backup <change>
//! p4ci prune [--days 30] [--dry-run | --yes]
//! ```

mod buildkite;
mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    describe::DescribeArgs,
    head::HeadArgs,
    hooks::{CheckoutArgs, PreExitArgs},
    maintenance::{CleanArgs, RevertArgs},
    prune::PruneArgs,
    shelf::{ShelfArgs, ShelfOperation},
    sync::SyncArgs,
};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "p4ci",
    version,
    about = "Manage Perforce workspaces for CI build agents",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Checkout hook: sync the build revision and apply the branch's shelf.
    Checkout(CheckoutArgs),

    /// Pre-exit hook: revert opened and shelf-patched files.
    PreExit(PreExitArgs),

    /// Sync the workspace to a revision (head of the view by default).
    Sync(SyncArgs),

    /// Print the head revision of the workspace view.
    Head(HeadArgs),

    /// Print the description of a change.
    Describe(DescribeArgs),

    /// Revert opened files and files written from a shelf.
    Revert(RevertArgs),

    /// Restore deleted files and remove files unknown to the server.
    Clean(CleanArgs),

    /// Open the files of a shelved change in the workspace.
    Unshelve(ShelfArgs),

    /// Write the content of a shelved change without opening files.
    Materialize(ShelfArgs),

    /// Copy a shelved change into a new shelf owned by this workspace.
    Backup(ShelfArgs),

    /// Delete build-agent clients that have not been used for a while.
    Prune(PruneArgs),
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Commands::Checkout(args) => args.run(),
        Commands::PreExit(args) => args.run(),
        Commands::Sync(args) => args.run(),
        Commands::Head(args) => args.run(),
        Commands::Describe(args) => args.run(),
        Commands::Revert(args) => args.run(),
        Commands::Clean(args) => args.run(),
        Commands::Unshelve(args) => args.run(ShelfOperation::Unshelve),
        Commands::Materialize(args) => args.run(ShelfOperation::Materialize),
        Commands::Backup(args) => args.run(ShelfOperation::Backup),
        Commands::Prune(args) => args.run(),
    }
}

/// Log to stderr; `RUST_LOG` overrides the default `info` level.
fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
