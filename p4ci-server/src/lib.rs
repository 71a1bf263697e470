//! Access to the version-control server.
//!
//! [`P4Server`] is the capability the workspace engine consumes.
//! [`CliServer`] drives the `p4` command-line client; [`MemoryServer`] keeps
//! everything in memory for tests.

pub mod cli;
pub mod error;
pub mod marshal;
pub mod memory;
pub mod server;

pub use cli::CliServer;
pub use error::ServerError;
pub use memory::{MemoryServer, ShelfEntry};
pub use server::{ChangesQuery, ClientSummary, FileMapping, P4Server, Progress, ServerInfo, ServerResult};
