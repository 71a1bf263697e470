//! p4ci core library: domain types, client identity, view mapping, configuration.
//!
//! - [`types`]: newtypes and records exchanged with the server
//! - [`identity`]: client workspace naming
//! - [`view`]: view construction and depot wildcard matching
//! - [`config`]: [`CheckoutConfig`] and the [`EnvContext`] it is read from
//! - [`error`]: [`ConfigError`]

pub mod config;
pub mod error;
pub mod identity;
pub mod types;
pub mod view;

pub use config::{CheckoutConfig, EnvContext, StreamAndShelf};
pub use error::ConfigError;
pub use identity::client_identity;
pub use types::{
    ChangeDescription, ChangeNumber, ChangeStatus, ClientName, ClientOptions, ClientSpec,
    Connection, FileAction, FileType, PendingChange, RevisionSpec, ShelvedFile, StorageType,
    SyncedFile, ViewMapping,
};
pub use view::View;
