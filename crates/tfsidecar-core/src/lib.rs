//! tfsidecar-core - the execution pipeline and state-mirroring engine
//! behind the `tfsidecar` binary.
//!
//! The supervisor runs terraform inside a pod while bridging two worlds:
//! durable ConfigMaps/Secrets in the cluster (config, variables, state)
//! and the transient files terraform reads and writes on disk. While
//! terraform runs, every write to the state file is mirrored back into
//! the state ConfigMap through a single rate-limited worker; at shutdown
//! a final must-succeed update is retried with backoff before the process
//! exits with terraform's own exit code.
//!
//! Entry point: build a [`supervisor::Config`], wrap a
//! [`client::RecordClient`] in a [`supervisor::Supervisor`] and call
//! [`supervisor::Supervisor::run`].

pub mod client;
pub mod command;
pub mod exec;
pub mod fetch;
pub mod finalizer;
pub mod paths;
pub mod queue;
pub mod state;
pub mod store;
pub mod supervisor;

pub use command::Command;
pub use supervisor::{Config, Supervisor, SupervisorError};

/// The crate version, for startup banners.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
