//! Daemon plumbing for herd: where the daemon keeps its files, how the CLI
//! reaches it, and how it gets started in the background.

pub mod paths;
pub mod server;
pub mod client;
pub mod daemon;
#[cfg(feature = "clap")]
pub mod clap;

pub use paths::DaemonPaths;
pub use client::{DaemonClient, ClientError};
pub use daemon::Daemon;
pub use daemon::ensure_daemon_with_args;
