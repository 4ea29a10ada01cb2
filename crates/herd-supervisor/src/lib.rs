//! # herd-supervisor
//!
//! Keeps a set of apps running from a declarative TOML definition.
//!
//! Each app is expanded into instances; every instance is driven by its own
//! actor that launches the child, pipes its output into log files, samples its
//! memory, and restarts it on crash, memory breach or file change.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use herd_supervisor::{config, Supervisor, SupervisorConfig, SupervisorContext};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let apps = config::load_file("apps.toml".as_ref(), Some("production")).unwrap();
//!
//! let sup = Supervisor::new(
//!     SupervisorConfig::default(),
//!     SupervisorContext::from_process(Some("production".into())),
//! );
//! sup.apply(apps).await;
//! sup.start(None).await.unwrap();
//!
//! for app in sup.status(None).await.unwrap() {
//!     println!("{}: running={}", app.name, app.is_running());
//! }
//! sup.shutdown().await;
//! # }
//! ```

pub mod config;
pub mod error;
pub mod health;
mod instance;
pub mod launcher;
pub mod sink;
pub mod supervisor;
pub mod types;
pub mod watcher;

pub use config::{AppSpec, RawConfig};
pub use error::{CommandError, ConfigError, LaunchError, RuntimeFault, WatchError};
pub use health::{HealthMonitor, MemoryProbe, SysinfoProbe};
pub use instance::backoff_delay;
pub use supervisor::{ReloadSummary, Supervisor, SupervisorConfig, SupervisorContext};
pub use types::*;
