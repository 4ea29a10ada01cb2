use herd_ipc::paths::expand_tilde;
use herd_ipc::DaemonPaths;
use herd_supervisor::SupervisorConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Looked up in the current directory when neither `--config` nor
/// `defaults.apps` name an apps file.
const LOCAL_APPS_FILE: &str = "herd.toml";

// ── Settings (~/.config/herd/config.toml) ────────────────────────────────────

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Settings {
	#[serde(default)]
	pub daemon: DaemonSettings,
	#[serde(default)]
	pub supervisor: SupervisorSettings,
	#[serde(default)]
	pub defaults: DefaultsSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DaemonSettings {
	#[serde(default = "default_command_timeout")]
	pub command_timeout_secs: u64,
}

impl Default for DaemonSettings {
	fn default() -> Self {
		Self { command_timeout_secs: default_command_timeout() }
	}
}

fn default_command_timeout() -> u64 { 30 }

#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorSettings {
	#[serde(default = "default_poll_interval")]
	pub poll_interval_ms: u64,
	#[serde(default = "default_sample_timeout")]
	pub sample_timeout_ms: u64,
	#[serde(default = "default_start_grace")]
	pub start_grace_ms: u64,
	#[serde(default = "default_kill_timeout")]
	pub kill_timeout_ms: u64,
	#[serde(default = "default_backoff_base")]
	pub backoff_base_ms: u64,
	#[serde(default = "default_backoff_max")]
	pub backoff_max_ms: u64,
	#[serde(default = "default_stable_uptime")]
	pub stable_uptime_secs: u64,
	#[serde(default = "default_watch_debounce")]
	pub watch_debounce_ms: u64,
	#[serde(default = "default_shutdown_deadline")]
	pub shutdown_deadline_secs: u64,
	pub log_dir: Option<String>,
}

impl Default for SupervisorSettings {
	fn default() -> Self {
		Self {
			poll_interval_ms: default_poll_interval(),
			sample_timeout_ms: default_sample_timeout(),
			start_grace_ms: default_start_grace(),
			kill_timeout_ms: default_kill_timeout(),
			backoff_base_ms: default_backoff_base(),
			backoff_max_ms: default_backoff_max(),
			stable_uptime_secs: default_stable_uptime(),
			watch_debounce_ms: default_watch_debounce(),
			shutdown_deadline_secs: default_shutdown_deadline(),
			log_dir: None,
		}
	}
}

fn default_poll_interval() -> u64 { 1000 }
fn default_sample_timeout() -> u64 { 2000 }
fn default_start_grace() -> u64 { 1000 }
fn default_kill_timeout() -> u64 { 1600 }
fn default_backoff_base() -> u64 { 100 }
fn default_backoff_max() -> u64 { 15_000 }
fn default_stable_uptime() -> u64 { 60 }
fn default_watch_debounce() -> u64 { 250 }
fn default_shutdown_deadline() -> u64 { 10 }

#[derive(Debug, Clone, Deserialize, Default)]
pub struct DefaultsSettings {
	/// Environment profile used when `--env` is not given.
	pub profile: Option<String>,
	/// Apps file used when `--config` is not given.
	pub apps: Option<String>,
}

impl Settings {
	pub fn command_timeout(&self) -> Duration {
		Duration::from_secs(self.daemon.command_timeout_secs)
	}

	pub fn supervisor_config(&self, paths: &DaemonPaths) -> SupervisorConfig {
		let s = &self.supervisor;
		SupervisorConfig {
			log_dir: s
				.log_dir
				.as_deref()
				.map(expand_tilde)
				.unwrap_or_else(|| paths.log_dir()),
			poll_interval: Duration::from_millis(s.poll_interval_ms.max(1)),
			sample_timeout: Duration::from_millis(s.sample_timeout_ms),
			start_grace: Duration::from_millis(s.start_grace_ms),
			kill_timeout: Duration::from_millis(s.kill_timeout_ms),
			backoff_base: Duration::from_millis(s.backoff_base_ms),
			backoff_max: Duration::from_millis(s.backoff_max_ms),
			stable_uptime: Duration::from_secs(s.stable_uptime_secs),
			watch_debounce: Duration::from_millis(s.watch_debounce_ms),
			command_timeout: self.command_timeout(),
			shutdown_deadline: Duration::from_secs(s.shutdown_deadline_secs),
		}
	}

	/// `--env`, else `defaults.profile`.
	pub fn profile(&self, cli: Option<&str>) -> Option<String> {
		cli.map(str::to_string).or_else(|| self.defaults.profile.clone())
	}

	/// `--config`, else `defaults.apps`, else `./herd.toml` if present, else
	/// `<config_dir>/apps.toml`. Made absolute so the daemon can use it from anywhere.
	pub fn apps_path(&self, cli: Option<&Path>, paths: &DaemonPaths) -> PathBuf {
		let path = if let Some(p) = cli {
			p.to_path_buf()
		} else if let Some(p) = &self.defaults.apps {
			expand_tilde(p)
		} else if Path::new(LOCAL_APPS_FILE).exists() {
			PathBuf::from(LOCAL_APPS_FILE)
		} else {
			paths.default_apps_file()
		};
		absolute(path)
	}
}

fn absolute(path: PathBuf) -> PathBuf {
	if let Ok(canonical) = path.canonicalize() {
		return canonical;
	}
	if path.is_absolute() {
		return path;
	}
	std::env::current_dir().map(|cwd| cwd.join(&path)).unwrap_or(path)
}

pub fn parse_settings(content: &str) -> Result<Settings, toml::de::Error> {
	toml::from_str(content)
}

pub fn load_settings(paths: &DaemonPaths) -> Settings {
	let path = paths.settings_file();
	if path.exists() {
		match std::fs::read_to_string(&path) {
			Ok(content) => match parse_settings(&content) {
				Ok(settings) => return settings,
				Err(e) => eprintln!("warning: failed to parse {}: {}", path.display(), e),
			},
			Err(e) => eprintln!("warning: failed to read {}: {}", path.display(), e),
		}
	}
	Settings::default()
}
