use std::path::PathBuf;

/// Where one named daemon keeps its socket, pid file, logs and settings.
///
/// Directories are resolved once, when the value is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonPaths {
	pub app_name: String,
	state_dir: PathBuf,
	config_dir: PathBuf,
}

impl DaemonPaths {
	/// `$XDG_STATE_HOME/<app>` and `$XDG_CONFIG_HOME/<app>`, falling back to
	/// `~/.local/state/<app>` and `~/.config/<app>`.
	pub fn new(app_name: impl Into<String>) -> Self {
		let app_name = app_name.into();
		let (state_dir, config_dir) = match (
			xdg_base("XDG_STATE_HOME", &[".local", "state"]),
			xdg_base("XDG_CONFIG_HOME", &[".config"]),
		) {
			(Some(state), Some(config)) => (state.join(&app_name), config.join(&app_name)),
			_ => {
				let scratch = std::env::temp_dir().join(&app_name);
				(scratch.clone(), scratch.join("config"))
			}
		};
		Self {
			app_name,
			state_dir,
			config_dir,
		}
	}

	/// Everything under `root`: state in `root/<app>`, settings in `root/<app>/config`.
	pub fn under(app_name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
		let app_name = app_name.into();
		let state_dir = root.into().join(&app_name);
		Self {
			config_dir: state_dir.join("config"),
			state_dir,
			app_name,
		}
	}

	pub fn state_dir(&self) -> PathBuf {
		self.state_dir.clone()
	}

	pub fn config_dir(&self) -> PathBuf {
		self.config_dir.clone()
	}

	pub fn socket_path(&self) -> PathBuf {
		self.state_dir.join("daemon.sock")
	}

	pub fn pid_path(&self) -> PathBuf {
		self.state_dir.join("daemon.pid")
	}

	/// Where a backgrounded daemon's stdout/stderr end up.
	pub fn daemon_log_path(&self) -> PathBuf {
		self.state_dir.join("daemon.log")
	}

	/// Default directory for app logs that have no explicit destination.
	pub fn log_dir(&self) -> PathBuf {
		self.state_dir.join("logs")
	}

	pub fn settings_file(&self) -> PathBuf {
		self.config_dir.join("config.toml")
	}

	/// Apps file used when nothing else names one.
	pub fn default_apps_file(&self) -> PathBuf {
		self.config_dir.join("apps.toml")
	}
}

/// Expand a leading `~/` using `$HOME`.
pub fn expand_tilde(path: &str) -> PathBuf {
	match (path.strip_prefix("~/"), home_dir()) {
		(Some(rest), Some(home)) => home.join(rest),
		_ => PathBuf::from(path),
	}
}

fn xdg_base(var: &str, under_home: &[&str]) -> Option<PathBuf> {
	match std::env::var_os(var) {
		Some(dir) if !dir.is_empty() => Some(PathBuf::from(dir)),
		_ => home_dir().map(|home| under_home.iter().fold(home, |path, part| path.join(part))),
	}
}

fn home_dir() -> Option<PathBuf> {
	std::env::var_os("HOME").filter(|h| !h.is_empty()).map(PathBuf::from)
}
