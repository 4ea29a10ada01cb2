use std::path::PathBuf;
use std::time::Duration;

/// A malformed or incomplete app definition. Fatal for the app it names.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	#[error("failed to read {path}: {source}")]
	Read {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},
	#[error("failed to parse {path}: {source}")]
	Parse {
		path: PathBuf,
		#[source]
		source: Box<toml::de::Error>,
	},
	#[error("failed to serialize config: {0}")]
	Serialize(#[from] toml::ser::Error),
	#[error("app #{index}: missing name")]
	MissingName { index: usize },
	#[error("{app}: duplicate app name")]
	DuplicateName { app: String },
	#[error("{app}: missing required field `{field}`")]
	MissingField { app: String, field: &'static str },
	#[error("{app}: instance count must be at least 1 (got {value})")]
	InstanceCount { app: String, value: String },
	#[error("{app}: invalid value for `{field}`: {value}")]
	InvalidValue {
		app: String,
		field: &'static str,
		value: String,
	},
	#[error("{app}: invalid memory threshold {value:?} (expected bytes or a K/M/G suffix)")]
	InvalidMemory { app: String, value: String },
	#[error("{app}: environment profile {profile:?} is not defined")]
	UndefinedProfile { app: String, profile: String },
	#[error("{app}: invalid ignore rule {rule:?}: {reason}")]
	InvalidIgnoreRule {
		app: String,
		rule: String,
		reason: String,
	},
}

/// Why a child could not be started. The instance goes straight to `Crashed`.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
	#[error("working directory {0} does not exist")]
	WorkingDirectory(PathBuf),
	#[error("script {0} not found")]
	ScriptNotFound(PathBuf),
	#[error("interpreter {0:?} not found")]
	InterpreterNotFound(String),
	#[error("permission denied launching {0:?}")]
	PermissionDenied(String),
	#[error("spawn failed: {0}")]
	Spawn(#[source] std::io::Error),
}

/// Something went wrong with a running instance. Handled by the restart policy.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RuntimeFault {
	#[error("exited with {0}")]
	AbnormalExit(crate::types::ExitOutcome),
	#[error("exited during startup with {0}")]
	EarlyExit(crate::types::ExitOutcome),
	#[error("memory {used} bytes exceeded limit of {limit} bytes")]
	MemoryExceeded { used: u64, limit: u64 },
	#[error("process stopped responding to health checks")]
	Unresponsive,
	#[error("process did not exit after SIGKILL")]
	StopFailed,
}

#[derive(Debug, thiserror::Error)]
#[error("log write to {path} failed: {source}")]
pub struct LogWriteError {
	pub path: PathBuf,
	#[source]
	pub source: std::io::Error,
}

/// File observation is unavailable; watching is disabled for that app.
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
	#[error("cannot watch {path}: {source}")]
	Notify {
		path: PathBuf,
		#[source]
		source: notify::Error,
	},
	#[error("watch root {0} does not exist")]
	MissingRoot(PathBuf),
	#[error("invalid ignore rules: {0}")]
	Rules(#[from] globset::Error),
}

/// An operator command that could not be fulfilled.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
	#[error("app not found: {}", .0.join(", "))]
	NotFound(Vec<String>),
	#[error("timed out after {0:?}")]
	Timeout(Duration),
}
