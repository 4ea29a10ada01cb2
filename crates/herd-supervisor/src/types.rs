use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
	Stopped,
	Starting,
	Running,
	Stopping,
	Crashed,
	RestartBackoff,
}

impl InstanceState {
	pub fn is_running(&self) -> bool {
		matches!(self, InstanceState::Running)
	}

	/// Whether a child process may currently exist for this state.
	pub fn is_active(&self) -> bool {
		matches!(
			self,
			InstanceState::Starting | InstanceState::Running | InstanceState::Stopping
		)
	}
}

impl fmt::Display for InstanceState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let label = match self {
			InstanceState::Stopped => "stopped",
			InstanceState::Starting => "starting",
			InstanceState::Running => "running",
			InstanceState::Stopping => "stopping",
			InstanceState::Crashed => "crashed",
			InstanceState::RestartBackoff => "backoff",
		};
		f.write_str(label)
	}
}

/// How a child process ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExitOutcome {
	Code(i32),
	Signal(i32),
	/// The exit status could not be collected.
	Unknown,
}

impl ExitOutcome {
	pub fn is_success(&self) -> bool {
		matches!(self, ExitOutcome::Code(0))
	}

	pub fn code(&self) -> Option<i32> {
		match self {
			ExitOutcome::Code(c) => Some(*c),
			_ => None,
		}
	}
}

impl From<std::process::ExitStatus> for ExitOutcome {
	fn from(status: std::process::ExitStatus) -> Self {
		use std::os::unix::process::ExitStatusExt;
		match (status.code(), status.signal()) {
			(Some(code), _) => ExitOutcome::Code(code),
			(None, Some(sig)) => ExitOutcome::Signal(sig),
			(None, None) => ExitOutcome::Unknown,
		}
	}
}

impl fmt::Display for ExitOutcome {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ExitOutcome::Code(c) => write!(f, "exit code {}", c),
			ExitOutcome::Signal(s) => write!(f, "signal {}", s),
			ExitOutcome::Unknown => f.write_str("unknown status"),
		}
	}
}

/// Bookkeeping for one copy of an app. Only the instance's own actor mutates it;
/// everyone else sees published snapshots.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Instance {
	pub instance_id: usize,
	pub state: InstanceState,
	/// Present only while Running or Stopping.
	pub pid: Option<u32>,
	pub restart_count: u32,
	pub last_started_at: Option<DateTime<Utc>>,
	pub last_exit_code: Option<i32>,
	pub last_exit: Option<ExitOutcome>,
	pub last_error: Option<String>,
	pub memory_bytes: Option<u64>,
}

impl Instance {
	pub fn new(instance_id: usize) -> Self {
		Self {
			instance_id,
			state: InstanceState::Stopped,
			pid: None,
			restart_count: 0,
			last_started_at: None,
			last_exit_code: None,
			last_exit: None,
			last_error: None,
			memory_bytes: None,
		}
	}

	pub fn uptime_secs(&self) -> Option<u64> {
		if !self.state.is_running() {
			return None;
		}
		let started = self.last_started_at?;
		let secs = Utc::now().signed_duration_since(started).num_seconds();
		Some(secs.max(0) as u64)
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppStatus {
	pub name: String,
	pub watch_enabled: bool,
	pub watch_error: Option<String>,
	pub instances: Vec<Instance>,
}

impl AppStatus {
	pub fn is_running(&self) -> bool {
		self.instances.iter().any(|i| i.state.is_running())
	}
}

/// One state change of one instance, as broadcast by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
	pub app: String,
	pub instance_id: usize,
	pub from: InstanceState,
	pub to: InstanceState,
}
