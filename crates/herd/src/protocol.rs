use herd_supervisor::{AppStatus, CommandError, ReloadSummary};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Request {
	Start {
		#[serde(default)]
		app: Option<String>,
	},
	Stop {
		#[serde(default)]
		app: Option<String>,
	},
	Restart {
		#[serde(default)]
		app: Option<String>,
	},
	Status {
		#[serde(default)]
		app: Option<String>,
	},
	Logs { app: String },
	Reload,
	Ping,
	Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
	Ok { message: Option<String> },
	Status { apps: Vec<AppStatus> },
	Log { text: String },
	Reloaded { summary: ReloadSummary },
	Error { kind: ErrorKind, message: String },
	Pong,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
	Config,
	NotFound,
	Timeout,
	InvalidRequest,
}

impl Response {
	pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
		Response::Error {
			kind,
			message: message.into(),
		}
	}
}

impl From<CommandError> for Response {
	fn from(e: CommandError) -> Self {
		let kind = match e {
			CommandError::NotFound(_) => ErrorKind::NotFound,
			CommandError::Timeout(_) => ErrorKind::Timeout,
		};
		Response::error(kind, e.to_string())
	}
}
