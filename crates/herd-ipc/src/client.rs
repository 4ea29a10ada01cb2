use std::io::{self, BufRead, BufReader, Write};
use std::marker::PhantomData;
use std::os::unix::net::UnixStream;
use std::time::Duration;

use serde::{Serialize, de::DeserializeOwned};

use crate::paths::DaemonPaths;

/// Errors from daemon client operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
	/// Daemon is not running (socket not found or refusing connections).
	#[error("daemon not running")]
	NotRunning,
	/// The daemon accepted the request but did not answer in time.
	#[error("daemon did not respond within {0:?}")]
	Timeout(Duration),
	/// The daemon closed the connection without answering.
	#[error("daemon closed the connection")]
	Closed,
	#[error("io error: {0}")]
	Io(#[from] io::Error),
	#[error("serialize error: {0}")]
	Serialize(String),
	#[error("deserialize error: {0}")]
	Deserialize(String),
}

/// Synchronous client for a daemon speaking JSON lines over a Unix socket.
pub struct DaemonClient<Req, Resp> {
	stream: UnixStream,
	timeout: Option<Duration>,
	_phantom: PhantomData<(Req, Resp)>,
}

impl<Req, Resp> DaemonClient<Req, Resp>
where
	Req: Serialize,
	Resp: DeserializeOwned,
{
	/// Connect to an already-running daemon.
	/// Returns `Err(ClientError::NotRunning)` if nothing listens on the socket.
	pub fn connect(paths: &DaemonPaths) -> Result<Self, ClientError> {
		let socket_path = paths.socket_path();
		let stream = UnixStream::connect(&socket_path).map_err(|_| ClientError::NotRunning)?;
		Ok(Self {
			stream,
			timeout: None,
			_phantom: PhantomData,
		})
	}

	/// Bound how long [`send`](Self::send) waits for a response.
	pub fn with_timeout(mut self, timeout: Duration) -> Result<Self, ClientError> {
		self.stream.set_read_timeout(Some(timeout))?;
		self.timeout = Some(timeout);
		Ok(self)
	}

	pub fn send(&mut self, request: &Req) -> Result<Resp, ClientError> {
		let mut data =
			serde_json::to_vec(request).map_err(|e| ClientError::Serialize(e.to_string()))?;
		data.push(b'\n');
		self.stream.write_all(&data)?;

		let mut reader = BufReader::new(&self.stream);
		let mut line = String::new();
		match reader.read_line(&mut line) {
			Ok(0) => return Err(ClientError::Closed),
			Ok(_) => {}
			Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
				return Err(ClientError::Timeout(self.timeout.unwrap_or_default()));
			}
			Err(e) => return Err(ClientError::Io(e)),
		}

		serde_json::from_str(&line).map_err(|e| ClientError::Deserialize(e.to_string()))
	}
}

pub fn is_running(paths: &DaemonPaths) -> bool {
	UnixStream::connect(paths.socket_path()).is_ok()
}

pub fn read_pid(paths: &DaemonPaths) -> Option<u32> {
	std::fs::read_to_string(paths.pid_path())
		.ok()
		.and_then(|s| s.trim().parse().ok())
}
