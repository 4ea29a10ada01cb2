use std::fs::OpenOptions;
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use serde::{Serialize, de::DeserializeOwned};
use tokio::signal::unix::{signal, SignalKind};

use crate::client::{self, ClientError, DaemonClient};
use crate::paths::DaemonPaths;
use crate::server;

pub struct Daemon {
	pub paths: DaemonPaths,
}

impl Daemon {
	pub fn new(app_name: impl Into<String>) -> Self {
		Self {
			paths: DaemonPaths::new(app_name),
		}
	}

	/// Serve requests until SIGINT, SIGTERM or `shutdown` resolves, then remove
	/// the socket and PID file. Returning hands control back to the caller so it
	/// can wind down whatever the handler manages.
	pub async fn run_until<Req, Resp, F, Fut, E, S>(&self, handler: F, on_invalid: Option<E>, shutdown: S)
	where
		Req: DeserializeOwned + Send + 'static,
		Resp: Serialize + Send + 'static,
		F: Fn(Req) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Resp> + Send,
		E: Fn(String) -> Resp + Send + Sync + 'static,
		S: Future<Output = ()>,
	{
		let _ = std::fs::create_dir_all(self.paths.state_dir());
		let _ = std::fs::write(self.paths.pid_path(), std::process::id().to_string());

		let socket_path = self.paths.socket_path();
		if socket_path.exists() {
			let _ = std::fs::remove_file(&socket_path);
		}

		tracing::info!("daemon started (pid {})", std::process::id());

		let paths = self.paths.clone();
		let server_handle = tokio::spawn(async move {
			server::run_socket_server_with_error(&paths, handler, on_invalid).await;
		});

		let mut terminate = match signal(SignalKind::terminate()) {
			Ok(s) => Some(s),
			Err(e) => {
				tracing::warn!("cannot listen for SIGTERM: {}", e);
				None
			}
		};

		tokio::select! {
			_ = shutdown => tracing::info!("shutdown requested"),
			_ = tokio::signal::ctrl_c() => tracing::info!("interrupted, shutting down"),
			_ = async {
				match terminate.as_mut() {
					Some(s) => { s.recv().await; }
					None => std::future::pending::<()>().await,
				}
			} => tracing::info!("terminated, shutting down"),
		}

		server_handle.abort();
		self.cleanup();
	}

	pub fn cleanup(&self) {
		let _ = std::fs::remove_file(self.paths.socket_path());
		let _ = std::fs::remove_file(self.paths.pid_path());
	}

	/// Re-exec the current binary with `args`, detached, output appended to the daemon log.
	pub fn start_background_with_args(&self, args: &[String]) -> Result<(), String> {
		if client::is_running(&self.paths) {
			return Err("daemon already running".to_string());
		}
		spawn_detached(&self.paths, args).map_err(|e| format!("failed to start daemon: {}", e))
	}

	/// Ask a running daemon to exit via SIGTERM.
	pub fn stop(&self) -> Result<(), String> {
		let pid = client::read_pid(&self.paths).ok_or_else(|| "daemon not running".to_string())?;
		use nix::sys::signal::{kill, Signal};
		use nix::unistd::Pid;
		kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
			.map_err(|e| format!("failed to signal daemon (pid {}): {}", pid, e))
	}
}

/// Connect to the daemon, starting it with `args` if it is not running yet.
pub fn ensure_daemon_with_args<Req, Resp>(
	paths: &DaemonPaths,
	args: &[String],
) -> Result<DaemonClient<Req, Resp>, ClientError>
where
	Req: Serialize,
	Resp: DeserializeOwned,
{
	if let Ok(client) = DaemonClient::connect(paths) {
		return Ok(client);
	}

	spawn_detached(paths, args)?;

	for _ in 0..50 {
		std::thread::sleep(Duration::from_millis(100));
		if let Ok(client) = DaemonClient::connect(paths) {
			return Ok(client);
		}
	}

	Err(ClientError::NotRunning)
}

fn spawn_detached(paths: &DaemonPaths, args: &[String]) -> std::io::Result<()> {
	std::fs::create_dir_all(paths.state_dir())?;
	let log = OpenOptions::new()
		.create(true)
		.append(true)
		.open(paths.daemon_log_path())?;
	let log_err = log.try_clone()?;

	let mut cmd = std::process::Command::new(find_current_binary());
	cmd.args(args)
		.stdin(Stdio::null())
		.stdout(Stdio::from(log))
		.stderr(Stdio::from(log_err));
	cmd.spawn()?;
	Ok(())
}

fn find_current_binary() -> PathBuf {
	std::env::current_exe().unwrap_or_else(|_| PathBuf::from("herd"))
}
