use std::io::ErrorKind;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{ChildStderr, ChildStdout, Command};
use tokio::sync::oneshot;

use crate::config::{AppSpec, EnvMap};
use crate::error::LaunchError;
use crate::types::ExitOutcome;

/// How long to wait for the exit notice after SIGKILL before giving up on a process.
const KILL_WAIT: Duration = Duration::from_secs(3);

/// A launched child. Output streams are taken by the log sink; the exit notice
/// resolves once and is observed by the instance that owns the handle.
pub struct ProcessHandle {
	pub pid: u32,
	pub stdout: Option<ChildStdout>,
	pub stderr: Option<ChildStderr>,
	exit: oneshot::Receiver<ExitOutcome>,
	resolved: Option<ExitOutcome>,
}

impl ProcessHandle {
	/// Wait for the process to end. Cancel-safe; repeated calls return the same outcome.
	pub async fn wait(&mut self) -> ExitOutcome {
		if let Some(outcome) = self.resolved {
			return outcome;
		}
		let outcome = (&mut self.exit).await.unwrap_or(ExitOutcome::Unknown);
		self.resolved = Some(outcome);
		outcome
	}

	pub fn exited(&self) -> Option<ExitOutcome> {
		self.resolved
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
	/// Exited within the grace period (or had already exited).
	Exited(ExitOutcome),
	/// Needed SIGKILL.
	Killed(ExitOutcome),
	/// Still no exit notice after SIGKILL.
	Unresponsive,
}

/// Layer the environment: process base, then the app's `env`, then the selected profile.
pub fn merged_env(base: &EnvMap, app: &AppSpec, profile: Option<&str>, instance_id: usize) -> EnvMap {
	let mut env = base.clone();
	env.extend(app.env.iter().map(|(k, v)| (k.clone(), v.clone())));
	if let Some(profile_env) = app.profile_env(profile) {
		env.extend(profile_env.iter().map(|(k, v)| (k.clone(), v.clone())));
	}
	env.insert("HERD_APP".to_string(), app.name.clone());
	env.insert("HERD_INSTANCE".to_string(), instance_id.to_string());
	env
}

pub fn start(
	app: &AppSpec,
	instance_id: usize,
	profile: Option<&str>,
	base_env: &EnvMap,
) -> Result<ProcessHandle, LaunchError> {
	if !app.working_directory.is_dir() {
		return Err(LaunchError::WorkingDirectory(app.working_directory.clone()));
	}
	let script = app.script_path();
	if !script.exists() {
		return Err(LaunchError::ScriptNotFound(script));
	}

	let (program, mut cmd) = if app.interpreter == "none" {
		let program = script.to_string_lossy().into_owned();
		(program, Command::new(&script))
	} else {
		let mut cmd = Command::new(&app.interpreter);
		cmd.arg(&script);
		(app.interpreter.clone(), cmd)
	};

	cmd.args(&app.args)
		.current_dir(&app.working_directory)
		.env_clear()
		.envs(merged_env(base_env, app, profile, instance_id))
		.stdin(Stdio::null())
		.stdout(Stdio::piped())
		.stderr(Stdio::piped())
		.process_group(0)
		.kill_on_drop(true);

	let mut child = cmd.spawn().map_err(|e| match e.kind() {
		ErrorKind::NotFound => LaunchError::InterpreterNotFound(program.clone()),
		ErrorKind::PermissionDenied => LaunchError::PermissionDenied(program.clone()),
		_ => LaunchError::Spawn(e),
	})?;

	let pid = child
		.id()
		.ok_or_else(|| LaunchError::Spawn(std::io::Error::other("child exited before its pid was read")))?;
	let stdout = child.stdout.take();
	let stderr = child.stderr.take();

	let (tx, rx) = oneshot::channel();
	tokio::spawn(async move {
		let outcome = match child.wait().await {
			Ok(status) => ExitOutcome::from(status),
			Err(e) => {
				tracing::warn!("failed to collect exit status of pid {}: {}", pid, e);
				ExitOutcome::Unknown
			}
		};
		let _ = tx.send(outcome);
	});

	tracing::debug!("spawned {} ({}) as pid {}", app.name, program, pid);
	Ok(ProcessHandle {
		pid,
		stdout,
		stderr,
		exit: rx,
		resolved: None,
	})
}

/// SIGTERM the process group, wait up to `grace`, then SIGKILL.
pub async fn stop(handle: &mut ProcessHandle, grace: Duration) -> StopOutcome {
	if let Some(outcome) = handle.exited() {
		return StopOutcome::Exited(outcome);
	}

	signal_group(handle.pid, nix::sys::signal::Signal::SIGTERM);
	if let Ok(outcome) = tokio::time::timeout(grace, handle.wait()).await {
		return StopOutcome::Exited(outcome);
	}

	tracing::warn!("pid {} ignored SIGTERM for {:?}, sending SIGKILL", handle.pid, grace);
	signal_group(handle.pid, nix::sys::signal::Signal::SIGKILL);
	match tokio::time::timeout(KILL_WAIT, handle.wait()).await {
		Ok(outcome) => StopOutcome::Killed(outcome),
		Err(_) => StopOutcome::Unresponsive,
	}
}

/// Signal the whole process group led by `pid`, falling back to the pid itself.
pub fn signal_group(pid: u32, signal: nix::sys::signal::Signal) {
	use nix::sys::signal::{kill, killpg};
	use nix::unistd::Pid;
	let target = Pid::from_raw(pid as i32);
	if killpg(target, signal).is_err() {
		let _ = kill(target, signal);
	}
}
