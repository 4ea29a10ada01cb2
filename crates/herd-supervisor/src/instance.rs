//! Lifecycle actor for a single instance.
//!
//! Each actor owns its [`Instance`] record, takes commands one at a time from
//! its queue and publishes a snapshot after every change. Nothing else writes
//! the record.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};

use crate::config::{AppSpec, ResolvedLogFiles};
use crate::error::RuntimeFault;
use crate::health::HealthMonitor;
use crate::launcher::{self, ProcessHandle, StopOutcome};
use crate::sink::LogSink;
use crate::supervisor::{SupervisorConfig, SupervisorContext};
use crate::types::{ExitOutcome, Instance, InstanceState, Transition};
use crate::watcher::ChangeEvent;

const COMMAND_QUEUE: usize = 32;

/// Resolved (or dropped) once the command has been carried out.
pub(crate) type Ack = oneshot::Sender<()>;

#[derive(Debug)]
pub(crate) enum Command {
	Start(Ack),
	Stop(Ack),
	Restart(Ack),
	FileChanged(ChangeEvent),
	Shutdown(Ack),
}

/// Everything the actors of one supervisor have in common.
pub(crate) struct Shared {
	pub config: SupervisorConfig,
	pub context: SupervisorContext,
	pub sink: LogSink,
	pub health: HealthMonitor,
	pub transitions: broadcast::Sender<Transition>,
}

pub(crate) struct InstanceHandle {
	pub commands: mpsc::Sender<Command>,
	pub status: watch::Receiver<Instance>,
	pub task: JoinHandle<()>,
}

impl InstanceHandle {
	pub fn snapshot(&self) -> Instance {
		self.status.borrow().clone()
	}
}

pub(crate) fn spawn(app: Arc<AppSpec>, instance_id: usize, files: ResolvedLogFiles, shared: Arc<Shared>) -> InstanceHandle {
	let record = Instance::new(instance_id);
	let (status_tx, status_rx) = watch::channel(record.clone());
	let (tx, rx) = mpsc::channel(COMMAND_QUEUE);

	let actor = Actor {
		app,
		files,
		record,
		status: status_tx,
		commands: rx,
		shared,
	};
	let task = tokio::spawn(actor.run());

	InstanceHandle {
		commands: tx,
		status: status_rx,
		task,
	}
}

/// `min(max, base * 2^restart_count)`
pub fn backoff_delay(restart_count: u32, base: Duration, max: Duration) -> Duration {
	let factor = 2u32.checked_pow(restart_count).unwrap_or(u32::MAX);
	base.checked_mul(factor).map_or(max, |d| d.min(max))
}

enum Step {
	Idle,
	Launch(Option<Ack>),
	Supervise(ProcessHandle, Option<Ack>),
	Backoff,
	Exit,
}

struct Actor {
	app: Arc<AppSpec>,
	files: ResolvedLogFiles,
	record: Instance,
	status: watch::Sender<Instance>,
	commands: mpsc::Receiver<Command>,
	shared: Arc<Shared>,
}

impl Actor {
	async fn run(mut self) {
		let mut step = Step::Idle;
		loop {
			step = match step {
				Step::Idle => self.idle().await,
				Step::Launch(ack) => self.launch(ack).await,
				Step::Supervise(handle, ack) => self.supervise(handle, ack).await,
				Step::Backoff => self.backoff().await,
				Step::Exit => break,
			};
		}
		tracing::debug!("{}[{}] actor finished", self.app.name, self.record.instance_id);
	}

	/// Stopped or crashed; nothing runs until asked.
	async fn idle(&mut self) -> Step {
		loop {
			match self.commands.recv().await {
				None => return Step::Exit,
				Some(Command::Start(ack)) | Some(Command::Restart(ack)) => return Step::Launch(Some(ack)),
				Some(Command::Stop(ack)) => {
					let _ = ack.send(());
				}
				Some(Command::FileChanged(_)) => {}
				Some(Command::Shutdown(ack)) => {
					let _ = ack.send(());
					return Step::Exit;
				}
			}
		}
	}

	async fn launch(&mut self, ack: Option<Ack>) -> Step {
		self.transition(InstanceState::Starting);
		let shared = self.shared.clone();
		let started = launcher::start(
			&self.app,
			self.record.instance_id,
			shared.context.profile.as_deref(),
			&shared.context.base_env,
		);

		match started {
			Ok(mut handle) => {
				shared
					.sink
					.attach(
						&mut handle,
						&self.files,
						self.app.timestamp_lines,
						self.app.log_date_format.as_deref(),
						&self.app.name,
					)
					.await;
				self.record.last_started_at = Some(Utc::now());
				Step::Supervise(handle, ack)
			}
			Err(e) => {
				tracing::error!("{}[{}] failed to launch: {}", self.app.name, self.record.instance_id, e);
				self.record.last_error = Some(e.to_string());
				self.transition(InstanceState::Crashed);
				drop(ack);
				self.after_crash()
			}
		}
	}

	/// Starting until the grace period passes, then Running until something ends it.
	async fn supervise(&mut self, mut handle: ProcessHandle, mut ack: Option<Ack>) -> Step {
		let config = self.shared.config.clone();
		let mut starting = true;
		let mut stable = false;
		// A change seen while starting is acted on once the instance is up.
		let mut deferred: Option<ChangeEvent> = None;

		let grace = sleep(config.start_grace);
		tokio::pin!(grace);
		let stable_timer = sleep(config.start_grace + config.stable_uptime);
		tokio::pin!(stable_timer);
		let mut ticker = interval(config.poll_interval);
		ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
		ticker.tick().await;

		loop {
			tokio::select! {
				outcome = handle.wait() => {
					return self.on_exit(outcome, starting);
				}
				_ = &mut grace, if starting => {
					starting = false;
					self.record.pid = Some(handle.pid);
					self.record.last_error = None;
					self.transition(InstanceState::Running);
					if let Some(ack) = ack.take() {
						let _ = ack.send(());
					}
					if let Some(event) = deferred.take() {
						return self.reload_on_change(&mut handle, event).await;
					}
				}
				_ = &mut stable_timer, if !starting && !stable => {
					stable = true;
					if self.record.restart_count > 0 {
						tracing::debug!("{}[{}] stable, resetting restart count", self.app.name, self.record.instance_id);
						self.record.restart_count = 0;
						self.publish();
					}
				}
				_ = ticker.tick(), if !starting => {
					if let Some(step) = self.check_health(&mut handle).await {
						return step;
					}
				}
				cmd = self.commands.recv() => match cmd {
					None => {
						self.stop_child(&mut handle).await;
						return Step::Exit;
					}
					Some(Command::Start(done)) => {
						let _ = done.send(());
					}
					Some(Command::Stop(done)) => {
						self.stop_child(&mut handle).await;
						self.transition(InstanceState::Stopped);
						let _ = done.send(());
						return Step::Idle;
					}
					Some(Command::Restart(done)) => {
						tracing::info!("{}[{}] restarting", self.app.name, self.record.instance_id);
						self.stop_child(&mut handle).await;
						return Step::Launch(Some(done));
					}
					Some(Command::FileChanged(event)) if self.app.watch_enabled => {
						if starting {
							deferred = Some(event);
						} else {
							return self.reload_on_change(&mut handle, event).await;
						}
					}
					Some(Command::FileChanged(_)) => {}
					Some(Command::Shutdown(done)) => {
						self.stop_child(&mut handle).await;
						self.transition(InstanceState::Stopped);
						let _ = done.send(());
						return Step::Exit;
					}
				}
			}
		}
	}

	async fn reload_on_change(&mut self, handle: &mut ProcessHandle, event: ChangeEvent) -> Step {
		tracing::info!(
			"{}[{}] {} {:?}, restarting",
			self.app.name,
			self.record.instance_id,
			event.path.display(),
			event.kind
		);
		self.stop_child(handle).await;
		Step::Launch(None)
	}

	/// Sample memory and liveness. Returns the next step when the child must go.
	async fn check_health(&mut self, handle: &mut ProcessHandle) -> Option<Step> {
		let sample = self.shared.health.sample(handle.pid).await;

		if !sample.is_alive {
			// The exit notice usually follows right behind.
			let grace = self.shared.config.start_grace;
			if let Ok(outcome) = tokio::time::timeout(grace, handle.wait()).await {
				return Some(self.on_exit(outcome, false));
			}
			tracing::warn!("{}[{}] pid {} is unresponsive", self.app.name, self.record.instance_id, handle.pid);
			self.record.last_error = Some(RuntimeFault::Unresponsive.to_string());
			if self.stop_child(handle).await != StopOutcome::Unresponsive {
				self.transition(InstanceState::Crashed);
			}
			return Some(self.after_crash());
		}

		self.record.memory_bytes = sample.memory_bytes;
		self.publish();

		if let (Some(limit), Some(used)) = (self.app.max_memory_bytes, sample.memory_bytes) {
			if used > limit {
				let fault = RuntimeFault::MemoryExceeded { used, limit };
				tracing::warn!("{}[{}] {}", self.app.name, self.record.instance_id, fault);
				self.record.last_error = Some(fault.to_string());
				if self.stop_child(handle).await != StopOutcome::Unresponsive {
					self.transition(InstanceState::Stopped);
					self.transition(InstanceState::Crashed);
				}
				return Some(self.after_crash());
			}
		}
		None
	}

	fn on_exit(&mut self, outcome: ExitOutcome, starting: bool) -> Step {
		self.record_exit(outcome);

		if starting {
			self.record.last_error = Some(RuntimeFault::EarlyExit(outcome).to_string());
			tracing::warn!("{}[{}] exited during startup ({})", self.app.name, self.record.instance_id, outcome);
			self.transition(InstanceState::Crashed);
			return self.after_crash();
		}

		if outcome.is_success() {
			tracing::info!("{}[{}] exited cleanly", self.app.name, self.record.instance_id);
			self.transition(InstanceState::Stopped);
			return if self.app.auto_restart { Step::Backoff } else { Step::Idle };
		}

		self.record.last_error = Some(RuntimeFault::AbnormalExit(outcome).to_string());
		tracing::warn!("{}[{}] crashed ({})", self.app.name, self.record.instance_id, outcome);
		self.transition(InstanceState::Crashed);
		self.after_crash()
	}

	fn after_crash(&mut self) -> Step {
		if self.app.auto_restart {
			Step::Backoff
		} else {
			self.transition(InstanceState::Stopped);
			Step::Idle
		}
	}

	async fn backoff(&mut self) -> Step {
		let config = &self.shared.config;
		let delay = backoff_delay(self.record.restart_count, config.backoff_base, config.backoff_max);
		self.record.restart_count = self.record.restart_count.saturating_add(1);
		self.transition(InstanceState::RestartBackoff);
		tracing::info!(
			"{}[{}] restarting in {:?} (attempt {})",
			self.app.name,
			self.record.instance_id,
			delay,
			self.record.restart_count
		);

		let timer = sleep(delay);
		tokio::pin!(timer);
		loop {
			tokio::select! {
				_ = &mut timer => return Step::Launch(None),
				cmd = self.commands.recv() => match cmd {
					None => return Step::Exit,
					Some(Command::Start(ack)) | Some(Command::Restart(ack)) => return Step::Launch(Some(ack)),
					Some(Command::Stop(ack)) => {
						self.transition(InstanceState::Stopped);
						let _ = ack.send(());
						return Step::Idle;
					}
					Some(Command::FileChanged(_)) => {}
					Some(Command::Shutdown(ack)) => {
						self.transition(InstanceState::Stopped);
						let _ = ack.send(());
						return Step::Exit;
					}
				}
			}
		}
	}

	/// Running → Stopping, then terminate the child. A child that survives
	/// SIGKILL leaves the instance `Crashed`.
	async fn stop_child(&mut self, handle: &mut ProcessHandle) -> StopOutcome {
		self.record.pid = Some(handle.pid);
		self.transition(InstanceState::Stopping);

		let grace = self
			.app
			.kill_timeout_ms
			.map(Duration::from_millis)
			.unwrap_or(self.shared.config.kill_timeout);
		let result = launcher::stop(handle, grace).await;

		match result {
			StopOutcome::Exited(outcome) | StopOutcome::Killed(outcome) => self.record_exit(outcome),
			StopOutcome::Unresponsive => {
				tracing::error!(
					"{}[{}] pid {} survived SIGKILL",
					self.app.name,
					self.record.instance_id,
					handle.pid
				);
				self.record.pid = None;
				self.record.memory_bytes = None;
				self.record.last_error = Some(RuntimeFault::StopFailed.to_string());
				self.transition(InstanceState::Crashed);
			}
		}
		result
	}

	fn record_exit(&mut self, outcome: ExitOutcome) {
		self.record.pid = None;
		self.record.memory_bytes = None;
		self.record.last_exit = Some(outcome);
		self.record.last_exit_code = outcome.code();
	}

	fn transition(&mut self, to: InstanceState) {
		let from = self.record.state;
		self.record.state = to;
		if !matches!(to, InstanceState::Running | InstanceState::Stopping) {
			self.record.pid = None;
		}
		self.publish();

		tracing::info!("{}[{}] {} -> {}", self.app.name, self.record.instance_id, from, to);
		let _ = self.shared.transitions.send(Transition {
			app: self.app.name.clone(),
			instance_id: self.record.instance_id,
			from,
			to,
		});
	}

	fn publish(&self) {
		self.status.send_replace(self.record.clone());
	}
}
