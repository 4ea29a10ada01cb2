use std::path::{Component, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::config::{AppSpec, EnvMap, ResolvedLogFiles};
use crate::error::{CommandError, WatchError};
use crate::health::{HealthMonitor, MemoryProbe, SysinfoProbe};
use crate::instance::{self, Ack, Command, InstanceHandle, Shared};
use crate::launcher;
use crate::sink::LogSink;
use crate::types::{AppStatus, InstanceState, Transition};
use crate::watcher::{self, ChangeStream, IgnoreRules};

const TRANSITION_BUFFER: usize = 256;

/// Timing knobs. Defaults match the settings file defaults.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
	/// Where `<name>-out.log` / `<name>-error.log` go when an app names no file.
	pub log_dir: PathBuf,
	pub poll_interval: Duration,
	pub sample_timeout: Duration,
	/// How long a child must stay up to count as started.
	pub start_grace: Duration,
	/// SIGTERM to SIGKILL, unless the app sets `kill_timeout`.
	pub kill_timeout: Duration,
	pub backoff_base: Duration,
	pub backoff_max: Duration,
	/// Continuous uptime after which `restart_count` goes back to zero.
	pub stable_uptime: Duration,
	pub watch_debounce: Duration,
	pub command_timeout: Duration,
	pub shutdown_deadline: Duration,
}

impl Default for SupervisorConfig {
	fn default() -> Self {
		Self {
			log_dir: std::env::temp_dir().join("herd").join("logs"),
			poll_interval: Duration::from_millis(1000),
			sample_timeout: Duration::from_millis(2000),
			start_grace: Duration::from_millis(1000),
			kill_timeout: Duration::from_millis(1600),
			backoff_base: Duration::from_millis(100),
			backoff_max: Duration::from_millis(15_000),
			stable_uptime: Duration::from_secs(60),
			watch_debounce: Duration::from_millis(250),
			command_timeout: Duration::from_secs(30),
			shutdown_deadline: Duration::from_secs(10),
		}
	}
}

/// The selected profile and the environment every child starts from.
#[derive(Debug, Clone, Default)]
pub struct SupervisorContext {
	pub profile: Option<String>,
	pub base_env: EnvMap,
}

impl SupervisorContext {
	/// Capture the current process environment as the base.
	pub fn from_process(profile: Option<String>) -> Self {
		Self {
			profile,
			base_env: std::env::vars().collect(),
		}
	}
}

/// What [`Supervisor::apply`] did, by app name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReloadSummary {
	pub added: Vec<String>,
	pub removed: Vec<String>,
	pub replaced: Vec<String>,
	pub unchanged: Vec<String>,
}

struct ManagedApp {
	spec: Arc<AppSpec>,
	instances: Vec<InstanceHandle>,
	watcher: Option<JoinHandle<()>>,
	watch_error: Option<String>,
}

impl ManagedApp {
	fn status(&self) -> AppStatus {
		AppStatus {
			name: self.spec.name.clone(),
			watch_enabled: self.spec.watch_enabled,
			watch_error: self.watch_error.clone(),
			instances: self.instances.iter().map(InstanceHandle::snapshot).collect(),
		}
	}

	/// Whether any instance is running or on its way back up.
	fn is_active(&self) -> bool {
		self.instances.iter().any(|i| {
			!matches!(
				i.status.borrow().state,
				InstanceState::Stopped | InstanceState::Crashed
			)
		})
	}

	fn senders(&self) -> impl Iterator<Item = mpsc::Sender<Command>> + '_ {
		self.instances.iter().map(|i| i.commands.clone())
	}
}

pub struct Supervisor {
	shared: Arc<Shared>,
	apps: Mutex<Vec<ManagedApp>>,
}

impl Supervisor {
	pub fn new(config: SupervisorConfig, context: SupervisorContext) -> Arc<Self> {
		Self::with_probe(config, context, Arc::new(SysinfoProbe::new()))
	}

	pub fn with_probe(config: SupervisorConfig, context: SupervisorContext, probe: Arc<dyn MemoryProbe>) -> Arc<Self> {
		let (transitions, _) = broadcast::channel(TRANSITION_BUFFER);
		let health = HealthMonitor::new(probe, config.sample_timeout);
		Arc::new(Self {
			shared: Arc::new(Shared {
				config,
				context,
				sink: LogSink::new(),
				health,
				transitions,
			}),
			apps: Mutex::new(Vec::new()),
		})
	}

	pub fn config(&self) -> &SupervisorConfig {
		&self.shared.config
	}

	pub fn context(&self) -> &SupervisorContext {
		&self.shared.context
	}

	/// Every instance state change from now on.
	pub fn subscribe(&self) -> broadcast::Receiver<Transition> {
		self.shared.transitions.subscribe()
	}

	/// Make the managed set match `specs`.
	///
	/// New apps are registered stopped. Removed apps are shut down. Apps whose
	/// definition changed are shut down and recreated, and started again if
	/// they were active before.
	pub async fn apply(&self, specs: Vec<AppSpec>) -> ReloadSummary {
		let mut summary = ReloadSummary::default();
		let mut restart = Vec::new();
		let mut retired = Vec::new();
		{
			let mut apps = self.apps.lock().await;
			let mut previous = std::mem::take(&mut *apps);
			let mut next = Vec::with_capacity(specs.len());

			for spec in specs {
				let name = spec.name.clone();
				match previous.iter().position(|a| a.spec.name == name) {
					Some(index) => {
						let old = previous.remove(index);
						if *old.spec == spec {
							summary.unchanged.push(name);
							next.push(old);
							continue;
						}
						if old.is_active() {
							restart.push(name.clone());
						}
						retired.push(old);
						next.push(self.register(spec));
						summary.replaced.push(name);
					}
					None => {
						next.push(self.register(spec));
						summary.added.push(name);
					}
				}
			}

			summary.removed = previous.iter().map(|a| a.spec.name.clone()).collect();
			retired.extend(previous);
			*apps = next;
		}

		// Status stays available while retired apps wind down.
		self.retire(retired).await;
		for name in &summary.removed {
			self.shared.sink.forget(name).await;
		}

		for name in &restart {
			if let Err(e) = self.start(Some(name)).await {
				tracing::warn!("{}: restart after reload failed: {}", name, e);
			}
		}

		tracing::info!(
			"applied config: {} added, {} removed, {} replaced, {} unchanged",
			summary.added.len(),
			summary.removed.len(),
			summary.replaced.len(),
			summary.unchanged.len()
		);
		summary
	}

	/// Start `target` (or every app). Already running instances are left alone.
	pub async fn start(&self, target: Option<&str>) -> Result<Vec<AppStatus>, CommandError> {
		self.command(target, Command::Start).await
	}

	pub async fn stop(&self, target: Option<&str>) -> Result<Vec<AppStatus>, CommandError> {
		self.command(target, Command::Stop).await
	}

	/// Stop and start again without counting towards `restart_count`.
	pub async fn restart(&self, target: Option<&str>) -> Result<Vec<AppStatus>, CommandError> {
		self.command(target, Command::Restart).await
	}

	pub async fn status(&self, target: Option<&str>) -> Result<Vec<AppStatus>, CommandError> {
		let apps = self.apps.lock().await;
		Ok(select(&apps, target)?.into_iter().map(ManagedApp::status).collect())
	}

	/// Recent combined output of one app.
	pub async fn tail(&self, app: &str) -> Result<String, CommandError> {
		{
			let apps = self.apps.lock().await;
			select(&apps, Some(app))?;
		}
		Ok(self.shared.sink.tail(app).await.unwrap_or_default())
	}

	/// Stop everything and discard all apps.
	pub async fn shutdown(&self) {
		let apps = std::mem::take(&mut *self.apps.lock().await);
		let count: usize = apps.iter().map(|a| a.instances.len()).sum();
		tracing::info!("shutting down {} instance(s)", count);
		self.retire(apps).await;
	}

	async fn command(&self, target: Option<&str>, make: fn(Ack) -> Command) -> Result<Vec<AppStatus>, CommandError> {
		let senders: Vec<_> = {
			let apps = self.apps.lock().await;
			select(&apps, target)?.into_iter().flat_map(|a| a.senders()).collect()
		};
		dispatch(senders, make, self.shared.config.command_timeout).await?;
		self.status(target).await
	}

	fn register(&self, spec: AppSpec) -> ManagedApp {
		let spec = Arc::new(spec);
		let files = spec
			.log_files
			.resolve(&spec.name, &spec.working_directory, &self.shared.config.log_dir);
		let instances: Vec<InstanceHandle> = (0..spec.instance_count)
			.map(|id| instance::spawn(spec.clone(), id, files.clone(), self.shared.clone()))
			.collect();

		let (watcher, watch_error) = if spec.watch_enabled {
			match self.watch_app(&spec, &files, &instances) {
				Ok(task) => (Some(task), None),
				Err(e) => {
					tracing::warn!("{}: file watching disabled: {}", spec.name, e);
					(None, Some(e.to_string()))
				}
			}
		} else {
			(None, None)
		};

		tracing::debug!("{}: registered {} instance(s)", spec.name, instances.len());
		ManagedApp {
			spec,
			instances,
			watcher,
			watch_error,
		}
	}

	fn watch_app(
		&self,
		spec: &AppSpec,
		files: &ResolvedLogFiles,
		instances: &[InstanceHandle],
	) -> Result<JoinHandle<()>, WatchError> {
		let mut rules = IgnoreRules::compile(&spec.ignore_rules)?;
		// The app's own log files must not retrigger it.
		for path in files.all() {
			if let Ok(relative) = path.strip_prefix(&spec.working_directory) {
				let relative: PathBuf = relative
					.components()
					.filter(|c| !matches!(c, Component::CurDir))
					.collect();
				rules.add_literal(relative);
			}
		}

		let stream = watcher::watch(&spec.working_directory, rules)?;
		let senders = instances.iter().map(|i| i.commands.clone()).collect();
		Ok(tokio::spawn(forward_changes(
			spec.name.clone(),
			stream,
			senders,
			self.shared.config.watch_debounce,
		)))
	}

	/// Shut the given apps' instances down together, then release whatever is left.
	async fn retire(&self, apps: Vec<ManagedApp>) {
		if apps.is_empty() {
			return;
		}
		for app in &apps {
			if let Some(task) = &app.watcher {
				task.abort();
			}
		}

		let senders = apps.iter().flat_map(|a| a.senders()).collect();
		if let Err(e) = dispatch(senders, Command::Shutdown, self.shared.config.shutdown_deadline).await {
			tracing::warn!("shutdown incomplete: {}", e);
		}

		for app in apps {
			for handle in app.instances {
				if let Some(pid) = handle.snapshot().pid {
					tracing::warn!("{}: killing leftover pid {}", app.spec.name, pid);
					launcher::signal_group(pid, nix::sys::signal::Signal::SIGKILL);
				}
				handle.task.abort();
			}
		}
	}
}

fn select<'a>(apps: &'a [ManagedApp], target: Option<&str>) -> Result<Vec<&'a ManagedApp>, CommandError> {
	match target {
		None => Ok(apps.iter().collect()),
		Some(name) => apps
			.iter()
			.find(|a| a.spec.name == name)
			.map(|a| vec![a])
			.ok_or_else(|| CommandError::NotFound(vec![name.to_string()])),
	}
}

/// Queue one command per instance and wait until all of them are done.
async fn dispatch(
	senders: Vec<mpsc::Sender<Command>>,
	make: fn(Ack) -> Command,
	limit: Duration,
) -> Result<(), CommandError> {
	let work = async move {
		let mut pending = Vec::with_capacity(senders.len());
		for tx in senders {
			let (ack, done) = oneshot::channel();
			if tx.send(make(ack)).await.is_ok() {
				pending.push(done);
			}
		}
		for done in pending {
			let _ = done.await;
		}
	};
	tokio::time::timeout(limit, work)
		.await
		.map_err(|_| CommandError::Timeout(limit))
}

/// Coalesce bursts of changes and hand one event per burst to every instance.
async fn forward_changes(
	app: String,
	mut stream: ChangeStream,
	senders: Vec<mpsc::Sender<Command>>,
	debounce: Duration,
) {
	while let Some(first) = stream.next().await {
		let mut latest = first;
		let window = sleep(debounce);
		tokio::pin!(window);
		loop {
			tokio::select! {
				_ = &mut window => break,
				next = stream.next() => match next {
					Some(event) => latest = event,
					None => break,
				},
			}
		}

		tracing::debug!("{}: change under {}: {}", app, stream.root().display(), latest.path.display());
		for tx in &senders {
			let _ = tx.send(Command::FileChanged(latest.clone())).await;
		}
	}
}
