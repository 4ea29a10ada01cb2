mod config;
mod daemon;
mod protocol;

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use herd_ipc::clap::DaemonCommand;
use herd_ipc::{ClientError, DaemonClient, DaemonPaths};
use herd_supervisor::{AppSpec, AppStatus, ConfigError, Instance, InstanceState, ReloadSummary};
use owo_colors::OwoColorize;

use config::Settings;
use protocol::{ErrorKind, Request, Response};

const APP_NAME: &str = "herd";
/// Extra time the CLI gives the daemon on top of its own command timeout.
const CLIENT_SLACK: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[command(name = "herd", version, about = "Keep a herd of processes running")]
struct Cli {
	/// Apps file (default: defaults.apps, ./herd.toml, ~/.config/herd/apps.toml)
	#[arg(long, short = 'c', global = true, value_name = "PATH")]
	config: Option<PathBuf>,
	/// Environment profile to apply (default: defaults.profile)
	#[arg(long = "env", short = 'e', global = true, value_name = "PROFILE")]
	profile: Option<String>,
	#[command(subcommand)]
	command: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
	/// Start an app, or every app (starts the daemon if needed)
	Start { app: Option<String> },
	/// Stop an app, or every app
	Stop { app: Option<String> },
	/// Stop and start again
	Restart { app: Option<String> },
	/// Show instance state
	#[command(alias = "st")]
	Status { app: Option<String> },
	/// Re-read the apps file: add, replace and remove apps
	Reload,
	/// Print recent output of an app
	Logs { app: String },
	/// Manage the background daemon
	Daemon {
		#[command(subcommand)]
		command: DaemonCommand,
	},
}

#[derive(Debug, thiserror::Error)]
enum CliError {
	#[error("{0}")]
	Config(#[from] ConfigError),
	#[error("{0}")]
	Daemon(String),
	#[error("{message}")]
	Remote { kind: ErrorKind, message: String },
	#[error("{0}")]
	Client(#[from] ClientError),
	#[error("unexpected response from daemon")]
	Unexpected,
}

impl CliError {
	fn exit_code(&self) -> i32 {
		match self {
			CliError::Remote { kind: ErrorKind::NotFound, .. } => 2,
			CliError::Remote { kind: ErrorKind::Timeout, .. } | CliError::Client(ClientError::Timeout(_)) => 3,
			_ => 1,
		}
	}
}

/// Everything a command needs, resolved once from flags and the settings file.
struct Context {
	paths: DaemonPaths,
	settings: Settings,
	apps_path: PathBuf,
	profile: Option<String>,
}

impl Context {
	fn resolve(cli: &Cli) -> Self {
		let paths = DaemonPaths::new(APP_NAME);
		let settings = config::load_settings(&paths);
		let apps_path = settings.apps_path(cli.config.as_deref(), &paths);
		let profile = settings.profile(cli.profile.as_deref());
		Self {
			paths,
			settings,
			apps_path,
			profile,
		}
	}

	/// Arguments that make this binary run the daemon with the same apps file and profile.
	fn daemon_args(&self) -> Vec<String> {
		let mut args = vec!["--config".to_string(), self.apps_path.to_string_lossy().into_owned()];
		if let Some(profile) = &self.profile {
			args.push("--env".to_string());
			args.push(profile.clone());
		}
		args.push("daemon".to_string());
		args.push("run".to_string());
		args
	}

	fn client_timeout(&self) -> Duration {
		self.settings.command_timeout() + CLIENT_SLACK
	}

	fn connect(&self) -> Result<DaemonClient<Request, Response>, CliError> {
		Ok(DaemonClient::connect(&self.paths)?.with_timeout(self.client_timeout())?)
	}

	fn connect_if_running(&self) -> Result<Option<DaemonClient<Request, Response>>, CliError> {
		match DaemonClient::connect(&self.paths) {
			Ok(client) => Ok(Some(client.with_timeout(self.client_timeout())?)),
			Err(ClientError::NotRunning) => Ok(None),
			Err(e) => Err(e.into()),
		}
	}

	fn ensure(&self) -> Result<DaemonClient<Request, Response>, CliError> {
		let client = herd_ipc::ensure_daemon_with_args(&self.paths, &self.daemon_args())?;
		Ok(client.with_timeout(self.client_timeout())?)
	}
}

fn main() {
	let cli = Cli::parse();
	let ctx = Context::resolve(&cli);

	if let Err(e) = run(cli.command, &ctx) {
		eprintln!("{} {}", "error:".red().bold(), e);
		std::process::exit(e.exit_code());
	}
}

fn run(command: Cmd, ctx: &Context) -> Result<(), CliError> {
	match command {
		Cmd::Start { app } => {
			configured_apps(ctx, app.as_deref())?;
			let apps = expect_status(ctx.ensure()?.send(&Request::Start { app })?)?;
			render_status(&apps);
			Ok(())
		}
		Cmd::Stop { app } => {
			let specs = configured_apps(ctx, app.as_deref())?;
			// Without a daemon nothing runs, so there is nothing to stop.
			let apps = match ctx.connect_if_running()? {
				Some(mut client) => expect_status(client.send(&Request::Stop { app })?)?,
				None => offline_status(&specs, app.as_deref()),
			};
			render_status(&apps);
			Ok(())
		}
		Cmd::Restart { app } => {
			configured_apps(ctx, app.as_deref())?;
			let apps = expect_status(ctx.ensure()?.send(&Request::Restart { app })?)?;
			render_status(&apps);
			Ok(())
		}
		Cmd::Status { app } => {
			let specs = configured_apps(ctx, app.as_deref())?;
			let apps = match ctx.connect_if_running()? {
				Some(mut client) => expect_status(client.send(&Request::Status { app })?)?,
				None => {
					eprintln!("{} daemon not running", "○".dimmed());
					offline_status(&specs, app.as_deref())
				}
			};
			if apps.is_empty() {
				eprintln!("no apps in {}", ctx.apps_path.display());
			}
			render_status(&apps);
			Ok(())
		}
		Cmd::Reload => {
			configured_apps(ctx, None)?;
			match ctx.connect()?.send(&Request::Reload)? {
				Response::Reloaded { summary } => {
					print_summary(&summary);
					Ok(())
				}
				other => Err(unexpected(other)),
			}
		}
		Cmd::Logs { app } => {
			configured_apps(ctx, Some(&app))?;
			let Some(mut client) = ctx.connect_if_running()? else {
				eprintln!("{} daemon not running, no output captured", "○".dimmed());
				return Ok(());
			};
			match client.send(&Request::Logs { app })? {
				Response::Log { text } => {
					print!("{}", text);
					Ok(())
				}
				other => Err(unexpected(other)),
			}
		}
		Cmd::Daemon { command } => cmd_daemon(ctx, command),
	}
}

/// Load the apps file and check that `target` names one of its apps, so a
/// broken file or an unknown name is reported before the daemon is involved.
fn configured_apps(ctx: &Context, target: Option<&str>) -> Result<Vec<AppSpec>, CliError> {
	let apps = herd_supervisor::config::load_file(&ctx.apps_path, ctx.profile.as_deref())?;
	if let Some(name) = target {
		if !apps.iter().any(|a| a.name == name) {
			return Err(CliError::Remote {
				kind: ErrorKind::NotFound,
				message: format!("app not found: {}", name),
			});
		}
	}
	Ok(apps)
}

/// Status as it is when no daemon runs: every instance stopped.
fn offline_status(specs: &[AppSpec], target: Option<&str>) -> Vec<AppStatus> {
	specs
		.iter()
		.filter(|spec| target.map_or(true, |name| spec.name == name))
		.map(|spec| AppStatus {
			name: spec.name.clone(),
			watch_enabled: spec.watch_enabled,
			watch_error: None,
			instances: (0..spec.instance_count).map(Instance::new).collect(),
		})
		.collect()
}

fn cmd_daemon(ctx: &Context, command: DaemonCommand) -> Result<(), CliError> {
	match command {
		DaemonCommand::Run => {
			let runtime = tokio::runtime::Runtime::new().map_err(|e| CliError::Daemon(e.to_string()))?;
			runtime.block_on(daemon::run(
				ctx.paths.clone(),
				ctx.settings.clone(),
				ctx.apps_path.clone(),
				ctx.profile.clone(),
			));
			Ok(())
		}
		other => other.execute(&ctx.paths, &ctx.daemon_args()).map_err(CliError::Daemon),
	}
}

fn expect_status(response: Response) -> Result<Vec<AppStatus>, CliError> {
	match response {
		Response::Status { apps } => Ok(apps),
		other => Err(unexpected(other)),
	}
}

fn unexpected(response: Response) -> CliError {
	match response {
		Response::Error { kind, message } => CliError::Remote { kind, message },
		_ => CliError::Unexpected,
	}
}

// --- Rendering ---

fn render_status(apps: &[AppStatus]) {
	let name_width = apps
		.iter()
		.flat_map(|a| a.instances.iter().map(move |i| instance_label(a, i).len()))
		.max()
		.unwrap_or(0);

	for app in apps {
		for inst in &app.instances {
			print_instance_line(app, inst, name_width);
		}
		if let Some(err) = &app.watch_error {
			println!("  {} {}: watch disabled: {}", "!".yellow(), app.name, err);
		}
	}
}

fn instance_label(app: &AppStatus, inst: &Instance) -> String {
	if app.instances.len() == 1 {
		app.name.clone()
	} else {
		format!("{}[{}]", app.name, inst.instance_id)
	}
}

fn print_instance_line(app: &AppStatus, inst: &Instance, name_width: usize) {
	let (circle, label) = match inst.state {
		InstanceState::Running => ("●".green().to_string(), "on".green().to_string()),
		InstanceState::Starting => ("◐".cyan().to_string(), "starting".cyan().to_string()),
		InstanceState::Stopping => ("◑".cyan().to_string(), "stopping".cyan().to_string()),
		InstanceState::Stopped => ("●".red().to_string(), "off".red().to_string()),
		InstanceState::Crashed => ("●".yellow().to_string(), "crashed".yellow().to_string()),
		InstanceState::RestartBackoff => ("●".yellow().to_string(), "backoff".yellow().to_string()),
	};
	let uptime = inst.uptime_secs().map(format_uptime).unwrap_or_else(|| "-".to_string());
	let pid = inst.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string());
	let memory = inst.memory_bytes.map(format_bytes).unwrap_or_else(|| "-".to_string());
	let restarts = format!("↺{}", inst.restart_count);

	let mut detail = String::new();
	if !inst.state.is_active() {
		if let Some(exit) = &inst.last_exit {
			detail.push_str(&format!(" last {}", exit));
		}
	}
	if let Some(err) = &inst.last_error {
		detail.push_str(&format!(" {}", err.dimmed()));
	}

	println!(
		"{} {:<width$} {:<8} {:<8} {:<7} {:<4} {}{}",
		circle,
		instance_label(app, inst),
		uptime,
		pid,
		memory,
		restarts,
		label,
		detail,
		width = name_width
	);
}

fn print_summary(summary: &ReloadSummary) {
	let groups = [
		("added", &summary.added),
		("replaced", &summary.replaced),
		("removed", &summary.removed),
		("unchanged", &summary.unchanged),
	];
	for (label, names) in groups {
		if !names.is_empty() {
			eprintln!("{:<9} {}", label.bold(), names.join(", "));
		}
	}
}

fn format_uptime(secs: u64) -> String {
	if secs < 60 {
		format!("{}s", secs)
	} else if secs < 3600 {
		let m = secs / 60;
		let s = secs % 60;
		if s == 0 { format!("{}m", m) } else { format!("{}m{}s", m, s) }
	} else if secs < 86400 {
		let h = secs / 3600;
		let m = (secs % 3600) / 60;
		if m == 0 { format!("{}h", h) } else { format!("{}h{}m", h, m) }
	} else {
		let d = secs / 86400;
		let h = (secs % 86400) / 3600;
		if h == 0 { format!("{}d", d) } else { format!("{}d{}h", d, h) }
	}
}

fn format_bytes(bytes: u64) -> String {
	const UNITS: [&str; 4] = ["B", "K", "M", "G"];
	let mut value = bytes as f64;
	let mut unit = 0;
	while value >= 1024.0 && unit < UNITS.len() - 1 {
		value /= 1024.0;
		unit += 1;
	}
	if unit == 0 {
		format!("{}B", bytes)
	} else {
		format!("{:.1}{}", value, UNITS[unit])
	}
}
