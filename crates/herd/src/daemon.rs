use std::path::PathBuf;
use std::sync::Arc;

use herd_ipc::{Daemon, DaemonPaths};
use herd_supervisor::{config, AppStatus, CommandError, Supervisor, SupervisorContext};
use tokio::sync::Notify;
use tracing_subscriber::EnvFilter;

use crate::config::Settings;
use crate::protocol::{ErrorKind, Request, Response};

struct DaemonState {
	supervisor: Arc<Supervisor>,
	apps_path: PathBuf,
	profile: Option<String>,
	shutdown: Notify,
}

pub async fn run(paths: DaemonPaths, settings: Settings, apps_path: PathBuf, profile: Option<String>) {
	let filter = EnvFilter::try_from_env("HERD_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
	tracing_subscriber::fmt().with_env_filter(filter).init();

	let supervisor = Supervisor::new(
		settings.supervisor_config(&paths),
		SupervisorContext::from_process(profile.clone()),
	);
	tracing::info!(
		"apps file {} (profile: {})",
		apps_path.display(),
		profile.as_deref().unwrap_or("none")
	);

	let state = Arc::new(DaemonState {
		supervisor,
		apps_path,
		profile,
		shutdown: Notify::new(),
	});

	load_initial(&state).await;
	serve(paths, state).await;
}

/// Answer requests until a shutdown request or signal, then stop every app.
async fn serve(paths: DaemonPaths, state: Arc<DaemonState>) {
	let handler_state = Arc::clone(&state);
	let shutdown_state = Arc::clone(&state);
	Daemon { paths }
		.run_until(
			move |req: Request| {
				let state = Arc::clone(&handler_state);
				async move { handle_request(&state, req).await }
			},
			Some(|msg: String| Response::error(ErrorKind::InvalidRequest, msg)),
			async move { shutdown_state.shutdown.notified().await },
		)
		.await;

	state.supervisor.shutdown().await;
	tracing::info!("daemon stopped");
}

/// Register every valid app, stopped. Invalid apps are reported and skipped;
/// the command that auto-started the daemon decides what runs.
async fn load_initial(state: &DaemonState) {
	let raw = match config::read_file(&state.apps_path) {
		Ok(raw) => raw,
		Err(e) => {
			tracing::error!("{}", e);
			return;
		}
	};

	let mut apps = Vec::new();
	for result in config::load_each(&raw, state.profile.as_deref()) {
		match result {
			Ok(app) => apps.push(app),
			Err(e) => tracing::error!("skipping app: {}", e),
		}
	}
	state.supervisor.apply(apps).await;
}

async fn handle_request(state: &DaemonState, request: Request) -> Response {
	let supervisor = &state.supervisor;
	let status = |result: Result<Vec<AppStatus>, CommandError>| match result {
		Ok(apps) => Response::Status { apps },
		Err(e) => Response::from(e),
	};

	match request {
		Request::Ping => Response::Pong,
		Request::Start { app } => status(supervisor.start(app.as_deref()).await),
		Request::Stop { app } => status(supervisor.stop(app.as_deref()).await),
		Request::Restart { app } => status(supervisor.restart(app.as_deref()).await),
		Request::Status { app } => status(supervisor.status(app.as_deref()).await),
		Request::Logs { app } => match supervisor.tail(&app).await {
			Ok(text) => Response::Log { text },
			Err(e) => Response::from(e),
		},
		Request::Reload => match config::load_file(&state.apps_path, state.profile.as_deref()) {
			Ok(apps) => {
				let summary = supervisor.apply(apps).await;
				for name in &summary.added {
					if let Err(e) = supervisor.start(Some(name)).await {
						tracing::warn!("{}: start after reload failed: {}", name, e);
					}
				}
				Response::Reloaded { summary }
			}
			Err(e) => Response::error(ErrorKind::Config, e.to_string()),
		},
		Request::Shutdown => {
			state.shutdown.notify_one();
			Response::Ok {
				message: Some("shutting down".to_string()),
			}
		}
	}
}
