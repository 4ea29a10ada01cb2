use clap::Subcommand;

use crate::paths::DaemonPaths;

#[derive(Debug, Clone, Subcommand)]
pub enum DaemonCommand {
	/// Run the daemon in the foreground (used internally)
	Run,
	/// Start the daemon in the background
	Start,
	/// Stop the running daemon
	Stop,
	/// Show daemon status
	Status,
}

impl DaemonCommand {
	/// Handle `start`, `stop` and `status`. `run` must be handled by the
	/// application, which owns the request handler; `start_args` are the
	/// arguments that make the current binary run the daemon.
	pub fn execute(&self, paths: &DaemonPaths, start_args: &[String]) -> Result<(), String> {
		match self {
			DaemonCommand::Run => Err("the 'run' subcommand must be handled by the application".to_string()),
			DaemonCommand::Start => {
				let daemon = crate::Daemon {
					paths: paths.clone(),
				};
				daemon.start_background_with_args(start_args)?;
				eprintln!("daemon started");
				Ok(())
			}
			DaemonCommand::Stop => {
				let daemon = crate::Daemon {
					paths: paths.clone(),
				};
				daemon.stop()?;
				eprintln!("daemon stopping");
				Ok(())
			}
			DaemonCommand::Status => {
				if crate::client::is_running(paths) {
					match crate::client::read_pid(paths) {
						Some(pid) => eprintln!("daemon running (pid {})", pid),
						None => eprintln!("daemon running"),
					}
				} else {
					eprintln!("daemon not running");
				}
				Ok(())
			}
		}
	}
}
