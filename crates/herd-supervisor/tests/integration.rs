use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use herd_supervisor::config::{self, AppSpec};
use herd_supervisor::types::*;
use herd_supervisor::{CommandError, MemoryProbe, Supervisor, SupervisorConfig, SupervisorContext};
use tokio::sync::broadcast;

use herd_supervisor::types::InstanceState::*;

static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

fn temp_dir(name: &str) -> PathBuf {
	let n = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
	let dir = std::env::temp_dir().join(format!("herd-test-{}-{}-{}", std::process::id(), n, name));
	let _ = std::fs::remove_dir_all(&dir);
	let _ = std::fs::create_dir_all(&dir);
	dir.canonicalize().unwrap_or(dir)
}

fn fast_config(log_dir: &Path) -> SupervisorConfig {
	SupervisorConfig {
		log_dir: log_dir.to_path_buf(),
		poll_interval: Duration::from_millis(100),
		sample_timeout: Duration::from_secs(1),
		start_grace: Duration::from_millis(200),
		kill_timeout: Duration::from_millis(500),
		backoff_base: Duration::from_millis(50),
		backoff_max: Duration::from_millis(500),
		stable_uptime: Duration::from_secs(60),
		watch_debounce: Duration::from_millis(150),
		command_timeout: Duration::from_secs(10),
		shutdown_deadline: Duration::from_secs(5),
	}
}

fn test_supervisor(name: &str, profile: Option<&str>) -> (Arc<Supervisor>, PathBuf) {
	let log_dir = temp_dir(name);
	let sup = Supervisor::new(
		fast_config(&log_dir),
		SupervisorContext::from_process(profile.map(str::to_string)),
	);
	(sup, log_dir)
}

fn tuned_supervisor(name: &str, tune: impl FnOnce(&mut SupervisorConfig)) -> (Arc<Supervisor>, PathBuf) {
	let log_dir = temp_dir(name);
	let mut config = fast_config(&log_dir);
	tune(&mut config);
	(Supervisor::new(config, SupervisorContext::from_process(None)), log_dir)
}

/// Write `run.sh` into `dir` and load a single app definition around it.
fn sh_app(dir: &Path, name: &str, script: &str, extra: &str) -> AppSpec {
	std::fs::write(dir.join("run.sh"), script).unwrap();
	let toml = format!(
		"[[apps]]\nname = {:?}\nscript = \"run.sh\"\ninterpreter = \"sh\"\ncwd = {:?}\n{}\n",
		name,
		dir.to_string_lossy(),
		extra
	);
	let raw = config::parse_str(&toml, Path::new("apps.toml")).unwrap();
	config::load(&raw, None).unwrap().remove(0)
}

async fn instances(sup: &Supervisor, app: &str) -> Vec<Instance> {
	sup.status(Some(app)).await.unwrap().remove(0).instances
}

async fn wait_until(sup: &Supervisor, app: &str, pred: impl Fn(&[Instance]) -> bool) -> Vec<Instance> {
	for _ in 0..100 {
		let current = instances(sup, app).await;
		if pred(&current) {
			return current;
		}
		tokio::time::sleep(Duration::from_millis(50)).await;
	}
	let current = instances(sup, app).await;
	panic!("condition not reached, last status: {:?}", current);
}

/// Collect transitions until `from -> to` is seen.
async fn transitions_until(
	rx: &mut broadcast::Receiver<Transition>,
	from: InstanceState,
	to: InstanceState,
) -> Vec<(InstanceState, InstanceState)> {
	let mut seen = Vec::new();
	loop {
		let t = tokio::time::timeout(Duration::from_secs(10), rx.recv())
			.await
			.unwrap_or_else(|_| panic!("no {} -> {} transition, saw {:?}", from, to, seen))
			.expect("transition channel closed");
		seen.push((t.from, t.to));
		if t.from == from && t.to == to {
			return seen;
		}
	}
}

/// Transitions observed within `window`.
async fn transitions_for(rx: &mut broadcast::Receiver<Transition>, window: Duration) -> Vec<(InstanceState, InstanceState)> {
	let mut seen = Vec::new();
	let deadline = tokio::time::Instant::now() + window;
	while let Ok(Ok(t)) = tokio::time::timeout_at(deadline, rx.recv()).await {
		seen.push((t.from, t.to));
	}
	seen
}

fn pid_alive(pid: u32) -> bool {
	nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
}

// --- Expansion ---

proptest::proptest! {
	#![proptest_config(proptest::prelude::ProptestConfig::with_cases(8))]

	#[test]
	fn instances_indexed_from_zero(count in 1usize..6) {
		let rt = tokio::runtime::Runtime::new().unwrap();
		rt.block_on(async {
			let (sup, log_dir) = test_supervisor("expand", None);
			let dir = temp_dir("expand-workdir");
			let app = sh_app(&dir, "web", "sleep 30\n", &format!("instances = {}", count));

			sup.apply(vec![app]).await;
			let list = instances(&sup, "web").await;
			let ids: Vec<usize> = list.iter().map(|i| i.instance_id).collect();
			assert_eq!(ids, (0..count).collect::<Vec<_>>());
			assert!(list.iter().all(|i| i.state == Stopped && i.pid.is_none()));

			sup.shutdown().await;
			let _ = std::fs::remove_dir_all(&log_dir);
			let _ = std::fs::remove_dir_all(&dir);
		});
	}
}

// --- Start / stop ---

#[tokio::test]
async fn start_and_stop_all_instances() {
	let (sup, log_dir) = test_supervisor("start-stop", None);
	let dir = temp_dir("start-stop-workdir");
	sup.apply(vec![sh_app(&dir, "sleeper", "sleep 30\n", "instances = 2")]).await;

	let status = sup.start(None).await.unwrap();
	assert_eq!(status.len(), 1);
	assert!(status[0].instances.iter().all(|i| i.state == Running && i.pid.is_some()));
	let pids: Vec<u32> = status[0].instances.iter().filter_map(|i| i.pid).collect();
	assert_eq!(pids.len(), 2);
	assert_ne!(pids[0], pids[1]);

	// Starting again leaves the running children alone.
	let again = sup.start(Some("sleeper")).await.unwrap();
	let again_pids: Vec<u32> = again[0].instances.iter().filter_map(|i| i.pid).collect();
	assert_eq!(pids, again_pids);

	let stopped = sup.stop(Some("sleeper")).await.unwrap();
	assert!(stopped[0].instances.iter().all(|i| i.state == Stopped && i.pid.is_none()));
	for pid in pids {
		assert!(!pid_alive(pid), "pid {} still alive", pid);
	}

	// Stopping a stopped app is a no-op.
	let mut rx = sup.subscribe();
	sup.stop(Some("sleeper")).await.unwrap();
	assert!(transitions_for(&mut rx, Duration::from_millis(200)).await.is_empty());

	sup.shutdown().await;
	let _ = std::fs::remove_dir_all(&log_dir);
	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn unknown_app_is_not_found() {
	let (sup, log_dir) = test_supervisor("not-found", None);

	let err = sup.start(Some("ghost")).await.unwrap_err();
	assert!(matches!(err, CommandError::NotFound(ref names) if names == &["ghost".to_string()]));
	assert!(matches!(sup.status(Some("ghost")).await, Err(CommandError::NotFound(_))));
	assert!(matches!(sup.tail("ghost").await, Err(CommandError::NotFound(_))));

	let _ = std::fs::remove_dir_all(&log_dir);
}

// --- Exits and restart policy ---

#[tokio::test]
async fn crash_without_autorestart_stays_stopped() {
	let (sup, log_dir) = test_supervisor("no-autorestart", None);
	let dir = temp_dir("no-autorestart-workdir");
	sup.apply(vec![sh_app(&dir, "flaky", "sleep 0.5\nexit 3\n", "autorestart = false")]).await;

	let mut rx = sup.subscribe();
	sup.start(None).await.unwrap();
	let seen = transitions_until(&mut rx, Crashed, Stopped).await;
	assert!(seen.contains(&(Running, Crashed)), "saw {:?}", seen);

	tokio::time::sleep(Duration::from_millis(500)).await;
	let inst = &instances(&sup, "flaky").await[0];
	assert_eq!(inst.state, Stopped);
	assert_eq!(inst.last_exit_code, Some(3));
	assert_eq!(inst.restart_count, 0);
	assert!(inst.last_error.as_deref().unwrap_or("").contains("exit code 3"));

	sup.shutdown().await;
	let _ = std::fs::remove_dir_all(&log_dir);
	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn crash_with_autorestart_backs_off_and_relaunches() {
	let (sup, log_dir) = test_supervisor("autorestart", None);
	let dir = temp_dir("autorestart-workdir");
	sup.apply(vec![sh_app(&dir, "flaky", "sleep 0.3\nexit 1\n", "")]).await;

	let mut rx = sup.subscribe();
	sup.start(None).await.unwrap();
	transitions_until(&mut rx, Running, Crashed).await;
	let seen = transitions_until(&mut rx, RestartBackoff, Starting).await;
	assert_eq!(seen, vec![(Crashed, RestartBackoff), (RestartBackoff, Starting)]);

	let inst = wait_until(&sup, "flaky", |i| i[0].restart_count >= 1).await;
	assert_eq!(inst[0].last_exit_code, Some(1));

	sup.shutdown().await;
	let _ = std::fs::remove_dir_all(&log_dir);
	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn restart_count_resets_after_stable_uptime() {
	let (sup, log_dir) = tuned_supervisor("stable", |c| c.stable_uptime = Duration::from_millis(500));
	let dir = temp_dir("stable-workdir");
	// First run dies after the grace period, every later run stays up.
	let script = "if [ -e crashed-once ]; then exec sleep 30; fi\ntouch crashed-once\nsleep 0.3\nexit 2\n";
	sup.apply(vec![sh_app(&dir, "recovering", script, "autorestart = true")]).await;

	let mut rx = sup.subscribe();
	sup.start(None).await.unwrap();
	transitions_until(&mut rx, Running, Crashed).await;
	transitions_until(&mut rx, Starting, Running).await;

	let inst = &instances(&sup, "recovering").await[0];
	assert_eq!(inst.restart_count, 1);
	assert_eq!(inst.last_exit_code, Some(2));

	let inst = wait_until(&sup, "recovering", |i| i[0].restart_count == 0).await;
	assert_eq!(inst[0].state, Running);
	assert!(inst[0].pid.is_some());

	sup.shutdown().await;
	let _ = std::fs::remove_dir_all(&log_dir);
	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn flapping_app_keeps_counting() {
	let (sup, log_dir) = tuned_supervisor("flapping", |c| c.stable_uptime = Duration::from_millis(500));
	let dir = temp_dir("flapping-workdir");
	sup.apply(vec![sh_app(&dir, "flapper", "sleep 0.3\nexit 1\n", "")]).await;

	sup.start(None).await.unwrap();
	let inst = wait_until(&sup, "flapper", |i| i[0].restart_count >= 3).await;
	assert!(inst[0].restart_count >= 3);

	sup.shutdown().await;
	let _ = std::fs::remove_dir_all(&log_dir);
	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn clean_exit_is_stopped_not_crashed() {
	let (sup, log_dir) = test_supervisor("clean-exit", None);
	let dir = temp_dir("clean-exit-workdir");
	sup.apply(vec![sh_app(&dir, "once", "sleep 0.4\necho done\n", "autorestart = false")]).await;

	let mut rx = sup.subscribe();
	sup.start(None).await.unwrap();
	let seen = transitions_until(&mut rx, Running, Stopped).await;
	assert!(!seen.iter().any(|(_, to)| *to == Crashed), "saw {:?}", seen);

	let inst = &instances(&sup, "once").await[0];
	assert_eq!(inst.last_exit_code, Some(0));
	assert!(inst.last_error.is_none());

	sup.shutdown().await;
	let _ = std::fs::remove_dir_all(&log_dir);
	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn exit_during_start_grace_is_a_crash() {
	let (sup, log_dir) = test_supervisor("early-exit", None);
	let dir = temp_dir("early-exit-workdir");
	sup.apply(vec![sh_app(&dir, "early", "exit 0\n", "autorestart = false")]).await;

	let mut rx = sup.subscribe();
	sup.start(None).await.unwrap();
	let seen = transitions_until(&mut rx, Crashed, Stopped).await;
	assert_eq!(seen, vec![(Stopped, Starting), (Starting, Crashed), (Crashed, Stopped)]);

	let inst = &instances(&sup, "early").await[0];
	assert!(inst.last_error.as_deref().unwrap_or("").contains("startup"));

	sup.shutdown().await;
	let _ = std::fs::remove_dir_all(&log_dir);
	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn launch_failure_records_error() {
	let (sup, log_dir) = test_supervisor("launch-fail", None);
	let dir = temp_dir("launch-fail-workdir");
	let mut app = sh_app(&dir, "broken", "sleep 30\n", "autorestart = false");
	app.interpreter = "herd-no-such-interpreter".into();
	sup.apply(vec![app]).await;

	let mut rx = sup.subscribe();
	sup.start(None).await.unwrap();
	let seen = transitions_until(&mut rx, Crashed, Stopped).await;
	assert_eq!(seen, vec![(Stopped, Starting), (Starting, Crashed), (Crashed, Stopped)]);

	let inst = &instances(&sup, "broken").await[0];
	let error = inst.last_error.clone().unwrap_or_default();
	assert!(error.contains("herd-no-such-interpreter"), "error was {:?}", error);
	assert!(inst.pid.is_none());

	sup.shutdown().await;
	let _ = std::fs::remove_dir_all(&log_dir);
	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn manual_restart_does_not_count() {
	let (sup, log_dir) = test_supervisor("manual-restart", None);
	let dir = temp_dir("manual-restart-workdir");
	sup.apply(vec![sh_app(&dir, "svc", "sleep 30\n", "")]).await;

	let before = sup.start(None).await.unwrap()[0].instances[0].pid;
	let mut rx = sup.subscribe();
	let after = sup.restart(Some("svc")).await.unwrap();

	let inst = &after[0].instances[0];
	assert_eq!(inst.state, Running);
	assert_eq!(inst.restart_count, 0);
	assert_ne!(inst.pid, before);

	let seen = transitions_until(&mut rx, Starting, Running).await;
	assert_eq!(seen, vec![(Running, Stopping), (Stopping, Starting), (Starting, Running)]);

	sup.shutdown().await;
	let _ = std::fs::remove_dir_all(&log_dir);
	let _ = std::fs::remove_dir_all(&dir);
}

// --- Memory threshold ---

struct Bloated;

impl MemoryProbe for Bloated {
	fn probe(&self, _pid: u32) -> Option<u64> {
		Some(2 * 1024 * 1024 * 1024)
	}
}

#[tokio::test]
async fn memory_breach_restarts_through_crash() {
	let log_dir = temp_dir("memory");
	let dir = temp_dir("memory-workdir");
	let sup = Supervisor::with_probe(
		fast_config(&log_dir),
		SupervisorContext::from_process(None),
		Arc::new(Bloated),
	);
	sup.apply(vec![sh_app(&dir, "hog", "sleep 30\n", "max_memory_restart = \"1G\"")]).await;

	let mut rx = sup.subscribe();
	sup.start(None).await.unwrap();
	let seen = transitions_until(&mut rx, RestartBackoff, Starting).await;
	let from_running = seen.iter().position(|t| *t == (Running, Stopping)).expect("never stopped");
	assert_eq!(
		&seen[from_running..],
		&[
			(Running, Stopping),
			(Stopping, Stopped),
			(Stopped, Crashed),
			(Crashed, RestartBackoff),
			(RestartBackoff, Starting),
		]
	);

	let inst = &instances(&sup, "hog").await[0];
	assert!(inst.restart_count >= 1);
	assert!(inst.last_error.as_deref().unwrap_or("").contains("memory"));

	sup.shutdown().await;
	let _ = std::fs::remove_dir_all(&log_dir);
	let _ = std::fs::remove_dir_all(&dir);
}

// --- Environment and logs ---

#[tokio::test]
async fn profile_env_reaches_child() {
	let (sup, log_dir) = test_supervisor("profile", Some("production"));
	let dir = temp_dir("profile-workdir");
	let app = sh_app(
		&dir,
		"api",
		"echo \"PORT=$PORT FLAG=$USE_FEATURE APP=$HERD_APP INSTANCE=$HERD_INSTANCE\"\nsleep 30\n",
		"out_file = \"logs/out.log\"\n\
		 [apps.env]\nUSE_FEATURE = true\n\
		 [apps.profiles.development]\nPORT = 8000\n\
		 [apps.profiles.production]\nPORT = 8001\n",
	);
	sup.apply(vec![app]).await;
	sup.start(None).await.unwrap();

	let out_path = dir.join("logs/out.log");
	let mut content = String::new();
	for _ in 0..50 {
		content = std::fs::read_to_string(&out_path).unwrap_or_default();
		if content.contains("PORT=") {
			break;
		}
		tokio::time::sleep(Duration::from_millis(100)).await;
	}
	assert!(content.contains("PORT=8001 FLAG=true APP=api INSTANCE=0"), "out was: {:?}", content);

	let tail = sup.tail("api").await.unwrap();
	assert!(tail.contains("PORT=8001"));

	sup.shutdown().await;
	let _ = std::fs::remove_dir_all(&log_dir);
	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn default_log_files_under_log_dir() {
	let (sup, log_dir) = test_supervisor("default-logs", None);
	let dir = temp_dir("default-logs-workdir");
	sup.apply(vec![sh_app(&dir, "chatty", "echo to-out\necho to-err >&2\nsleep 30\n", "")]).await;
	sup.start(None).await.unwrap();

	let out = log_dir.join("chatty-out.log");
	let err = log_dir.join("chatty-error.log");
	for _ in 0..50 {
		if std::fs::read_to_string(&err).unwrap_or_default().contains("to-err") {
			break;
		}
		tokio::time::sleep(Duration::from_millis(100)).await;
	}
	assert_eq!(std::fs::read_to_string(&out).unwrap_or_default(), "to-out\n");
	assert_eq!(std::fs::read_to_string(&err).unwrap_or_default(), "to-err\n");

	sup.shutdown().await;
	let _ = std::fs::remove_dir_all(&log_dir);
	let _ = std::fs::remove_dir_all(&dir);
}

// --- File watching ---

#[tokio::test]
async fn ignored_change_does_not_restart_but_real_change_does_once() {
	let (sup, log_dir) = test_supervisor("watch", None);
	let dir = temp_dir("watch-workdir");
	std::fs::create_dir_all(dir.join("app")).unwrap();
	std::fs::create_dir_all(dir.join("logs")).unwrap();
	sup.apply(vec![sh_app(
		&dir,
		"api",
		"sleep 30\n",
		"watch = true\nignore_watch = [\"**/*.pdf\", \"logs\"]",
	)])
	.await;

	let status = sup.start(None).await.unwrap();
	assert!(status[0].watch_enabled && status[0].watch_error.is_none());
	let pid = status[0].instances[0].pid;
	let mut rx = sup.subscribe();

	std::fs::write(dir.join("app/report.pdf"), b"%PDF-1.4").unwrap();
	std::fs::write(dir.join("logs/noise.log"), b"noise\n").unwrap();
	let quiet = transitions_for(&mut rx, Duration::from_millis(800)).await;
	assert!(quiet.is_empty(), "ignored change caused {:?}", quiet);
	assert_eq!(instances(&sup, "api").await[0].pid, pid);

	std::fs::write(dir.join("app/main.py"), b"print('v2')\n").unwrap();
	let seen = transitions_until(&mut rx, Starting, Running).await;
	assert_eq!(seen, vec![(Running, Stopping), (Stopping, Starting), (Starting, Running)]);

	let after = transitions_for(&mut rx, Duration::from_millis(800)).await;
	assert!(after.is_empty(), "restarted more than once: {:?}", after);
	let inst = &instances(&sup, "api").await[0];
	assert_eq!(inst.restart_count, 0);
	assert_ne!(inst.pid, pid);

	sup.shutdown().await;
	let _ = std::fs::remove_dir_all(&log_dir);
	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn own_log_files_do_not_trigger_restart() {
	let (sup, log_dir) = test_supervisor("watch-own-logs", None);
	let dir = temp_dir("watch-own-logs-workdir");
	sup.apply(vec![sh_app(
		&dir,
		"ticker",
		"while true; do echo tick; sleep 0.1; done\n",
		"watch = true\nout_file = \"./out.log\"\nlog_file = \"combined.log\"\ntime = true",
	)])
	.await;

	sup.start(None).await.unwrap();
	let mut rx = sup.subscribe();
	let seen = transitions_for(&mut rx, Duration::from_secs(1)).await;
	assert!(seen.is_empty(), "log writes caused {:?}", seen);

	let combined = std::fs::read_to_string(dir.join("combined.log")).unwrap_or_default();
	let first = combined.lines().next().unwrap_or_default();
	assert!(first.ends_with(": tick"), "combined line was {:?}", first);

	sup.shutdown().await;
	let _ = std::fs::remove_dir_all(&log_dir);
	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn change_during_start_grace_restarts_once_running() {
	let (sup, log_dir) = tuned_supervisor("watch-grace", |c| c.start_grace = Duration::from_millis(1000));
	let dir = temp_dir("watch-grace-workdir");
	sup.apply(vec![sh_app(&dir, "api", "sleep 30\n", "watch = true")]).await;

	let mut rx = sup.subscribe();
	let handle = {
		let sup = sup.clone();
		tokio::spawn(async move { sup.start(None).await })
	};
	transitions_until(&mut rx, Stopped, Starting).await;
	std::fs::write(dir.join("main.py"), b"print('v2')\n").unwrap();

	let seen = transitions_until(&mut rx, Stopping, Starting).await;
	assert_eq!(seen, vec![(Starting, Running), (Running, Stopping), (Stopping, Starting)]);
	transitions_until(&mut rx, Starting, Running).await;
	handle.await.unwrap().unwrap();

	let after = transitions_for(&mut rx, Duration::from_millis(800)).await;
	assert!(after.is_empty(), "restarted more than once: {:?}", after);
	assert_eq!(instances(&sup, "api").await[0].restart_count, 0);

	sup.shutdown().await;
	let _ = std::fs::remove_dir_all(&log_dir);
	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn instances_sharing_a_log_never_split_lines() {
	let (sup, log_dir) = test_supervisor("shared-log", None);
	let dir = temp_dir("shared-log-workdir");
	let script = concat!(
		"pad=$(printf '%0300d' 0)\n",
		"i=0\n",
		"while [ $i -lt 400 ]; do\n",
		"  echo \"<$HERD_INSTANCE:$i:$pad>\"\n",
		"  i=$((i+1))\n",
		"done\n",
		"exec sleep 30\n",
	);
	sup.apply(vec![sh_app(
		&dir,
		"chatty",
		script,
		"instances = 3\nlog_file = \"all.log\"",
	)])
	.await;
	sup.start(None).await.unwrap();

	let combined = dir.join("all.log");
	let mut content = String::new();
	for _ in 0..100 {
		content = std::fs::read_to_string(&combined).unwrap_or_default();
		if content.lines().count() >= 1200 {
			break;
		}
		tokio::time::sleep(Duration::from_millis(50)).await;
	}

	let pad = "0".repeat(300);
	let mut per_instance = [0usize; 3];
	for line in content.lines() {
		let body = line
			.strip_prefix('<')
			.and_then(|l| l.strip_suffix('>'))
			.unwrap_or_else(|| panic!("torn line: {:?}", line));
		let parts: Vec<&str> = body.split(':').collect();
		assert_eq!(parts.len(), 3, "torn line: {:?}", line);
		assert_eq!(parts[2], pad, "torn line: {:?}", line);
		let id: usize = parts[0].parse().unwrap();
		assert_eq!(parts[1].parse::<usize>().unwrap(), per_instance[id], "out of order: {:?}", line);
		per_instance[id] += 1;
	}
	assert_eq!(per_instance, [400, 400, 400]);

	sup.shutdown().await;
	let _ = std::fs::remove_dir_all(&log_dir);
	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn missing_watch_root_is_reported() {
	let (sup, log_dir) = test_supervisor("watch-missing", None);
	let dir = temp_dir("watch-missing-workdir");
	let mut app = sh_app(&dir, "gone", "sleep 30\n", "watch = true");
	app.working_directory = dir.join("does-not-exist");
	sup.apply(vec![app]).await;

	let status = sup.status(Some("gone")).await.unwrap();
	assert!(status[0].watch_error.is_some());

	sup.shutdown().await;
	let _ = std::fs::remove_dir_all(&log_dir);
	let _ = std::fs::remove_dir_all(&dir);
}

// --- Reload and shutdown ---

#[tokio::test]
async fn apply_adds_replaces_and_removes() {
	let (sup, log_dir) = test_supervisor("reload", None);
	let dir_a = temp_dir("reload-a");
	let dir_b = temp_dir("reload-b");
	let a = sh_app(&dir_a, "a", "sleep 30\n", "");
	let b = sh_app(&dir_b, "b", "sleep 30\n", "");

	let first = sup.apply(vec![a.clone(), b.clone()]).await;
	assert_eq!(first.added, vec!["a".to_string(), "b".to_string()]);
	sup.start(Some("a")).await.unwrap();
	let old_pid = instances(&sup, "a").await[0].pid;

	let mut a2 = a.clone();
	a2.args = vec!["--changed".into()];
	let second = sup.apply(vec![a2]).await;
	assert_eq!(second.replaced, vec!["a".to_string()]);
	assert_eq!(second.removed, vec!["b".to_string()]);
	assert!(second.added.is_empty() && second.unchanged.is_empty());

	// A running app that was replaced comes back up with a new child.
	let inst = &instances(&sup, "a").await[0];
	assert_eq!(inst.state, Running);
	assert_ne!(inst.pid, old_pid);
	assert!(matches!(sup.status(Some("b")).await, Err(CommandError::NotFound(_))));

	sup.shutdown().await;
	let _ = std::fs::remove_dir_all(&log_dir);
	let _ = std::fs::remove_dir_all(&dir_a);
	let _ = std::fs::remove_dir_all(&dir_b);
}

#[tokio::test]
async fn status_answers_while_removed_app_winds_down() {
	let (sup, log_dir) = test_supervisor("reload-busy", None);
	let dir = temp_dir("reload-busy-workdir");
	let stubborn = sh_app(
		&dir,
		"stubborn",
		"trap '' TERM\nwhile true; do sleep 0.1; done\n",
		"kill_timeout = 1500",
	);
	sup.apply(vec![stubborn]).await;
	sup.start(None).await.unwrap();

	let applying = {
		let sup = sup.clone();
		tokio::spawn(async move { sup.apply(Vec::new()).await })
	};
	tokio::time::sleep(Duration::from_millis(200)).await;

	let asked = tokio::time::Instant::now();
	let status = sup.status(None).await.unwrap();
	assert!(asked.elapsed() < Duration::from_millis(500), "status waited {:?}", asked.elapsed());
	assert!(status.is_empty());

	let summary = applying.await.unwrap();
	assert_eq!(summary.removed, vec!["stubborn".to_string()]);

	sup.shutdown().await;
	let _ = std::fs::remove_dir_all(&log_dir);
	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn shutdown_stops_every_child() {
	let (sup, log_dir) = test_supervisor("shutdown", None);
	let dir = temp_dir("shutdown-workdir");
	// Ignores SIGTERM so shutdown has to escalate.
	sup.apply(vec![sh_app(&dir, "stubborn", "trap '' TERM\nwhile true; do sleep 0.1; done\n", "instances = 2")])
		.await;

	let status = sup.start(None).await.unwrap();
	let pids: Vec<u32> = status[0].instances.iter().filter_map(|i| i.pid).collect();
	assert_eq!(pids.len(), 2);

	sup.shutdown().await;
	for pid in pids {
		assert!(!pid_alive(pid), "pid {} survived shutdown", pid);
	}
	assert!(sup.status(None).await.unwrap().is_empty());

	let _ = std::fs::remove_dir_all(&log_dir);
	let _ = std::fs::remove_dir_all(&dir);
}
