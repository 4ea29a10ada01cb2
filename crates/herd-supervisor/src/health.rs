use std::sync::{Arc, Mutex};
use std::time::Duration;

use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System};

/// Reads the resident memory of a process. `None` means the process is gone
/// (or a zombie) or could not be inspected.
pub trait MemoryProbe: Send + Sync + 'static {
	fn probe(&self, pid: u32) -> Option<u64>;
}

pub struct SysinfoProbe {
	system: Mutex<System>,
}

impl SysinfoProbe {
	pub fn new() -> Self {
		Self {
			system: Mutex::new(System::new()),
		}
	}
}

impl Default for SysinfoProbe {
	fn default() -> Self {
		Self::new()
	}
}

impl MemoryProbe for SysinfoProbe {
	fn probe(&self, pid: u32) -> Option<u64> {
		let mut system = self.system.lock().ok()?;
		let pid = Pid::from_u32(pid);
		system.refresh_processes_specifics(
			ProcessesToUpdate::Some(&[pid]),
			true,
			ProcessRefreshKind::new().with_memory(),
		);
		let process = system.process(pid)?;
		match process.status() {
			ProcessStatus::Zombie | ProcessStatus::Dead => None,
			_ => Some(process.memory()),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
	pub memory_bytes: Option<u64>,
	pub is_alive: bool,
}

impl Sample {
	const DEAD: Sample = Sample {
		memory_bytes: None,
		is_alive: false,
	};
}

/// Time-bounded sampling. The probe runs on the blocking pool so a slow
/// `/proc` read never stalls an instance actor.
#[derive(Clone)]
pub struct HealthMonitor {
	probe: Arc<dyn MemoryProbe>,
	timeout: Duration,
}

impl HealthMonitor {
	pub fn new(probe: Arc<dyn MemoryProbe>, timeout: Duration) -> Self {
		Self { probe, timeout }
	}

	pub fn sysinfo(timeout: Duration) -> Self {
		Self::new(Arc::new(SysinfoProbe::new()), timeout)
	}

	pub async fn sample(&self, pid: u32) -> Sample {
		let probe = self.probe.clone();
		let task = tokio::task::spawn_blocking(move || probe.probe(pid));
		match tokio::time::timeout(self.timeout, task).await {
			Ok(Ok(Some(memory))) => Sample {
				memory_bytes: Some(memory),
				is_alive: true,
			},
			Ok(Ok(None)) => Sample::DEAD,
			Ok(Err(e)) => {
				tracing::warn!("health probe for pid {} failed: {}", pid, e);
				Sample::DEAD
			}
			Err(_) => {
				tracing::warn!("health probe for pid {} timed out after {:?}", pid, self.timeout);
				Sample::DEAD
			}
		}
	}
}
