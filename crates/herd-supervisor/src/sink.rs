use std::collections::{HashMap, VecDeque};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Local;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};

use crate::config::ResolvedLogFiles;
use crate::error::LogWriteError;
use crate::launcher::ProcessHandle;

const TAIL_CAPACITY: usize = 64 * 1024;
const READ_BUFFER: usize = 4096;
/// A partial line longer than this is written without waiting for its newline.
const MAX_PENDING_LINE: usize = 16 * 1024;

pub const DEFAULT_DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

type Tail = Arc<Mutex<VecDeque<u8>>>;
type Writer = mpsc::UnboundedSender<Vec<u8>>;
type WeakWriter = mpsc::WeakUnboundedSender<Vec<u8>>;

/// Routes child output into log files.
///
/// Every destination path gets exactly one writer task, shared by all
/// instances (and apps) that name it. Output is cut at line boundaries and
/// each piece lands with a single `write_all`, so lines from different
/// children never interleave. A writer task ends once no child feeds it.
/// A bounded tail of recent output is kept per app.
#[derive(Clone, Default)]
pub struct LogSink {
	writers: Arc<Mutex<HashMap<PathBuf, WeakWriter>>>,
	tails: Arc<Mutex<HashMap<String, Tail>>>,
}

impl LogSink {
	pub fn new() -> Self {
		Self::default()
	}

	/// Take the handle's output streams and pump them into `files`.
	pub async fn attach(
		&self,
		handle: &mut ProcessHandle,
		files: &ResolvedLogFiles,
		timestamp: bool,
		date_format: Option<&str>,
		app: &str,
	) {
		let stamp = timestamp.then(|| date_format.unwrap_or(DEFAULT_DATE_FORMAT).to_string());
		let tail = self.tail_for(app).await;
		let combined = match &files.combined {
			Some(path) => Some(self.writer(path).await),
			None => None,
		};

		if let Some(stdout) = handle.stdout.take() {
			let mut targets = vec![self.writer(&files.stdout).await];
			targets.extend(combined.clone());
			tokio::spawn(pump(stdout, targets, tail.clone(), stamp.clone()));
		}
		if let Some(stderr) = handle.stderr.take() {
			let mut targets = vec![self.writer(&files.stderr).await];
			targets.extend(combined);
			tokio::spawn(pump(stderr, targets, tail, stamp));
		}
	}

	/// Recent output of `app` across all its instances, oldest first.
	pub async fn tail(&self, app: &str) -> Option<String> {
		let tail = self.tails.lock().await.get(app).cloned()?;
		let ring = tail.lock().await;
		let bytes: Vec<u8> = ring.iter().copied().collect();
		Some(String::from_utf8_lossy(&bytes).into_owned())
	}

	pub async fn forget(&self, app: &str) {
		self.tails.lock().await.remove(app);
		self.writers.lock().await.retain(|_, w| w.upgrade().is_some());
	}

	/// Destinations that still have a writer task.
	pub async fn open_destinations(&self) -> usize {
		let mut writers = self.writers.lock().await;
		writers.retain(|_, w| w.upgrade().is_some());
		writers.len()
	}

	async fn tail_for(&self, app: &str) -> Tail {
		self.tails
			.lock()
			.await
			.entry(app.to_string())
			.or_insert_with(|| Arc::new(Mutex::new(VecDeque::with_capacity(TAIL_CAPACITY))))
			.clone()
	}

	async fn writer(&self, path: &Path) -> Writer {
		let mut writers = self.writers.lock().await;
		if let Some(tx) = writers.get(path).and_then(WeakWriter::upgrade) {
			return tx;
		}
		writers.retain(|_, w| w.upgrade().is_some());
		let tx = spawn_writer(path.to_path_buf());
		writers.insert(path.to_path_buf(), tx.downgrade());
		tx
	}
}

fn spawn_writer(path: PathBuf) -> Writer {
	let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
	tokio::spawn(async move {
		let mut file: Option<File> = None;
		let mut failing = false;
		while let Some(data) = rx.recv().await {
			if file.is_none() {
				match open_append(&path).await {
					Ok(f) => file = Some(f),
					Err(e) => {
						if !failing {
							tracing::warn!("{}", LogWriteError { path: path.clone(), source: e });
							failing = true;
						}
						continue;
					}
				}
			}
			let Some(f) = file.as_mut() else { continue };
			let written = match f.write_all(&data).await {
				Ok(()) => f.flush().await,
				Err(e) => Err(e),
			};
			match written {
				Ok(()) => failing = false,
				Err(e) => {
					if !failing {
						tracing::warn!("{}", LogWriteError { path: path.clone(), source: e });
						failing = true;
					}
					file = None;
				}
			}
		}
	});
	tx
}

async fn open_append(path: &Path) -> std::io::Result<File> {
	if let Some(parent) = path.parent() {
		tokio::fs::create_dir_all(parent).await?;
	}
	OpenOptions::new().create(true).append(true).open(path).await
}

async fn pump<R: AsyncRead + Unpin>(mut reader: R, targets: Vec<Writer>, tail: Tail, stamp: Option<String>) {
	let mut buf = vec![0u8; READ_BUFFER];
	let mut framer = LineFramer::new(stamp);
	loop {
		let n = match reader.read(&mut buf).await {
			Ok(0) | Err(_) => break,
			Ok(n) => n,
		};
		if let Some(chunk) = framer.push(&buf[..n]) {
			deliver(chunk, &targets, &tail).await;
		}
	}
	if let Some(chunk) = framer.finish() {
		deliver(chunk, &targets, &tail).await;
	}
}

async fn deliver(chunk: Vec<u8>, targets: &[Writer], tail: &Tail) {
	{
		let mut ring = tail.lock().await;
		for &byte in &chunk {
			if ring.len() >= TAIL_CAPACITY {
				ring.pop_front();
			}
			ring.push_back(byte);
		}
	}
	for tx in targets {
		let _ = tx.send(chunk.clone());
	}
}

/// Cuts a byte stream at line boundaries, prefixing each line with
/// `"<time>: "` when stamping. Bytes pass through unchanged otherwise.
struct LineFramer {
	pending: Vec<u8>,
	stamp: Option<String>,
	/// The next byte handed out starts a line.
	at_line_start: bool,
}

impl LineFramer {
	fn new(stamp: Option<String>) -> Self {
		Self {
			pending: Vec::new(),
			stamp,
			at_line_start: true,
		}
	}

	/// Every complete line buffered so far. A partial line that outgrows
	/// `MAX_PENDING_LINE` is released as is; its remainder follows unstamped.
	fn push(&mut self, data: &[u8]) -> Option<Vec<u8>> {
		self.pending.extend_from_slice(data);
		let partial = match self.pending.iter().rposition(|&b| b == b'\n') {
			Some(newline) => self.pending.len() - newline - 1,
			None => self.pending.len(),
		};
		let end = if partial > MAX_PENDING_LINE {
			self.pending.len()
		} else {
			self.pending.len() - partial
		};
		self.take(end)
	}

	/// Whatever is left once the stream ends, without adding a newline.
	fn finish(&mut self) -> Option<Vec<u8>> {
		self.take(self.pending.len())
	}

	fn take(&mut self, end: usize) -> Option<Vec<u8>> {
		if end == 0 {
			return None;
		}
		let bytes: Vec<u8> = self.pending.drain(..end).collect();
		let Some(format) = &self.stamp else {
			self.at_line_start = bytes.ends_with(b"\n");
			return Some(bytes);
		};

		let prefix = timestamp(format);
		let mut out = Vec::with_capacity(bytes.len() + prefix.len() * 4);
		for line in bytes.split_inclusive(|&b| b == b'\n') {
			if self.at_line_start {
				out.extend_from_slice(prefix.as_bytes());
				out.extend_from_slice(b": ");
			}
			out.extend_from_slice(line);
			self.at_line_start = line.ends_with(b"\n");
		}
		Some(out)
	}
}

fn timestamp(format: &str) -> String {
	let now = Local::now();
	let mut out = String::new();
	if write!(out, "{}", now.format(format)).is_err() {
		out.clear();
		let _ = write!(out, "{}", now.format(DEFAULT_DATE_FORMAT));
	}
	out
}

/// Whether `format` is a usable chrono strftime string.
pub fn is_valid_date_format(format: &str) -> bool {
	use chrono::format::{Item, StrftimeItems};
	!StrftimeItems::new(format).any(|item| matches!(item, Item::Error))
}
