//! Change detection under an app's working directory.

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

use crate::error::WatchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
	Created,
	Modified,
	Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
	pub path: PathBuf,
	pub kind: ChangeKind,
}

pub fn is_glob(rule: &str) -> bool {
	rule.contains(['*', '?', '[', '{'])
}

/// Check a single ignore rule without compiling the whole set.
pub fn validate_rule(rule: &str) -> Result<(), String> {
	if rule.trim().is_empty() {
		return Err("empty pattern".to_string());
	}
	if is_glob(rule) {
		build_glob(rule).map_err(|e| e.kind().to_string())?;
	}
	Ok(())
}

fn build_glob(rule: &str) -> Result<globset::Glob, globset::Error> {
	GlobBuilder::new(rule.trim_start_matches("./"))
		.literal_separator(true)
		.build()
}

/// Compiled ignore rules.
///
/// A literal (`logs`, `app/generated`) matches that path and everything under
/// it. A glob (`**/*.pdf`) matches the path or any of its ancestors. Relative
/// rules are evaluated against the watch root; absolute literals against the
/// absolute path.
#[derive(Debug, Clone)]
pub struct IgnoreRules {
	literals: Vec<PathBuf>,
	globs: GlobSet,
}

impl IgnoreRules {
	pub fn compile(rules: &[String]) -> Result<Self, globset::Error> {
		let mut literals = Vec::new();
		let mut builder = GlobSetBuilder::new();
		for rule in rules {
			let rule = rule.trim();
			if rule.is_empty() {
				continue;
			}
			if is_glob(rule) {
				builder.add(build_glob(rule)?);
			} else {
				literals.push(normalize_literal(rule));
			}
		}
		Ok(Self {
			literals,
			globs: builder.build()?,
		})
	}

	pub fn empty() -> Self {
		Self {
			literals: Vec::new(),
			globs: GlobSet::empty(),
		}
	}

	/// Also ignore `path` (and anything beneath it).
	pub fn add_literal(&mut self, path: impl AsRef<Path>) {
		self.literals.push(path.as_ref().to_path_buf());
	}

	pub fn is_ignored(&self, path: &Path, root: &Path) -> bool {
		let relative = path.strip_prefix(root).unwrap_or(path);

		let literal_hit = self.literals.iter().any(|lit| {
			if lit.is_absolute() {
				path.starts_with(lit)
			} else {
				relative.starts_with(lit)
			}
		});
		if literal_hit {
			return true;
		}

		if self.globs.is_empty() {
			return false;
		}
		relative
			.ancestors()
			.take_while(|p| !p.as_os_str().is_empty())
			.any(|p| self.globs.is_match(p))
	}
}

fn normalize_literal(rule: &str) -> PathBuf {
	let rule = rule.strip_prefix("./").unwrap_or(rule);
	let rule = rule.trim_end_matches('/');
	PathBuf::from(rule)
}

fn classify(kind: &EventKind) -> Option<ChangeKind> {
	match kind {
		EventKind::Create(_) => Some(ChangeKind::Created),
		EventKind::Modify(_) => Some(ChangeKind::Modified),
		EventKind::Remove(_) => Some(ChangeKind::Deleted),
		EventKind::Access(_) | EventKind::Any | EventKind::Other => None,
	}
}

/// Non-ignored changes under a root. Dropping the stream stops observation;
/// it cannot be resumed, call [`watch`] again instead.
pub struct ChangeStream {
	events: mpsc::UnboundedReceiver<ChangeEvent>,
	root: PathBuf,
	_watcher: RecommendedWatcher,
}

impl ChangeStream {
	pub async fn next(&mut self) -> Option<ChangeEvent> {
		self.events.recv().await
	}

	pub fn root(&self) -> &Path {
		&self.root
	}
}

pub fn watch(root: &Path, rules: IgnoreRules) -> Result<ChangeStream, WatchError> {
	let root = root
		.canonicalize()
		.map_err(|_| WatchError::MissingRoot(root.to_path_buf()))?;
	let (tx, rx) = mpsc::unbounded_channel();

	let filter_root = root.clone();
	let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
		Ok(event) => {
			let Some(kind) = classify(&event.kind) else {
				return;
			};
			for path in event.paths {
				if rules.is_ignored(&path, &filter_root) {
					tracing::trace!("ignored change: {}", path.display());
					continue;
				}
				let _ = tx.send(ChangeEvent { path, kind });
			}
		}
		Err(e) => tracing::warn!("watch error under {}: {}", filter_root.display(), e),
	})
	.map_err(|e| WatchError::Notify {
		path: root.clone(),
		source: e,
	})?;

	watcher
		.watch(&root, RecursiveMode::Recursive)
		.map_err(|e| WatchError::Notify {
			path: root.clone(),
			source: e,
		})?;

	tracing::debug!("watching {}", root.display());
	Ok(ChangeStream {
		events: rx,
		root,
		_watcher: watcher,
	})
}
