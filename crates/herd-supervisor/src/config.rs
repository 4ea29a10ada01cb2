//! App definitions: the loosely typed file format and the validated model.
//!
//! The file is parsed into [`RawConfig`] as-is, then [`load`] coerces every
//! value exactly once into [`AppSpec`]. Nothing downstream re-parses strings.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::{sink, watcher};

// ── file format ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RawConfig {
	#[serde(default)]
	pub apps: Vec<RawApp>,
}

/// A config value that may arrive as a bool, number or string.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Scalar {
	Bool(bool),
	Int(i64),
	Float(f64),
	Text(String),
}

impl Scalar {
	/// Environment values are always strings to the child.
	pub fn to_env_string(&self) -> String {
		match self {
			Scalar::Bool(b) => b.to_string(),
			Scalar::Int(i) => i.to_string(),
			Scalar::Float(f) => f.to_string(),
			Scalar::Text(s) => s.clone(),
		}
	}

	fn describe(&self) -> String {
		match self {
			Scalar::Text(s) => format!("{:?}", s),
			other => other.to_env_string(),
		}
	}
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RawApp {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub script: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub interpreter: Option<String>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub args: Vec<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub cwd: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub instances: Option<Scalar>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub autorestart: Option<Scalar>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub watch: Option<Scalar>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub ignore_watch: Vec<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub max_memory_restart: Option<Scalar>,
	/// Milliseconds between SIGTERM and SIGKILL.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub kill_timeout: Option<Scalar>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub out_file: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error_file: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub log_file: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub time: Option<Scalar>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub log_date_format: Option<String>,
	#[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
	pub env: BTreeMap<String, Scalar>,
	#[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
	pub profiles: BTreeMap<String, BTreeMap<String, Scalar>>,
}

// ── validated model ──────────────────────────────────────────────────────────

pub type EnvMap = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq)]
pub struct AppSpec {
	pub name: String,
	pub script: String,
	/// `none` runs the script directly.
	pub interpreter: String,
	pub args: Vec<String>,
	pub working_directory: PathBuf,
	pub instance_count: usize,
	pub auto_restart: bool,
	pub watch_enabled: bool,
	/// Relative to `working_directory`.
	pub ignore_rules: Vec<String>,
	pub max_memory_bytes: Option<u64>,
	pub kill_timeout_ms: Option<u64>,
	/// Applied under every profile.
	pub env: EnvMap,
	pub environment_profiles: BTreeMap<String, EnvMap>,
	pub log_files: LogFiles,
	pub timestamp_lines: bool,
	pub log_date_format: Option<String>,
}

impl AppSpec {
	pub fn profile_env(&self, profile: Option<&str>) -> Option<&EnvMap> {
		profile.and_then(|p| self.environment_profiles.get(p))
	}

	/// Absolute (or cwd-relative, if `working_directory` is) path of the script.
	pub fn script_path(&self) -> PathBuf {
		self.working_directory.join(&self.script)
	}
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogFiles {
	pub stdout: Option<PathBuf>,
	pub stderr: Option<PathBuf>,
	pub combined: Option<PathBuf>,
}

/// Log destinations with defaults filled in and relative paths anchored.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedLogFiles {
	pub stdout: PathBuf,
	pub stderr: PathBuf,
	pub combined: Option<PathBuf>,
}

impl LogFiles {
	pub fn resolve(&self, app: &str, cwd: &Path, log_dir: &Path) -> ResolvedLogFiles {
		let anchor = |p: &PathBuf| if p.is_absolute() { p.clone() } else { cwd.join(p) };
		ResolvedLogFiles {
			stdout: self
				.stdout
				.as_ref()
				.map(anchor)
				.unwrap_or_else(|| log_dir.join(format!("{}-out.log", app))),
			stderr: self
				.stderr
				.as_ref()
				.map(anchor)
				.unwrap_or_else(|| log_dir.join(format!("{}-error.log", app))),
			combined: self.combined.as_ref().map(anchor),
		}
	}
}

impl ResolvedLogFiles {
	pub fn all(&self) -> impl Iterator<Item = &PathBuf> {
		[&self.stdout, &self.stderr].into_iter().chain(self.combined.as_ref())
	}
}

// ── loading ──────────────────────────────────────────────────────────────────

/// Validate every app, failing on the first bad one.
pub fn load(raw: &RawConfig, profile: Option<&str>) -> Result<Vec<AppSpec>, ConfigError> {
	load_each(raw, profile).into_iter().collect()
}

/// Validate every app independently so good apps can run while bad ones are reported.
pub fn load_each(raw: &RawConfig, profile: Option<&str>) -> Vec<Result<AppSpec, ConfigError>> {
	let mut seen = HashSet::new();
	raw.apps
		.iter()
		.enumerate()
		.map(|(index, app)| {
			let spec = load_app(index, app, profile)?;
			if !seen.insert(spec.name.clone()) {
				return Err(ConfigError::DuplicateName { app: spec.name });
			}
			Ok(spec)
		})
		.collect()
}

pub fn parse_str(content: &str, origin: &Path) -> Result<RawConfig, ConfigError> {
	toml::from_str(content).map_err(|e| ConfigError::Parse {
		path: origin.to_path_buf(),
		source: Box::new(e),
	})
}

/// Read a config file, anchoring each app's `cwd` at the file's directory.
pub fn read_file(path: &Path) -> Result<RawConfig, ConfigError> {
	let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
		path: path.to_path_buf(),
		source: e,
	})?;
	let mut raw = parse_str(&content, path)?;

	let base = path
		.parent()
		.filter(|p| !p.as_os_str().is_empty())
		.map(Path::to_path_buf)
		.unwrap_or_else(|| PathBuf::from("."));
	let base = base.canonicalize().unwrap_or(base);
	for app in &mut raw.apps {
		let cwd = match app.cwd.as_deref() {
			Some(dir) if Path::new(dir).is_absolute() => continue,
			Some(dir) => base.join(dir),
			None => base.clone(),
		};
		app.cwd = Some(cwd.to_string_lossy().into_owned());
	}
	Ok(raw)
}

/// Read and validate a config file in one step.
pub fn load_file(path: &Path, profile: Option<&str>) -> Result<Vec<AppSpec>, ConfigError> {
	load(&read_file(path)?, profile)
}

/// Convert validated apps back into the file format. `load(&to_raw(x), ..) == x`.
pub fn to_raw(apps: &[AppSpec]) -> RawConfig {
	let env_table = |env: &EnvMap| {
		env.iter()
			.map(|(k, v)| (k.clone(), Scalar::Text(v.clone())))
			.collect::<BTreeMap<_, _>>()
	};
	let path_str = |p: &PathBuf| p.to_string_lossy().into_owned();

	RawConfig {
		apps: apps
			.iter()
			.map(|app| RawApp {
				name: Some(app.name.clone()),
				script: Some(app.script.clone()),
				interpreter: Some(app.interpreter.clone()),
				args: app.args.clone(),
				cwd: Some(path_str(&app.working_directory)),
				instances: Some(Scalar::Int(app.instance_count as i64)),
				autorestart: Some(Scalar::Bool(app.auto_restart)),
				watch: Some(Scalar::Bool(app.watch_enabled)),
				ignore_watch: app.ignore_rules.clone(),
				max_memory_restart: app.max_memory_bytes.map(unsigned_scalar),
				kill_timeout: app.kill_timeout_ms.map(unsigned_scalar),
				out_file: app.log_files.stdout.as_ref().map(path_str),
				error_file: app.log_files.stderr.as_ref().map(path_str),
				log_file: app.log_files.combined.as_ref().map(path_str),
				time: Some(Scalar::Bool(app.timestamp_lines)),
				log_date_format: app.log_date_format.clone(),
				env: env_table(&app.env),
				profiles: app
					.environment_profiles
					.iter()
					.map(|(name, env)| (name.clone(), env_table(env)))
					.collect(),
			})
			.collect(),
	}
}

/// TOML integers are signed; larger values are written as strings, which load accepts too.
fn unsigned_scalar(value: u64) -> Scalar {
	i64::try_from(value).map_or_else(|_| Scalar::Text(value.to_string()), Scalar::Int)
}

pub fn to_toml_string(apps: &[AppSpec]) -> Result<String, ConfigError> {
	Ok(toml::to_string(&to_raw(apps))?)
}

fn load_app(index: usize, raw: &RawApp, profile: Option<&str>) -> Result<AppSpec, ConfigError> {
	let name = raw
		.name
		.as_deref()
		.map(str::trim)
		.filter(|n| !n.is_empty())
		.ok_or(ConfigError::MissingName { index })?
		.to_string();
	if name.contains('/') {
		return Err(ConfigError::InvalidValue {
			app: name,
			field: "name",
			value: raw.name.clone().unwrap_or_default(),
		});
	}

	let required = |value: &Option<String>, field: &'static str| {
		value
			.as_deref()
			.map(str::trim)
			.filter(|v| !v.is_empty())
			.map(str::to_string)
			.ok_or_else(|| ConfigError::MissingField { app: name.clone(), field })
	};
	let script = required(&raw.script, "script")?;
	let interpreter = required(&raw.interpreter, "interpreter")?;

	let instance_count = match &raw.instances {
		None => 1,
		Some(value) => instance_count(&name, value)?,
	};

	let auto_restart = flag(&name, "autorestart", raw.autorestart.as_ref(), true)?;
	let watch_enabled = flag(&name, "watch", raw.watch.as_ref(), false)?;
	let timestamp_lines = flag(&name, "time", raw.time.as_ref(), false)?;

	for rule in &raw.ignore_watch {
		watcher::validate_rule(rule).map_err(|reason| ConfigError::InvalidIgnoreRule {
			app: name.clone(),
			rule: rule.clone(),
			reason,
		})?;
	}

	if let Some(format) = &raw.log_date_format {
		if !sink::is_valid_date_format(format) {
			return Err(ConfigError::InvalidValue {
				app: name.clone(),
				field: "log_date_format",
				value: format.clone(),
			});
		}
	}

	let max_memory_bytes = raw
		.max_memory_restart
		.as_ref()
		.map(|value| memory_threshold(&name, value))
		.transpose()?;

	let kill_timeout_ms = raw
		.kill_timeout
		.as_ref()
		.map(|value| {
			non_negative(value).ok_or_else(|| ConfigError::InvalidValue {
				app: name.clone(),
				field: "kill_timeout",
				value: value.describe(),
			})
		})
		.transpose()?;

	let stringify = |table: &BTreeMap<String, Scalar>| {
		table
			.iter()
			.map(|(k, v)| (k.clone(), v.to_env_string()))
			.collect::<EnvMap>()
	};
	let environment_profiles: BTreeMap<String, EnvMap> = raw
		.profiles
		.iter()
		.map(|(profile, table)| (profile.clone(), stringify(table)))
		.collect();

	if let Some(selected) = profile {
		if !environment_profiles.is_empty() && !environment_profiles.contains_key(selected) {
			return Err(ConfigError::UndefinedProfile {
				app: name,
				profile: selected.to_string(),
			});
		}
	}

	let path = |p: &Option<String>| p.as_ref().map(PathBuf::from);

	Ok(AppSpec {
		script,
		interpreter,
		args: raw.args.clone(),
		working_directory: raw.cwd.as_ref().map(PathBuf::from).unwrap_or_else(|| PathBuf::from(".")),
		instance_count,
		auto_restart,
		watch_enabled,
		ignore_rules: raw.ignore_watch.clone(),
		max_memory_bytes,
		kill_timeout_ms,
		env: stringify(&raw.env),
		environment_profiles,
		log_files: LogFiles {
			stdout: path(&raw.out_file),
			stderr: path(&raw.error_file),
			combined: path(&raw.log_file),
		},
		timestamp_lines,
		log_date_format: raw.log_date_format.clone(),
		name,
	})
}

fn flag(app: &str, field: &'static str, value: Option<&Scalar>, default: bool) -> Result<bool, ConfigError> {
	let Some(value) = value else {
		return Ok(default);
	};
	let parsed = match value {
		Scalar::Bool(b) => Some(*b),
		Scalar::Int(0) => Some(false),
		Scalar::Int(1) => Some(true),
		Scalar::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
			"true" | "yes" | "on" | "1" => Some(true),
			"false" | "no" | "off" | "0" => Some(false),
			_ => None,
		},
		_ => None,
	};
	parsed.ok_or_else(|| ConfigError::InvalidValue {
		app: app.to_string(),
		field,
		value: value.describe(),
	})
}

fn instance_count(app: &str, value: &Scalar) -> Result<usize, ConfigError> {
	let invalid = || ConfigError::InstanceCount {
		app: app.to_string(),
		value: value.describe(),
	};
	let n = match value {
		Scalar::Int(n) => *n,
		Scalar::Text(s) if s.trim().eq_ignore_ascii_case("max") => {
			return Ok(std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1));
		}
		Scalar::Text(s) => s.trim().parse::<i64>().map_err(|_| invalid())?,
		_ => return Err(invalid()),
	};
	if n < 1 {
		return Err(invalid());
	}
	Ok(n as usize)
}

fn memory_threshold(app: &str, value: &Scalar) -> Result<u64, ConfigError> {
	let parsed = match value {
		Scalar::Int(n) if *n > 0 => Some(*n as u64),
		Scalar::Text(s) => parse_memory(s),
		_ => None,
	};
	parsed.ok_or_else(|| ConfigError::InvalidMemory {
		app: app.to_string(),
		value: value.to_env_string(),
	})
}

/// Parse `"512"`, `"200K"`, `"150M"`, `"1G"` (binary multiples) into bytes.
pub fn parse_memory(value: &str) -> Option<u64> {
	let value = value.trim();
	let (digits, multiplier) = match value.chars().last()?.to_ascii_uppercase() {
		'K' => (&value[..value.len() - 1], 1024),
		'M' => (&value[..value.len() - 1], 1024 * 1024),
		'G' => (&value[..value.len() - 1], 1024 * 1024 * 1024),
		_ => (value, 1),
	};
	let n: u64 = digits.trim().parse().ok()?;
	if n == 0 {
		return None;
	}
	n.checked_mul(multiplier)
}

fn non_negative(value: &Scalar) -> Option<u64> {
	match value {
		Scalar::Int(n) if *n >= 0 => Some(*n as u64),
		Scalar::Text(s) => s.trim().parse().ok(),
		_ => None,
	}
}
