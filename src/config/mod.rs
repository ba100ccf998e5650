#![forbid(unsafe_code)]

pub mod project;

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::error::DatmoError;

/// Process-wide settings. Loaded once by the CLI and passed down explicitly.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub project: ProjectLayoutConfig,
    pub environment: EnvironmentConfig,
    pub task: TaskConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProjectLayoutConfig {
    pub environment_dir: String,
    pub files_dir: String,
}

impl Default for ProjectLayoutConfig {
    fn default() -> Self {
        Self {
            environment_dir: "datmo_environment".to_owned(),
            files_dir: "datmo_files".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EnvironmentConfig {
    pub docker_command: String,
    pub definition_filename: String,
    pub capture_hardware_info: bool,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            docker_command: "docker".to_owned(),
            definition_filename: "Dockerfile".to_owned(),
            capture_hardware_info: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TaskConfig {
    pub stop_retry_attempts: u32,
    pub stop_retry_interval_ms: u64,
    pub workspace_url_attempts: u32,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            stop_retry_attempts: 3,
            stop_retry_interval_ms: 500,
            workspace_url_attempts: 10,
        }
    }
}

/// Overrides the location of the settings file.
pub const CONFIG_ENV: &str = "DATMO_CONFIG";

/// `~/.config/datmo/config.toml`, or the platform config directory where no home-relative
/// file exists (Windows).
pub fn config_file() -> anyhow::Result<PathBuf> {
    if let Some(path) = std::env::var_os(CONFIG_ENV) {
        return Ok(PathBuf::from(path));
    }
    let base = BaseDirs::new().context("cannot locate the home directory")?;
    let dotted = base.home_dir().join(".config").join("datmo").join("config.toml");
    if cfg!(windows) && !dotted.exists() {
        return Ok(base.config_dir().join("datmo").join("config.toml"));
    }
    Ok(dotted)
}

/// Loads and validates the process settings. A missing file yields the defaults.
pub fn load() -> anyhow::Result<Config> {
    load_at(&config_file()?)
}

pub fn load_at(path: &Path) -> anyhow::Result<Config> {
    let (_doc, cfg) = read_document(path)?;
    cfg.validate()?;
    Ok(cfg)
}

/// The effective settings, defaults included, as TOML.
pub fn list_resolved_toml() -> anyhow::Result<String> {
    Ok(toml::to_string_pretty(&load()?)?)
}

pub fn get_value_string(key: &str) -> anyhow::Result<Option<String>> {
    get_value_string_at_path(&config_file()?, key)
}

pub fn set_value_string(key: &str, value: &str) -> anyhow::Result<()> {
    set_value_string_at_path(&config_file()?, key, value)
}

/// The file both as an editable document (comments kept) and as typed settings.
fn read_document(path: &Path) -> anyhow::Result<(toml_edit::DocumentMut, Config)> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e).with_context(|| format!("failed to read {}", path.display())),
    };
    let doc = raw
        .parse::<toml_edit::DocumentMut>()
        .with_context(|| format!("invalid TOML in {}", path.display()))?;
    let cfg: Config = toml::from_str(&raw)
        .with_context(|| format!("unexpected settings in {}", path.display()))?;
    Ok((doc, cfg))
}

pub fn get_value_string_at_path(path: &Path, key: &str) -> anyhow::Result<Option<String>> {
    let cfg = load_at(path)?;
    let mut node = serde_json::to_value(&cfg)?;
    for seg in key.split('.') {
        match node.get_mut(seg).map(serde_json::Value::take) {
            Some(child) => node = child,
            None => return Ok(None),
        }
    }
    Ok(Some(match node {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }))
}

/// Sets one dotted key, keeping the rest of the document (comments included) as written.
pub fn set_value_string_at_path(path: &Path, key: &str, value: &str) -> anyhow::Result<()> {
    let (mut doc, _cfg) = read_document(path)?;
    let (section, field) = key
        .split_once('.')
        .ok_or_else(|| DatmoError::InvalidConfigKey(key.to_owned()))?;
    let item = ConfigKey::lookup(key)?.to_item(key, value)?;

    let mut fresh = toml_edit::Table::new();
    fresh.set_implicit(true);
    let table = doc
        .entry(section)
        .or_insert(toml_edit::Item::Table(fresh))
        .as_table_mut()
        .ok_or_else(|| DatmoError::Config(format!("'{section}' is not a table")))?;
    table.insert(field, item);

    let updated = doc.to_string();
    let cfg: Config = toml::from_str(&updated)
        .with_context(|| format!("setting {key} would break {}", path.display()))?;
    cfg.validate()?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(path, updated).with_context(|| format!("failed to write {}", path.display()))
}

/// Value shape of each settable key.
#[derive(Debug, Clone, Copy)]
enum ConfigKey {
    Text,
    Flag,
    Count,
    Level,
}

const LEVELS: &[&str] = &["error", "warn", "info", "debug", "trace"];

impl ConfigKey {
    fn lookup(key: &str) -> Result<Self, DatmoError> {
        match key {
            "project.environment_dir"
            | "project.files_dir"
            | "environment.docker_command"
            | "environment.definition_filename" => Ok(Self::Text),
            "environment.capture_hardware_info" => Ok(Self::Flag),
            "task.stop_retry_attempts"
            | "task.stop_retry_interval_ms"
            | "task.workspace_url_attempts" => Ok(Self::Count),
            "logging.level" => Ok(Self::Level),
            _ => Err(DatmoError::InvalidConfigKey(key.to_owned())),
        }
    }

    fn to_item(self, key: &str, raw: &str) -> Result<toml_edit::Item, DatmoError> {
        let invalid = |msg: String| DatmoError::InvalidConfigValue {
            key: key.to_owned(),
            msg,
        };
        let raw = raw.trim();
        match self {
            Self::Text => Ok(toml_edit::value(raw)),
            Self::Flag => raw
                .parse::<bool>()
                .map(toml_edit::value)
                .map_err(|_| invalid(format!("expected true or false, got '{raw}'"))),
            Self::Count => raw
                .parse::<u32>()
                .map(|n| toml_edit::value(i64::from(n)))
                .map_err(|e| invalid(format!("expected a non-negative integer, got '{raw}': {e}"))),
            Self::Level if LEVELS.contains(&raw) => Ok(toml_edit::value(raw)),
            Self::Level => Err(invalid(format!("must be one of: {}", LEVELS.join(", ")))),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), DatmoError> {
        if self.project.environment_dir.trim().is_empty() {
            return Err(DatmoError::Config(
                "project.environment_dir must not be empty".to_owned(),
            ));
        }
        if self.project.files_dir.trim().is_empty() {
            return Err(DatmoError::Config(
                "project.files_dir must not be empty".to_owned(),
            ));
        }
        if self.project.environment_dir == self.project.files_dir {
            return Err(DatmoError::Config(
                "project.environment_dir and project.files_dir must differ".to_owned(),
            ));
        }
        if self.environment.docker_command.trim().is_empty() {
            return Err(DatmoError::Config(
                "environment.docker_command must not be empty".to_owned(),
            ));
        }
        let filename = self.environment.definition_filename.trim();
        if filename.is_empty() || filename.contains('/') || filename.contains('\\') {
            return Err(DatmoError::Config(
                "environment.definition_filename must be a plain file name".to_owned(),
            ));
        }
        if self.task.stop_retry_attempts == 0 {
            return Err(DatmoError::Config(
                "task.stop_retry_attempts must be >= 1".to_owned(),
            ));
        }
        if self.task.workspace_url_attempts == 0 {
            return Err(DatmoError::Config(
                "task.workspace_url_attempts must be >= 1".to_owned(),
            ));
        }
        Ok(())
    }
}
