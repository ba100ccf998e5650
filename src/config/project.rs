#![forbid(unsafe_code)]

//! Driver selection persisted in `.datmo/.config`.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{DatmoError, io_at};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CodeDriverKind {
    File,
    Git {
        #[serde(default = "default_git_execpath")]
        execpath: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FileDriverKind {
    Local,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EnvironmentDriverKind {
    Docker { docker_command: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverSelection {
    #[serde(rename = "controller.code.driver", default)]
    pub code: Option<CodeDriverKind>,
    #[serde(rename = "controller.file.driver", default)]
    pub file: Option<FileDriverKind>,
    #[serde(rename = "controller.environment.driver", default)]
    pub environment: Option<EnvironmentDriverKind>,
}

/// Fully resolved selection; every slot is filled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Drivers {
    pub code: CodeDriverKind,
    pub file: FileDriverKind,
    pub environment: EnvironmentDriverKind,
}

impl Drivers {
    #[must_use]
    pub fn defaults(cfg: &Config) -> Self {
        Self {
            code: CodeDriverKind::File,
            file: FileDriverKind::Local,
            environment: EnvironmentDriverKind::Docker {
                docker_command: cfg.environment.docker_command.clone(),
            },
        }
    }
}

fn default_git_execpath() -> String {
    "git".to_owned()
}

/// Reads the selection at `path`, filling absent slots from defaults. The merged result is
/// written back when the file's parent directory exists and anything was missing.
pub fn load_or_default(path: &Path, cfg: &Config) -> Result<Drivers, DatmoError> {
    let stored = if path.is_file() {
        let data = std::fs::read(path).map_err(io_at(path))?;
        serde_json::from_slice::<DriverSelection>(&data).map_err(|source| DatmoError::Json {
            path: path.to_path_buf(),
            source,
        })?
    } else {
        DriverSelection {
            code: None,
            file: None,
            environment: None,
        }
    };

    let defaults = Drivers::defaults(cfg);
    let complete = stored.code.is_some() && stored.file.is_some() && stored.environment.is_some();
    let drivers = Drivers {
        code: stored.code.unwrap_or(defaults.code),
        file: stored.file.unwrap_or(defaults.file),
        environment: stored.environment.unwrap_or(defaults.environment),
    };

    if !complete && path.parent().is_some_and(Path::is_dir) {
        save(path, &drivers)?;
    }
    Ok(drivers)
}

pub fn save(path: &Path, drivers: &Drivers) -> Result<(), DatmoError> {
    let selection = DriverSelection {
        code: Some(drivers.code.clone()),
        file: Some(drivers.file.clone()),
        environment: Some(drivers.environment.clone()),
    };
    let data = serde_json::to_vec_pretty(&selection).map_err(|source| DatmoError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, &data).map_err(io_at(&tmp))?;
    std::fs::rename(&tmp, path).map_err(io_at(path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults_and_is_written() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(".config");
        let drivers = load_or_default(&path, &Config::default()).unwrap();
        assert_eq!(drivers.code, CodeDriverKind::File);
        assert!(path.is_file());

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("controller.environment.driver"));
        assert!(raw.contains("\"docker\""));
    }

    #[test]
    fn stored_selection_wins_over_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(".config");
        std::fs::write(
            &path,
            r#"{"controller.code.driver": {"type": "git", "execpath": "/usr/bin/git"}}"#,
        )
        .unwrap();

        let drivers = load_or_default(&path, &Config::default()).unwrap();
        assert_eq!(
            drivers.code,
            CodeDriverKind::Git {
                execpath: "/usr/bin/git".to_owned()
            }
        );
        assert_eq!(drivers.file, FileDriverKind::Local);
    }
}
