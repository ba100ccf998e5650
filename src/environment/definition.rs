#![forbid(unsafe_code)]

//! Container definition files: the default template and the derived `datmo<name>` file that is
//! actually built.

use std::path::{Path, PathBuf};

use crate::entity::WorkspaceKind;
use crate::error::{DatmoError, io_at};

pub const DERIVED_PREFIX: &str = "datmo";

const DEFAULT_DEFINITION: &str = "FROM datmo/python-base:cpu-py35\n";

const BASE_BOILERPLATE: &[&str] = &["", "# datmo", "WORKDIR /home"];

#[must_use]
pub fn default_definition() -> &'static str {
    DEFAULT_DEFINITION
}

fn workspace_boilerplate(workspace: WorkspaceKind) -> &'static [&'static str] {
    match workspace {
        WorkspaceKind::Notebook | WorkspaceKind::Jupyterlab => &["EXPOSE 8888"],
        WorkspaceKind::Rstudio => &["EXPOSE 8787"],
        WorkspaceKind::Terminal => &[],
    }
}

/// `dir/Dockerfile` → `dir/datmoDockerfile`.
pub fn derived_path(definition: &Path) -> Result<PathBuf, DatmoError> {
    let name = definition
        .file_name()
        .ok_or_else(|| DatmoError::EnvironmentDoesNotExist(definition.display().to_string()))?;
    Ok(definition.with_file_name(format!("{DERIVED_PREFIX}{}", name.to_string_lossy())))
}

/// Rewrites a definition for `workspace`: `FROM datmo/...` base images get the workspace suffix
/// and the boilerplate is appended.
#[must_use]
pub fn derive(input: &str, workspace: Option<WorkspaceKind>) -> String {
    let mut out = String::with_capacity(input.len() + 64);
    for line in input.lines() {
        let line = line.trim();
        match workspace {
            Some(ws) if line.starts_with("FROM datmo/") => {
                out.push_str(line);
                out.push('-');
                out.push_str(ws.as_str());
            }
            _ => out.push_str(line),
        }
        out.push('\n');
    }
    for line in BASE_BOILERPLATE {
        out.push_str(line);
        out.push('\n');
    }
    if let Some(ws) = workspace {
        for line in workspace_boilerplate(ws) {
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

/// Writes the derived definition next to `definition`, replacing any previous one.
pub fn write_derived(
    definition: &Path,
    workspace: Option<WorkspaceKind>,
) -> Result<PathBuf, DatmoError> {
    if !definition.is_file() {
        return Err(DatmoError::EnvironmentDoesNotExist(
            definition.display().to_string(),
        ));
    }
    let input = std::fs::read_to_string(definition).map_err(io_at(definition))?;
    let output = derived_path(definition)?;
    std::fs::write(&output, derive(&input, workspace)).map_err(io_at(&output))?;
    Ok(output)
}
