#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::core::time::{now, serde_timestamp};
use crate::error::DatmoError;
use crate::storage::{Collection, Entity};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    New,
    Running,
    Success,
    Failed,
    Stopped,
}

impl TaskStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Stopped)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Stopped => "STOPPED",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Interactive serving mode of a task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceKind {
    Notebook,
    Jupyterlab,
    Rstudio,
    Terminal,
}

impl WorkspaceKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Notebook => "notebook",
            Self::Jupyterlab => "jupyterlab",
            Self::Rstudio => "rstudio",
            Self::Terminal => "terminal",
        }
    }

    /// Command that starts the workspace inside the container.
    #[must_use]
    pub fn default_command(self) -> &'static [&'static str] {
        match self {
            Self::Notebook => &["jupyter", "notebook", "--allow-root"],
            Self::Jupyterlab => &["jupyter", "lab", "--allow-root"],
            Self::Rstudio => &[
                "/usr/lib/rstudio-server/bin/rserver",
                "--server-daemonize=0",
                "--server-app-armor-enabled=0",
            ],
            Self::Terminal => &["/bin/bash"],
        }
    }

    #[must_use]
    pub fn default_ports(self) -> &'static [&'static str] {
        match self {
            Self::Notebook | Self::Jupyterlab => &["8888:8888"],
            Self::Rstudio => &["8787:8787"],
            Self::Terminal => &[],
        }
    }

    /// Terminal sessions attach to the container; the others are served over a port.
    #[must_use]
    pub fn is_attached(self) -> bool {
        matches!(self, Self::Terminal)
    }
}

impl FromStr for WorkspaceKind {
    type Err = DatmoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "notebook" => Ok(Self::Notebook),
            "jupyterlab" => Ok(Self::Jupyterlab),
            "rstudio" => Ok(Self::Rstudio),
            "terminal" => Ok(Self::Terminal),
            other => Err(DatmoError::InvalidArgumentType(format!(
                "workspace must be one of notebook, jupyterlab, rstudio, terminal; got '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for WorkspaceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    pub project_id: String,
    #[serde(default)]
    pub session_id: Option<String>,

    #[serde(default)]
    pub before_snapshot_id: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub command_list: Option<Vec<String>>,
    #[serde(default)]
    pub interactive: bool,
    #[serde(default)]
    pub detach: bool,
    #[serde(default)]
    pub gpu: bool,
    #[serde(default)]
    pub ports: Option<Vec<String>>,
    #[serde(default)]
    pub mem_limit: Option<String>,
    #[serde(default)]
    pub workspace: Option<WorkspaceKind>,
    /// Relative to the project root.
    #[serde(default)]
    pub task_dirpath: Option<String>,
    /// Relative to the project root.
    #[serde(default)]
    pub log_filepath: Option<String>,
    #[serde(default, with = "serde_timestamp::option")]
    pub start_time: Option<OffsetDateTime>,

    #[serde(default)]
    pub after_snapshot_id: Option<String>,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub logs: Option<String>,
    pub status: TaskStatus,
    #[serde(default)]
    pub results: Option<BTreeMap<String, String>>,
    #[serde(default, with = "serde_timestamp::option")]
    pub end_time: Option<OffsetDateTime>,
    #[serde(default)]
    pub duration: Option<f64>,

    #[serde(with = "serde_timestamp")]
    pub created_at: OffsetDateTime,
    #[serde(with = "serde_timestamp")]
    pub updated_at: OffsetDateTime,
}

impl Task {
    #[must_use]
    pub fn new(project_id: &str) -> Self {
        let t = now();
        Self {
            id: super::new_id(),
            project_id: project_id.to_owned(),
            session_id: None,
            before_snapshot_id: None,
            command: None,
            command_list: None,
            interactive: false,
            detach: false,
            gpu: false,
            ports: None,
            mem_limit: None,
            workspace: None,
            task_dirpath: None,
            log_filepath: None,
            start_time: None,
            after_snapshot_id: None,
            run_id: None,
            logs: None,
            status: TaskStatus::New,
            results: None,
            end_time: None,
            duration: None,
            created_at: t,
            updated_at: t,
        }
    }
}

impl Entity for Task {
    const COLLECTION: Collection = Collection::Task;

    fn id(&self) -> &str {
        &self.id
    }
}
