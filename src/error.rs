#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DatmoError {
    #[error("invalid project path: {0}")]
    InvalidProjectPath(PathBuf),

    #[error("project is not initialized (run `datmo init`)")]
    ProjectNotInitialized,

    #[error("project model is not initialized")]
    ModelNotInitialized,

    #[error("session does not exist: {0}")]
    SessionDoesNotExist(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("required argument missing: {0}")]
    RequiredArgumentMissing(String),

    #[error("too many arguments: {0}")]
    TooManyArguments(String),

    #[error("arguments '{first}' and '{second}' are mutually exclusive")]
    MutuallyExclusive { first: String, second: String },

    #[error("invalid argument type: {0}")]
    InvalidArgumentType(String),

    #[error("path does not exist: {0}")]
    PathDoesNotExist(PathBuf),

    #[error("file already exists: {0}")]
    FileAlreadyExists(String),

    #[error("invalid destination name '{0}': must not contain a path separator")]
    InvalidDestinationName(String),

    #[error("code is not initialized")]
    CodeNotInitialized,

    #[error("commit does not exist: {0}")]
    CommitDoesNotExist(String),

    #[error("{0} does not exist")]
    DoesNotExist(String),

    #[error("{collection} not found: {id}")]
    EntityNotFound { collection: String, id: String },

    #[error("unknown entity collection: {0}")]
    EntityCollectionNotFound(String),

    #[error("more than one {collection} found matching '{prefix}'")]
    MoreThanOneFound { collection: String, prefix: String },

    #[error("field '{field}' has the wrong type: {msg}")]
    IncorrectType { field: String, msg: String },

    #[error("unstaged changes in {0}")]
    UnstagedChanges(String),

    #[error("environment init failed: {0}")]
    EnvironmentInitFailed(String),

    #[error("environment does not exist: {0}")]
    EnvironmentDoesNotExist(String),

    #[error("environment execution error: {0}")]
    EnvironmentExecution(String),

    #[error("could not create environment requirements: {0}")]
    EnvironmentRequirementsCreate(String),

    #[error("gpu support is not enabled: {0}")]
    GpuSupportNotEnabled(String),

    #[error("{msg}")]
    TaskRun {
        msg: String,
        #[source]
        source: Option<Box<DatmoError>>,
    },

    #[error("no command given for task")]
    TaskNoCommandGiven,

    #[error("task cannot be both interactive and detached")]
    TaskInteractiveDetach,

    #[error("task is not complete: {0}")]
    TaskNotComplete(String),

    #[error("invalid arguments to create snapshot from task: {0}")]
    SnapshotCreateFromTaskArgs(String),

    #[error("validation failed: {}", format_fields(.0))]
    ValidationFailed(BTreeMap<String, String>),

    #[error("config error: {0}")]
    Config(String),

    #[error("invalid config key '{0}'")]
    InvalidConfigKey(String),

    #[error("invalid config value for '{key}': {msg}")]
    InvalidConfigValue { key: String, msg: String },

    #[error("io error at {path}: {source}")]
    IoPath {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid json at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{0}")]
    Other(String),
}

impl DatmoError {
    /// Stable localisation key for the error kind.
    #[must_use]
    pub fn key(&self) -> &'static str {
        match self {
            Self::InvalidProjectPath(_) => "invalid-project-path",
            Self::ProjectNotInitialized => "project-not-initialized",
            Self::ModelNotInitialized => "model-not-initialized",
            Self::SessionDoesNotExist(_) => "session-does-not-exist",
            Self::InvalidOperation(_) => "invalid-operation",
            Self::RequiredArgumentMissing(_) => "required-argument-missing",
            Self::TooManyArguments(_) => "too-many-arguments",
            Self::MutuallyExclusive { .. } => "mutually-exclusive",
            Self::InvalidArgumentType(_) => "invalid-argument-type",
            Self::PathDoesNotExist(_) => "path-does-not-exist",
            Self::FileAlreadyExists(_) => "file-already-exists",
            Self::InvalidDestinationName(_) => "invalid-destination-name",
            Self::CodeNotInitialized => "code-not-initialized",
            Self::CommitDoesNotExist(_) => "commit-does-not-exist",
            Self::DoesNotExist(_) => "does-not-exist",
            Self::EntityNotFound { .. } => "entity-not-found",
            Self::EntityCollectionNotFound(_) => "entity-collection-not-found",
            Self::MoreThanOneFound { .. } => "more-than-one-found",
            Self::IncorrectType { .. } => "incorrect-type",
            Self::UnstagedChanges(_) => "unstaged-changes",
            Self::EnvironmentInitFailed(_) => "environment-init-failed",
            Self::EnvironmentDoesNotExist(_) => "environment-does-not-exist",
            Self::EnvironmentExecution(_) => "environment-execution",
            Self::EnvironmentRequirementsCreate(_) => "environment-requirements-create",
            Self::GpuSupportNotEnabled(_) => "gpu-support-not-enabled",
            Self::TaskRun { .. } => "task-run",
            Self::TaskNoCommandGiven => "task-no-command-given",
            Self::TaskInteractiveDetach => "task-interactive-detach",
            Self::TaskNotComplete(_) => "task-not-complete",
            Self::SnapshotCreateFromTaskArgs(_) => "snapshot-create-from-task-args",
            Self::ValidationFailed(_) => "validation-failed",
            Self::Config(_) | Self::InvalidConfigKey(_) | Self::InvalidConfigValue { .. } => {
                "config"
            }
            Self::IoPath { .. } => "io",
            Self::Json { .. } => "json",
            Self::Other(_) => "other",
        }
    }

    pub fn task_run(msg: impl Into<String>) -> Self {
        Self::TaskRun {
            msg: msg.into(),
            source: None,
        }
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::EntityNotFound { .. })
    }
}

/// Maps an `io::Error` to [`DatmoError::IoPath`] for `path`.
pub fn io_at(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> DatmoError {
    let path = path.into();
    move |source| DatmoError::IoPath { path, source }
}

fn format_fields(fields: &BTreeMap<String, String>) -> String {
    fields
        .iter()
        .map(|(k, v)| format!("{k}: {v}"))
        .collect::<Vec<_>>()
        .join(", ")
}
