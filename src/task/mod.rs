#![forbid(unsafe_code)]

//! Task runner: executes a command inside a project environment, bracketed by an invisible
//! snapshot before and after the run.

pub mod results;

use std::collections::BTreeMap;
use std::io::IsTerminal as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};

use crate::config::TaskConfig;
use crate::core::layout::{Layout, TASK_LOG_FILE};
use crate::core::time::{format_timestamp, now, seconds_between};
use crate::core::tree;
use crate::entity::{Snapshot, Task, TaskStatus, WorkspaceKind};
use crate::environment::{RunOptions, RunOutcome, VolumeMount, task_container_name};
use crate::error::{DatmoError, io_at};
use crate::file::{PathMapping, resolve_paths};
use crate::snapshot::{
    DEFAULT_STATS_FILENAME, SnapshotComposer, SnapshotCreate, find_file_named, read_json_map,
};
use crate::storage::{Dal, Query, Sort};

pub use results::parse_logs;

/// Per-run parameters of a task.
#[derive(Debug, Clone, Default)]
pub struct TaskRunOptions {
    pub command: Option<String>,
    pub command_list: Option<Vec<String>>,
    pub interactive: bool,
    pub detach: bool,
    pub gpu: bool,
    pub ports: Vec<String>,
    pub mem_limit: Option<String>,
    pub workspace: Option<WorkspaceKind>,
    /// `SRC` or `SRC>DEST`, each mounted at `/data/<DEST>`.
    pub data_paths: Vec<String>,
}

impl TaskRunOptions {
    /// Options for running `task` again.
    #[must_use]
    pub fn from_task(task: &Task) -> Self {
        Self {
            command: task.command.clone(),
            command_list: task.command_list.clone(),
            interactive: task.interactive,
            detach: task.detach,
            gpu: task.gpu,
            ports: task.ports.clone().unwrap_or_default(),
            mem_limit: task.mem_limit.clone(),
            workspace: task.workspace,
            data_paths: Vec::new(),
        }
    }

    #[must_use]
    pub fn for_workspace(workspace: WorkspaceKind) -> Self {
        Self {
            command_list: Some(
                workspace
                    .default_command()
                    .iter()
                    .map(|s| (*s).to_owned())
                    .collect(),
            ),
            interactive: workspace.is_attached(),
            ports: workspace
                .default_ports()
                .iter()
                .map(|s| (*s).to_owned())
                .collect(),
            workspace: Some(workspace),
            ..Self::default()
        }
    }
}

/// Fills in whichever of the string and token forms of the command is missing.
fn resolve_command(
    opts: &TaskRunOptions,
) -> Result<(Option<String>, Option<Vec<String>>), DatmoError> {
    match (&opts.command, &opts.command_list) {
        (Some(cmd), Some(list)) => Ok((Some(cmd.clone()), Some(list.clone()))),
        (Some(cmd), None) => {
            let tokens = shlex::split(cmd).ok_or_else(|| {
                DatmoError::InvalidArgumentType(format!("cannot tokenise command '{cmd}'"))
            })?;
            if tokens.is_empty() {
                return Err(DatmoError::TaskNoCommandGiven);
            }
            Ok((Some(cmd.clone()), Some(tokens)))
        }
        (None, Some(list)) if !list.is_empty() => Ok((Some(list.join(" ")), Some(list.clone()))),
        // The container's default entrypoint serves interactive sessions.
        _ if opts.interactive => Ok((None, None)),
        _ => Err(DatmoError::TaskNoCommandGiven),
    }
}

fn ensure_new(task: &Task) -> Result<(), DatmoError> {
    if task.status == TaskStatus::New {
        return Ok(());
    }
    Err(DatmoError::task_run(format!(
        "task {} is already running or has run (status {})",
        task.id, task.status
    )))
}

pub struct TaskRunner {
    dal: Dal,
    layout: Layout,
    snapshots: Arc<SnapshotComposer>,
    settings: TaskConfig,
}

impl TaskRunner {
    #[must_use]
    pub fn new(
        dal: Dal,
        layout: Layout,
        snapshots: Arc<SnapshotComposer>,
        settings: TaskConfig,
    ) -> Self {
        Self {
            dal,
            layout,
            snapshots,
            settings,
        }
    }

    #[must_use]
    pub fn snapshots(&self) -> &SnapshotComposer {
        &self.snapshots
    }

    /// A NEW task in the current session.
    pub fn create(&self) -> Result<Task, DatmoError> {
        let mut task = Task::new(self.snapshots.project_id());
        task.session_id = self.snapshots.sessions().current_id()?;
        self.dal.create(&task)
    }

    /// Runs a NEW task to completion (or, when detached, until the container has started).
    ///
    /// Failures after the task has been marked RUNNING still leave it FAILED with an
    /// after-snapshot, and are returned as `task-run` errors.
    pub async fn run(
        &self,
        task_id: &str,
        snapshot: SnapshotCreate,
        opts: TaskRunOptions,
    ) -> Result<Task, DatmoError> {
        let (command, command_list) = resolve_command(&opts)?;
        if opts.detach && opts.interactive {
            return Err(DatmoError::TaskInteractiveDetach);
        }
        let data_mounts = resolve_paths(self.layout.root(), &opts.data_paths)?;
        ensure_new(&self.dal.get::<Task>(task_id)?)?;

        let before = self.snapshots.create(&SnapshotCreate {
            message: Some(format!(
                "autogenerated snapshot created before task {task_id} is run"
            )),
            task_id: Some(task_id.to_owned()),
            visible: Some(false),
            ..snapshot.clone()
        })?;
        if before.environment_id.is_empty() {
            return Err(DatmoError::RequiredArgumentMissing(
                "environment_id".to_owned(),
            ));
        }

        let task_dir = self.layout.task_dir(task_id);
        let log_path = task_dir.join(TASK_LOG_FILE);
        let patch = json!({
            "status": TaskStatus::Running,
            "before_snapshot_id": before.id,
            "command": command,
            "command_list": command_list,
            "interactive": opts.interactive,
            "detach": opts.detach,
            "gpu": opts.gpu,
            "ports": (!opts.ports.is_empty()).then_some(&opts.ports),
            "mem_limit": opts.mem_limit,
            "workspace": opts.workspace,
            "task_dirpath": self.layout.relative(&task_dir),
            "log_filepath": self.layout.relative(&log_path),
            "start_time": format_timestamp(now()),
        });
        let task = self.dal.compare_and_update(task_id, ensure_new, patch)?;
        tracing::info!(task_id, before_snapshot_id = %before.id, "task running");

        let finished = match self.execute(&task, &before, data_mounts).await {
            Ok(outcome) if task.detach => self.record_detached(&task, outcome),
            Ok(outcome) => self.complete(&task, &snapshot, &before, outcome),
            Err(e) => Err(e),
        };
        match finished {
            Ok(task) => Ok(task),
            Err(e) => Err(self.fail(&task, &snapshot, &before, e)),
        }
    }

    /// Prepares the scratch directory, then builds and runs the environment.
    async fn execute(
        &self,
        task: &Task,
        before: &Snapshot,
        data_mounts: Vec<PathMapping>,
    ) -> Result<RunOutcome, DatmoError> {
        let task_dir = self.layout.task_dir(&task.id);
        std::fs::create_dir_all(&task_dir).map_err(io_at(&task_dir))?;
        let inputs = self
            .snapshots
            .files()
            .path_of(&before.file_collection_id)?;
        tree::copy_into(&inputs, &task_dir)?;
        let log_path = task_dir.join(TASK_LOG_FILE);
        std::fs::write(&log_path, b"").map_err(io_at(&log_path))?;

        let mut volumes = vec![
            VolumeMount {
                host: task_dir.clone(),
                bind: "/task/".to_owned(),
                mode: "rw".to_owned(),
            },
            VolumeMount {
                host: self.layout.root().to_path_buf(),
                bind: "/home/".to_owned(),
                mode: "rw".to_owned(),
            },
        ];
        volumes.extend(data_mounts.into_iter().map(|m| VolumeMount {
            host: m.src,
            bind: format!("/data/{}", m.dest),
            mode: "rw".to_owned(),
        }));
        let container_name = task_container_name(&task.project_id, &task.id);
        let options = RunOptions {
            command: task.command_list.clone(),
            ports: task.ports.clone().unwrap_or_default(),
            name: Some(container_name.clone()),
            volumes,
            mem_limit: task.mem_limit.clone(),
            gpu: task.gpu,
            detach: task.detach,
            stdin_open: task.interactive,
            tty: task.interactive && std::io::stdin().is_terminal(),
        };

        let snapshots = Arc::clone(&self.snapshots);
        let environment_id = before.environment_id.clone();
        let workspace = task.workspace;
        let url_attempts = self.settings.workspace_url_attempts;
        let handle = tokio::task::spawn_blocking(move || {
            let envs = snapshots.environments();
            envs.build(&environment_id, workspace)?;
            if let Some(ws) = workspace.filter(|ws| !ws.is_attached()) {
                let driver = Arc::clone(envs.driver());
                let name = container_name.clone();
                std::thread::spawn(move || {
                    if let Some(url) = driver.extract_workspace_url(&name, Some(ws), url_attempts) {
                        println!("{ws} is available at {url}");
                    }
                });
            }
            envs.run(&environment_id, &options, &log_path)
        });
        handle
            .await
            .map_err(|e| DatmoError::task_run(format!("task {} was aborted: {e}", task.id)))?
    }

    fn record_detached(&self, task: &Task, outcome: RunOutcome) -> Result<Task, DatmoError> {
        tracing::info!(task_id = %task.id, run_id = %outcome.run_id, "task detached");
        self.dal.update(
            &task.id,
            json!({ "run_id": outcome.run_id, "logs": outcome.logs }),
        )
    }

    fn complete(
        &self,
        task: &Task,
        snapshot: &SnapshotCreate,
        before: &Snapshot,
        outcome: RunOutcome,
    ) -> Result<Task, DatmoError> {
        let results = parse_logs(&outcome.logs);
        let after = self.after_snapshot(task, snapshot, before, &results)?;
        let status = if outcome.exit_code == 0 {
            TaskStatus::Success
        } else {
            TaskStatus::Failed
        };
        let end = now();
        let patch = json!({
            "after_snapshot_id": after.id,
            "run_id": outcome.run_id,
            "logs": outcome.logs,
            "status": status,
            "results": results,
            "end_time": format_timestamp(end),
            "duration": seconds_between(task.start_time.unwrap_or(end), end),
        });
        if let Some(done) = self.finish(&task.id, patch)? {
            tracing::info!(task_id = %task.id, status = %done.status, exit_code = outcome.exit_code, "task finished");
            return Ok(done);
        }
        // A concurrent stop already recorded the final state. Keep the run's output.
        let current: Task = self.dal.get(&task.id)?;
        let mut output = json!({
            "run_id": outcome.run_id,
            "logs": outcome.logs,
            "results": results,
        });
        if current.after_snapshot_id.is_none() {
            output["after_snapshot_id"] = json!(after.id);
        }
        self.dal.update(&task.id, output)
    }

    /// Records FAILED (with an after-snapshot when one can still be taken) and wraps `cause`.
    /// A task that was stopped meanwhile keeps its STOPPED state.
    fn fail(
        &self,
        task: &Task,
        snapshot: &SnapshotCreate,
        before: &Snapshot,
        cause: DatmoError,
    ) -> DatmoError {
        tracing::warn!(task_id = %task.id, error = %cause, "task failed");
        let still_running = self
            .dal
            .get::<Task>(&task.id)
            .is_ok_and(|t| t.status == TaskStatus::Running);
        if still_running {
            let end = now();
            let mut patch = json!({
                "status": TaskStatus::Failed,
                "end_time": format_timestamp(end),
                "duration": seconds_between(task.start_time.unwrap_or(end), end),
            });
            match self.after_snapshot(task, snapshot, before, &BTreeMap::new()) {
                Ok(after) => patch["after_snapshot_id"] = json!(after.id),
                Err(e) => tracing::warn!(task_id = %task.id, error = %e, "no after snapshot for failed task"),
            }
            if let Err(e) = self.finish(&task.id, patch) {
                tracing::warn!(task_id = %task.id, error = %e, "could not record task failure");
            }
        }
        DatmoError::TaskRun {
            msg: format!("task {} failed: {cause}", task.id),
            source: Some(Box::new(cause)),
        }
    }

    /// Applies a final-state `patch` while the task is still RUNNING. `None` means another path
    /// (a stop, or the run itself) already finished it.
    fn finish(&self, task_id: &str, patch: Value) -> Result<Option<Task>, DatmoError> {
        let mut finished_as = None;
        let result = self.dal.compare_and_update::<Task>(
            task_id,
            |t| {
                if t.status == TaskStatus::Running {
                    Ok(())
                } else {
                    finished_as = Some(t.status);
                    Err(DatmoError::task_run(format!("task {} is no longer running", t.id)))
                }
            },
            patch,
        );
        match (result, finished_as) {
            (Ok(task), _) => Ok(Some(task)),
            (Err(_), Some(status)) => {
                tracing::debug!(task_id, %status, "task already finished");
                Ok(None)
            }
            (Err(e), None) => Err(e),
        }
    }

    /// Snapshot of the scratch directory, reusing the before-snapshot's environment. Parsed
    /// results are merged over the stats the caller supplied or the run wrote.
    fn after_snapshot(
        &self,
        task: &Task,
        snapshot: &SnapshotCreate,
        before: &Snapshot,
        results: &BTreeMap<String, String>,
    ) -> Result<Snapshot, DatmoError> {
        let task_dir = self.layout.task_dir(&task.id);
        let mut paths = Vec::new();
        if task_dir.is_dir() {
            for entry in std::fs::read_dir(&task_dir).map_err(io_at(&task_dir))? {
                let entry = entry.map_err(io_at(&task_dir))?;
                paths.push(entry.path().display().to_string());
            }
        }
        paths.sort();

        let mut stats = match (&snapshot.stats, &snapshot.stats_filepath) {
            (Some(stats), _) => stats.clone(),
            (None, Some(path)) => read_json_map(path)?,
            (None, None) => {
                let name = snapshot
                    .stats_filename
                    .as_deref()
                    .unwrap_or(DEFAULT_STATS_FILENAME);
                match find_file_named(&task_dir, name)? {
                    Some(path) => read_json_map(&path)?,
                    None => BTreeMap::new(),
                }
            }
        };
        for (k, v) in results {
            stats.insert(k.clone(), Value::String(v.clone()));
        }

        self.snapshots.create(&SnapshotCreate {
            message: Some(format!(
                "autogenerated snapshot created after task {} is run",
                task.id
            )),
            environment_id: Some(before.environment_id.clone()),
            environment_paths: None,
            file_collection_id: None,
            paths: Some(paths),
            stats: Some(stats),
            stats_filepath: None,
            stats_filename: None,
            task_id: Some(task.id.clone()),
            visible: Some(false),
            ..snapshot.clone()
        })
    }

    fn environment_of(&self, task: &Task) -> Result<Option<String>, DatmoError> {
        let Some(snapshot_id) = task
            .after_snapshot_id
            .as_deref()
            .or(task.before_snapshot_id.as_deref())
        else {
            return Ok(None);
        };
        let snapshot: Snapshot = self.dal.get(snapshot_id)?;
        Ok(Some(snapshot.environment_id))
    }

    /// Stops one task's container, or every task container of the project.
    pub async fn stop(&self, task_id: Option<&str>, all: bool) -> Result<(), DatmoError> {
        match (task_id, all) {
            (None, false) => Err(DatmoError::RequiredArgumentMissing(
                "task id or all".to_owned(),
            )),
            (Some(_), true) => Err(DatmoError::TooManyArguments(
                "give either a task id or all, not both".to_owned(),
            )),
            (Some(id), false) => self.stop_task(id).await,
            (None, true) => {
                self.snapshots.environments().stop(None, None, true)?;
                let running = self.dal.query::<Task>(
                    &Query::new()
                        .eq("project_id", self.snapshots.project_id())
                        .eq("status", TaskStatus::Running.as_str()),
                )?;
                for task in running {
                    self.mark_stopped(&task)?;
                }
                Ok(())
            }
        }
    }

    async fn stop_task(&self, task_id: &str) -> Result<(), DatmoError> {
        let mut task: Task = self.dal.get(task_id)?;
        let mut attempt = 1;
        // Snapshot ids land a moment after the status flips to RUNNING.
        while task.status == TaskStatus::Running
            && self.environment_of(&task)?.is_none()
            && attempt < self.settings.stop_retry_attempts
        {
            tokio::time::sleep(Duration::from_millis(self.settings.stop_retry_interval_ms)).await;
            task = self.dal.get(task_id)?;
            attempt += 1;
        }

        if self.environment_of(&task)?.is_some() {
            let name = task_container_name(&task.project_id, &task.id);
            self.snapshots
                .environments()
                .stop(None, Some(&name), false)?;
        }
        if task.status == TaskStatus::Running {
            self.mark_stopped(&task)?;
        }
        Ok(())
    }

    fn mark_stopped(&self, task: &Task) -> Result<(), DatmoError> {
        let logs = task
            .log_filepath
            .as_deref()
            .map(|rel| self.layout.root().join(rel))
            .and_then(|path| std::fs::read_to_string(path).ok())
            .unwrap_or_default();
        let results = parse_logs(&logs);
        let end = now();
        let mut patch = json!({
            "status": TaskStatus::Stopped,
            "logs": logs,
            "results": results,
            "end_time": format_timestamp(end),
            "duration": seconds_between(task.start_time.unwrap_or(end), end),
        });
        if task.after_snapshot_id.is_none() {
            let before: Option<Snapshot> = task
                .before_snapshot_id
                .as_deref()
                .map(|id| self.dal.get(id))
                .transpose()?;
            if let Some(before) = before {
                let after =
                    self.after_snapshot(task, &SnapshotCreate::default(), &before, &results)?;
                patch["after_snapshot_id"] = json!(after.id);
            }
        }
        if self.finish(&task.id, patch)?.is_some() {
            tracing::info!(task_id = %task.id, "task stopped");
        }
        Ok(())
    }

    /// Stops the task, then removes its record and scratch directory.
    pub async fn delete(&self, task_id: &str) -> Result<(), DatmoError> {
        self.stop_task(task_id).await?;
        self.dal.delete::<Task>(task_id)?;
        tree::remove_path(&self.layout.task_dir(task_id))
    }

    /// Accepts a full id or a unique prefix.
    pub fn get(&self, id: &str) -> Result<Task, DatmoError> {
        self.dal.get_by_shortened_id(id)
    }

    /// Tasks of the project, newest first.
    pub fn list(&self) -> Result<Vec<Task>, DatmoError> {
        self.dal.query_sorted(
            &Query::new().eq("project_id", self.snapshots.project_id()),
            Some(&Sort::descending("created_at")),
        )
    }

    /// Tasks created while `session` (name or id) was current, newest first.
    pub fn list_in_session(&self, session: &str) -> Result<Vec<Task>, DatmoError> {
        let session = self.snapshots.sessions().resolve(session)?;
        self.dal.query_sorted(
            &Query::new()
                .eq("project_id", self.snapshots.project_id())
                .eq("session_id", session.id.as_str()),
            Some(&Sort::descending("created_at")),
        )
    }

    /// Files a task produced: the after-snapshot's collection, else the live scratch directory,
    /// else the before-snapshot's collection.
    pub fn get_files(&self, task_id: &str) -> Result<Vec<PathBuf>, DatmoError> {
        let task: Task = self.dal.get(task_id)?;
        let dir = if let Some(after) = task.after_snapshot_id.as_deref() {
            let snapshot: Snapshot = self.dal.get(after)?;
            self.snapshots.files().path_of(&snapshot.file_collection_id)?
        } else if self.layout.task_dir(task_id).is_dir() {
            self.layout.task_dir(task_id)
        } else if let Some(before) = task.before_snapshot_id.as_deref() {
            let snapshot: Snapshot = self.dal.get(before)?;
            self.snapshots.files().path_of(&snapshot.file_collection_id)?
        } else {
            return Err(DatmoError::PathDoesNotExist(self.layout.task_dir(task_id)));
        };
        Ok(tree::list_files(&dir)?
            .into_iter()
            .map(|rel| dir.join(rel))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::code::{CodeDriver as _, CodeStore, FileCodeDriver};
    use crate::config::Config;
    use crate::environment::EnvironmentStore;
    use crate::environment::testing::FakeDriver;
    use crate::file::{FileCollectionStore, LocalFileDriver};

    fn runner(root: &Path, driver: Arc<FakeDriver>) -> TaskRunner {
        let cfg = Config::default();
        let layout = Layout::new(root.to_path_buf(), &cfg);
        let dal = Dal::open(&layout.database_dir()).unwrap();
        let file_driver = LocalFileDriver::new(layout.clone());
        file_driver.init().unwrap();
        let code_driver = FileCodeDriver::new(layout.clone());
        code_driver.init().unwrap();
        let files = FileCollectionStore::new(dal.clone(), "p", file_driver);
        let envs = EnvironmentStore::new(dal.clone(), "p", files.clone(), driver, true);
        let code = CodeStore::new(dal.clone(), "p", Box::new(code_driver));
        let composer = SnapshotComposer::new(dal.clone(), "p", code, files, envs);
        TaskRunner::new(dal, layout, Arc::new(composer), cfg.task)
    }

    fn script(cmd: &str) -> TaskRunOptions {
        TaskRunOptions {
            command: Some(cmd.to_owned()),
            ..TaskRunOptions::default()
        }
    }

    #[tokio::test]
    async fn run_records_results_between_two_snapshots() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        std::fs::write(root.join("script.py"), "print(\"accuracy:0.45\")\n").unwrap();
        let driver = Arc::new(FakeDriver::printing("accuracy:0.45\n", 0));
        let tasks = runner(root, driver.clone());

        let task = tasks.create().unwrap();
        assert_eq!(task.status, TaskStatus::New);
        let done = tasks
            .run(&task.id, SnapshotCreate::default(), script("python script.py"))
            .await
            .unwrap();

        assert_eq!(done.status, TaskStatus::Success);
        assert_eq!(done.results.as_ref().unwrap()["accuracy"], "0.45");
        assert!(done.logs.as_deref().unwrap().contains("accuracy:0.45"));
        assert_eq!(
            done.command_list.as_deref().unwrap(),
            ["python".to_owned(), "script.py".to_owned()]
        );
        let duration = seconds_between(done.start_time.unwrap(), done.end_time.unwrap());
        assert!((done.duration.unwrap() - duration).abs() < 1e-9);

        let before = tasks.snapshots().get(done.before_snapshot_id.as_deref().unwrap()).unwrap();
        let after = tasks.snapshots().get(done.after_snapshot_id.as_deref().unwrap()).unwrap();
        assert!(!before.visible && !after.visible);
        assert_eq!(before.environment_id, after.environment_id);
        assert_eq!(after.stats.get("accuracy"), Some(&json!("0.45")));

        let runs = driver.runs.lock().unwrap();
        let opts = &runs[0];
        assert_eq!(opts.name.as_deref(), Some(format!("datmo-task-p-{}", task.id).as_str()));
        let binds: Vec<&str> = opts.volumes.iter().map(|v| v.bind.as_str()).collect();
        assert_eq!(binds, ["/task/", "/home/"]);

        let files = tasks.get_files(&task.id).unwrap();
        assert!(files.iter().any(|p| p.ends_with(TASK_LOG_FILE)));
    }

    #[tokio::test]
    async fn second_run_of_same_task_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tasks = runner(dir.path(), Arc::new(FakeDriver::printing("", 0)));
        let task = tasks.create().unwrap();
        tasks
            .run(&task.id, SnapshotCreate::default(), script("true"))
            .await
            .unwrap();
        let err = tasks
            .run(&task.id, SnapshotCreate::default(), script("true"))
            .await
            .unwrap_err();
        assert_eq!(err.key(), "task-run");
    }

    #[tokio::test]
    async fn argument_errors_never_reach_the_runtime() {
        let dir = tempfile::tempdir().expect("tempdir");
        let driver = Arc::new(FakeDriver::default());
        let tasks = runner(dir.path(), driver.clone());
        let task = tasks.create().unwrap();

        let both = TaskRunOptions {
            interactive: true,
            detach: true,
            ..script("bash")
        };
        let err = tasks
            .run(&task.id, SnapshotCreate::default(), both)
            .await
            .unwrap_err();
        assert_eq!(err.key(), "task-interactive-detach");

        let err = tasks
            .run(&task.id, SnapshotCreate::default(), TaskRunOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.key(), "task-no-command-given");

        assert!(driver.runs.lock().unwrap().is_empty());
        assert_eq!(tasks.get(&task.id).unwrap().status, TaskStatus::New);
    }

    #[tokio::test]
    async fn non_zero_exit_is_failed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tasks = runner(dir.path(), Arc::new(FakeDriver::printing("boom\n", 2)));
        let task = tasks.create().unwrap();
        let done = tasks
            .run(&task.id, SnapshotCreate::default(), script("false"))
            .await
            .unwrap();
        assert_eq!(done.status, TaskStatus::Failed);
        assert!(done.after_snapshot_id.is_some());
        assert!(done.results.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stop_during_run_is_not_overwritten_by_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let driver = Arc::new(FakeDriver::printing("", 0));
        let tasks = runner(dir.path(), driver.clone());
        let task = tasks.create().unwrap();
        *driver.stop_during_run.lock().unwrap() = Some((tasks.dal.clone(), task.id.clone()));

        let err = tasks
            .run(&task.id, SnapshotCreate::default(), script("sleep 100"))
            .await
            .unwrap_err();
        assert_eq!(err.key(), "task-run");
        let task = tasks.get(&task.id).unwrap();
        assert_eq!(task.status, TaskStatus::Stopped);
        assert!(task.end_time.is_none());
    }

    #[tokio::test]
    async fn a_finished_task_cannot_be_finished_again() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tasks = runner(dir.path(), Arc::new(FakeDriver::printing("", 0)));
        let task = tasks.create().unwrap();
        let done = tasks
            .run(&task.id, SnapshotCreate::default(), script("true"))
            .await
            .unwrap();
        assert_eq!(done.status, TaskStatus::Success);

        let again = tasks
            .finish(&task.id, json!({ "status": TaskStatus::Failed }))
            .unwrap();
        assert!(again.is_none());
        assert_eq!(tasks.get(&task.id).unwrap().status, TaskStatus::Success);
    }

    #[tokio::test]
    async fn stop_all_marks_detached_tasks_stopped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let driver = Arc::new(FakeDriver::printing("", 0));
        let tasks = runner(dir.path(), driver.clone());

        let mut ids = Vec::new();
        for _ in 0..3 {
            let task = tasks.create().unwrap();
            let running = tasks
                .run(
                    &task.id,
                    SnapshotCreate::default(),
                    TaskRunOptions {
                        detach: true,
                        ..script("sleep 100")
                    },
                )
                .await
                .unwrap();
            assert_eq!(running.status, TaskStatus::Running);
            ids.push(task.id);
        }

        assert_eq!(tasks.stop(None, false).await.unwrap_err().key(), "required-argument-missing");
        assert_eq!(
            tasks.stop(Some(ids[0].as_str()), true).await.unwrap_err().key(),
            "too-many-arguments"
        );
        tasks.stop(None, true).await.unwrap();
        for id in &ids {
            let task = tasks.get(id).unwrap();
            assert_eq!(task.status, TaskStatus::Stopped);
            assert!(task.after_snapshot_id.is_some());
        }
        assert!(driver.stopped_terms.lock().unwrap().contains(&"datmo-task-p".to_owned()));
    }

    #[tokio::test]
    async fn delete_stops_and_removes_scratch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let driver = Arc::new(FakeDriver::printing("", 0));
        let tasks = runner(dir.path(), driver.clone());
        let task = tasks.create().unwrap();
        tasks
            .run(
                &task.id,
                SnapshotCreate::default(),
                TaskRunOptions {
                    detach: true,
                    ..script("sleep 100")
                },
            )
            .await
            .unwrap();

        tasks.delete(&task.id).await.unwrap();
        assert!(tasks.get(&task.id).unwrap_err().is_not_found());
        assert!(!tasks.layout.task_dir(&task.id).exists());
        let name = format!("datmo-task-p-{}", task.id);
        assert!(driver.stopped_terms.lock().unwrap().contains(&name));
    }

    #[tokio::test]
    async fn data_paths_mount_under_data() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        std::fs::create_dir_all(root.join("raw")).unwrap();
        std::fs::write(root.join("train.csv"), "x\n").unwrap();
        let driver = Arc::new(FakeDriver::printing("", 0));
        let tasks = runner(root, driver.clone());

        let task = tasks.create().unwrap();
        let dup = TaskRunOptions {
            data_paths: vec!["train.csv>d".to_owned(), "raw>d".to_owned()],
            ..script("ls")
        };
        let err = tasks
            .run(&task.id, SnapshotCreate::default(), dup)
            .await
            .unwrap_err();
        assert_eq!(err.key(), "file-already-exists");

        let ok = TaskRunOptions {
            data_paths: vec!["train.csv".to_owned(), "raw>input".to_owned()],
            ..script("ls")
        };
        tasks
            .run(&task.id, SnapshotCreate::default(), ok)
            .await
            .unwrap();
        let runs = driver.runs.lock().unwrap();
        let binds: Vec<&str> = runs[0].volumes.iter().map(|v| v.bind.as_str()).collect();
        assert_eq!(binds, ["/task/", "/home/", "/data/train.csv", "/data/input"]);
    }

    #[test]
    fn command_forms_are_completed() {
        let (cmd, list) = resolve_command(&script("python  train.py --lr '0.1 0.2'")).unwrap();
        assert_eq!(cmd.as_deref(), Some("python  train.py --lr '0.1 0.2'"));
        assert_eq!(list.unwrap(), ["python", "train.py", "--lr", "0.1 0.2"]);

        let (cmd, _) = resolve_command(&TaskRunOptions {
            command_list: Some(vec!["a".to_owned(), "b".to_owned()]),
            ..TaskRunOptions::default()
        })
        .unwrap();
        assert_eq!(cmd.as_deref(), Some("a b"));

        let interactive = TaskRunOptions {
            interactive: true,
            ..TaskRunOptions::default()
        };
        assert_eq!(resolve_command(&interactive).unwrap(), (None, None));
    }
}
