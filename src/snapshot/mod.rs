#![forbid(unsafe_code)]

//! Snapshots bind one code revision, one environment, one file collection, a config map and a
//! stats map into a single deduplicated record.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::{Value, json};
use walkdir::WalkDir;

use crate::code::CodeStore;
use crate::core::hash::manifest_hash;
use crate::entity::snapshot::StatMap;
use crate::entity::{Snapshot, Task};
use crate::environment::{EnvironmentCreate, EnvironmentStore};
use crate::error::{DatmoError, io_at};
use crate::file::FileCollectionStore;
use crate::session::SessionStore;
use crate::storage::{Dal, Query, Sort};

pub const DEFAULT_CONFIG_FILENAME: &str = "config.json";
pub const DEFAULT_STATS_FILENAME: &str = "stats.json";

/// Raw inputs for [`SnapshotComposer::create`]. For every component the first populated field
/// wins; absent components are created from the working tree.
#[derive(Debug, Clone, Default)]
pub struct SnapshotCreate {
    pub message: Option<String>,

    pub code_id: Option<String>,
    pub commit_id: Option<String>,

    pub environment_id: Option<String>,
    pub environment_paths: Option<Vec<String>>,

    pub file_collection_id: Option<String>,
    pub paths: Option<Vec<String>>,

    pub config: Option<StatMap>,
    pub config_filepath: Option<PathBuf>,
    pub config_filename: Option<String>,

    pub stats: Option<StatMap>,
    pub stats_filepath: Option<PathBuf>,
    pub stats_filename: Option<String>,

    pub task_id: Option<String>,
    pub label: Option<String>,
    pub visible: Option<bool>,
}

impl SnapshotCreate {
    #[must_use]
    pub fn with_message(message: &str) -> Self {
        Self {
            message: Some(message.to_owned()),
            ..Self::default()
        }
    }

    /// Names of fields that pick or build content, which promotion from a task cannot honour.
    fn content_fields(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        let given = [
            ("code_id", self.code_id.is_some()),
            ("commit_id", self.commit_id.is_some()),
            ("environment_id", self.environment_id.is_some()),
            ("environment_paths", self.environment_paths.is_some()),
            ("file_collection_id", self.file_collection_id.is_some()),
            ("paths", self.paths.is_some()),
        ];
        for (name, present) in given {
            if present {
                out.push(name);
            }
        }
        out
    }
}

/// Where a config or stats map is read from.
enum MapSource<'a> {
    Inline(&'a StatMap),
    File(&'a Path),
    Search(&'a str),
}

pub struct SnapshotComposer {
    dal: Dal,
    project_id: String,
    code: CodeStore,
    files: FileCollectionStore,
    environments: EnvironmentStore,
    sessions: SessionStore,
}

impl SnapshotComposer {
    #[must_use]
    pub fn new(
        dal: Dal,
        project_id: &str,
        code: CodeStore,
        files: FileCollectionStore,
        environments: EnvironmentStore,
    ) -> Self {
        Self {
            sessions: SessionStore::new(dal.clone(), project_id),
            dal,
            project_id: project_id.to_owned(),
            code,
            files,
            environments,
        }
    }

    #[must_use]
    pub fn code(&self) -> &CodeStore {
        &self.code
    }

    #[must_use]
    pub fn files(&self) -> &FileCollectionStore {
        &self.files
    }

    #[must_use]
    pub fn environments(&self) -> &EnvironmentStore {
        &self.environments
    }

    #[must_use]
    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    #[must_use]
    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn create(&self, opts: &SnapshotCreate) -> Result<Snapshot, DatmoError> {
        let message = required_message(opts.message.as_deref())?;

        let code_id = match (&opts.code_id, &opts.commit_id) {
            (Some(id), _) => self.code.get(id)?.id,
            (None, commit) => self.code.create(commit.as_deref())?.id,
        };

        let environment_id = match (&opts.environment_id, &opts.environment_paths) {
            (Some(id), _) => self.environments.get(id)?.id,
            (None, paths) => {
                self.environments
                    .create(&EnvironmentCreate {
                        paths: paths.clone().unwrap_or_default(),
                        ..EnvironmentCreate::default()
                    })?
                    .id
            }
        };

        let file_collection_id = match (&opts.file_collection_id, &opts.paths) {
            (Some(id), _) => self.files.get(id)?.id,
            (None, paths) => self.files.create(paths.as_deref().unwrap_or_default())?.id,
        };

        let config = self.resolve_map(
            map_source(
                opts.config.as_ref(),
                opts.config_filepath.as_deref(),
                opts.config_filename.as_deref(),
                DEFAULT_CONFIG_FILENAME,
            ),
            &file_collection_id,
        )?;
        let stats = self.resolve_map(
            map_source(
                opts.stats.as_ref(),
                opts.stats_filepath.as_deref(),
                opts.stats_filename.as_deref(),
                DEFAULT_STATS_FILENAME,
            ),
            &file_collection_id,
        )?;

        let mut snapshot = Snapshot::new(&self.project_id, message);
        snapshot.code_id = code_id;
        snapshot.environment_id = environment_id;
        snapshot.file_collection_id = file_collection_id;
        snapshot.config = config;
        snapshot.stats = stats;

        if let Some(existing) = self.find_by_content(&snapshot)? {
            tracing::debug!(snapshot_id = %existing.id, "snapshot content already recorded");
            return Ok(existing);
        }

        snapshot.task_id.clone_from(&opts.task_id);
        snapshot.session_id = self.sessions.current_id()?;
        snapshot.label.clone_from(&opts.label);
        snapshot.visible = opts.visible.unwrap_or(true);
        tracing::info!(snapshot_id = %snapshot.id, visible = snapshot.visible, "recording snapshot");
        self.dal.create(&snapshot)
    }

    /// Any snapshot of this project with the same content key.
    fn find_by_content(&self, candidate: &Snapshot) -> Result<Option<Snapshot>, DatmoError> {
        let query = Query::new()
            .eq("project_id", self.project_id.as_str())
            .eq("code_id", candidate.code_id.as_str())
            .eq("environment_id", candidate.environment_id.as_str())
            .eq("file_collection_id", candidate.file_collection_id.as_str());
        let key = candidate.content_key();
        Ok(self
            .dal
            .query_sorted::<Snapshot>(&query, Some(&Sort::ascending("created_at")))?
            .into_iter()
            .find(|s| s.content_key() == key))
    }

    fn resolve_map(
        &self,
        source: MapSource<'_>,
        file_collection_id: &str,
    ) -> Result<StatMap, DatmoError> {
        match source {
            MapSource::Inline(map) => Ok(map.clone()),
            MapSource::File(path) => {
                if !path.is_file() {
                    return Err(DatmoError::PathDoesNotExist(path.to_path_buf()));
                }
                read_json_map(path)
            }
            MapSource::Search(filename) => match self.find_in_collection(filename, file_collection_id)? {
                Some(path) => read_json_map(&path),
                None => Ok(StatMap::new()),
            },
        }
    }

    /// Looks for `filename` anywhere inside the collection's tree, and nowhere else.
    fn find_in_collection(
        &self,
        filename: &str,
        file_collection_id: &str,
    ) -> Result<Option<PathBuf>, DatmoError> {
        find_file_named(&self.files.path_of(file_collection_id)?, filename)
    }

    /// Promotes the after-snapshot of a finished task to a user-visible snapshot. Task results
    /// are merged into its stats; stats given here override them.
    pub fn create_from_task(&self, task_id: &str, opts: &SnapshotCreate) -> Result<Snapshot, DatmoError> {
        let message = required_message(opts.message.as_deref())?;
        let conflicting = opts.content_fields();
        if !conflicting.is_empty() {
            return Err(DatmoError::SnapshotCreateFromTaskArgs(format!(
                "cannot combine a task with {}",
                conflicting.join(", ")
            )));
        }
        let task: Task = self.dal.get(task_id)?;
        let Some(after_id) = task.after_snapshot_id.as_deref().filter(|_| task.status.is_terminal())
        else {
            return Err(DatmoError::TaskNotComplete(task_id.to_owned()));
        };
        let after: Snapshot = self.dal.get(after_id)?;

        let mut stats = after.stats.clone();
        for (k, v) in task.results.iter().flatten() {
            stats.insert(k.clone(), Value::String(v.clone()));
        }
        if let Some(extra) = &opts.stats {
            stats.extend(extra.clone());
        }
        let mut patch = json!({
            "message": message,
            "stats": stats,
            "visible": true,
            "task_id": task.id,
        });
        if let Some(config) = &opts.config {
            patch["config"] = json!(config);
        }
        if let Some(label) = &opts.label {
            patch["label"] = json!(label);
        }
        self.dal.update(after_id, patch)
    }

    pub fn get(&self, id: &str) -> Result<Snapshot, DatmoError> {
        self.dal.get(id)
    }

    /// Snapshots of the project, newest first.
    pub fn list(&self, visible: Option<bool>) -> Result<Vec<Snapshot>, DatmoError> {
        self.list_where(Query::new(), visible)
    }

    /// Snapshots taken while `session` (name or id) was current, newest first.
    pub fn list_in_session(
        &self,
        session: &str,
        visible: Option<bool>,
    ) -> Result<Vec<Snapshot>, DatmoError> {
        let session = self.sessions.resolve(session)?;
        self.list_where(Query::new().eq("session_id", session.id.as_str()), visible)
    }

    fn list_where(&self, query: Query, visible: Option<bool>) -> Result<Vec<Snapshot>, DatmoError> {
        let mut query = query.eq("project_id", self.project_id.as_str());
        if let Some(visible) = visible {
            query = query.eq("visible", visible);
        }
        self.dal
            .query_sorted(&query, Some(&Sort::descending("created_at")))
    }

    /// Changes the user metadata of a snapshot. Content is immutable.
    pub fn update(
        &self,
        id: &str,
        message: Option<&str>,
        label: Option<&str>,
    ) -> Result<Snapshot, DatmoError> {
        let mut patch = serde_json::Map::new();
        if let Some(message) = message {
            patch.insert("message".to_owned(), json!(required_message(Some(message))?));
        }
        if let Some(label) = label {
            patch.insert("label".to_owned(), json!(label));
        }
        self.dal.update(id, Value::Object(patch))
    }

    pub fn delete(&self, id: &str) -> Result<(), DatmoError> {
        self.dal.delete::<Snapshot>(id)
    }

    /// Restores the working tree to a snapshot: code first, then the files directory, then the
    /// environment image. Nothing is touched while code or files have unstaged changes.
    pub fn checkout(&self, id: &str) -> Result<(), DatmoError> {
        let snapshot = self.get(id)?;
        self.code.check_unstaged_changes()?;
        self.files.check_unstaged_changes()?;

        self.code.checkout(&snapshot.code_id)?;
        self.files.checkout(&snapshot.file_collection_id)?;
        if let Err(e) = self.environments.build(&snapshot.environment_id, None) {
            tracing::warn!(
                environment_id = %snapshot.environment_id,
                error = %e,
                "could not rebuild environment"
            );
        }
        tracing::info!(snapshot_id = id, "checked out snapshot");
        Ok(())
    }

    /// The snapshot matching the working tree, resolved without writing anything. `None` while
    /// any component has unstaged changes or no snapshot records the current state.
    pub fn current(&self) -> Result<Option<Snapshot>, DatmoError> {
        if self.code.has_unstaged_changes()?
            || self.environments.has_unstaged_changes()?
            || self.files.has_unstaged_changes()?
        {
            return Ok(None);
        }
        let commit = self.code.driver().current_hash()?;
        let Some(code) = self.code.find_by_commit(&commit)? else {
            return Ok(None);
        };
        let env_hash = self.environments.current_hash()?;
        let Some(env) = self.environments.find_by_unique_hash(&env_hash)? else {
            return Ok(None);
        };
        let fc_hash = self
            .files
            .current_hash()?
            .unwrap_or_else(|| manifest_hash(&[]));
        let Some(fc) = self.files.find_by_hash(&fc_hash)? else {
            return Ok(None);
        };
        let query = Query::new()
            .eq("project_id", self.project_id.as_str())
            .eq("code_id", code.id.as_str())
            .eq("environment_id", env.id.as_str())
            .eq("file_collection_id", fc.id.as_str());
        let mut matches = self
            .dal
            .query_sorted::<Snapshot>(&query, Some(&Sort::descending("created_at")))?;
        // Prefer what the user created over autogenerated records.
        matches.sort_by_key(|s| !s.visible);
        Ok(matches.into_iter().next())
    }
}

fn required_message(message: Option<&str>) -> Result<&str, DatmoError> {
    match message {
        None => Err(DatmoError::RequiredArgumentMissing("message".to_owned())),
        Some(m) if m.trim().is_empty() => {
            let mut fields = BTreeMap::new();
            fields.insert("message".to_owned(), "must not be empty".to_owned());
            Err(DatmoError::ValidationFailed(fields))
        }
        Some(m) => Ok(m),
    }
}

fn map_source<'a>(
    inline: Option<&'a StatMap>,
    filepath: Option<&'a Path>,
    filename: Option<&'a str>,
    default_filename: &'a str,
) -> MapSource<'a> {
    match (inline, filepath) {
        (Some(map), _) => MapSource::Inline(map),
        (None, Some(path)) => MapSource::File(path),
        (None, None) => MapSource::Search(filename.unwrap_or(default_filename)),
    }
}

/// First file called `filename` below `dir`, in file-name order.
pub(crate) fn find_file_named(dir: &Path, filename: &str) -> Result<Option<PathBuf>, DatmoError> {
    if !dir.is_dir() {
        return Ok(None);
    }
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| DatmoError::Other(format!("{}: {e}", dir.display())))?;
        if entry.file_type().is_file() && entry.file_name() == filename {
            return Ok(Some(entry.into_path()));
        }
    }
    Ok(None)
}

/// Reads a JSON object file into a map.
pub fn read_json_map(path: &Path) -> Result<StatMap, DatmoError> {
    let raw = std::fs::read(path).map_err(io_at(path))?;
    let value: Value = serde_json::from_slice(&raw).map_err(|source| DatmoError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    match value {
        Value::Object(map) => Ok(map.into_iter().collect()),
        other => Err(DatmoError::IncorrectType {
            field: path.display().to_string(),
            msg: format!("expected a JSON object, got {other}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::code::{CodeDriver as _, FileCodeDriver};
    use crate::config::Config;
    use crate::core::layout::Layout;
    use crate::entity::TaskStatus;
    use crate::environment::testing::FakeDriver;
    use crate::file::LocalFileDriver;

    fn composer(root: &Path) -> SnapshotComposer {
        let layout = Layout::new(root.to_path_buf(), &Config::default());
        let dal = Dal::open(&layout.database_dir()).unwrap();
        let file_driver = LocalFileDriver::new(layout.clone());
        file_driver.init().unwrap();
        let code_driver = FileCodeDriver::new(layout);
        code_driver.init().unwrap();
        let files = FileCollectionStore::new(dal.clone(), "p", file_driver);
        let envs = EnvironmentStore::new(
            dal.clone(),
            "p",
            files.clone(),
            Arc::new(FakeDriver::default()),
            true,
        );
        let code = CodeStore::new(dal.clone(), "p", Box::new(code_driver));
        SnapshotComposer::new(dal, "p", code, files, envs)
    }

    #[test]
    fn identical_content_returns_existing_snapshot() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        std::fs::write(root.join("script.py"), "print(1)\n").unwrap();
        std::fs::write(root.join("a.txt"), "a").unwrap();
        let snapshots = composer(root);

        let opts = SnapshotCreate {
            paths: Some(vec!["a.txt".to_owned()]),
            ..SnapshotCreate::with_message("m")
        };
        let first = snapshots.create(&opts).unwrap();
        let second = snapshots.create(&opts).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(snapshots.list(None).unwrap().len(), 1);

        let other = snapshots
            .create(&SnapshotCreate {
                stats: Some(StatMap::from([("acc".to_owned(), json!(0.5))])),
                ..opts
            })
            .unwrap();
        assert_ne!(other.id, first.id);
    }

    #[test]
    fn message_is_required() {
        let dir = tempfile::tempdir().expect("tempdir");
        let snapshots = composer(dir.path());
        assert_eq!(
            snapshots.create(&SnapshotCreate::default()).unwrap_err().key(),
            "required-argument-missing"
        );
        assert_eq!(
            snapshots
                .create(&SnapshotCreate::with_message("  "))
                .unwrap_err()
                .key(),
            "validation-failed"
        );
    }

    #[test]
    fn config_and_stats_come_from_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        std::fs::create_dir_all(root.join("out")).unwrap();
        std::fs::write(root.join("out/stats.json"), r#"{"loss": 0.1}"#).unwrap();
        std::fs::write(root.join("params.json"), r#"{"lr": 0.01}"#).unwrap();
        let snapshots = composer(root);

        let snap = snapshots
            .create(&SnapshotCreate {
                paths: Some(vec!["out".to_owned()]),
                config_filepath: Some(root.join("params.json")),
                ..SnapshotCreate::with_message("m")
            })
            .unwrap();
        assert_eq!(snap.config.get("lr"), Some(&json!(0.01)));
        assert_eq!(snap.stats.get("loss"), Some(&json!(0.1)));

        let missing = snapshots
            .create(&SnapshotCreate {
                config_filepath: Some(root.join("nope.json")),
                ..SnapshotCreate::with_message("m")
            })
            .unwrap_err();
        assert_eq!(missing.key(), "path-does-not-exist");
    }

    #[test]
    fn config_search_stays_inside_the_collection() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        std::fs::write(root.join("a.txt"), "a").unwrap();
        std::fs::write(root.join("config.json"), r#"{"lr": 0.5}"#).unwrap();
        let snapshots = composer(root);

        let snap = snapshots
            .create(&SnapshotCreate {
                paths: Some(vec!["a.txt".to_owned()]),
                ..SnapshotCreate::with_message("m")
            })
            .unwrap();
        assert!(snap.config.is_empty());

        let with_config = snapshots
            .create(&SnapshotCreate {
                paths: Some(vec!["a.txt".to_owned(), "config.json".to_owned()]),
                ..SnapshotCreate::with_message("m")
            })
            .unwrap();
        assert_eq!(with_config.config.get("lr"), Some(&json!(0.5)));
    }

    #[test]
    fn unknown_commit_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let snapshots = composer(dir.path());
        let err = snapshots
            .create(&SnapshotCreate {
                commit_id: Some("0".repeat(32)),
                ..SnapshotCreate::with_message("m")
            })
            .unwrap_err();
        assert_eq!(err.key(), "commit-does-not-exist");
    }

    #[test]
    fn current_tracks_working_tree() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        std::fs::write(root.join("script.py"), "print(1)\n").unwrap();
        let snapshots = composer(root);

        assert!(snapshots.current().unwrap().is_none());
        let snap = snapshots.create(&SnapshotCreate::with_message("m")).unwrap();
        assert_eq!(snapshots.current().unwrap().map(|s| s.id), Some(snap.id.clone()));

        snapshots.checkout(&snap.id).unwrap();
        assert_eq!(std::fs::read_to_string(root.join("script.py")).unwrap(), "print(1)\n");

        std::fs::write(root.join("script.py"), "print(2)\n").unwrap();
        assert!(snapshots.current().unwrap().is_none());
        assert_eq!(snapshots.checkout(&snap.id).unwrap_err().key(), "unstaged-changes");
    }

    #[test]
    fn update_and_promotion_from_task() {
        let dir = tempfile::tempdir().expect("tempdir");
        let snapshots = composer(dir.path());
        let hidden = snapshots
            .create(&SnapshotCreate {
                visible: Some(false),
                ..SnapshotCreate::with_message("auto")
            })
            .unwrap();

        let mut task = Task::new("p");
        task.status = TaskStatus::Running;
        task.after_snapshot_id = Some(hidden.id.clone());
        let task = snapshots.dal.create(&task).unwrap();
        assert_eq!(
            snapshots
                .create_from_task(&task.id, &SnapshotCreate::with_message("keep"))
                .unwrap_err()
                .key(),
            "task-not-complete"
        );

        let done: Task = snapshots
            .dal
            .update(
                &task.id,
                json!({"status": "SUCCESS", "results": {"acc": "0.9", "loss": "1"}}),
            )
            .unwrap();
        let promoted = snapshots
            .create_from_task(
                &done.id,
                &SnapshotCreate {
                    stats: Some(StatMap::from([("loss".to_owned(), json!(0.5))])),
                    ..SnapshotCreate::with_message("keep")
                },
            )
            .unwrap();
        assert!(promoted.visible);
        assert_eq!(promoted.id, hidden.id);
        assert_eq!(promoted.stats.get("acc"), Some(&json!("0.9")));
        assert_eq!(promoted.stats.get("loss"), Some(&json!(0.5)));

        let conflict = snapshots
            .create_from_task(
                &done.id,
                &SnapshotCreate {
                    paths: Some(Vec::new()),
                    ..SnapshotCreate::with_message("keep")
                },
            )
            .unwrap_err();
        assert_eq!(conflict.key(), "snapshot-create-from-task-args");

        let renamed = snapshots.update(&hidden.id, Some("new"), Some("best")).unwrap();
        assert_eq!(renamed.message, "new");
        assert_eq!(renamed.label.as_deref(), Some("best"));
        assert_eq!(snapshots.list(Some(true)).unwrap().len(), 1);
    }
}
