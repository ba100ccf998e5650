#![forbid(unsafe_code)]

//! Project root: initialisation, teardown and status of a `.datmo` project, plus assembly of the
//! stores that operate on it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;

use crate::code::{self, CodeStore};
use crate::config::Config;
use crate::config::project::{self as driver_config, Drivers};
use crate::core::layout::{HIDDEN_DIR, Layout};
use crate::core::tree;
use crate::entity::{Environment, Project, Session, Snapshot};
use crate::environment::{self, EnvironmentStore};
use crate::error::{DatmoError, io_at};
use crate::file::{FileCollectionStore, LocalFileDriver};
use crate::session::SessionStore;
use crate::snapshot::SnapshotComposer;
use crate::storage::{Dal, Query, Sort};
use crate::task::TaskRunner;

/// What `datmo status` reports.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub project: Project,
    pub current_session: Option<Session>,
    /// Absent while any component has unstaged changes.
    pub current_snapshot: Option<Snapshot>,
    pub latest_snapshot_user_generated: Option<Snapshot>,
    pub latest_snapshot_auto_generated: Option<Snapshot>,
    pub unstaged_code: bool,
    pub unstaged_environment: bool,
    pub unstaged_files: bool,
}

/// Stores bound to one initialised project.
pub struct ProjectStores {
    pub project: Project,
    pub snapshots: Arc<SnapshotComposer>,
    pub tasks: TaskRunner,
}

impl ProjectStores {
    #[must_use]
    pub fn code(&self) -> &CodeStore {
        self.snapshots.code()
    }

    #[must_use]
    pub fn files(&self) -> &FileCollectionStore {
        self.snapshots.files()
    }

    #[must_use]
    pub fn environments(&self) -> &EnvironmentStore {
        self.snapshots.environments()
    }

    #[must_use]
    pub fn sessions(&self) -> &SessionStore {
        self.snapshots.sessions()
    }
}

#[derive(Debug, Clone)]
pub struct ProjectRoot {
    cfg: Config,
    layout: Layout,
}

impl ProjectRoot {
    pub fn new(root: &Path, cfg: Config) -> Result<Self, DatmoError> {
        if !root.is_dir() {
            return Err(DatmoError::InvalidProjectPath(root.to_path_buf()));
        }
        let layout = Layout::new(root.to_path_buf(), &cfg);
        Ok(Self { cfg, layout })
    }

    /// The closest ancestor of `start` holding a `.datmo` directory, else `start` itself.
    pub fn discover(start: &Path, cfg: Config) -> Result<Self, DatmoError> {
        let found = start
            .ancestors()
            .find(|dir| dir.join(HIDDEN_DIR).is_dir())
            .map_or_else(|| start.to_path_buf(), Path::to_path_buf);
        Self::new(&found, cfg)
    }

    #[must_use]
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    #[must_use]
    pub fn root(&self) -> PathBuf {
        self.layout.root().to_path_buf()
    }

    fn dal(&self) -> Result<Dal, DatmoError> {
        Dal::open(&self.layout.database_dir())
    }

    fn find_project(&self) -> Result<Option<Project>, DatmoError> {
        if !self.layout.database_dir().is_dir() {
            return Ok(None);
        }
        let projects = self
            .dal()?
            .query_sorted::<Project>(&Query::new(), Some(&Sort::ascending("created_at")))?;
        Ok(projects.into_iter().next())
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.layout.hidden_dir().is_dir() && matches!(self.find_project(), Ok(Some(_)))
    }

    fn drivers(&self) -> Result<Drivers, DatmoError> {
        driver_config::load_or_default(&self.layout.driver_config_file(), &self.cfg)
    }

    fn assemble(&self, project: Project) -> Result<ProjectStores, DatmoError> {
        let drivers = self.drivers()?;
        let dal = self.dal()?;
        let file_driver = LocalFileDriver::new(self.layout.clone());
        let files = FileCollectionStore::new(dal.clone(), &project.id, file_driver);
        let code = CodeStore::new(
            dal.clone(),
            &project.id,
            code::driver_for(&drivers.code, &self.layout),
        );
        let envs = EnvironmentStore::new(
            dal.clone(),
            &project.id,
            files.clone(),
            environment::driver_for(&drivers.environment, &self.cfg),
            self.cfg.environment.capture_hardware_info,
        );
        let snapshots = Arc::new(SnapshotComposer::new(
            dal.clone(),
            &project.id,
            code,
            files,
            envs,
        ));
        let tasks = TaskRunner::new(
            dal,
            self.layout.clone(),
            Arc::clone(&snapshots),
            self.cfg.task.clone(),
        );
        Ok(ProjectStores {
            project,
            snapshots,
            tasks,
        })
    }

    /// Stores of an initialised project.
    pub fn open(&self) -> Result<ProjectStores, DatmoError> {
        if !self.layout.hidden_dir().is_dir() {
            return Err(DatmoError::ProjectNotInitialized);
        }
        let project = self.find_project()?.ok_or(DatmoError::ModelNotInitialized)?;
        self.assemble(project)
    }

    /// Creates the project, or renames an existing one. A failed first initialisation leaves no
    /// trace on disk; a failed re-initialisation restores the previous record.
    pub fn init(&self, name: &str, description: Option<&str>) -> Result<Project, DatmoError> {
        if name.trim().is_empty() {
            let mut fields = std::collections::BTreeMap::new();
            fields.insert("name".to_owned(), "must not be empty".to_owned());
            return Err(DatmoError::ValidationFailed(fields));
        }
        let existing = self.find_project()?;
        match self.init_steps(name, description, existing.as_ref()) {
            Ok(project) => Ok(project),
            Err(e) => {
                match &existing {
                    None => {
                        if let Err(cleanup) = self.cleanup() {
                            tracing::warn!(error = %cleanup, "cleanup after failed init did not complete");
                        }
                    }
                    Some(previous) => {
                        if let Err(revert) = self.dal().and_then(|dal| dal.create(previous)) {
                            tracing::warn!(error = %revert, "could not restore project record");
                        }
                    }
                }
                Err(e)
            }
        }
    }

    fn init_steps(
        &self,
        name: &str,
        description: Option<&str>,
        existing: Option<&Project>,
    ) -> Result<Project, DatmoError> {
        let hidden = self.layout.hidden_dir();
        std::fs::create_dir_all(&hidden).map_err(io_at(&hidden))?;
        let tasks = self.layout.tasks_dir();
        std::fs::create_dir_all(&tasks).map_err(io_at(&tasks))?;
        let drivers = self.drivers()?;

        LocalFileDriver::new(self.layout.clone()).init()?;
        let dal = self.dal()?;
        code::driver_for(&drivers.code, &self.layout).init()?;
        // Everything except running tasks works without a container runtime.
        if let Err(e) = environment::driver_for(&drivers.environment, &self.cfg).init() {
            tracing::warn!(error = %e, "container runtime is not available");
        }

        let project = match existing {
            Some(project) => dal.update::<Project>(
                &project.id,
                json!({ "name": name, "description": description }),
            )?,
            None => dal.create(&Project::new(name, description))?,
        };
        SessionStore::new(dal, &project.id).ensure_default()?;
        tracing::info!(project_id = %project.id, root = %self.layout.root().display(), "project initialised");
        Ok(project)
    }

    /// Removes everything datmo created for the project. Runtime artefacts are removed on a best
    /// effort basis.
    pub fn cleanup(&self) -> Result<(), DatmoError> {
        if let Ok(Some(project)) = self.find_project() {
            match self.assemble(project) {
                Ok(stores) => release_artifacts(&stores),
                Err(e) => tracing::warn!(error = %e, "could not open project stores for cleanup"),
            }
        }
        tree::remove_path(&self.layout.hidden_dir())?;
        tracing::info!(root = %self.layout.root().display(), "project cleaned up");
        Ok(())
    }

    pub fn status(&self) -> Result<StatusReport, DatmoError> {
        let stores = self.open()?;
        let snapshots = &stores.snapshots;
        let latest = |visible: bool| -> Result<Option<Snapshot>, DatmoError> {
            Ok(snapshots.list(Some(visible))?.into_iter().next())
        };
        Ok(StatusReport {
            current_session: stores.sessions().current()?,
            current_snapshot: snapshots.current()?,
            latest_snapshot_user_generated: latest(true)?,
            latest_snapshot_auto_generated: latest(false)?,
            unstaged_code: stores.code().has_unstaged_changes()?,
            unstaged_environment: stores.environments().has_unstaged_changes()?,
            unstaged_files: stores.files().has_unstaged_changes()?,
            project: stores.project,
        })
    }
}

fn release_artifacts(stores: &ProjectStores) {
    let envs = stores.environments();
    if let Err(e) = envs.stop(None, None, true) {
        tracing::warn!(error = %e, "could not stop task containers");
    }
    match envs.list() {
        Ok(list) => {
            for env in list {
                remove_image(envs, &env);
            }
        }
        Err(e) => tracing::warn!(error = %e, "could not list environments"),
    }
    if let Err(e) = stores.code().driver().delete_refs() {
        tracing::warn!(error = %e, "could not delete code refs");
    }
}

fn remove_image(envs: &EnvironmentStore, env: &Environment) {
    if let Err(e) = envs.driver().remove(&env.id) {
        tracing::warn!(environment_id = %env.id, error = %e, "could not remove environment image");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_then_status_on_empty_project() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = ProjectRoot::new(dir.path(), Config::default()).unwrap();
        assert!(!root.is_initialized());
        assert_eq!(root.status().unwrap_err().key(), "project-not-initialized");

        let project = root.init("proj", Some("desc")).unwrap();
        assert!(root.is_initialized());
        let status = root.status().unwrap();
        assert_eq!(status.project.id, project.id);
        assert_eq!(status.project.name, "proj");
        assert_eq!(status.project.description.as_deref(), Some("desc"));
        assert!(status.current_snapshot.is_none());
        assert!(status.latest_snapshot_user_generated.is_none());
        assert!(status.latest_snapshot_auto_generated.is_none());
        assert!(!status.unstaged_code && !status.unstaged_environment && !status.unstaged_files);
        assert_eq!(status.current_session.map(|s| s.name).as_deref(), Some("default"));
    }

    #[test]
    fn reinit_updates_the_same_record() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = ProjectRoot::new(dir.path(), Config::default()).unwrap();
        let first = root.init("a", None).unwrap();
        let second = root.init("b", Some("d")).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.name, "b");
        assert_eq!(root.open().unwrap().project.description.as_deref(), Some("d"));
    }

    #[test]
    fn cleanup_removes_hidden_layout() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = ProjectRoot::new(dir.path(), Config::default()).unwrap();
        root.init("a", None).unwrap();
        std::fs::write(dir.path().join("keep.txt"), "x").unwrap();

        root.cleanup().unwrap();
        assert!(!dir.path().join(HIDDEN_DIR).exists());
        assert!(dir.path().join("keep.txt").is_file());
        assert!(!root.is_initialized());
    }

    #[test]
    fn invalid_paths_and_names_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("nope");
        assert_eq!(
            ProjectRoot::new(&missing, Config::default()).unwrap_err().key(),
            "invalid-project-path"
        );
        let root = ProjectRoot::new(dir.path(), Config::default()).unwrap();
        assert_eq!(root.init(" ", None).unwrap_err().key(), "validation-failed");
        assert!(!dir.path().join(HIDDEN_DIR).exists());
    }

    #[test]
    fn discover_walks_up_to_the_project() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = ProjectRoot::new(dir.path(), Config::default()).unwrap();
        root.init("a", None).unwrap();
        let nested = dir.path().join("src/deep");
        std::fs::create_dir_all(&nested).unwrap();
        let found = ProjectRoot::discover(&nested, Config::default()).unwrap();
        assert_eq!(found.root(), dir.path());
    }
}
