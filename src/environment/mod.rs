#![forbid(unsafe_code)]

//! Environments: definition files plus a hardware fingerprint, turned into runnable images by
//! an [`EnvironmentDriver`].

pub mod definition;
pub mod docker;
pub mod hardware;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::Config;
use crate::config::project::EnvironmentDriverKind;
use crate::core::hash::tree_hash;
use crate::core::tree;
use crate::entity::{Environment, HardwareInfo, Snapshot, WorkspaceKind};
use crate::error::{DatmoError, io_at};
use crate::file::{FileCollectionStore, resolve_paths};
use crate::storage::{Dal, Query, Sort};

pub use docker::DockerDriver;

/// Name of the fingerprint file stored alongside the definition.
pub const HARDWARE_INFO_FILE: &str = "hardware_info";

/// Prefix of every task container name; followed by the project id.
pub const TASK_CONTAINER_PREFIX: &str = "datmo-task-";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMount {
    pub host: PathBuf,
    pub bind: String,
    pub mode: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    pub command: Option<Vec<String>>,
    pub ports: Vec<String>,
    pub name: Option<String>,
    pub volumes: Vec<VolumeMount>,
    pub mem_limit: Option<String>,
    pub gpu: bool,
    pub detach: bool,
    pub stdin_open: bool,
    pub tty: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub exit_code: i32,
    pub run_id: String,
    pub logs: String,
}

/// Container runtime capabilities.
pub trait EnvironmentDriver: Send + Sync {
    fn driver_type(&self) -> &'static str;

    /// Verifies the runtime is reachable.
    fn init(&self) -> Result<(), DatmoError>;

    fn is_initialized(&self) -> bool;

    fn definition_filename(&self) -> &str;

    fn default_definition_content(&self) -> Result<String, DatmoError>;

    fn hardware_info(&self) -> HardwareInfo {
        hardware::capture()
    }

    /// Builds the definition at `definition_path` into an image tagged `tag`.
    fn build(
        &self,
        tag: &str,
        definition_path: &Path,
        workspace: Option<WorkspaceKind>,
    ) -> Result<(), DatmoError>;

    /// Starts a container from `image`. Output is written to `log_path` and returned.
    fn run(
        &self,
        image: &str,
        options: &RunOptions,
        log_path: &Path,
    ) -> Result<RunOutcome, DatmoError>;

    /// Stops and removes one container.
    fn stop(&self, run_id: &str) -> Result<(), DatmoError>;

    /// Stops and removes every container whose name contains `term`.
    fn stop_remove_containers_by_term(&self, term: &str) -> Result<(), DatmoError>;

    /// Removes an image together with containers named after it.
    fn remove(&self, image: &str) -> Result<(), DatmoError>;

    fn gpu_enabled(&self) -> Result<bool, DatmoError>;

    /// Best-effort URL of an interactive workspace served by `container_name`.
    fn extract_workspace_url(
        &self,
        container_name: &str,
        workspace: Option<WorkspaceKind>,
        attempts: u32,
    ) -> Option<String>;
}

#[must_use]
pub fn driver_for(kind: &EnvironmentDriverKind, cfg: &Config) -> Arc<dyn EnvironmentDriver> {
    match kind {
        EnvironmentDriverKind::Docker { docker_command } => Arc::new(DockerDriver::new(
            docker_command.clone(),
            cfg.environment.definition_filename.clone(),
        )),
    }
}

/// Container name for a task run.
#[must_use]
pub fn task_container_name(project_id: &str, task_id: &str) -> String {
    format!("{TASK_CONTAINER_PREFIX}{project_id}-{task_id}")
}

/// Inputs of [`EnvironmentStore::create`].
#[derive(Debug, Clone, Default)]
pub struct EnvironmentCreate {
    /// Definition and auxiliary files, `SRC` or `SRC>DEST`.
    pub paths: Vec<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    /// `None` defers to the configured default.
    pub save_hardware_file: Option<bool>,
}

pub struct EnvironmentStore {
    dal: Dal,
    project_id: String,
    files: FileCollectionStore,
    driver: Arc<dyn EnvironmentDriver>,
    capture_hardware_info: bool,
}

impl EnvironmentStore {
    #[must_use]
    pub fn new(
        dal: Dal,
        project_id: &str,
        files: FileCollectionStore,
        driver: Arc<dyn EnvironmentDriver>,
        capture_hardware_info: bool,
    ) -> Self {
        Self {
            dal,
            project_id: project_id.to_owned(),
            files,
            driver,
            capture_hardware_info,
        }
    }

    #[must_use]
    pub fn driver(&self) -> &Arc<dyn EnvironmentDriver> {
        &self.driver
    }

    /// Fills `dir` with the definition set: environment directory contents, then explicit
    /// paths, then a default definition when none is present, then the hardware fingerprint.
    fn stage(
        &self,
        dir: &Path,
        paths: &[String],
        save_hardware_file: bool,
    ) -> Result<Option<HardwareInfo>, DatmoError> {
        let layout = self.files.driver().layout();
        let env_dir = layout.environment_dir();
        if env_dir.is_dir() {
            tree::copy_into(&env_dir, dir)?;
        }
        for m in resolve_paths(layout.root(), paths)? {
            tree::copy_into(&m.src, &dir.join(&m.dest))?;
        }
        let definition = dir.join(self.driver.definition_filename());
        if !definition.is_file() {
            let content = self
                .driver
                .default_definition_content()
                .map_err(|e| DatmoError::EnvironmentRequirementsCreate(e.to_string()))?;
            std::fs::write(&definition, content).map_err(io_at(&definition))?;
        }
        if !save_hardware_file {
            return Ok(None);
        }
        let info = self.driver.hardware_info();
        let path = dir.join(HARDWARE_INFO_FILE);
        let data = serde_json::to_vec_pretty(&info).map_err(|source| DatmoError::Json {
            path: path.clone(),
            source,
        })?;
        std::fs::write(&path, data).map_err(io_at(&path))?;
        Ok(Some(info))
    }

    /// Records the environment described by `opts`, reusing an existing one with identical
    /// content.
    pub fn create(&self, opts: &EnvironmentCreate) -> Result<Environment, DatmoError> {
        let save_hw = opts.save_hardware_file.unwrap_or(self.capture_hardware_info);
        let staging = self.files.driver().temp_dir()?;
        let staged = self
            .stage(&staging, &opts.paths, save_hw)
            .and_then(|hw| Ok((hw, self.files.create_from_dir(&staging)?)));
        tree::remove_path(&staging)?;
        let (hardware_info, fc) = staged?;

        if let Some(existing) = self.find_by_unique_hash(&fc.filehash)? {
            return Ok(existing);
        }
        let mut env = Environment::new(
            &self.project_id,
            self.driver.driver_type(),
            self.driver.definition_filename(),
            &fc.id,
            &fc.filehash,
        );
        env.hardware_info = hardware_info;
        env.name.clone_from(&opts.name);
        env.description.clone_from(&opts.description);
        tracing::info!(unique_hash = %fc.filehash, "recording environment");
        self.dal.create(&env)
    }

    /// Unique hash the environment directory would produce now, without storing anything.
    pub fn current_hash(&self) -> Result<String, DatmoError> {
        let staging = self.files.driver().temp_dir()?;
        let hash = self
            .stage(&staging, &[], self.capture_hardware_info)
            .and_then(|_| tree_hash(&staging));
        tree::remove_path(&staging)?;
        hash
    }

    pub fn find_by_unique_hash(&self, unique_hash: &str) -> Result<Option<Environment>, DatmoError> {
        let query = Query::new()
            .eq("project_id", self.project_id.as_str())
            .eq("unique_hash", unique_hash);
        Ok(self.dal.query::<Environment>(&query)?.into_iter().next())
    }

    pub fn get(&self, id: &str) -> Result<Environment, DatmoError> {
        self.dal.get(id)
    }

    pub fn list(&self) -> Result<Vec<Environment>, DatmoError> {
        self.dal.query_sorted(
            &Query::new().eq("project_id", self.project_id.as_str()),
            Some(&Sort::ascending("created_at")),
        )
    }

    /// Location of the stored definition file.
    pub fn definition_path(&self, env: &Environment) -> Result<PathBuf, DatmoError> {
        let fc = self.files.get(&env.file_collection_id)?;
        Ok(self
            .files
            .driver()
            .get_collection_path(&fc.filehash)
            .join(&env.definition_filename))
    }

    /// Builds the image tagged with the environment id. The collection itself is left untouched;
    /// the build runs from a scratch copy.
    pub fn build(&self, id: &str, workspace: Option<WorkspaceKind>) -> Result<(), DatmoError> {
        let env = self.get(id)?;
        let source = self.definition_path(&env)?;
        let source_dir = source
            .parent()
            .ok_or_else(|| DatmoError::EnvironmentDoesNotExist(id.to_owned()))?;
        if !source.is_file() {
            return Err(DatmoError::EnvironmentDoesNotExist(source.display().to_string()));
        }
        let scratch = self.files.driver().temp_dir()?;
        let built = tree::copy_into(source_dir, &scratch).and_then(|()| {
            self.driver
                .build(&env.id, &scratch.join(&env.definition_filename), workspace)
        });
        tree::remove_path(&scratch)?;
        built
    }

    pub fn run(
        &self,
        id: &str,
        options: &RunOptions,
        log_path: &Path,
    ) -> Result<RunOutcome, DatmoError> {
        let env = self.get(id)?;
        self.driver.run(&env.id, options, log_path)
    }

    /// Stops containers: one run, every container whose name contains `match_string`, or all
    /// task containers of the project. Exactly one selector must be given.
    pub fn stop(
        &self,
        run_id: Option<&str>,
        match_string: Option<&str>,
        all: bool,
    ) -> Result<(), DatmoError> {
        let given = usize::from(run_id.is_some()) + usize::from(match_string.is_some()) + usize::from(all);
        if given == 0 {
            return Err(DatmoError::RequiredArgumentMissing(
                "run_id, match_string or all".to_owned(),
            ));
        }
        if given > 1 {
            return Err(DatmoError::TooManyArguments(
                "only one of run_id, match_string or all may be given".to_owned(),
            ));
        }
        if let Some(run_id) = run_id {
            return self.driver.stop(run_id);
        }
        if let Some(term) = match_string {
            return self.driver.stop_remove_containers_by_term(term);
        }
        let term = format!("{TASK_CONTAINER_PREFIX}{}", self.project_id);
        self.driver.stop_remove_containers_by_term(&term)
    }

    /// Removes the image, the definition collection and the record.
    pub fn delete(&self, id: &str) -> Result<(), DatmoError> {
        let env = self.get(id)?;
        if let Err(e) = self.driver.remove(&env.id) {
            tracing::warn!(environment_id = id, error = %e, "could not remove environment image");
        }
        self.dal.delete::<Environment>(id)?;
        if self.collection_in_use(&env.file_collection_id)? {
            tracing::debug!(environment_id = id, file_collection_id = %env.file_collection_id, "file collection still referenced, kept");
            return Ok(());
        }
        match self.files.delete(&env.file_collection_id) {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Collections are shared by hash, so a snapshot or another environment may hold the same id.
    fn collection_in_use(&self, file_collection_id: &str) -> Result<bool, DatmoError> {
        let by_id = Query::new()
            .eq("project_id", self.project_id.as_str())
            .eq("file_collection_id", file_collection_id);
        Ok(!self.dal.query::<Snapshot>(&by_id)?.is_empty()
            || !self.dal.query::<Environment>(&by_id)?.is_empty())
    }

    /// True when the environment directory holds a definition set no environment records.
    pub fn has_unstaged_changes(&self) -> Result<bool, DatmoError> {
        let env_dir = self.files.driver().layout().environment_dir();
        if !env_dir.is_dir() || tree::list_files(&env_dir)?.is_empty() {
            return Ok(false);
        }
        let hash = self.current_hash()?;
        Ok(self.find_by_unique_hash(&hash)?.is_none())
    }

    pub fn check_unstaged_changes(&self) -> Result<(), DatmoError> {
        if self.has_unstaged_changes()? {
            return Err(DatmoError::UnstagedChanges("environment".to_owned()));
        }
        Ok(())
    }

    /// Overlays the environment's files (minus the fingerprint) onto the environment directory.
    pub fn checkout(&self, id: &str) -> Result<(), DatmoError> {
        let env = self.get(id)?;
        self.check_unstaged_changes()?;
        let source = self.definition_path(&env)?;
        let Some(source_dir) = source.parent() else {
            return Err(DatmoError::EnvironmentDoesNotExist(id.to_owned()));
        };
        let dst = self.files.driver().layout().environment_dir();
        tree::copy_into(source_dir, &dst)?;
        tree::remove_path(&dst.join(HARDWARE_INFO_FILE))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-process stand-in for a container runtime.

    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Default)]
    pub struct FakeDriver {
        pub output: String,
        pub exit_code: i32,
        pub builds: Mutex<Vec<String>>,
        pub runs: Mutex<Vec<RunOptions>>,
        pub stopped_terms: Mutex<Vec<String>>,
        pub removed: Mutex<Vec<String>>,
        /// Task to mark STOPPED from inside the next run, which then fails the way a container
        /// removed under `docker wait` does.
        pub stop_during_run: Mutex<Option<(Dal, String)>>,
    }

    impl FakeDriver {
        #[must_use]
        pub fn printing(output: &str, exit_code: i32) -> Self {
            Self {
                output: output.to_owned(),
                exit_code,
                ..Self::default()
            }
        }
    }

    impl EnvironmentDriver for FakeDriver {
        fn driver_type(&self) -> &'static str {
            "docker"
        }

        fn init(&self) -> Result<(), DatmoError> {
            Ok(())
        }

        fn is_initialized(&self) -> bool {
            true
        }

        fn definition_filename(&self) -> &str {
            "Dockerfile"
        }

        fn default_definition_content(&self) -> Result<String, DatmoError> {
            Ok(definition::default_definition().to_owned())
        }

        fn hardware_info(&self) -> HardwareInfo {
            HardwareInfo {
                system: "Linux".to_owned(),
                machine: "x86_64".to_owned(),
                ..HardwareInfo::default()
            }
        }

        fn build(
            &self,
            tag: &str,
            definition_path: &Path,
            workspace: Option<WorkspaceKind>,
        ) -> Result<(), DatmoError> {
            definition::write_derived(definition_path, workspace)?;
            if let Ok(mut b) = self.builds.lock() {
                b.push(tag.to_owned());
            }
            Ok(())
        }

        fn run(
            &self,
            _image: &str,
            options: &RunOptions,
            log_path: &Path,
        ) -> Result<RunOutcome, DatmoError> {
            std::fs::write(log_path, &self.output).map_err(io_at(log_path))?;
            if let Ok(mut r) = self.runs.lock() {
                r.push(options.clone());
            }
            let interrupted = self.stop_during_run.lock().ok().and_then(|mut s| s.take());
            if let Some((dal, task_id)) = interrupted {
                dal.update::<crate::entity::Task>(
                    &task_id,
                    serde_json::json!({ "status": crate::entity::TaskStatus::Stopped }),
                )?;
                return Err(DatmoError::EnvironmentExecution(
                    "container removed while waiting".to_owned(),
                ));
            }
            Ok(RunOutcome {
                exit_code: if options.detach { 0 } else { self.exit_code },
                run_id: crate::entity::new_id(),
                logs: self.output.clone(),
            })
        }

        fn stop(&self, run_id: &str) -> Result<(), DatmoError> {
            self.stop_remove_containers_by_term(run_id)
        }

        fn stop_remove_containers_by_term(&self, term: &str) -> Result<(), DatmoError> {
            if let Ok(mut s) = self.stopped_terms.lock() {
                s.push(term.to_owned());
            }
            Ok(())
        }

        fn remove(&self, image: &str) -> Result<(), DatmoError> {
            if let Ok(mut r) = self.removed.lock() {
                r.push(image.to_owned());
            }
            Ok(())
        }

        fn gpu_enabled(&self) -> Result<bool, DatmoError> {
            Ok(false)
        }

        fn extract_workspace_url(
            &self,
            _container_name: &str,
            _workspace: Option<WorkspaceKind>,
            _attempts: u32,
        ) -> Option<String> {
            None
        }
    }
}
