#![forbid(unsafe_code)]

//! Versioning of the tracked source tree.

pub mod file;
pub mod git;

use crate::config::project::CodeDriverKind;
use crate::core::layout::Layout;
use crate::entity::Code;
use crate::error::DatmoError;
use crate::storage::{Dal, Query, Sort};

pub use file::FileCodeDriver;
pub use git::GitCodeDriver;

/// Capabilities every code backend provides.
pub trait CodeDriver: Send + Sync {
    fn driver_type(&self) -> &'static str;

    fn init(&self) -> Result<(), DatmoError>;

    fn is_initialized(&self) -> bool;

    /// Commit id the working tree would get if committed now. Nothing is written.
    fn current_hash(&self) -> Result<String, DatmoError>;

    /// Commits the working tree (or records `commit_id`, which must already exist) and returns
    /// the commit id.
    fn create_ref(&self, commit_id: Option<&str>) -> Result<String, DatmoError>;

    fn latest_ref(&self) -> Result<Option<String>, DatmoError>;

    fn exists_ref(&self, commit_id: &str) -> Result<bool, DatmoError>;

    fn list_refs(&self) -> Result<Vec<String>, DatmoError>;

    fn delete_ref(&self, commit_id: &str) -> Result<(), DatmoError>;

    /// Restores the tracked tree to `commit_id`. Refuses over unstaged changes.
    fn checkout_ref(&self, commit_id: &str) -> Result<(), DatmoError>;

    fn has_unstaged_changes(&self) -> Result<bool, DatmoError>;

    fn check_unstaged_changes(&self) -> Result<(), DatmoError> {
        if self.has_unstaged_changes()? {
            return Err(DatmoError::UnstagedChanges("code".to_owned()));
        }
        Ok(())
    }

    /// Removes every ref this driver keeps for the project.
    fn delete_refs(&self) -> Result<(), DatmoError>;
}

#[must_use]
pub fn driver_for(kind: &CodeDriverKind, layout: &Layout) -> Box<dyn CodeDriver> {
    match kind {
        CodeDriverKind::File => Box::new(FileCodeDriver::new(layout.clone())),
        CodeDriverKind::Git { execpath } => {
            Box::new(GitCodeDriver::new(layout.root().to_path_buf(), execpath.clone()))
        }
    }
}

/// Code records over a [`CodeDriver`].
pub struct CodeStore {
    dal: Dal,
    project_id: String,
    driver: Box<dyn CodeDriver>,
}

impl CodeStore {
    #[must_use]
    pub fn new(dal: Dal, project_id: &str, driver: Box<dyn CodeDriver>) -> Self {
        Self {
            dal,
            project_id: project_id.to_owned(),
            driver,
        }
    }

    #[must_use]
    pub fn driver(&self) -> &dyn CodeDriver {
        self.driver.as_ref()
    }

    /// Commits the working tree (or adopts `commit_id`) and returns its record; an existing record
    /// for the same commit is returned as is.
    pub fn create(&self, commit_id: Option<&str>) -> Result<Code, DatmoError> {
        let commit_id = self.driver.create_ref(commit_id)?;
        if let Some(existing) = self.find_by_commit(&commit_id)? {
            return Ok(existing);
        }
        tracing::info!(commit_id = %commit_id, "recording code revision");
        let code = Code::new(&self.project_id, self.driver.driver_type(), &commit_id);
        self.dal.create(&code)
    }

    pub fn find_by_commit(&self, commit_id: &str) -> Result<Option<Code>, DatmoError> {
        let query = Query::new()
            .eq("project_id", self.project_id.as_str())
            .eq("commit_id", commit_id);
        Ok(self.dal.query::<Code>(&query)?.into_iter().next())
    }

    pub fn get(&self, id: &str) -> Result<Code, DatmoError> {
        self.dal.get(id)
    }

    pub fn list(&self) -> Result<Vec<Code>, DatmoError> {
        self.dal.query_sorted(
            &Query::new().eq("project_id", self.project_id.as_str()),
            Some(&Sort::ascending("created_at")),
        )
    }

    /// Removes the record and the underlying ref.
    pub fn delete(&self, id: &str) -> Result<(), DatmoError> {
        let code: Code = self.dal.get(id)?;
        if self.driver.exists_ref(&code.commit_id)? {
            self.driver.delete_ref(&code.commit_id)?;
        }
        self.dal.delete::<Code>(id)
    }

    pub fn checkout(&self, id: &str) -> Result<(), DatmoError> {
        let code: Code = self.dal.get(id)?;
        self.driver.checkout_ref(&code.commit_id)
    }

    pub fn has_unstaged_changes(&self) -> Result<bool, DatmoError> {
        self.driver.has_unstaged_changes()
    }

    pub fn check_unstaged_changes(&self) -> Result<(), DatmoError> {
        self.driver.check_unstaged_changes()
    }
}
