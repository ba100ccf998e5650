#![forbid(unsafe_code)]

//! Sessions group the snapshots and tasks of a project. New snapshots and tasks are tagged with
//! the current session.

use std::collections::HashSet;

use serde_json::json;

use crate::entity::session::DEFAULT_SESSION;
use crate::entity::{Session, Snapshot, Task};
use crate::error::DatmoError;
use crate::storage::{Dal, Query, Sort};

#[derive(Debug, Clone)]
pub struct SessionStore {
    dal: Dal,
    project_id: String,
}

impl SessionStore {
    #[must_use]
    pub fn new(dal: Dal, project_id: &str) -> Self {
        Self {
            dal,
            project_id: project_id.to_owned(),
        }
    }

    fn query(&self) -> Query {
        Query::new().eq("project_id", self.project_id.as_str())
    }

    /// Creates the default session and makes it current when no session is.
    pub fn ensure_default(&self) -> Result<Session, DatmoError> {
        let default = self.create(DEFAULT_SESSION)?;
        match self.current()? {
            Some(current) => Ok(current),
            None => self.select(&default.id),
        }
    }

    /// Returns the existing session of that name, if any.
    pub fn create(&self, name: &str) -> Result<Session, DatmoError> {
        if name.trim().is_empty() {
            let mut fields = std::collections::BTreeMap::new();
            fields.insert("name".to_owned(), "must not be empty".to_owned());
            return Err(DatmoError::ValidationFailed(fields));
        }
        if let Some(existing) = self.find_by_name(name)? {
            return Ok(existing);
        }
        let session = self.dal.create(&Session::new(&self.project_id, name))?;
        tracing::info!(session_id = %session.id, name, "session created");
        Ok(session)
    }

    fn find_by_name(&self, name: &str) -> Result<Option<Session>, DatmoError> {
        Ok(self
            .dal
            .query::<Session>(&self.query().eq("name", name))?
            .into_iter()
            .next())
    }

    /// Resolves a session by name first, then by id.
    pub fn resolve(&self, name_or_id: &str) -> Result<Session, DatmoError> {
        if let Some(by_name) = self.find_by_name(name_or_id)? {
            return Ok(by_name);
        }
        match self.dal.get::<Session>(name_or_id) {
            Ok(session) if session.project_id == self.project_id => Ok(session),
            Ok(_) => Err(DatmoError::SessionDoesNotExist(name_or_id.to_owned())),
            Err(e) if e.is_not_found() => {
                Err(DatmoError::SessionDoesNotExist(name_or_id.to_owned()))
            }
            Err(e) => Err(e),
        }
    }

    /// Makes the named session current. The previously current session is cleared first.
    pub fn select(&self, name_or_id: &str) -> Result<Session, DatmoError> {
        let next = self.resolve(name_or_id)?;
        if next.current {
            return Ok(next);
        }
        for previous in self.dal.query::<Session>(&self.query().eq("current", true))? {
            self.dal
                .update::<Session>(&previous.id, json!({ "current": false }))?;
        }
        let selected = self.dal.update::<Session>(&next.id, json!({ "current": true }))?;
        tracing::info!(session_id = %selected.id, name = %selected.name, "session selected");
        Ok(selected)
    }

    pub fn current(&self) -> Result<Option<Session>, DatmoError> {
        Ok(self
            .dal
            .query::<Session>(&self.query().eq("current", true))?
            .into_iter()
            .next())
    }

    /// Sessions of the project, oldest first.
    pub fn list(&self) -> Result<Vec<Session>, DatmoError> {
        self.dal
            .query_sorted(&self.query(), Some(&Sort::ascending("created_at")))
    }

    pub fn rename(&self, name_or_id: &str, name: &str) -> Result<Session, DatmoError> {
        let session = self.resolve(name_or_id)?;
        if session.is_default() {
            return Err(DatmoError::InvalidOperation(
                "the default session cannot be renamed".to_owned(),
            ));
        }
        if name.trim().is_empty() || self.find_by_name(name)?.is_some_and(|s| s.id != session.id) {
            let mut fields = std::collections::BTreeMap::new();
            fields.insert("name".to_owned(), format!("'{name}' is empty or taken"));
            return Err(DatmoError::ValidationFailed(fields));
        }
        self.dal.update(&session.id, json!({ "name": name }))
    }

    /// Deletes the session along with the snapshot and task records tagged with it. Snapshots
    /// that tasks of other sessions still point at move to the default session instead. The
    /// default session becomes current if the deleted one was.
    pub fn delete(&self, name_or_id: &str) -> Result<(), DatmoError> {
        let session = self.resolve(name_or_id)?;
        if session.is_default() {
            return Err(DatmoError::InvalidOperation(
                "the default session cannot be deleted".to_owned(),
            ));
        }
        let default = self.create(DEFAULT_SESSION)?;
        if session.current {
            self.select(&default.id)?;
        }
        self.dal.delete::<Session>(&session.id)?;

        let referenced: HashSet<String> = self
            .dal
            .query::<Task>(&self.query())?
            .into_iter()
            .filter(|t| t.session_id.as_deref() != Some(session.id.as_str()))
            .flat_map(|t| [t.before_snapshot_id, t.after_snapshot_id])
            .flatten()
            .collect();

        let tagged = Query::new().eq("session_id", session.id.as_str());
        for snapshot in self.dal.query::<Snapshot>(&tagged)? {
            if referenced.contains(&snapshot.id) {
                self.dal
                    .update::<Snapshot>(&snapshot.id, json!({ "session_id": default.id }))?;
            } else {
                self.dal.delete::<Snapshot>(&snapshot.id)?;
            }
        }
        for task in self.dal.query::<Task>(&tagged)? {
            self.dal.delete::<Task>(&task.id)?;
        }
        tracing::info!(session_id = %session.id, "session deleted");
        Ok(())
    }

    /// Id of the current session, for tagging new records.
    pub(crate) fn current_id(&self) -> Result<Option<String>, DatmoError> {
        Ok(self.current()?.map(|s| s.id))
    }
}
