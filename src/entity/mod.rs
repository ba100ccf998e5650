#![forbid(unsafe_code)]

//! Persisted record types. Each record carries an opaque id, creation and update timestamps and
//! (except [`Project`]) the id of the owning project.

pub mod code;
pub mod environment;
pub mod file_collection;
pub mod project;
pub mod session;
pub mod snapshot;
pub mod task;

pub use code::Code;
pub use environment::{Environment, HardwareInfo};
pub use file_collection::FileCollection;
pub use project::Project;
pub use session::Session;
pub use snapshot::{Snapshot, StatMap};
pub use task::{Task, TaskStatus, WorkspaceKind};

use uuid::Uuid;

/// 16 random bytes in lowercase hex.
#[must_use]
pub fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_32_hex_chars() {
        let a = new_id();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, new_id());
    }
}
