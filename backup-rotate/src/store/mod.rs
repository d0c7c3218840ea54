//! Archive store collaborator.
//!
//! The rotation logic only needs three primitives from the store: list every
//! archive name, create one archive, delete one archive. All calls block until
//! the store answers.

pub mod borg;
#[cfg(any(test, feature = "mock"))]
pub mod mock;

use std::path::Path;

use crate::utils::errors::Result;

pub use borg::BorgStore;
#[cfg(any(test, feature = "mock"))]
pub use mock::MockStore;

pub trait ArchiveStore: Send + Sync {
    /// Every archive name in the store, in whatever order the store reports them.
    fn list_archives(&self) -> Result<Vec<String>>;

    /// Create archive `name` from `path`, with `source_root` as the working directory.
    fn create_archive(&self, name: &str, source_root: &Path, path: &Path) -> Result<()>;

    fn delete_archive(&self, name: &str) -> Result<()>;

    /// Ask an in-flight call to stop. The interrupted call returns an error.
    fn cancel(&self) {}
}
