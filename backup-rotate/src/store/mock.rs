//! In-memory archive store for testing.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::ArchiveStore;
use crate::utils::errors::{Result, RotateError};

/// One recorded store call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    List,
    Create { name: String, path: PathBuf },
    Delete { name: String },
}

#[derive(Debug, Default)]
struct State {
    archives: BTreeSet<String>,
    calls: Vec<StoreCall>,
    list_failure: Option<String>,
    /// Create fails for any archive whose target path matches a key.
    create_failures: HashMap<PathBuf, String>,
    delete_failures: HashMap<String, String>,
}

/// In-memory [`ArchiveStore`] that records every call and can be told to fail.
///
/// Archives live in a `BTreeSet` behind a [`Mutex`], so the trait methods
/// work on `&self` like the real store does.
#[derive(Debug, Default)]
pub struct MockStore {
    state: Mutex<State>,
}

impl MockStore {
    pub fn with_archives(names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let store = Self::default();
        store.lock().archives = names.into_iter().map(Into::into).collect();
        store
    }

    // A poisoned mutex only happens after a test already panicked.
    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn fail_list(&self, detail: &str) {
        self.lock().list_failure = Some(detail.to_string());
    }

    pub fn fail_create_for(&self, path: impl Into<PathBuf>, detail: &str) {
        self.lock()
            .create_failures
            .insert(path.into(), detail.to_string());
    }

    pub fn fail_delete(&self, name: &str, detail: &str) {
        self.lock()
            .delete_failures
            .insert(name.to_string(), detail.to_string());
    }

    /// Put an archive into the store without recording a call.
    pub fn add_archive(&self, name: &str) {
        self.lock().archives.insert(name.to_string());
    }

    pub fn archives(&self) -> Vec<String> {
        self.lock().archives.iter().cloned().collect()
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.lock().calls.clone()
    }

    pub fn list_calls(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| matches!(c, StoreCall::List))
            .count()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                StoreCall::Delete { name } => Some(name.clone()),
                _ => None,
            })
            .collect()
    }
}

impl ArchiveStore for MockStore {
    fn list_archives(&self) -> Result<Vec<String>> {
        let mut state = self.lock();
        state.calls.push(StoreCall::List);
        if let Some(detail) = &state.list_failure {
            return Err(RotateError::store("list", detail.clone()));
        }
        // Reverse order: callers must not rely on the store sorting.
        Ok(state.archives.iter().rev().cloned().collect())
    }

    fn create_archive(&self, name: &str, _source_root: &Path, path: &Path) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(StoreCall::Create {
            name: name.to_string(),
            path: path.to_path_buf(),
        });
        if let Some(detail) = state.create_failures.get(path) {
            return Err(RotateError::store("create", detail.clone()));
        }
        if !state.archives.insert(name.to_string()) {
            return Err(RotateError::store(
                "create",
                format!("Archive {name} already exists"),
            ));
        }
        Ok(())
    }

    fn delete_archive(&self, name: &str) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(StoreCall::Delete {
            name: name.to_string(),
        });
        if let Some(detail) = state.delete_failures.get(name) {
            return Err(RotateError::store("delete", detail.clone()));
        }
        if !state.archives.remove(name) {
            return Err(RotateError::store(
                "delete",
                format!("Archive {name} does not exist"),
            ));
        }
        Ok(())
    }
}
