//! Indexing progress and the rules that decide when a run is needed.

use crate::core::config::paths_file_for;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Lifecycle of the indexing pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Waiting,
    Indexing,
    Done,
    Error,
}

/// Kind of run chosen by [`IndexingManager::needs_indexing`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexingType {
    Full,
    Incremental,
    None,
}

/// Snapshot of the indexing state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexingStatus {
    pub is_indexing: bool,
    pub total_images: usize,
    pub processed_images: usize,
    pub status: RunStatus,
    pub last_error: Option<String>,
    pub is_initialized: bool,
    pub new_images_count: usize,
    pub indexing_type: IndexingType,
}

impl Default for IndexingStatus {
    fn default() -> Self {
        Self {
            is_indexing: false,
            total_images: 0,
            processed_images: 0,
            status: RunStatus::Waiting,
            last_error: None,
            is_initialized: false,
            new_images_count: 0,
            indexing_type: IndexingType::None,
        }
    }
}

/// Owner of the single [`IndexingStatus`] record.
///
/// Every read returns a full copy and every write is one read-modify-write
/// under the lock.
#[derive(Debug)]
pub struct IndexingManager {
    status: Mutex<IndexingStatus>,
    index_path: PathBuf,
    paths_path: PathBuf,
}

impl IndexingManager {
    /// Manager whose "no index yet" check looks at `index_path` and its
    /// path list
    pub fn new(index_path: &Path) -> Self {
        Self {
            status: Mutex::new(IndexingStatus::default()),
            index_path: index_path.to_path_buf(),
            paths_path: paths_file_for(index_path),
        }
    }

    pub fn get_status(&self) -> IndexingStatus {
        self.status.lock().clone()
    }

    /// Apply `f` to the status atomically
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut IndexingStatus),
    {
        f(&mut self.status.lock());
    }

    /// Decide whether a run should start, recording its kind.
    pub fn needs_indexing(&self) -> bool {
        let mut status = self.status.lock();

        if status.is_indexing {
            return false;
        }

        if !self.index_path.exists() || !self.paths_path.exists() {
            status.indexing_type = IndexingType::Full;
            return true;
        }

        if !status.is_initialized && status.status == RunStatus::Waiting {
            status.indexing_type = IndexingType::Full;
            return true;
        }

        if status.new_images_count > 0 {
            status.indexing_type = IndexingType::Incremental;
            return true;
        }

        false
    }

    /// Count newly registered images; a finished pipeline goes back to waiting.
    pub fn add_new_images(&self, count: usize) {
        let mut status = self.status.lock();
        status.new_images_count += count;
        if status.status == RunStatus::Done {
            status.status = RunStatus::Waiting;
            status.processed_images = 0;
        }
        debug!("{} new images pending", status.new_images_count);
    }

    /// Enter the indexing state unless a run is already in flight. The
    /// returned guard clears `is_indexing` when dropped, whatever the outcome
    /// of the run.
    pub fn try_begin_run(&self) -> Option<RunGuard<'_>> {
        let mut status = self.status.lock();
        if status.is_indexing {
            return None;
        }
        status.status = RunStatus::Indexing;
        status.is_indexing = true;
        status.processed_images = 0;
        status.last_error = None;
        Some(RunGuard { manager: self })
    }

    pub fn set_total(&self, total: usize, indexing_type: IndexingType) {
        self.update(|s| {
            s.total_images = total;
            s.indexing_type = indexing_type;
        });
    }

    pub fn record_processed(&self) {
        self.update(|s| s.processed_images += 1);
    }

    pub fn finish_success(&self) {
        self.update(|s| {
            s.status = RunStatus::Done;
            s.is_initialized = true;
            s.new_images_count = 0;
        });
    }

    pub fn finish_error(&self, error: &str) {
        self.update(|s| {
            s.status = RunStatus::Error;
            s.last_error = Some(error.to_string());
        });
    }

    /// Mark the gallery initialized with nothing left to do
    pub fn mark_idle(&self) {
        self.update(|s| {
            s.status = RunStatus::Done;
            s.is_initialized = true;
        });
    }

    /// Leave the error state so the next check can schedule again
    pub fn reset_error(&self) {
        self.update(|s| {
            if s.status == RunStatus::Error {
                s.status = RunStatus::Waiting;
            }
        });
    }
}

/// Clears `is_indexing` on drop
#[must_use = "dropping the guard ends the run immediately"]
pub struct RunGuard<'a> {
    manager: &'a IndexingManager,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.manager.update(|s| s.is_indexing = false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager_without_index() -> (TempDir, IndexingManager) {
        let temp_dir = TempDir::new().unwrap();
        let manager = IndexingManager::new(&temp_dir.path().join("vector.index"));
        (temp_dir, manager)
    }

    fn manager_with_index() -> (TempDir, IndexingManager) {
        let temp_dir = TempDir::new().unwrap();
        let index_path = temp_dir.path().join("vector.index");
        std::fs::write(&index_path, b"index").unwrap();
        std::fs::write(paths_file_for(&index_path), b"/g/a.png\n").unwrap();
        let manager = IndexingManager::new(&index_path);
        (temp_dir, manager)
    }

    #[test]
    fn test_initial_status() {
        let (_dir, manager) = manager_without_index();
        let status = manager.get_status();
        assert_eq!(status, IndexingStatus::default());
        assert_eq!(status.status, RunStatus::Waiting);
        assert!(!status.is_initialized);
    }

    #[test]
    fn test_needs_full_index_without_artifact() {
        let (_dir, manager) = manager_without_index();
        assert!(manager.needs_indexing());
        assert_eq!(manager.get_status().indexing_type, IndexingType::Full);
    }

    #[test]
    fn test_needs_full_index_without_path_list() {
        let (dir, manager) = manager_with_index();
        manager.mark_idle();
        assert!(!manager.needs_indexing());

        std::fs::remove_file(paths_file_for(&dir.path().join("vector.index"))).unwrap();
        assert!(manager.needs_indexing());
        assert_eq!(manager.get_status().indexing_type, IndexingType::Full);
    }

    #[test]
    fn test_needs_full_index_on_first_run() {
        let (_dir, manager) = manager_with_index();
        assert!(manager.needs_indexing());
        assert_eq!(manager.get_status().indexing_type, IndexingType::Full);
    }

    #[test]
    fn test_status_machine_cycle() {
        let (_dir, manager) = manager_with_index();

        {
            let _run = manager.try_begin_run().unwrap();
            assert!(manager.get_status().is_indexing);
            assert!(!manager.needs_indexing());
            assert!(manager.try_begin_run().is_none());
            manager.finish_success();
        }
        let status = manager.get_status();
        assert!(!status.is_indexing);
        assert_eq!(status.status, RunStatus::Done);
        assert!(status.is_initialized);
        assert!(!manager.needs_indexing());

        manager.add_new_images(3);
        assert!(manager.needs_indexing());
        let status = manager.get_status();
        assert_eq!(status.indexing_type, IndexingType::Incremental);
        assert_eq!(status.new_images_count, 3);
        assert_eq!(status.status, RunStatus::Waiting);
    }

    #[test]
    fn test_add_new_images_resets_progress_after_done() {
        let (_dir, manager) = manager_with_index();
        {
            let _run = manager.try_begin_run().unwrap();
            manager.set_total(2, IndexingType::Full);
            manager.record_processed();
            manager.record_processed();
            manager.finish_success();
        }
        assert_eq!(manager.get_status().processed_images, 2);

        manager.add_new_images(1);
        let status = manager.get_status();
        assert_eq!(status.processed_images, 0);
        assert_eq!(status.status, RunStatus::Waiting);
        assert!(status.is_initialized);
    }

    #[test]
    fn test_add_new_images_accumulates_while_indexing() {
        let (_dir, manager) = manager_with_index();
        let _run = manager.try_begin_run().unwrap();
        manager.add_new_images(2);
        manager.add_new_images(3);

        let status = manager.get_status();
        assert_eq!(status.new_images_count, 5);
        assert_eq!(status.status, RunStatus::Indexing);
    }

    #[test]
    fn test_guard_clears_flag_after_error() {
        let (_dir, manager) = manager_with_index();
        {
            let _run = manager.try_begin_run().unwrap();
            manager.finish_error("disk full");
        }
        let status = manager.get_status();
        assert!(!status.is_indexing);
        assert_eq!(status.status, RunStatus::Error);
        assert_eq!(status.last_error.as_deref(), Some("disk full"));

        manager.reset_error();
        assert_eq!(manager.get_status().status, RunStatus::Waiting);
    }

    #[test]
    fn test_guard_clears_flag_on_panic() {
        let (_dir, manager) = manager_with_index();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _run = manager.try_begin_run().unwrap();
            panic!("embedding backend crashed");
        }));
        assert!(result.is_err());
        assert!(!manager.get_status().is_indexing);
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&IndexingStatus::default()).unwrap();
        assert!(json.contains("\"status\":\"waiting\""));
        assert!(json.contains("\"indexing_type\":\"none\""));
    }
}
