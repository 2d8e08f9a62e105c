use crate::core::error::{Error, Result};
use crate::gallery::orchestrator::Gallery;
use notify_debouncer_full::{
    new_debouncer,
    notify::{EventKind, RecursiveMode, Watcher},
    DebounceEventResult, DebouncedEvent,
};
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;
use tracing::{info, warn};

/// Debounce window for file system events
const DEBOUNCE: Duration = Duration::from_secs(2);

/// Watches the image directory and hands new images to the gallery
pub struct FileWatcher {
    root_path: PathBuf,
    gallery: Gallery,
}

impl FileWatcher {
    pub fn new(gallery: Gallery) -> Self {
        Self {
            root_path: gallery.config().images_dir.clone(),
            gallery,
        }
    }

    /// Block, feeding created or modified images to the gallery
    pub fn watch(&self) -> Result<()> {
        info!("Watching directory: {}", self.root_path.display());

        let (tx, rx) = mpsc::channel();
        let mut debouncer = new_debouncer(DEBOUNCE, None, move |result: DebounceEventResult| {
            match result {
                Ok(events) => {
                    let _ = tx.send(events);
                }
                Err(errors) => {
                    for e in errors {
                        warn!("Watch error: {}", e);
                    }
                }
            }
        })
        .map_err(|e| Error::Io(std::io::Error::other(format!("Failed to create file watcher: {}", e))))?;

        debouncer
            .watcher()
            .watch(&self.root_path, RecursiveMode::Recursive)
            .map_err(|e| Error::Io(std::io::Error::other(format!("Failed to watch directory: {}", e))))?;

        while let Ok(events) = rx.recv() {
            let paths = changed_paths(&events);
            if !paths.is_empty() {
                self.gallery.notify_new_images(&paths);
            }
        }

        Ok(())
    }
}

/// Paths touched by create or modify events, without repeats
fn changed_paths(events: &[DebouncedEvent]) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = events
        .iter()
        .filter(|event| matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)))
        .flat_map(|event| event.paths.iter().cloned())
        .collect();
    paths.sort();
    paths.dedup();
    paths
}
