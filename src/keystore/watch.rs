//! Key directory change notifications
//!
//! Wraps the platform file watcher so the key cache is rescanned as soon as
//! keyfiles are added, changed or removed.

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};

/// A running watcher on one key directory. Dropping it stops notifications.
pub struct KeyDirWatcher {
    dir: PathBuf,
    _watcher: RecommendedWatcher,
}

impl KeyDirWatcher {
    /// Start watching `dir`, invoking `on_change` for every modification.
    ///
    /// Fails when the platform has no notification support or the directory
    /// does not exist yet; the caller then falls back to throttled rescans.
    pub fn start<F>(dir: &Path, on_change: F) -> notify::Result<Self>
    where
        F: Fn() + Send + 'static,
    {
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            match res {
                Ok(event) => {
                    if matches!(
                        event.kind,
                        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                    ) {
                        on_change();
                    }
                }
                Err(e) => log::warn!("Key directory watcher error: {}", e),
            }
        })?;
        watcher.watch(dir, RecursiveMode::NonRecursive)?;
        log::debug!("Started watcher for key directory {}", dir.display());

        Ok(Self {
            dir: dir.to_path_buf(),
            _watcher: watcher,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl Drop for KeyDirWatcher {
    fn drop(&mut self) {
        log::debug!("Stopped watcher for key directory {}", self.dir.display());
    }
}
