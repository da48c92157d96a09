use std::{
    path::{Path, PathBuf},
    sync::mpsc::{self, Receiver},
};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};

/// Collects changed module files from a set of directories.
///
/// Notifications arrive on notify's thread and queue up until [`drain`](Self::drain)
/// is called from the thread that owns the engine.
pub struct Watcher {
    _watchers: Vec<RecommendedWatcher>,
    changes: Receiver<PathBuf>,
}

impl Watcher {
    pub fn new(dirs: &[PathBuf], extension: &str) -> notify::Result<Self> {
        let (tx, changes) = mpsc::channel();
        let mut watchers = Vec::with_capacity(dirs.len());

        for dir in dirs {
            let tx = tx.clone();
            let extension = extension.to_owned();

            let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
                Ok(event) if is_change(&event.kind) => {
                    for path in event.paths {
                        if has_extension(&path, &extension) {
                            log::trace!("{path:?} changed");
                            let _ = tx.send(path);
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => log::error!("error watching module files: {e}"),
            })?;

            watcher.watch(dir, RecursiveMode::Recursive)?;
            log::debug!("watching {dir:?}");

            watchers.push(watcher);
        }

        Ok(Self {
            _watchers: watchers,
            changes,
        })
    }

    /// Changed paths since the last call, without duplicates, in notification order.
    pub fn drain(&self) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        for path in self.changes.try_iter() {
            if !paths.contains(&path) {
                paths.push(path);
            }
        }
        paths
    }
}

fn is_change(kind: &EventKind) -> bool {
    matches!(kind, EventKind::Create(_) | EventKind::Modify(_))
}

fn has_extension(path: &Path, extension: &str) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case(extension))
}
