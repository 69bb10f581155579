//! Files that could not be removed when they should have been.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

/// Paths swept once more when the process exits.
#[derive(Debug, Clone, Default)]
pub struct GarbageFiles {
    paths: Arc<Mutex<Vec<PathBuf>>>,
}

impl GarbageFiles {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<PathBuf>> {
        match self.paths.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Garbage list lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    pub fn push(&self, path: PathBuf) {
        self.lock().push(path);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every listed file that still exists. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let paths = std::mem::take(&mut *self.lock());
        let mut removed = 0;
        for path in paths {
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to remove leftover file")
                }
            }
        }
        removed
    }
}
