// Scoped ownership of a submission's staged upload directory
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use yantra_common::staging::StagingArea;

/// Deletes the staged directory exactly once: on `release`, or on drop if
/// the execution path unwound before reaching it. `keep` hands the files
/// back to the queue when the submission was never started.
pub struct StagingGuard {
    area: StagingArea,
    dir: Option<PathBuf>,
}

impl StagingGuard {
    pub fn new(area: StagingArea, dir: PathBuf) -> Self {
        Self {
            area,
            dir: Some(dir),
        }
    }

    /// A guard with nothing to clean up, for submissions without uploads
    pub fn empty(area: StagingArea) -> Self {
        Self { area, dir: None }
    }

    pub fn path(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Delete now. Failures are logged, never surfaced to the submission.
    pub fn release(&mut self) {
        if let Some(dir) = self.dir.take() {
            match self.area.remove(&dir) {
                Ok(()) => debug!(path = %dir.display(), "Staged files removed"),
                Err(e) => warn!(path = %dir.display(), error = %e, "Failed to remove staged files"),
            }
        }
    }

    /// Disarm without deleting; the submission will be retried and needs
    /// its files again
    pub fn keep(&mut self) {
        if let Some(dir) = self.dir.take() {
            debug!(path = %dir.display(), "Keeping staged files for retry");
        }
    }
}

impl Drop for StagingGuard {
    fn drop(&mut self) {
        self.release();
    }
}
