//! Per-submission staging directories for uploaded files.
//!
//! The upload layer creates the directory and writes files before the
//! execution job is enqueued; the worker only checks existence, resolves the
//! mount path, and deletes. Every directory lives under one root so a record
//! can never point the worker at an arbitrary host path.

use crate::types::UploadedFile;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct StagingArea {
    root: PathBuf,
}

impl StagingArea {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir_for(&self, job_id: &Uuid) -> PathBuf {
        self.root.join(job_id.to_string())
    }

    /// Create the submission's directory (idempotent)
    pub fn create(&self, job_id: &Uuid) -> io::Result<PathBuf> {
        let dir = self.dir_for(job_id);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Write one uploaded file into the submission's directory
    pub fn write_file(
        &self,
        job_id: &Uuid,
        filename: &str,
        contents: &[u8],
        mime_type: Option<String>,
    ) -> io::Result<UploadedFile> {
        if !is_plain_filename(filename) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid upload filename: {:?}", filename),
            ));
        }
        let dir = self.create(job_id)?;
        fs::write(dir.join(filename), contents)?;
        Ok(UploadedFile {
            filename: filename.to_string(),
            size: contents.len() as u64,
            mime_type,
        })
    }

    /// Resolve a recorded `files_directory` to a host path inside the root
    pub fn resolve(&self, files_directory: &str) -> io::Result<PathBuf> {
        let path = Path::new(files_directory);
        let escapes = path
            .components()
            .any(|c| matches!(c, Component::ParentDir));
        if escapes || !path.starts_with(&self.root) || path == self.root {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!(
                    "staging directory {} is outside {}",
                    path.display(),
                    self.root.display()
                ),
            ));
        }
        Ok(path.to_path_buf())
    }

    pub fn exists(&self, dir: &Path) -> bool {
        dir.is_dir()
    }

    /// Recursive delete; an already-missing directory is not an error
    pub fn remove(&self, dir: &Path) -> io::Result<()> {
        match fs::remove_dir_all(dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

fn is_plain_filename(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}
