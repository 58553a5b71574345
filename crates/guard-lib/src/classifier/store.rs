//! Named-location storage for opaque model blobs

use crate::error::StorageError;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Load/save contract for model artifacts
pub trait ModelStore: Send + Sync {
    fn load(&self, name: &str) -> Result<Vec<u8>, StorageError>;

    fn save(&self, name: &str, bytes: &[u8]) -> Result<(), StorageError>;
}

/// Model store backed by a directory on disk
#[derive(Debug, Clone)]
pub struct FsModelStore {
    model_dir: PathBuf,
}

impl FsModelStore {
    pub fn new(model_dir: impl Into<PathBuf>) -> Self {
        Self {
            model_dir: model_dir.into(),
        }
    }

    pub fn model_dir(&self) -> &Path {
        &self.model_dir
    }

    /// Resolve a model name to a path inside the store directory
    fn path_for(&self, name: &str) -> Result<PathBuf, StorageError> {
        if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
            return Err(StorageError::InvalidName(name.to_string()));
        }
        Ok(self.model_dir.join(name))
    }
}

impl ModelStore for FsModelStore {
    fn load(&self, name: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.path_for(name)?;
        fs::read(&path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound(name.to_string())
            } else {
                StorageError::Io {
                    name: name.to_string(),
                    source,
                }
            }
        })
    }

    fn save(&self, name: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let path = self.path_for(name)?;
        let io_err = |source| StorageError::Io {
            name: name.to_string(),
            source,
        };

        fs::create_dir_all(&self.model_dir).map_err(io_err)?;

        // Write to temp file first
        let temp_path = path.with_extension("tmp");
        let mut file = File::create(&temp_path).map_err(io_err)?;
        file.write_all(bytes).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;

        // Rename to final path
        fs::rename(&temp_path, &path).map_err(io_err)?;

        debug!(path = %path.display(), size = bytes.len(), "Model blob saved");
        Ok(())
    }
}
