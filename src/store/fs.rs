//! Object store rooted in a local directory.

use super::{validate_object_path, ObjectStore};
use crate::error::StoreError;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Objects are files under `root`; object paths are relative, `/`-separated.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StoreError> {
        validate_object_path(path)?;
        Ok(path.split('/').fold(self.root.clone(), |acc, seg| acc.join(seg)))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn get(&self, path: &str) -> Result<Vec<u8>, StoreError> {
        let full = self.resolve(path)?;
        match tokio::fs::read(&full).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::NotFound(path.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, path: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&full, bytes).await?;
        debug!(path, bytes = bytes.len(), "object stored");
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        let full = self.resolve(path)?;
        match tokio::fs::remove_file(&full).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
