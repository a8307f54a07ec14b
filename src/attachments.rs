use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AttachmentError {
    #[error("failed to prepare upload directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write attachment {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Where decoded photo uploads end up.
#[async_trait]
pub trait AttachmentStore: Send + Sync {
    /// Persist `bytes` under a unique name derived from the already
    /// sanitized `filename` and return the absolute path.
    async fn store(&self, filename: &str, bytes: &[u8]) -> Result<PathBuf, AttachmentError>;
}

/// Writes attachments as `<uuid>-<filename>` into one directory.
#[derive(Debug, Clone)]
pub struct DirAttachmentStore {
    dir: PathBuf,
}

impl DirAttachmentStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl AttachmentStore for DirAttachmentStore {
    async fn store(&self, filename: &str, bytes: &[u8]) -> Result<PathBuf, AttachmentError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| AttachmentError::CreateDir {
                path: self.dir.clone(),
                source,
            })?;

        let path = self
            .dir
            .join(format!("{}-{}", uuid::Uuid::new_v4(), filename));
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|source| AttachmentError::Write {
                path: path.clone(),
                source,
            })?;

        tracing::debug!(path = %path.display(), size = bytes.len(), "attachment stored");
        Ok(path)
    }
}
