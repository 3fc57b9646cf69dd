use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tempfile::NamedTempFile;
use tokio::task;
use tracing::debug;

use crate::error::{DownloadError, SetupError};

/// Destination for downloaded bodies, bound to one output location.
#[async_trait]
pub trait StorageSink: Send + Sync {
    /// Stores `bytes` under `file_name` and returns the number of bytes written.
    async fn write(&self, file_name: &str, bytes: Bytes) -> Result<u64, DownloadError>;
}

/// Writes files into a local directory.
///
/// Each write lands in an anonymous temp file in the same directory and is
/// persisted over the final name, so concurrent writes to the same name
/// leave one complete file behind (the last rename wins).
#[derive(Debug)]
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    /// Creates `dir` (and parents) if missing.
    pub fn create(dir: impl Into<PathBuf>) -> Result<Self, SetupError> {
        let dir = dir.into();
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(|source| SetupError::OutputDir {
                path: dir.clone(),
                source,
            })?;
        }
        if !dir.is_dir() {
            return Err(SetupError::OutputDir {
                source: std::io::Error::other("not a directory"),
                path: dir,
            });
        }

        debug!(dir = %dir.display(), "output directory ready");
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl StorageSink for DirectorySink {
    async fn write(&self, file_name: &str, bytes: Bytes) -> Result<u64, DownloadError> {
        let final_path = self.dir.join(file_name);
        let dir = self.dir.clone();
        let target = final_path.clone();

        // The temp file is removed on drop if any step fails.
        let written = task::spawn_blocking(move || -> std::io::Result<u64> {
            let mut partial = NamedTempFile::new_in(&dir)?;
            partial.write_all(&bytes)?;
            partial.persist(&target).map_err(|e| e.error)?;
            Ok(bytes.len() as u64)
        })
        .await
        .map_err(|e| DownloadError::io(&final_path, std::io::Error::other(e)))?;

        written.map_err(|source| DownloadError::io(final_path, source))
    }
}
