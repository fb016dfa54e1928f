//! File-system access offered to the agent
//!
//! The engine never touches the disk on its own; `fs/*` requests from the
//! agent go through a host-supplied [`FileSystemHandler`].

use async_trait::async_trait;
use std::path::Path;
use tokio::io::AsyncWriteExt;

use crate::error::{ClientError, Result};

#[async_trait]
pub trait FileSystemHandler: Send + Sync {
    async fn read_file(&self, path: &Path) -> Result<String>;
    async fn write_file(&self, path: &Path, content: &str) -> Result<()>;
    async fn exists(&self, path: &Path) -> Result<bool>;
}

/// Unrestricted access to the local disk via `tokio::fs`
#[derive(Debug, Clone, Default)]
pub struct LocalFileSystem;

impl LocalFileSystem {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FileSystemHandler for LocalFileSystem {
    async fn read_file(&self, path: &Path) -> Result<String> {
        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(ClientError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Path is not a file: {}", path.display()),
            )));
        }
        Ok(tokio::fs::read_to_string(path).await?)
    }

    /// Writes through a temp file in the same directory and renames it over
    /// the target, so readers never observe a partial file.
    async fn write_file(&self, path: &Path, content: &str) -> Result<()> {
        let parent = path.parent().ok_or_else(|| {
            ClientError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Path must include a parent directory: {}", path.display()),
            ))
        })?;
        tokio::fs::create_dir_all(parent).await?;

        let temp_path = parent.join(format!(".tmp_write_{}", ulid::Ulid::new()));
        let mut temp_file = tokio::fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;

        let written = async {
            temp_file.write_all(content.as_bytes()).await?;
            temp_file.flush().await?;
            temp_file.sync_all().await?;
            drop(temp_file);
            tokio::fs::rename(&temp_path, path).await
        }
        .await;

        if let Err(e) = written {
            if let Err(cleanup) = tokio::fs::remove_file(&temp_path).await {
                tracing::warn!("Failed to remove {}: {}", temp_path.display(), cleanup);
            }
            return Err(e.into());
        }
        Ok(())
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        Ok(tokio::fs::try_exists(path).await?)
    }
}

/// Apply the 1-based `line` and `limit` of `fs/read_text_file` to content
pub fn slice_lines(content: &str, line: Option<u32>, limit: Option<u32>) -> String {
    if line.is_none() && limit.is_none() {
        return content.to_string();
    }

    let skip = line.map(|l| l.saturating_sub(1) as usize).unwrap_or(0);
    let take = limit.map(|l| l as usize).unwrap_or(usize::MAX);

    content
        .split_inclusive('\n')
        .skip(skip)
        .take(take)
        .collect()
}
