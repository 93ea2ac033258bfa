//! Persisted resume offset: where the next index scan of a channel may start.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::Result;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeOffset {
    /// Byte offset of a line start.
    pub start: u64,
    /// Absolute line number at `start`.
    pub line: u64,
}

impl ResumeOffset {
    pub fn new(start: u64, line: u64) -> Self {
        Self { start, line }
    }

    /// Read the sidecar. A missing or unreadable sidecar means "scan from 0".
    pub async fn load(path: &Path) -> Result<Self> {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice(&bytes) {
            Ok(offset) => Ok(offset),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Ignoring unreadable resume offset");
                Ok(Self::default())
            }
        }
    }

    pub async fn store(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).await?;
        }
        let json = serde_json::to_vec(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let tmp = path.with_extension("tmp");
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }

    pub async fn clear(path: &Path) -> Result<()> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
