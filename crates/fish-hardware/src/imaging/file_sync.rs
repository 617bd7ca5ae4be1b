//! File-flag synchronization with an external acquisition program.

use anyhow::{Context, Result};
use async_trait::async_trait;
use fish_core::capabilities::ImageAcquirer;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, instrument};

use super::DEFAULT_POLL_INTERVAL;

/// Sync file holding `0` (idle) or `1` (acquire).
///
/// The engine writes `1` and waits until the acquisition program writes `0`
/// back.
#[derive(Debug)]
pub struct FileSyncWrite {
    path: PathBuf,
    poll_interval: Duration,
}

impl FileSyncWrite {
    /// Create or reset the sync file to `0`.
    pub async fn initiate(path: &Path) -> Result<Self> {
        tokio::fs::write(path, "0")
            .await
            .with_context(|| format!("Cannot initiate sync file {}", path.display()))?;
        info!(path = %path.display(), "Acquisition sync file initiated");
        Ok(Self {
            path: path.to_path_buf(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    /// Change the completion poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[async_trait]
impl ImageAcquirer for FileSyncWrite {
    #[instrument(skip(self), err)]
    async fn acquire_images(&self, _save_dir: &Path, name_base: &str) -> Result<()> {
        tokio::fs::write(&self.path, "1")
            .await
            .with_context(|| format!("Cannot write sync file {}", self.path.display()))?;
        info!("Checking sync file for completion");
        loop {
            tokio::time::sleep(self.poll_interval).await;
            let content = tokio::fs::read_to_string(&self.path)
                .await
                .with_context(|| format!("Cannot read sync file {}", self.path.display()))?;
            if content.trim() == "0" {
                info!("Acquisition terminated");
                return Ok(());
            }
        }
    }
}

/// Sync file whose existence means "acquisition running".
///
/// The engine creates the file and waits until the acquisition program
/// deletes it.
#[derive(Debug)]
pub struct FileSyncCreate {
    path: PathBuf,
    poll_interval: Duration,
}

impl FileSyncCreate {
    /// Prepare the strategy; a left-over sync file is an error.
    pub fn initiate(path: &Path) -> Result<Self> {
        if path.exists() {
            anyhow::bail!(
                "Sync file already exists, please delete {}",
                path.display()
            );
        }
        info!(path = %path.display(), "Acquisition sync file initiated");
        Ok(Self {
            path: path.to_path_buf(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    /// Change the completion poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[async_trait]
impl ImageAcquirer for FileSyncCreate {
    #[instrument(skip(self), err)]
    async fn acquire_images(&self, _save_dir: &Path, name_base: &str) -> Result<()> {
        tokio::fs::write(&self.path, "Temporary file to initiate acquisition!")
            .await
            .with_context(|| format!("Cannot create sync file {}", self.path.display()))?;
        info!("Checking existence of sync file");
        while tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            tokio::time::sleep(self.poll_interval).await;
        }
        info!("Acquisition terminated");
        Ok(())
    }
}
