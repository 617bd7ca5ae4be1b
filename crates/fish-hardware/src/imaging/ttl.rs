//! TTL synchronization through an Arduino on a serial line.
//!
//! The engine writes `start\n`; the Arduino raises the trigger line for the
//! microscope and prints `finished` once the acquisition reports done. Other
//! lines (status chatter) are ignored.

use anyhow::{Context, Result};
use async_trait::async_trait;
use fish_core::capabilities::ImageAcquirer;
use fish_core::serial::{open_serial_async, wrap_shared, write_command, SerialSettings, SharedPort};
use std::path::Path;
use tokio::io::AsyncBufReadExt;
use tracing::{debug, info, instrument};

const DEVICE_NAME: &str = "TTL sync";
const START: &[u8] = b"start\n";
const FINISHED: &str = "finished";

/// Acquirer that triggers the microscope through a TTL box.
pub struct TtlSync {
    port: SharedPort,
}

impl TtlSync {
    /// Open the serial line to the TTL box.
    pub async fn open(port_path: &str, settings: &SerialSettings) -> Result<Self> {
        let port = open_serial_async(port_path, settings, DEVICE_NAME).await?;
        info!(port = port_path, "Connected to TTL box");
        Ok(Self::with_port(wrap_shared(Box::new(port))))
    }

    /// Build over an already opened channel.
    pub fn with_port(port: SharedPort) -> Self {
        Self { port }
    }

    async fn wait_finished(&self) -> Result<()> {
        let mut guard = self.port.lock().await;
        loop {
            let mut line = String::new();
            let n = guard
                .read_line(&mut line)
                .await
                .context("TTL sync read error")?;
            if n == 0 {
                anyhow::bail!("TTL sync channel closed before acquisition finished");
            }
            let line = line.trim();
            if line == FINISHED {
                return Ok(());
            }
            debug!(line, "TTL sync: received");
        }
    }
}

#[async_trait]
impl ImageAcquirer for TtlSync {
    #[instrument(skip(self), err)]
    async fn acquire_images(&self, _save_dir: &Path, name_base: &str) -> Result<()> {
        write_command(&self.port, START, DEVICE_NAME).await?;
        info!("Checking TTL for completion");
        self.wait_finished().await?;
        info!("Acquisition terminated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn waits_for_finished_line() {
        let (mut host, device) = tokio::io::duplex(64);
        let sync = TtlSync::with_port(wrap_shared(Box::new(device)));

        let microscope = tokio::spawn(async move {
            let mut buf = [0u8; 6];
            host.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"start\n");
            host.write_all(b"imaging\r\nfinished\r\n").await.unwrap();
            host
        });

        sync.acquire_images(Path::new("/tmp"), "1").await.unwrap();
        microscope.await.unwrap();
    }

    #[tokio::test]
    async fn closed_channel_is_an_error() {
        let (host, device) = tokio::io::duplex(64);
        let sync = TtlSync::with_port(wrap_shared(Box::new(device)));
        drop(host);
        assert!(sync.acquire_images(Path::new("/tmp"), "1").await.is_err());
    }
}
