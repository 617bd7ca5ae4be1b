//! Imaging synchronization strategies.
//!
//! The fluidics engine only needs [`ImageAcquirer`]: "acquire images for this
//! round and return when done". Each strategy hands the acquisition to an
//! external microscope controller and waits for its completion signal.
//!
//! | Strategy | Start signal | Completion signal |
//! |----------|--------------|-------------------|
//! | [`TtlSync`] | `start\n` on a serial line | a `finished` line |
//! | [`FileSyncWrite`] | sync file content `1` | sync file content `0` |
//! | [`FileSyncCreate`] | sync file created | sync file deleted |
//!
//! [`ImageAcquirer`]: fish_core::capabilities::ImageAcquirer

pub mod file_sync;
pub mod ttl;

pub use file_sync::{FileSyncCreate, FileSyncWrite};
pub use ttl::TtlSync;

use anyhow::Result;
use fish_core::capabilities::ImageAcquirer;
use fish_core::serial::SerialSettings;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Default delay between completion checks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Selected synchronization strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "kebab-case")]
pub enum SyncConfig {
    /// Arduino TTL box on a serial port.
    Ttl {
        /// Serial port path.
        port: String,
        /// Baud rate.
        #[serde(default = "default_ttl_baudrate")]
        baudrate: u32,
    },
    /// Existing file toggled between `1` and `0`.
    FileWrite {
        /// Sync file path.
        path: PathBuf,
    },
    /// File created by the engine and deleted by the microscope.
    FileCreate {
        /// Sync file path.
        path: PathBuf,
    },
}

fn default_ttl_baudrate() -> u32 {
    115200
}

/// Build the acquirer for `config`.
pub async fn build_acquirer(config: &SyncConfig) -> Result<Arc<dyn ImageAcquirer>> {
    Ok(match config {
        SyncConfig::Ttl { port, baudrate } => {
            let settings = SerialSettings::new(*baudrate);
            Arc::new(TtlSync::open(port, &settings).await?)
        }
        SyncConfig::FileWrite { path } => Arc::new(FileSyncWrite::initiate(path).await?),
        SyncConfig::FileCreate { path } => Arc::new(FileSyncCreate::initiate(path)?),
    })
}
