//! AMC RVM rotary valve driver (single unit).
//!
//! Protocol Overview:
//! - Serial: 9600 baud, 8N1
//! - Initialization: `/1ZR\r` homes the rotor. The valve needs a few seconds
//!   before it accepts the next command.
//! - Move: `/1B{port}R\r` moves to `port` along the shortest path.

use anyhow::Result;
use async_trait::async_trait;
use fish_core::capabilities::Valve;
use fish_core::error::{DriverError, DriverErrorKind};
use fish_core::serial::{open_serial_async, wrap_shared, write_command, SerialSettings, SharedPort};
use std::time::Duration;
use tracing::{info, instrument};

/// Device type string.
pub const DEVICE_TYPE: &str = "AMC RVM";

/// Default serial settings.
pub fn default_settings() -> SerialSettings {
    SerialSettings::new(9600)
}

/// Driver for the AMC RVM valve.
pub struct AmcRvm {
    port: SharedPort,
    ports: u32,
}

impl AmcRvm {
    /// Open the valve on `port_path`, home it, and wait `init_wait`.
    pub async fn open(
        port_path: &str,
        settings: &SerialSettings,
        ports: u32,
        init_wait: Duration,
    ) -> Result<Self> {
        let port = open_serial_async(port_path, settings, DEVICE_TYPE).await?;
        info!(port = port_path, "Assign AMC RVM valve");
        let valve = Self::with_port(wrap_shared(Box::new(port)), ports);
        valve.initialize(init_wait).await?;
        Ok(valve)
    }

    /// Build the driver over an already opened channel (no handshake).
    pub fn with_port(port: SharedPort, ports: u32) -> Self {
        Self { port, ports }
    }

    /// Home the rotor.
    #[instrument(skip(self), err)]
    pub async fn initialize(&self, init_wait: Duration) -> Result<()> {
        write_command(&self.port, b"/1ZR\r", DEVICE_TYPE).await?;
        tokio::time::sleep(init_wait).await;
        info!("RVM initiated");
        Ok(())
    }
}

#[async_trait]
impl Valve for AmcRvm {
    #[instrument(skip(self), err)]
    async fn move_to(&self, position: u32) -> Result<()> {
        if position == 0 || position > self.ports {
            return Err(DriverError::new(
                DEVICE_TYPE,
                DriverErrorKind::InvalidParameter,
                format!("valve position {} outside 1..={}", position, self.ports),
            )
            .into());
        }
        let cmd = format!("/1B{}R\r", position);
        write_command(&self.port, cmd.as_bytes(), DEVICE_TYPE).await
    }
}
