//! Hamilton MVP rotary valve driver (daisy-chained units).
//!
//! Protocol Overview:
//! - Format: ASCII `/{unit}{command}R\r`, units addressed 1..n
//! - h-factor commands are enabled and the valve initialized on assignment:
//!   `h30001` (enable h-factor), `h20000` (initialize), `h10001`,
//!   `h21003` (8-way, 45° valve type)
//! - Move: `h2600{port}`, i.e. `h26000 + port`
//!
//! Daisy chain: each unit exposes `ports_per_unit` ports. An upstream unit
//! reaches the next one through its last port. To select global position
//! `p`, every unit before the target is switched to its connector port, and
//! then the target unit moves to `(p - 1) % ports_per_unit + 1`.

use anyhow::Result;
use async_trait::async_trait;
use fish_core::capabilities::Valve;
use fish_core::error::{DriverError, DriverErrorKind};
use fish_core::serial::{open_serial_async, wrap_shared, write_command, SerialSettings, SharedPort};
use std::time::Duration;
use tracing::{info, instrument};

/// Device type string.
pub const DEVICE_TYPE: &str = "HAMILTON MVP";

const H_FACTOR_INIT: [u32; 4] = [30001, 20000, 10001, 21003];
const H_FACTOR_MOVE_BASE: u32 = 26000;

/// Default serial settings.
pub fn default_settings() -> SerialSettings {
    SerialSettings::new(9600)
}

/// Driver for one or more daisy-chained MVP valves on one channel.
pub struct HamiltonMvp {
    port: SharedPort,
    units: u32,
    ports_per_unit: u32,
    command_gap: Duration,
}

impl HamiltonMvp {
    /// Open the valve chain on `port_path` and run the initialization handshake.
    pub async fn open(
        port_path: &str,
        settings: &SerialSettings,
        units: u32,
        ports_per_unit: u32,
    ) -> Result<Self> {
        let port = open_serial_async(port_path, settings, DEVICE_TYPE).await?;
        info!(port = port_path, units, "Assign HAMILTON MVP valve");
        let valve = Self::with_port(wrap_shared(Box::new(port)), units, ports_per_unit)?;
        valve.initialize().await?;
        Ok(valve)
    }

    /// Build the driver over an already opened channel (no handshake).
    pub fn with_port(port: SharedPort, units: u32, ports_per_unit: u32) -> Result<Self> {
        if units == 0 || ports_per_unit == 0 || (units > 1 && ports_per_unit < 2) {
            return Err(DriverError::new(
                DEVICE_TYPE,
                DriverErrorKind::Configuration,
                format!("invalid chain: {} units × {} ports", units, ports_per_unit),
            )
            .into());
        }
        Ok(Self {
            port,
            units,
            ports_per_unit,
            command_gap: Duration::from_millis(50),
        })
    }

    /// Highest selectable global position.
    pub fn max_position(&self) -> u32 {
        self.units * self.ports_per_unit
    }

    /// Enable h-factor commands and initialize every unit.
    #[instrument(skip(self), fields(units = self.units), err)]
    pub async fn initialize(&self) -> Result<()> {
        for unit in 1..=self.units {
            info!(unit, "Valve: initiate");
            for code in H_FACTOR_INIT {
                self.send(&format!("/{}h{}R\r", unit, code)).await?;
            }
        }
        Ok(())
    }

    /// Commands needed to select global `position`, in send order.
    pub fn move_commands(&self, position: u32) -> Result<Vec<String>> {
        if position == 0 || position > self.max_position() {
            return Err(DriverError::new(
                DEVICE_TYPE,
                DriverErrorKind::InvalidParameter,
                format!(
                    "valve position {} outside 1..={}",
                    position,
                    self.max_position()
                ),
            )
            .into());
        }

        let target_unit = (position - 1) / self.ports_per_unit + 1;
        let local_port = (position - 1) % self.ports_per_unit + 1;

        let mut commands: Vec<String> = (1..target_unit)
            .map(|unit| {
                format!(
                    "/{}h{}R\r",
                    unit,
                    H_FACTOR_MOVE_BASE + self.ports_per_unit
                )
            })
            .collect();
        commands.push(format!(
            "/{}h{}R\r",
            target_unit,
            H_FACTOR_MOVE_BASE + local_port
        ));
        Ok(commands)
    }

    async fn send(&self, cmd: &str) -> Result<()> {
        write_command(&self.port, cmd.as_bytes(), DEVICE_TYPE).await?;
        tokio::time::sleep(self.command_gap).await;
        Ok(())
    }
}

#[async_trait]
impl Valve for HamiltonMvp {
    #[instrument(skip(self), err)]
    async fn move_to(&self, position: u32) -> Result<()> {
        for cmd in self.move_commands(position)? {
            self.send(&cmd).await?;
        }
        Ok(())
    }
}
