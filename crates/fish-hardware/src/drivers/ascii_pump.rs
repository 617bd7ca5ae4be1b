//! Generic ASCII speed-controlled pump.
//!
//! Some pump heads speak a small line protocol: a model query, a head
//! temperature query, a speed-set command, and start/stop. The exact
//! command words come from the `[pump.commands]` section of the system
//! configuration. `set_speed` is a strfmt template, e.g. `"SPEED {speed}"`.
//!
//! Every command is answered with one line. An answer starting with `ERR`
//! is treated as a rejection.

use anyhow::{Context, Result};
use async_trait::async_trait;
use fish_core::capabilities::Pump;
use fish_core::error::{DriverError, DriverErrorKind};
use fish_core::serial::{open_serial_async, query_line, wrap_shared, SerialSettings, SharedPort};
use std::collections::HashMap;
use std::time::Duration;
use strfmt::strfmt;
use tracing::{info, instrument};

use crate::config::AsciiPumpCommands;

/// Device type string.
pub const DEVICE_TYPE: &str = "ASCII SPEED";

/// Default serial settings.
pub fn default_settings() -> SerialSettings {
    SerialSettings::new(9600)
}

/// Driver for a config-templated ASCII pump.
pub struct AsciiSpeedPump {
    port: SharedPort,
    timeout: Duration,
    commands: AsciiPumpCommands,
}

impl AsciiSpeedPump {
    /// Open the pump on `port_path`.
    pub async fn open(
        port_path: &str,
        settings: &SerialSettings,
        commands: AsciiPumpCommands,
    ) -> Result<Self> {
        let port = open_serial_async(port_path, settings, DEVICE_TYPE).await?;
        info!(port = port_path, "Assign ASCII SPEED pump");
        Ok(Self::with_port(
            wrap_shared(Box::new(port)),
            settings.timeout(),
            commands,
        ))
    }

    /// Build the driver over an already opened channel.
    pub fn with_port(port: SharedPort, timeout: Duration, commands: AsciiPumpCommands) -> Self {
        Self {
            port,
            timeout,
            commands,
        }
    }

    /// Identify the pump and apply the configured speed.
    pub async fn configure(&self, speed_rpm: Option<f64>) -> Result<()> {
        let model = self.pump_type().await?;
        let temperature = self.temperature().await?;
        info!(%model, temperature, "PUMP: identified");
        if let Some(speed) = speed_rpm {
            self.set_speed(speed).await?;
        }
        Ok(())
    }

    /// Model identification string.
    pub async fn pump_type(&self) -> Result<String> {
        let query = self.commands.type_query.clone();
        let response = self.send(&query).await?;
        if response.is_empty() {
            return Err(DriverError::new(
                DEVICE_TYPE,
                DriverErrorKind::Initialization,
                "no answer to type query",
            )
            .into());
        }
        Ok(response)
    }

    /// Head temperature in °C.
    pub async fn temperature(&self) -> Result<f64> {
        let query = self.commands.temperature_query.clone();
        let response = self.send(&query).await?;
        response
            .trim()
            .trim_end_matches(['C', '°'])
            .trim()
            .parse()
            .map_err(|_| {
                DriverError::new(
                    DEVICE_TYPE,
                    DriverErrorKind::Protocol,
                    format!("unreadable temperature '{}'", response),
                )
                .into()
            })
    }

    /// Set rotation speed in rpm.
    #[instrument(skip(self), err)]
    pub async fn set_speed(&self, speed_rpm: f64) -> Result<()> {
        let cmd = render_speed(&self.commands.set_speed, speed_rpm)?;
        self.send(&cmd).await.map(|_| ())
    }

    async fn send(&self, cmd: &str) -> Result<String> {
        let line = format!("{}{}", cmd, self.commands.terminator);
        let response = query_line(&self.port, line.as_bytes(), self.timeout, DEVICE_TYPE)
            .await
            .with_context(|| format!("ASCII pump command {:?} failed", cmd))?;
        if response.to_ascii_uppercase().starts_with("ERR") {
            return Err(DriverError::new(
                DEVICE_TYPE,
                DriverErrorKind::Protocol,
                format!("command {:?} rejected: {}", cmd, response),
            )
            .into());
        }
        Ok(response)
    }
}

/// Render the speed-set template.
pub fn render_speed(template: &str, speed_rpm: f64) -> Result<String> {
    let mut vars = HashMap::new();
    vars.insert("speed".to_string(), format!("{:.1}", speed_rpm));
    strfmt(template, &vars).map_err(|e| {
        DriverError::new(
            DEVICE_TYPE,
            DriverErrorKind::Configuration,
            format!("bad set_speed template '{}': {}", template, e),
        )
        .into()
    })
}

#[async_trait]
impl Pump for AsciiSpeedPump {
    #[instrument(skip(self), err)]
    async fn start(&self) -> Result<()> {
        let cmd = self.commands.start.clone();
        self.send(&cmd).await.map(|_| ())
    }

    #[instrument(skip(self), err)]
    async fn stop(&self) -> Result<()> {
        let cmd = self.commands.stop.clone();
        self.send(&cmd).await.map(|_| ())
    }
}
