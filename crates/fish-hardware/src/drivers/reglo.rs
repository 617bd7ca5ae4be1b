//! Ismatec Reglo Digital peristaltic pump driver.
//!
//! Protocol Overview:
//! - Format: ASCII command/response over RS-232, pump address `1`
//! - Commands end with `\r`, the pump answers one line
//! - Acknowledgment: `*` for success
//! - Flow rate: `1f{mmmm}{ee}` with a 4-digit mantissa and signed exponent,
//!   e.g. `1f0045-2` for 0.45 ml/min. The pump echoes the rate it actually
//!   set, and the echo must agree within 1 %.
//!
//! | Command | Meaning |
//! |---------|---------|
//! | `1H`    | start |
//! | `1I`    | stop |
//! | `1#`    | pump info |
//! | `1J`    | clockwise |
//! | `1K`    | counter-clockwise |

use anyhow::{Context, Result};
use async_trait::async_trait;
use fish_core::capabilities::Pump;
use fish_core::error::{DriverError, DriverErrorKind};
use fish_core::serial::{open_serial_async, query_line, wrap_shared, SerialSettings, SharedPort};
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::config::Revolution;

/// Device type string.
pub const DEVICE_TYPE: &str = "REGLO DIGITAL";

/// Default flow-rate exponent: mantissa is in 1/100 ml/min.
const FLOW_EXPONENT: i32 = -2;

/// Maximum relative difference (in percent) between sent and echoed rate.
const FLOW_ECHO_TOLERANCE_PERCENT: f64 = 1.0;

/// Default serial settings.
pub fn default_settings() -> SerialSettings {
    SerialSettings::new(9600)
}

/// Driver for the Reglo Digital pump.
pub struct RegloDigital {
    port: SharedPort,
    timeout: Duration,
}

impl RegloDigital {
    /// Open the pump on `port_path`.
    pub async fn open(port_path: &str, settings: &SerialSettings) -> Result<Self> {
        let port = open_serial_async(port_path, settings, DEVICE_TYPE).await?;
        info!(port = port_path, "Assign REGLO DIGITAL pump");
        Ok(Self::with_port(wrap_shared(Box::new(port)), settings.timeout()))
    }

    /// Build the driver over an already opened channel.
    pub fn with_port(port: SharedPort, timeout: Duration) -> Self {
        Self { port, timeout }
    }

    /// Apply flow rate and direction from the configuration.
    ///
    /// The pump tends to ignore the first command after the port opens, so an
    /// info request goes first and its answer is not checked.
    pub async fn configure(&self, flow_rate: Option<f64>, revolution: Revolution) -> Result<()> {
        self.info().await;
        if let Some(rate) = flow_rate {
            self.set_flow_rate(rate).await?;
        }
        self.set_revolution(revolution).await
    }

    /// Request pump info; failures are only logged.
    pub async fn info(&self) {
        match self.send("1#\r").await {
            Ok(response) => info!(%response, "PUMP: info"),
            Err(e) => warn!(error = %e, "PUMP: info request not answered"),
        }
    }

    /// Set revolution direction.
    #[instrument(skip(self), err)]
    pub async fn set_revolution(&self, revolution: Revolution) -> Result<()> {
        let cmd = match revolution {
            Revolution::Clockwise => "1J\r",
            Revolution::CounterClockwise => "1K\r",
        };
        self.command(cmd).await
    }

    /// Set flow rate in ml/min and verify the echoed value.
    #[instrument(skip(self), err)]
    pub async fn set_flow_rate(&self, rate: f64) -> Result<()> {
        let (cmd, rate_sent) = flow_rate_command(rate, FLOW_EXPONENT)?;
        let response = self.send(&cmd).await?;
        let rate_set: f64 = response.trim().parse().map_err(|_| {
            DriverError::new(
                DEVICE_TYPE,
                DriverErrorKind::Protocol,
                format!("Setting flow rate seems to have failed: '{}'", response),
            )
        })?;

        let diff_percent = 100.0 * (rate_sent - rate_set).abs() / rate_sent;
        info!(rate_sent, rate_set, diff_percent, "PUMP: flow rate set");
        if diff_percent >= FLOW_ECHO_TOLERANCE_PERCENT {
            return Err(DriverError::new(
                DEVICE_TYPE,
                DriverErrorKind::Protocol,
                format!(
                    "flow rate echo {} differs from requested {} by {:.1} %",
                    rate_set, rate_sent, diff_percent
                ),
            )
            .into());
        }
        Ok(())
    }

    async fn send(&self, cmd: &str) -> Result<String> {
        query_line(&self.port, cmd.as_bytes(), self.timeout, DEVICE_TYPE)
            .await
            .with_context(|| format!("REGLO DIGITAL command {:?} failed", cmd))
    }

    /// Send a command that must be acknowledged with `*`.
    async fn command(&self, cmd: &str) -> Result<()> {
        let response = self.send(cmd).await?;
        if response != "*" {
            return Err(DriverError::new(
                DEVICE_TYPE,
                DriverErrorKind::Protocol,
                format!("command {:?} answered with '{}'", cmd.trim_end(), response),
            )
            .into());
        }
        Ok(())
    }
}

/// Encode a flow rate as `1f{mmmm}{ee}\r`, returning the rate actually encoded.
pub fn flow_rate_command(rate: f64, exponent: i32) -> Result<(String, f64)> {
    let mantissa = (rate * 10f64.powi(-exponent)).round();
    if !(1.0..=9999.0).contains(&mantissa) {
        return Err(DriverError::new(
            DEVICE_TYPE,
            DriverErrorKind::InvalidParameter,
            format!("flow rate {} ml/min cannot be encoded with exponent {}", rate, exponent),
        )
        .into());
    }
    let encoded = mantissa * 10f64.powi(exponent);
    Ok((format!("1f{:04}{}\r", mantissa as u32, exponent), encoded))
}

#[async_trait]
impl Pump for RegloDigital {
    #[instrument(skip(self), err)]
    async fn start(&self) -> Result<()> {
        self.command("1H\r").await
    }

    #[instrument(skip(self), err)]
    async fn stop(&self) -> Result<()> {
        self.command("1I\r").await
    }
}
