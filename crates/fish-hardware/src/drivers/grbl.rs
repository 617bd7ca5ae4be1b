//! GRBL plate stage driver (CNC router 3018PRO / Genmitsu).
//!
//! Protocol Overview:
//! - Format: G-code lines over USB serial, 115200 baud
//! - `$10=2` selects the status report mask on assignment
//! - `?` returns a status line such as `<Idle|MPos:0.000,0.000,0.000|FS:0,0>`.
//!   Motion is complete once the line contains the idle token (`Idl`).
//! - `G0 {axis}{coord}` rapid move, `$J=G91 G21 {axis}{dist}F{feed}` jog,
//!   `G10 L20 P0 X0 Y0 Z0` declares the current position as origin
//!
//! Horizontal travel always retracts Z to 0 first, so that the plate is not
//! dragged through liquid. Every single axis move is polled to idle before
//! the next one is issued.

use anyhow::{Context, Result};
use async_trait::async_trait;
use fish_core::capabilities::{Axis, AxisTargets, Stage};
use fish_core::error::{DriverError, DriverErrorKind};
use fish_core::serial::{
    drain_serial_buffer, open_serial_async, query_line, wrap_shared, write_command, SerialSettings,
    SharedPort,
};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tracing::{debug, info, instrument};

use crate::config::StageConfig;

/// Device type string.
pub const DEVICE_TYPE: &str = "GRBL";

/// Other type strings accepted for the same driver.
pub const DEVICE_TYPE_ALIASES: &[&str] = &["CNCROUTER3018PRO", "GENMITSU"];

/// Default serial settings.
pub fn default_settings() -> SerialSettings {
    SerialSettings::new(115200)
}

/// Motion tuning for the stage.
#[derive(Debug, Clone)]
pub struct GrblTuning {
    /// Jog feed rate in mm/min.
    pub feed: f64,
    /// Idle token searched in status lines.
    pub idle_token: String,
    /// Delay between idle polls.
    pub poll_interval: Duration,
    /// Delay between sending `?` and reading the answer.
    pub status_delay: Duration,
    /// Give up waiting for idle after this long.
    pub move_timeout: Duration,
}

impl GrblTuning {
    /// Tuning from the `[plate]` section.
    pub fn from_config(config: &StageConfig) -> Self {
        Self {
            feed: config.feed,
            idle_token: config.idle_token.clone(),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            status_delay: Duration::from_millis(config.status_delay_ms),
            move_timeout: Duration::from_secs(120),
        }
    }
}

/// Driver for a GRBL controlled XYZ stage.
pub struct GrblStage {
    port: SharedPort,
    timeout: Duration,
    tuning: GrblTuning,
}

impl GrblStage {
    /// Open the stage on `port_path` and set the status report mask.
    pub async fn open(port_path: &str, settings: &SerialSettings, tuning: GrblTuning) -> Result<Self> {
        let port = open_serial_async(port_path, settings, DEVICE_TYPE).await?;
        info!(port = port_path, "Assign GRBL plate robot");
        let stage = Self::with_port(wrap_shared(Box::new(port)), settings.timeout(), tuning);
        stage.initialize().await?;
        Ok(stage)
    }

    /// Build the driver over an already opened channel (no handshake).
    pub fn with_port(port: SharedPort, timeout: Duration, tuning: GrblTuning) -> Self {
        Self {
            port,
            timeout,
            tuning,
        }
    }

    /// Select the status report mask.
    #[instrument(skip(self), err)]
    pub async fn initialize(&self) -> Result<()> {
        {
            let mut guard = self.port.lock().await;
            drain_serial_buffer(guard.get_mut(), 50).await;
        }
        let response = query_line(&self.port, b"$10=2\n\r", self.timeout, DEVICE_TYPE).await?;
        info!(%response, "PLATE: set status report mask");
        Ok(())
    }

    /// Send `?` and return the raw status line.
    pub async fn status(&self) -> Result<String> {
        let mut guard = self.port.lock().await;

        // Move acknowledgments ("ok") pile up between polls.
        let buffered = guard.buffer().len();
        guard.consume(buffered);
        drain_serial_buffer(guard.get_mut(), 20).await;

        let writer = guard.get_mut();
        writer
            .write_all(b"?\n\r")
            .await
            .context("GRBL status write failed")?;
        writer.flush().await.context("GRBL status flush failed")?;

        tokio::time::sleep(self.tuning.status_delay).await;

        let mut response = String::new();
        tokio::time::timeout(self.timeout, guard.read_line(&mut response))
            .await
            .context("GRBL status read timeout")?
            .context("GRBL status read error")?;
        Ok(response.trim().to_string())
    }

    async fn send(&self, cmd: &str) -> Result<()> {
        debug!(cmd = cmd.trim_end(), "PLATE: send");
        write_command(&self.port, cmd.as_bytes(), DEVICE_TYPE).await
    }

    async fn move_axis(&self, axis: Axis, coord: f64) -> Result<()> {
        self.send(&format!("G0 {}{} \n", axis.letter(), coord)).await?;
        self.wait_idle().await?;
        info!(%axis, coord, "Moved");
        Ok(())
    }
}

#[async_trait]
impl Stage for GrblStage {
    #[instrument(skip(self), err)]
    async fn move_to(&self, targets: &AxisTargets) -> Result<()> {
        if targets.keys().any(|axis| axis.is_horizontal()) {
            self.move_axis(Axis::Z, 0.0).await?;
        }
        for (axis, coord) in targets {
            self.move_axis(*axis, *coord).await?;
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn jog(&self, axis: Axis, distance: f64) -> Result<()> {
        self.send(&format!(
            "$J=G91 G21 {}{}F{} \n",
            axis.letter(),
            distance,
            self.tuning.feed
        ))
        .await?;
        self.wait_idle().await
    }

    #[instrument(skip(self), err)]
    async fn zero(&self) -> Result<()> {
        let response =
            query_line(&self.port, b"G10 L20 P0 X0 Y0 Z0 \n", self.timeout, DEVICE_TYPE).await?;
        info!(%response, "PLATE: current position set to zero");
        Ok(())
    }

    async fn check_idle(&self) -> Result<bool> {
        let status = self.status().await?;
        debug!(%status, "PLATE: status");
        Ok(status.contains(&self.tuning.idle_token))
    }

    async fn wait_idle(&self) -> Result<()> {
        let start = tokio::time::Instant::now();
        loop {
            if self.check_idle().await? {
                return Ok(());
            }
            if start.elapsed() > self.tuning.move_timeout {
                return Err(DriverError::new(
                    DEVICE_TYPE,
                    DriverErrorKind::Timeout,
                    format!(
                        "stage not idle after {} s",
                        self.tuning.move_timeout.as_secs()
                    ),
                )
                .into());
            }
            tokio::time::sleep(self.tuning.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::mock_serial::{ScriptedPort, Transcript};

    const IDLE: &str = "<Idle|MPos:0.000,0.000,0.000|FS:0,0>\r\n";
    const RUN: &str = "<Run|MPos:1.000,0.000,0.000|FS:500,0>\r\n";

    fn stage(replies: Vec<&str>) -> (GrblStage, Transcript) {
        let (port, transcript) = ScriptedPort::new(replies);
        let tuning = GrblTuning {
            feed: 500.0,
            idle_token: "Idl".to_string(),
            poll_interval: Duration::ZERO,
            status_delay: Duration::ZERO,
            move_timeout: Duration::from_secs(5),
        };
        (
            GrblStage::with_port(wrap_shared(Box::new(port)), Duration::from_millis(50), tuning),
            transcript,
        )
    }

    #[tokio::test]
    async fn horizontal_move_retracts_first_and_polls_each_axis() {
        let (stage, transcript) = stage(vec![
            "ok\r\n", IDLE, // G0 Z0
            "ok\r\n", RUN, IDLE, // G0 X10
            "ok\r\n", IDLE, // G0 Y20.5
        ]);

        let mut targets = AxisTargets::new();
        targets.insert(Axis::Y, 20.5);
        targets.insert(Axis::X, 10.0);
        stage.move_to(&targets).await.unwrap();

        assert_eq!(
            transcript.commands(),
            vec![
                "G0 Z0 \n",
                "?\n\r",
                "G0 X10 \n",
                "?\n\r",
                "?\n\r",
                "G0 Y20.5 \n",
                "?\n\r",
            ]
        );
    }

    #[tokio::test]
    async fn vertical_move_does_not_retract() {
        let (stage, transcript) = stage(vec!["ok\r\n", IDLE]);
        let mut targets = AxisTargets::new();
        targets.insert(Axis::Z, -12.0);
        stage.move_to(&targets).await.unwrap();
        assert_eq!(transcript.commands(), vec!["G0 Z-12 \n", "?\n\r"]);
    }

    #[tokio::test]
    async fn jog_uses_feed_and_waits() {
        let (stage, transcript) = stage(vec!["ok\r\n", IDLE]);
        stage.jog(Axis::X, -2.5).await.unwrap();
        assert_eq!(
            transcript.commands(),
            vec!["$J=G91 G21 X-2.5F500 \n", "?\n\r"]
        );
    }

    #[tokio::test]
    async fn zero_and_initialize_commands() {
        let (stage, transcript) = stage(vec!["ok\r\n", "ok\r\n"]);
        stage.initialize().await.unwrap();
        stage.zero().await.unwrap();
        assert_eq!(
            transcript.commands(),
            vec!["$10=2\n\r", "G10 L20 P0 X0 Y0 Z0 \n"]
        );
    }

    #[tokio::test]
    async fn custom_idle_token() {
        let (port, _) = ScriptedPort::new(["<Ready>\r\n"]);
        let tuning = GrblTuning {
            feed: 500.0,
            idle_token: "Ready".to_string(),
            poll_interval: Duration::ZERO,
            status_delay: Duration::ZERO,
            move_timeout: Duration::from_secs(1),
        };
        let stage =
            GrblStage::with_port(wrap_shared(Box::new(port)), Duration::from_millis(50), tuning);
        assert!(stage.check_idle().await.unwrap());
    }
}
