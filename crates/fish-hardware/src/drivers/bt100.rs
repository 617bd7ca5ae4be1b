//! Longer BT100 peristaltic pump driver (binary frame protocol).
//!
//! Protocol Overview:
//! - Serial: 1200 baud, 8E1
//! - Frame: `E9 1F 06 57 4A <speed_hi> <speed_lo> <start> <cw> <FCS>`
//!   - `E9`: frame header
//!   - `1F`: pump address
//!   - `06`: payload length
//!   - `57 4A`: "WJ", the run-control command
//!   - speed: rpm × 10 as big-endian u16
//!   - start: `01` running, `00` stopped
//!   - cw: `01` clockwise, `00` counter-clockwise
//!   - FCS: XOR of every byte after the header
//! - The pump does not answer control frames.

use anyhow::Result;
use async_trait::async_trait;
use fish_core::capabilities::Pump;
use fish_core::error::{DriverError, DriverErrorKind};
use fish_core::serial::{
    open_serial_async, wrap_shared, write_command, ParitySetting, SerialSettings, SharedPort,
};
use tracing::{info, instrument};

use crate::config::Revolution;

/// Device type string.
pub const DEVICE_TYPE: &str = "BT100";

const FRAME_HEADER: u8 = 0xE9;
const PUMP_ADDRESS: u8 = 0x1F;
const PAYLOAD_LEN: u8 = 0x06;
const CMD_RUN_CONTROL: [u8; 2] = [0x57, 0x4A];

/// Default serial settings.
pub fn default_settings() -> SerialSettings {
    SerialSettings {
        parity: ParitySetting::Even,
        ..SerialSettings::new(1200)
    }
}

/// XOR frame check sequence over `bytes`.
pub fn xor_checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc ^ b)
}

/// Build the run-control frame.
pub fn control_frame(speed_rpm: f64, running: bool, revolution: Revolution) -> Result<[u8; 10]> {
    let tenths = (speed_rpm * 10.0).round();
    if !(0.0..=f64::from(u16::MAX)).contains(&tenths) {
        return Err(DriverError::new(
            DEVICE_TYPE,
            DriverErrorKind::InvalidParameter,
            format!("speed {} rpm out of range", speed_rpm),
        )
        .into());
    }
    let [speed_hi, speed_lo] = (tenths as u16).to_be_bytes();

    let mut frame = [0u8; 10];
    frame[0] = FRAME_HEADER;
    frame[1] = PUMP_ADDRESS;
    frame[2] = PAYLOAD_LEN;
    frame[3] = CMD_RUN_CONTROL[0];
    frame[4] = CMD_RUN_CONTROL[1];
    frame[5] = speed_hi;
    frame[6] = speed_lo;
    frame[7] = u8::from(running);
    frame[8] = u8::from(revolution == Revolution::Clockwise);
    frame[9] = xor_checksum(&frame[1..9]);
    Ok(frame)
}

/// Driver for the BT100 pump.
pub struct Bt100 {
    port: SharedPort,
    speed_rpm: f64,
    revolution: Revolution,
}

impl Bt100 {
    /// Open the pump on `port_path`.
    pub async fn open(
        port_path: &str,
        settings: &SerialSettings,
        speed_rpm: f64,
        revolution: Revolution,
    ) -> Result<Self> {
        let port = open_serial_async(port_path, settings, DEVICE_TYPE).await?;
        info!(port = port_path, speed_rpm, ?revolution, "Assign BT100 pump");
        Self::with_port(wrap_shared(Box::new(port)), speed_rpm, revolution)
    }

    /// Build the driver over an already opened channel.
    pub fn with_port(port: SharedPort, speed_rpm: f64, revolution: Revolution) -> Result<Self> {
        // Reject unencodable speeds at assignment rather than at the first start.
        control_frame(speed_rpm, false, revolution)?;
        Ok(Self {
            port,
            speed_rpm,
            revolution,
        })
    }

    async fn send(&self, running: bool) -> Result<()> {
        let frame = control_frame(self.speed_rpm, running, self.revolution)?;
        write_command(&self.port, &frame, DEVICE_TYPE).await
    }
}

#[async_trait]
impl Pump for Bt100 {
    #[instrument(skip(self), fields(speed = self.speed_rpm), err)]
    async fn start(&self) -> Result<()> {
        self.send(true).await
    }

    #[instrument(skip(self), err)]
    async fn stop(&self) -> Result<()> {
        self.send(false).await
    }
}
