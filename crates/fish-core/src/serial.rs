//! Serial channel abstractions for driver crates.
//!
//! Each fluidics device talks over exactly one serial channel, owned by its
//! driver. This module provides the shared channel types and helpers so that
//! drivers do not each redefine them.
//!
//! # Feature Flag
//!
//! This module requires the `serial` feature (enabled by default).
//!
//! # Types
//!
//! - [`SerialPortIO`]: AsyncRead + AsyncWrite bound for serial ports
//! - [`DynSerial`]: Type-erased boxed serial port
//! - [`SharedPort`]: Mutex-guarded buffered port for line protocols
//! - [`SerialSettings`]: Baud rate and framing as read from the system config
//!
//! # Utilities
//!
//! - [`open_serial_async`]: Open a serial port with spawn_blocking
//! - [`drain_serial_buffer`]: Drain stale data from a serial port
//! - [`write_command`] / [`query_line`]: Command and command/response helpers
//!
//! # Example
//!
//! ```rust,ignore
//! use fish_core::serial::{open_serial_async, query_line, wrap_shared, SerialSettings};
//!
//! let settings = SerialSettings::new(9600);
//! let port = open_serial_async("/dev/ttyUSB0", &settings, "REGLO DIGITAL").await?;
//! let shared = wrap_shared(Box::new(port));
//! let ack = query_line(&shared, b"1H\r", settings.timeout(), "REGLO DIGITAL").await?;
//! ```

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

// =============================================================================
// Serial Port Trait
// =============================================================================

/// Trait alias for async serial port I/O.
///
/// Any type implementing `AsyncRead + AsyncWrite + Unpin + Send` can be used
/// as a serial port. This includes:
/// - `tokio_serial::SerialStream` (real hardware)
/// - `tokio::io::DuplexStream` (testing)
/// - Any mock implementing the async I/O traits
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

// Blanket implementation for all types meeting the requirements
impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

// =============================================================================
// Type Aliases
// =============================================================================

/// Type-erased boxed serial port.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Mutex-guarded serial port with buffered reading.
///
/// Most fluidics devices answer with line-delimited ASCII, so the
/// `BufReader` wrapper enables `read_line()` on the response side.
pub type SharedPort = Arc<Mutex<BufReader<DynSerial>>>;

/// Create a SharedPort from a type-erased serial port.
pub fn wrap_shared(port: DynSerial) -> SharedPort {
    Arc::new(Mutex::new(BufReader::new(port)))
}

// =============================================================================
// Settings
// =============================================================================

/// Parity bit setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ParitySetting {
    /// No parity bit.
    #[default]
    #[serde(alias = "N", alias = "none", alias = "NONE")]
    None,
    /// Even parity.
    #[serde(alias = "E", alias = "even", alias = "EVEN")]
    Even,
    /// Odd parity.
    #[serde(alias = "O", alias = "odd", alias = "ODD")]
    Odd,
}

/// Serial framing and timing for one device channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialSettings {
    /// Baud rate (e.g. 1200, 9600, 115200).
    #[serde(alias = "baud")]
    pub baudrate: u32,
    /// Parity bit.
    #[serde(default)]
    pub parity: ParitySetting,
    /// Stop bits, 1 or 2.
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    /// Data bits, 5 to 8.
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    /// Read timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_stop_bits() -> u8 {
    1
}

fn default_data_bits() -> u8 {
    8
}

fn default_timeout_ms() -> u64 {
    500
}

impl SerialSettings {
    /// 8N1 at `baudrate` with the default read timeout.
    pub fn new(baudrate: u32) -> Self {
        Self {
            baudrate,
            parity: ParitySetting::None,
            stop_bits: default_stop_bits(),
            data_bits: default_data_bits(),
            timeout_ms: default_timeout_ms(),
        }
    }

    /// Read timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Check that the framing values are supported by the serial backend.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.baudrate == 0 {
            anyhow::bail!("baudrate must be positive");
        }
        if !(1..=2).contains(&self.stop_bits) {
            anyhow::bail!("stop_bits must be 1 or 2, got {}", self.stop_bits);
        }
        if !(5..=8).contains(&self.data_bits) {
            anyhow::bail!("data_bits must be 5-8, got {}", self.data_bits);
        }
        Ok(())
    }
}

// =============================================================================
// Serial Port Utilities
// =============================================================================

/// Open a serial port asynchronously using spawn_blocking.
///
/// The port is opened in `spawn_blocking` so that port initialization does
/// not block the async runtime. Framing comes from `settings`, and flow
/// control is always off.
///
/// # Errors
///
/// Returns an error if the settings are invalid, the port cannot be opened,
/// or spawn_blocking fails.
pub async fn open_serial_async(
    port_path: &str,
    settings: &SerialSettings,
    device_name: &str,
) -> anyhow::Result<tokio_serial::SerialStream> {
    use tokio::task::spawn_blocking;
    use tokio_serial::SerialPortBuilderExt;

    settings
        .validate()
        .with_context(|| format!("Invalid serial settings for {}", device_name))?;

    let data_bits = match settings.data_bits {
        5 => tokio_serial::DataBits::Five,
        6 => tokio_serial::DataBits::Six,
        7 => tokio_serial::DataBits::Seven,
        _ => tokio_serial::DataBits::Eight,
    };
    let stop_bits = match settings.stop_bits {
        2 => tokio_serial::StopBits::Two,
        _ => tokio_serial::StopBits::One,
    };
    let parity = match settings.parity {
        ParitySetting::None => tokio_serial::Parity::None,
        ParitySetting::Even => tokio_serial::Parity::Even,
        ParitySetting::Odd => tokio_serial::Parity::Odd,
    };

    let port_path_owned = port_path.to_string();
    let device_name_owned = device_name.to_string();
    let baud_rate = settings.baudrate;
    let timeout = settings.timeout();

    spawn_blocking(move || {
        tokio_serial::new(&port_path_owned, baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .flow_control(tokio_serial::FlowControl::None)
            .timeout(timeout)
            .open_native_async()
            .context(format!(
                "Failed to open {} serial port: {}",
                device_name_owned, port_path_owned
            ))
    })
    .await
    .context("spawn_blocking for serial port opening failed")?
}

/// Drain stale data from a serial port buffer.
///
/// Reads and discards data until nothing more is immediately available or
/// `timeout_ms` elapses. Returns the number of bytes discarded.
pub async fn drain_serial_buffer<R: AsyncRead + Unpin>(port: &mut R, timeout_ms: u64) -> usize {
    let mut discard = [0u8; 256];
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    let mut total_discarded = 0usize;

    loop {
        if tokio::time::Instant::now() >= deadline {
            break;
        }

        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match tokio::time::timeout(remaining, port.read(&mut discard)).await {
            Ok(Ok(0)) => break, // EOF or no more data
            Ok(Ok(n)) => {
                total_discarded += n;
            }
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Ok(Err(_)) => break, // Real I/O error, abort drain
            Err(_) => break,     // Timeout, no more immediate data
        }
    }

    total_discarded
}

/// Write `command` and flush, without reading a response.
pub async fn write_command(
    port: &SharedPort,
    command: &[u8],
    device_name: &str,
) -> anyhow::Result<()> {
    let mut guard = port.lock().await;
    let writer = guard.get_mut();
    writer
        .write_all(command)
        .await
        .with_context(|| format!("{} write failed", device_name))?;
    writer
        .flush()
        .await
        .with_context(|| format!("{} flush failed", device_name))?;
    Ok(())
}

/// Write `command`, then read one response line (trimmed).
pub async fn query_line(
    port: &SharedPort,
    command: &[u8],
    timeout: Duration,
    device_name: &str,
) -> anyhow::Result<String> {
    let mut guard = port.lock().await;
    let writer = guard.get_mut();
    writer
        .write_all(command)
        .await
        .with_context(|| format!("{} write failed", device_name))?;
    writer
        .flush()
        .await
        .with_context(|| format!("{} flush failed", device_name))?;

    let mut response = String::new();
    tokio::time::timeout(timeout, guard.read_line(&mut response))
        .await
        .with_context(|| format!("{} read timeout", device_name))?
        .with_context(|| format!("{} read error", device_name))?;

    Ok(response.trim().to_string())
}

/// Read one response line without writing first (trimmed).
pub async fn read_line(
    port: &SharedPort,
    timeout: Duration,
    device_name: &str,
) -> anyhow::Result<String> {
    let mut guard = port.lock().await;
    let mut response = String::new();
    tokio::time::timeout(timeout, guard.read_line(&mut response))
        .await
        .with_context(|| format!("{} read timeout", device_name))?
        .with_context(|| format!("{} read error", device_name))?;
    Ok(response.trim().to_string())
}
