//! Schema definitions for the fluidics system configuration.
//!
//! # Schema Structure
//!
//! ```toml
//! demo = false          # or "yes", "1", "on" ...
//! [pump]                # REGLO DIGITAL | BT100 | ASCII SPEED
//! [plate]               # GRBL (aliases CNCRouter3018PRO, GENMITSU)
//! [valve_in]            # HAMILTON MVP | AMC RVM   (alias [valve])
//! [valve_out]           # HAMILTON MVP | AMC RVM
//! [flow_sensor]         # SENSIRION CSV
//! ```
//!
//! Every role section is optional. A missing section leaves that capability
//! unassigned.

use fish_core::serial::{ParitySetting, SerialSettings};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::PathBuf;

// =============================================================================
// Top-Level Config
// =============================================================================

/// Complete hardware configuration, keyed by hardware role.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemConfig {
    /// Disable all physical I/O and shorten waits.
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub demo: bool,

    /// Factor applied to pump and pause durations in demo mode.
    #[serde(default = "default_demo_time_scale")]
    pub demo_time_scale: f64,

    /// Pump role.
    #[serde(default)]
    pub pump: Option<PumpConfig>,

    /// Plate stage role.
    #[serde(default)]
    pub plate: Option<StageConfig>,

    /// Inlet valve role.
    #[serde(default, alias = "valve")]
    pub valve_in: Option<ValveConfig>,

    /// Outlet valve role.
    #[serde(default)]
    pub valve_out: Option<ValveConfig>,

    /// Flow sensor role.
    #[serde(default)]
    pub flow_sensor: Option<FlowSensorConfig>,
}

fn default_demo_time_scale() -> f64 {
    0.0
}

/// Accepts booleans, integers and the usual yes/no strings.
fn deserialize_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
        Text(String),
    }

    Ok(match Flag::deserialize(deserializer)? {
        Flag::Bool(b) => b,
        Flag::Int(i) => i != 0,
        Flag::Text(s) => matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "t" | "y" | "yes" | "on"
        ),
    })
}

// =============================================================================
// Channel
// =============================================================================

/// Serial channel settings shared by every role.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Serial port path (e.g. `/dev/ttyUSB0`, `COM3`).
    #[serde(default, alias = "COM")]
    pub port: Option<String>,
    /// Baud rate; the driver default is used if absent.
    #[serde(default, alias = "baud")]
    pub baudrate: Option<u32>,
    /// Parity bit.
    #[serde(default)]
    pub parity: Option<ParitySetting>,
    /// Stop bits.
    #[serde(default)]
    pub stop_bits: Option<u8>,
    /// Data bits.
    #[serde(default)]
    pub data_bits: Option<u8>,
    /// Read timeout in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl ChannelConfig {
    /// Resolve into serial settings, filling gaps from the driver defaults.
    pub fn settings(&self, defaults: &SerialSettings) -> SerialSettings {
        SerialSettings {
            baudrate: self.baudrate.unwrap_or(defaults.baudrate),
            parity: self.parity.unwrap_or(defaults.parity),
            stop_bits: self.stop_bits.unwrap_or(defaults.stop_bits),
            data_bits: self.data_bits.unwrap_or(defaults.data_bits),
            timeout_ms: self.timeout_ms.unwrap_or(defaults.timeout_ms),
        }
    }
}

// =============================================================================
// Pump
// =============================================================================

/// Pump revolution direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Revolution {
    /// Clockwise.
    #[default]
    #[serde(rename = "CW", alias = "cw")]
    Clockwise,
    /// Counter-clockwise.
    #[serde(rename = "CCW", alias = "ccw")]
    CounterClockwise,
}

/// Pump role configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PumpConfig {
    /// Device type string selecting the driver.
    #[serde(rename = "type")]
    pub device_type: String,
    /// Serial channel.
    #[serde(flatten)]
    pub channel: ChannelConfig,
    /// Flow rate in ml/min (REGLO DIGITAL).
    #[serde(default, alias = "Flowrate")]
    pub flow_rate: Option<f64>,
    /// Revolution direction.
    #[serde(default, alias = "Revolution")]
    pub revolution: Revolution,
    /// Rotation speed in rpm (BT100, ASCII SPEED).
    #[serde(default)]
    pub speed: Option<f64>,
    /// Command templates for the ASCII SPEED pump.
    #[serde(default)]
    pub commands: AsciiPumpCommands,
}

/// Command set of a config-templated ASCII pump.
///
/// `set_speed` is a strfmt template with a `{speed}` placeholder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsciiPumpCommands {
    /// Model identification query.
    #[serde(default = "default_type_query")]
    pub type_query: String,
    /// Head temperature query.
    #[serde(default = "default_temperature_query")]
    pub temperature_query: String,
    /// Speed-set template.
    #[serde(default = "default_set_speed")]
    pub set_speed: String,
    /// Start command.
    #[serde(default = "default_start")]
    pub start: String,
    /// Stop command.
    #[serde(default = "default_stop")]
    pub stop: String,
    /// Line terminator appended to every command.
    #[serde(default = "default_terminator")]
    pub terminator: String,
}

fn default_type_query() -> String {
    "TYPE?".to_string()
}

fn default_temperature_query() -> String {
    "TEMP?".to_string()
}

fn default_set_speed() -> String {
    "SPEED {speed}".to_string()
}

fn default_start() -> String {
    "RUN".to_string()
}

fn default_stop() -> String {
    "STOP".to_string()
}

fn default_terminator() -> String {
    "\r".to_string()
}

impl Default for AsciiPumpCommands {
    fn default() -> Self {
        Self {
            type_query: default_type_query(),
            temperature_query: default_temperature_query(),
            set_speed: default_set_speed(),
            start: default_start(),
            stop: default_stop(),
            terminator: default_terminator(),
        }
    }
}

// =============================================================================
// Valve
// =============================================================================

/// Valve role configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValveConfig {
    /// Device type string selecting the driver.
    #[serde(rename = "type")]
    pub device_type: String,
    /// Serial channel.
    #[serde(flatten)]
    pub channel: ChannelConfig,
    /// Number of daisy-chained units (HAMILTON MVP).
    #[serde(default = "default_units")]
    pub units: u32,
    /// Ports per unit; the last port of an upstream unit feeds the next unit.
    #[serde(default = "default_ports_per_unit")]
    pub ports_per_unit: u32,
    /// Wait after the homing handshake in milliseconds (AMC RVM).
    #[serde(default = "default_init_wait_ms")]
    pub init_wait_ms: u64,
}

fn default_units() -> u32 {
    1
}

fn default_ports_per_unit() -> u32 {
    8
}

fn default_init_wait_ms() -> u64 {
    5000
}

// =============================================================================
// Stage
// =============================================================================

/// Plate stage role configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    /// Device type string selecting the driver.
    #[serde(rename = "type")]
    pub device_type: String,
    /// Serial channel.
    #[serde(flatten)]
    pub channel: ChannelConfig,
    /// Jog feed rate in mm/min.
    #[serde(default = "default_feed")]
    pub feed: f64,
    /// Substring of the status response meaning "motion complete".
    #[serde(default = "default_idle_token")]
    pub idle_token: String,
    /// Delay between idle polls in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Delay between the status query and reading its answer.
    #[serde(default = "default_status_delay_ms")]
    pub status_delay_ms: u64,
}

fn default_feed() -> f64 {
    500.0
}

fn default_idle_token() -> String {
    "Idl".to_string()
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_status_delay_ms() -> u64 {
    200
}

// =============================================================================
// Flow sensor
// =============================================================================

/// Flow sensor role configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowSensorConfig {
    /// Device type string selecting the driver.
    #[serde(rename = "type")]
    pub device_type: String,
    /// CSV log written by the sensor software.
    pub log_file: PathBuf,
    /// Moving-average window in samples.
    #[serde(default = "default_kernel_size")]
    pub kernel_size: usize,
    /// Smoothed flow below this value (µl/min) counts as zero.
    #[serde(default)]
    pub flow_min: f64,
    /// Thousands separator used in the log.
    #[serde(default = "default_thousands_separator")]
    pub thousands_separator: String,
    /// Decimal separator used in the log.
    #[serde(default = "default_decimal_separator")]
    pub decimal_separator: String,
    /// CSV field delimiter.
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    /// Column holding the time stamp in seconds.
    #[serde(default = "default_time_column")]
    pub time_column: usize,
    /// Column holding the flow in µl/min.
    #[serde(default = "default_flow_column")]
    pub flow_column: usize,
    /// Pumped-volume verification settings.
    #[serde(default)]
    pub verification: FlowVerificationConfig,
}

fn default_kernel_size() -> usize {
    1
}

fn default_thousands_separator() -> String {
    ",".to_string()
}

fn default_decimal_separator() -> String {
    ".".to_string()
}

fn default_delimiter() -> char {
    ','
}

fn default_time_column() -> usize {
    1
}

fn default_flow_column() -> usize {
    2
}

/// Expected flow and tolerance for pumped-volume verification.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FlowVerificationConfig {
    /// Compare measured against expected volume after each pump step.
    #[serde(default)]
    pub verify: bool,
    /// Expected flow in ml/min.
    #[serde(default)]
    pub expected_flow: Option<f64>,
    /// Maximum relative deviation before the operator is asked to confirm.
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
}

fn default_tolerance() -> f64 {
    0.25
}

impl Default for FlowVerificationConfig {
    fn default() -> Self {
        Self {
            verify: false,
            expected_flow: None,
            tolerance: default_tolerance(),
        }
    }
}
