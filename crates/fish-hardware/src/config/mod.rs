//! System (hardware) configuration.
//!
//! The configuration lists one entry per hardware role (`pump`, `plate`,
//! `valve_in`, `valve_out`, `flow_sensor`). Each entry has:
//!
//! - a device-type string that selects the driver variant,
//! - a serial channel (port, baud rate, parity, stop bits, data bits),
//! - device-specific tuning values.
//!
//! The top-level `demo` flag swaps every driver for a simulated one.
//!
//! # Example Configuration
//!
//! ```toml
//! demo = false
//!
//! [pump]
//! type = "REGLO DIGITAL"
//! port = "/dev/ttyUSB0"
//! baudrate = 9600
//! flow_rate = 0.45
//! revolution = "CW"
//!
//! [plate]
//! type = "GRBL"
//! port = "/dev/ttyUSB1"
//! baudrate = 115200
//! ```

pub mod loader;
pub mod schema;

pub use loader::{load_system_config, load_system_config_from_str, ConfigLoadError};
pub use schema::{
    AsciiPumpCommands, ChannelConfig, FlowSensorConfig, FlowVerificationConfig, PumpConfig,
    Revolution, StageConfig, SystemConfig, ValveConfig,
};
