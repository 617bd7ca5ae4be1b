//! Hardware layer of the fluidics engine.
//!
//! - [`config`]: system configuration schema and loader (figment).
//! - [`drivers`]: one driver per supported vendor protocol, plus simulated
//!   drivers for demo mode.
//! - [`factory`]: maps configured device types to driver instances.
//! - [`imaging`]: synchronization strategies with the microscope.
//! - [`ports`]: serial port discovery.

pub mod config;
pub mod drivers;
pub mod factory;
pub mod imaging;
pub mod ports;

pub use config::{load_system_config, SystemConfig};
pub use factory::{assign_all, DeviceComponents};
