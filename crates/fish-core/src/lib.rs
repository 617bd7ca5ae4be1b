//! Core types and traits for the fluidics engine.
//!
//! This crate holds everything the protocol engine and the device drivers
//! agree on, without depending on either:
//!
//! - [`capabilities`]: one async trait per hardware role (pump, valve, stage,
//!   flow sensor) plus the imaging collaborator.
//! - [`operator`]: the acknowledgment port used for blocking operator prompts.
//! - [`error`]: the error taxonomy shared by configuration, transport,
//!   protocol, measurement and cancellation failures.
//! - [`serial`]: shared async serial channel plumbing (feature `serial`).

pub mod capabilities;
pub mod error;
pub mod operator;
#[cfg(feature = "serial")]
pub mod serial;

pub use capabilities::{Axis, AxisTargets, FlowSensor, ImageAcquirer, Pump, Stage, Valve};
pub use error::{AppResult, DriverError, DriverErrorKind, FluidicsError};
pub use operator::OperatorPort;
