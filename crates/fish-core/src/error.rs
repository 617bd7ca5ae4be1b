//! Error types for the fluidics engine.
//!
//! `FluidicsError` is the error returned by every engine operation. Its
//! variants fall into five groups, and each group is handled differently:
//!
//! - **Configuration**: `Configuration`, `UnknownBuffer`, `MalformedPosition`,
//!   `UndefinedWell`, `UnknownDeviceType`. Fatal to the operation that found
//!   them. Static analysis keeps going so that every finding gets reported.
//! - **Transport**: `Driver`, `Io`, `Hardware`. When a device is assigned,
//!   these leave the capability unassigned (`None`). During a round they end
//!   the round.
//! - **Protocol/state**: `UnknownAction`, `NoInletValve`, `NoOutletValve`,
//!   `OutletCountMismatch`, `NotReady`, `RoundUnavailable`. Fatal to the
//!   current round.
//! - **Measurement**: flow tolerance breaches are not errors. They escalate to
//!   an operator confirmation instead.
//! - **Cancellation**: `Cancelled`, observed at a step boundary.
//!
//! Driver-level failures use [`DriverError`] inside `anyhow::Error` chains, the
//! same way capability traits report hardware problems.

use thiserror::Error;

// =============================================================================
// Driver Errors
// =============================================================================

/// Failure category reported by a device driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    /// Handshake or power-on sequence failed.
    Initialization,
    /// Driver settings are invalid for the device.
    Configuration,
    /// Channel open, write or read failed.
    Communication,
    /// The device answered, but not with the expected acknowledgment.
    Protocol,
    /// The device did not answer in time.
    Timeout,
    /// A parameter is outside the range the device accepts.
    InvalidParameter,
}

impl std::fmt::Display for DriverErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            DriverErrorKind::Initialization => "initialization",
            DriverErrorKind::Configuration => "configuration",
            DriverErrorKind::Communication => "communication",
            DriverErrorKind::Protocol => "protocol",
            DriverErrorKind::Timeout => "timeout",
            DriverErrorKind::InvalidParameter => "invalid_parameter",
        };
        write!(f, "{}", label)
    }
}

/// Error raised by a specific driver.
#[derive(Error, Debug, Clone)]
#[error("Driver '{driver_type}' {kind} error: {message}")]
pub struct DriverError {
    /// Device type string of the driver, e.g. `"REGLO DIGITAL"`.
    pub driver_type: String,
    /// Failure category.
    pub kind: DriverErrorKind,
    /// Human readable detail.
    pub message: String,
}

impl DriverError {
    /// Create a new driver error.
    pub fn new(
        driver_type: impl Into<String>,
        kind: DriverErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            driver_type: driver_type.into(),
            kind,
            message: message.into(),
        }
    }
}

// =============================================================================
// Engine Errors
// =============================================================================

/// Convenience alias for results using the engine error type.
pub type AppResult<T> = std::result::Result<T, FluidicsError>;

/// Primary error type of the fluidics engine.
#[derive(Error, Debug)]
pub enum FluidicsError {
    /// Semantic problem in a system or experiment configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A step referenced a buffer missing from the buffer table.
    #[error("Buffer not defined in buffer list: {0}")]
    UnknownBuffer(String),

    /// An absolute plate position did not match `X.._Y.._Z..`.
    #[error("Position on plate not in good format: {0}")]
    MalformedPosition(String),

    /// A well label is not part of the plate geometry.
    #[error("Well is not defined: {0}")]
    UndefinedWell(String),

    /// A hardware role names a device type without a driver.
    #[error("Unknown device type '{device_type}' for {role}")]
    UnknownDeviceType {
        /// Hardware role, e.g. `pump`.
        role: String,
        /// The unsupported type string.
        device_type: String,
    },

    /// A driver reported a failure.
    #[error(transparent)]
    Driver(#[from] DriverError),

    /// File or channel I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The protocol contains an action the executor does not know.
    #[error("Unrecognized step: {0}")]
    UnknownAction(String),

    /// A buffer needs the inlet valve but none is configured.
    #[error("No inlet valve defined")]
    NoInletValve,

    /// `valve_out` or `pump_valve_out` used without an outlet valve.
    #[error("No outlet valve defined")]
    NoOutletValve,

    /// `pump_valve_out` durations do not pair up with outlet positions.
    #[error("pump_valve_out expects {expected} durations (one per outlet position), got {got}")]
    OutletCountMismatch {
        /// Number of configured outlet positions.
        expected: usize,
        /// Number of durations in the step.
        got: usize,
    },

    /// A required capability or precondition is missing.
    #[error("Not ready: {0}")]
    NotReady(String),

    /// The round was already run, or never admitted.
    #[error("Round {0} is not available")]
    RoundUnavailable(String),

    /// A stop request was observed at a step boundary.
    #[error("Round {0} cancelled")]
    Cancelled(String),

    /// Hardware failure reported through a capability trait.
    #[error(transparent)]
    Hardware(#[from] anyhow::Error),
}

impl FluidicsError {
    /// Short text for the operator-facing message channel.
    ///
    /// The full error, including any source chain, goes to the log. This is
    /// the one-liner shown next to it.
    pub fn operator_message(&self) -> String {
        match self {
            FluidicsError::Configuration(_)
            | FluidicsError::UnknownBuffer(_)
            | FluidicsError::MalformedPosition(_)
            | FluidicsError::UndefinedWell(_)
            | FluidicsError::UnknownDeviceType { .. } => {
                format!("Configuration problem: {}", self)
            }
            FluidicsError::Driver(e) => format!("{} failed ({})", e.driver_type, e.kind),
            FluidicsError::Io(_) | FluidicsError::Hardware(_) => {
                "Hardware communication failed, see log".to_string()
            }
            FluidicsError::Cancelled(round) => format!("Round {} stopped", round),
            _ => self.to_string(),
        }
    }

    /// Whether this error is a stop request rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, FluidicsError::Cancelled(_))
    }
}
