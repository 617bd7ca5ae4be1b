//! Loading and validation of the system configuration.
//!
//! # Usage
//!
//! ```rust,ignore
//! use fish_hardware::config::loader::load_system_config;
//! use std::path::Path;
//!
//! let config = load_system_config(Path::new("config/system.toml"))?;
//! ```
//!
//! Values can be overridden from the environment with the `FISH_` prefix,
//! nested keys separated by a double underscore, e.g.
//! `FISH_PUMP__PORT=/dev/ttyUSB3`.

use super::schema::SystemConfig;
use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Json, Toml},
    Figment,
};
use std::path::Path;
use tracing::{debug, info};

/// Error types for config loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    /// File not found
    #[error("Config file not found: {0}")]
    NotFound(String),

    /// Unsupported file extension
    #[error("Unsupported config format (expected .toml or .json): {0}")]
    UnsupportedFormat(String),

    /// Validation error
    #[error("Config validation failed:\n{0}")]
    ValidationError(String),
}

/// Load a system configuration from a TOML or JSON file.
///
/// This function:
/// 1. Picks the provider from the file extension
/// 2. Merges `FISH_` environment overrides on top
/// 3. Deserializes into a `SystemConfig`
/// 4. Runs cross-field validation
pub fn load_system_config(path: &Path) -> Result<SystemConfig> {
    if !path.exists() {
        return Err(ConfigLoadError::NotFound(path.display().to_string()).into());
    }

    debug!("Loading system config from: {}", path.display());

    let figment = match path.extension().and_then(|s| s.to_str()) {
        Some("toml") => Figment::new().merge(Toml::file(path)),
        Some("json") => Figment::new().merge(Json::file(path)),
        _ => {
            return Err(ConfigLoadError::UnsupportedFormat(path.display().to_string()).into());
        }
    };

    let config: SystemConfig = figment
        .merge(Env::prefixed("FISH_").split("__"))
        .extract()
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    check(&config)?;

    info!(
        demo = config.demo,
        pump = config.pump.as_ref().map(|p| p.device_type.as_str()),
        plate = config.plate.as_ref().map(|p| p.device_type.as_str()),
        valve_in = config.valve_in.as_ref().map(|v| v.device_type.as_str()),
        valve_out = config.valve_out.as_ref().map(|v| v.device_type.as_str()),
        flow_sensor = config.flow_sensor.as_ref().map(|s| s.device_type.as_str()),
        "Loaded system config"
    );

    Ok(config)
}

/// Load a system configuration from a TOML string.
///
/// Useful for testing or loading configs from embedded resources.
pub fn load_system_config_from_str(toml_content: &str) -> Result<SystemConfig> {
    let config: SystemConfig = Figment::new()
        .merge(Toml::string(toml_content))
        .extract()
        .context("Failed to parse TOML content")?;
    check(&config)?;
    Ok(config)
}

fn check(config: &SystemConfig) -> Result<()> {
    let errors = validate_system_config(config);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigLoadError::ValidationError(errors.join("\n")).into())
    }
}

/// Cross-field validation; returns one message per problem found.
pub fn validate_system_config(config: &SystemConfig) -> Vec<String> {
    let mut errors = Vec::new();

    if !(0.0..=1.0).contains(&config.demo_time_scale) {
        errors.push(format!(
            "demo_time_scale must be within 0..=1, got {}",
            config.demo_time_scale
        ));
    }

    if let Some(pump) = &config.pump {
        if pump.device_type.trim().is_empty() {
            errors.push("pump: no pump type defined".to_string());
        }
        if let Some(rate) = pump.flow_rate {
            if rate <= 0.0 {
                errors.push(format!("pump: flow_rate must be positive, got {}", rate));
            }
        }
        if let Some(speed) = pump.speed {
            if !(0.0..=6553.5).contains(&speed) {
                errors.push(format!("pump: speed must be within 0-6553.5 rpm, got {}", speed));
            }
        }
    }

    if let Some(plate) = &config.plate {
        if plate.device_type.trim().is_empty() {
            errors.push("plate: no plate robot type defined".to_string());
        }
        if plate.idle_token.is_empty() {
            errors.push("plate: idle_token must not be empty".to_string());
        }
        if plate.feed <= 0.0 {
            errors.push(format!("plate: feed must be positive, got {}", plate.feed));
        }
    }

    for (role, valve) in [("valve_in", &config.valve_in), ("valve_out", &config.valve_out)] {
        if let Some(valve) = valve {
            if valve.device_type.trim().is_empty() {
                errors.push(format!("{}: no valve type defined", role));
            }
            if valve.units == 0 {
                errors.push(format!("{}: units must be at least 1", role));
            }
            if valve.units > 1 && valve.ports_per_unit < 2 {
                errors.push(format!(
                    "{}: daisy-chained units need at least 2 ports per unit",
                    role
                ));
            }
        }
    }

    if let Some(sensor) = &config.flow_sensor {
        if sensor.device_type.trim().is_empty() {
            errors.push("flow_sensor: no sensor type defined".to_string());
        }
        if sensor.kernel_size == 0 {
            errors.push("flow_sensor: kernel_size must be at least 1".to_string());
        }
        if sensor.thousands_separator == sensor.decimal_separator {
            errors.push(
                "flow_sensor: thousands and decimal separators must differ".to_string(),
            );
        }
        if sensor.time_column == sensor.flow_column {
            errors.push("flow_sensor: time and flow columns must differ".to_string());
        }
        let verification = &sensor.verification;
        if verification.tolerance <= 0.0 {
            errors.push(format!(
                "flow_sensor: tolerance must be positive, got {}",
                verification.tolerance
            ));
        }
        if let Some(flow) = verification.expected_flow {
            if flow <= 0.0 {
                errors.push(format!(
                    "flow_sensor: expected_flow must be positive, got {}",
                    flow
                ));
            }
        }
    }

    errors
}
