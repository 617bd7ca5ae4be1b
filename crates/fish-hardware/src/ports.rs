//! Serial port discovery and validation.

use anyhow::Result;

/// Names of the serial ports visible to the operating system.
#[cfg(feature = "serial")]
pub fn list_ports() -> Result<Vec<String>> {
    let ports = serialport::available_ports()?;
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}

/// Port discovery needs the `serial` feature.
#[cfg(not(feature = "serial"))]
pub fn list_ports() -> Result<Vec<String>> {
    Ok(Vec::new())
}

/// Check that `port` exists before trying to open it for `role`.
///
/// The error lists the ports that do exist.
pub fn validate_serial_port(port: &str, role: &str) -> Result<()> {
    if std::path::Path::new(port).exists() || !port.starts_with('/') {
        // Windows COM names are not filesystem paths.
        return Ok(());
    }

    let available = match list_ports() {
        Ok(ports) if ports.is_empty() => "No serial ports detected on this system".to_string(),
        Ok(ports) => {
            let port_list: Vec<String> = ports.iter().map(|p| format!("  - {}", p)).collect();
            format!("Available serial ports:\n{}", port_list.join("\n"))
        }
        Err(e) => format!("Could not enumerate serial ports: {}", e),
    };

    anyhow::bail!(
        "Serial port '{}' does not exist for {}.\n\n{}",
        port,
        role,
        available
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_port_lists_alternatives() {
        let err = validate_serial_port("/dev/does-not-exist-fish", "pump").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("/dev/does-not-exist-fish"));
        assert!(message.contains("pump"));
    }

    #[test]
    fn com_names_pass_through() {
        assert!(validate_serial_port("COM3", "pump").is_ok());
    }
}
