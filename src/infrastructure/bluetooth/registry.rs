//! Serial port registry lookup.
//!
//! Windows publishes the COM port it created for an SPP link as a
//! `Win32_SerialPort` instance whose PnP device id embeds the peer address
//! and whose caption ends in `(COMn)`.

use crate::domain::error::{CardError, Result};
use crate::domain::models::BluetoothAddress;
use serde::Deserialize;
use std::process::Command;
use tracing::{debug, warn};

/// One row of the OS serial port registry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SerialPortEntry {
    #[serde(rename = "PNPDeviceID", default)]
    pub pnp_device_id: String,
    #[serde(rename = "Caption", default)]
    pub caption: String,
}

impl SerialPortEntry {
    pub fn new(pnp_device_id: impl Into<String>, caption: impl Into<String>) -> Self {
        Self {
            pnp_device_id: pnp_device_id.into(),
            caption: caption.into(),
        }
    }
}

/// `ConvertTo-Json` emits a bare object for a single row.
#[derive(Deserialize)]
#[serde(untagged)]
enum Rows {
    Many(Vec<SerialPortEntry>),
    One(SerialPortEntry),
}

/// Parse the JSON printed by the serial port query.
pub fn parse_serial_ports(json: &str) -> Result<Vec<SerialPortEntry>> {
    let trimmed = json.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    match serde_json::from_str::<Rows>(trimmed) {
        Ok(Rows::Many(rows)) => Ok(rows),
        Ok(Rows::One(row)) => Ok(vec![row]),
        Err(e) => Err(CardError::Malformed(format!("serial port query: {}", e))),
    }
}

/// Pull `COMn` out of a caption such as `Standard Serial over Bluetooth link (COM5)`.
pub fn port_from_caption(caption: &str) -> Option<String> {
    let start = caption.rfind("(COM").filter(|i| *i > 0)?;
    let port = caption[start..].trim_matches(|c| c == '(' || c == ')' || c == ' ');
    (!port.is_empty()).then(|| port.to_string())
}

/// Find the COM port assigned to `address`.
pub fn find_port_name(entries: &[SerialPortEntry], address: BluetoothAddress) -> Option<String> {
    let needle = address.to_compact_hex();
    entries
        .iter()
        .filter(|e| e.pnp_device_id.to_ascii_uppercase().contains(&needle))
        .find_map(|e| port_from_caption(&e.caption))
}

/// Ask the OS for its serial port registry.
pub fn query_serial_ports() -> Result<Vec<SerialPortEntry>> {
    let output = Command::new("powershell")
        .args([
            "-NoProfile",
            "-NonInteractive",
            "-Command",
            "Get-CimInstance -ClassName Win32_SerialPort | Select-Object PNPDeviceID, Caption | ConvertTo-Json -Compress",
        ])
        .output()?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        warn!("Serial port query failed: {}", stderr.trim());
        return Err(CardError::ConnectionFailed(format!(
            "serial port query failed: {}",
            stderr.trim()
        )));
    }

    let entries = parse_serial_ports(&String::from_utf8_lossy(&output.stdout))?;
    debug!("Serial port registry has {} entries", entries.len());
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDRESS: BluetoothAddress = BluetoothAddress(0x001A_7DDA_7113);

    #[test]
    fn test_parse_array_and_single_object() {
        let many = r#"[{"PNPDeviceID":"BTHENUM\\{0}&001A7DDA7113_C00000000","Caption":"Standard Serial over Bluetooth link (COM5)"},{"PNPDeviceID":"ACPI\\PNP0501\\1","Caption":"Communications Port (COM1)"}]"#;
        assert_eq!(parse_serial_ports(many).unwrap().len(), 2);

        let one = r#"{"PNPDeviceID":"ACPI\\PNP0501\\1","Caption":"Communications Port (COM1)"}"#;
        let rows = parse_serial_ports(one).unwrap();
        assert_eq!(rows, vec![SerialPortEntry::new("ACPI\\PNP0501\\1", "Communications Port (COM1)")]);

        assert!(parse_serial_ports("  \r\n").unwrap().is_empty());
        assert!(matches!(parse_serial_ports("nope"), Err(CardError::Malformed(_))));
    }

    #[test]
    fn test_port_from_caption() {
        assert_eq!(
            port_from_caption("Standard Serial over Bluetooth link (COM12)").as_deref(),
            Some("COM12")
        );
        assert_eq!(port_from_caption("(COM3)"), None);
        assert_eq!(port_from_caption("No port here"), None);
    }

    #[test]
    fn test_find_port_matches_address() {
        let entries = vec![
            SerialPortEntry::new("ACPI\\PNP0501\\1", "Communications Port (COM1)"),
            SerialPortEntry::new(
                "BTHENUM\\{00001101}_LOCALMFG&0002\\7&1&001a7dda7113_C00000000",
                "Standard Serial over Bluetooth link (COM7)",
            ),
        ];
        assert_eq!(find_port_name(&entries, ADDRESS).as_deref(), Some("COM7"));
        assert_eq!(find_port_name(&entries, BluetoothAddress(0x1)), None);
    }
}
