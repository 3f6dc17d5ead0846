use crate::domain::error::CardError;
use std::fmt;
use std::str::FromStr;

/// 48-bit Bluetooth device address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BluetoothAddress(pub u64);

impl BluetoothAddress {
    /// Address as 12 upper-case hex digits without separators, the form
    /// Windows embeds in PnP device ids.
    pub fn to_compact_hex(&self) -> String {
        format!("{:012X}", self.0 & 0xFFFF_FFFF_FFFF)
    }
}

impl fmt::Display for BluetoothAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0.to_be_bytes();
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[2], b[3], b[4], b[5], b[6], b[7]
        )
    }
}

impl FromStr for BluetoothAddress {
    type Err = CardError;

    /// Accepts `00:11:22:33:44:55`, `00-11-22-33-44-55` or `001122334455`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex: String = s.chars().filter(|c| *c != ':' && *c != '-').collect();
        if hex.len() != 12 {
            return Err(CardError::InvalidRequest(format!(
                "invalid Bluetooth address: {}",
                s
            )));
        }
        u64::from_str_radix(&hex, 16)
            .map(BluetoothAddress)
            .map_err(|_| CardError::InvalidRequest(format!("invalid Bluetooth address: {}", s)))
    }
}

/// A Bluetooth peer seen during discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub address: BluetoothAddress,
    /// Raw class-of-device value.
    pub class_of_device: u32,
    pub name: String,
    pub authenticated: bool,
    pub remembered: bool,
    pub connected: bool,
}

impl DeviceInfo {
    /// Class of device rendered the way the card filter is written ("1F00").
    pub fn class_hex(&self) -> String {
        format!("{:X}", self.class_of_device)
    }
}

/// Events sent to whoever renders status for the host application.
#[derive(Debug, Clone, PartialEq)]
pub enum CardEvent {
    OperationStarted(String),
    OperationEnded(String),
    ConnectionStatus(ConnectionStatus),
    TransferProgress { bytes: u64 },
    LogMessage(StatusMessage),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_formats() {
        let addr: BluetoothAddress = "00:1A:7D:DA:71:13".parse().unwrap();
        assert_eq!(addr.0, 0x001A_7DDA_7113);
        assert_eq!(addr.to_string(), "00:1A:7D:DA:71:13");
        assert_eq!(addr.to_compact_hex(), "001A7DDA7113");

        let compact: BluetoothAddress = "001a7dda7113".parse().unwrap();
        assert_eq!(compact, addr);
    }

    #[test]
    fn test_address_rejects_garbage() {
        assert!("00:11:22".parse::<BluetoothAddress>().is_err());
        assert!("ZZ:11:22:33:44:55".parse::<BluetoothAddress>().is_err());
    }

    #[test]
    fn test_class_hex() {
        let device = DeviceInfo {
            address: BluetoothAddress(1),
            class_of_device: 0x1F00,
            name: "GateKeeper".into(),
            authenticated: false,
            remembered: false,
            connected: false,
        };
        assert_eq!(device.class_hex(), "1F00");
    }
}
