//! Device Scanner Module
//!
//! Runs a bounded inquiry and keeps the devices that look like a card.

use crate::domain::error::Result;
use crate::domain::models::DeviceInfo;
use crate::infrastructure::bluetooth::BluetoothBackend;
use std::time::Duration;
use tracing::{debug, info};

/// Class of device the card advertises (uncategorized major class).
pub const DEFAULT_DEVICE_CLASS: &str = "1F00";

/// Default inquiry window.
pub const DEFAULT_INQUIRY_TIMEOUT: Duration = Duration::from_secs(7);

/// How candidates are picked out of the inquiry results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceFilter {
    /// Match the class-of-device hex string, e.g. "1F00".
    Class(String),
    /// Match the advertised device name exactly.
    Name(String),
}

impl Default for DeviceFilter {
    fn default() -> Self {
        Self::Class(DEFAULT_DEVICE_CLASS.to_string())
    }
}

impl DeviceFilter {
    /// Name filter when a card name is configured, class filter otherwise.
    pub fn from_settings(card_name: Option<&str>, device_class: &str) -> Self {
        match card_name {
            Some(name) if !name.is_empty() => Self::Name(name.to_string()),
            _ => Self::Class(device_class.to_string()),
        }
    }

    pub fn matches(&self, device: &DeviceInfo) -> bool {
        match self {
            Self::Class(class) => device.class_hex().eq_ignore_ascii_case(class),
            Self::Name(name) => device.name == *name,
        }
    }
}

/// Inquire for devices and keep those matching `filter`.
pub fn scan<B: BluetoothBackend + ?Sized>(
    backend: &mut B,
    filter: &DeviceFilter,
    timeout: Duration,
) -> Result<Vec<DeviceInfo>> {
    info!("Starting Bluetooth inquiry ({:?}) for {:?}", timeout, filter);
    let all = backend.discover(timeout)?;
    debug!("Inquiry returned {} devices", all.len());

    let candidates: Vec<DeviceInfo> = all.into_iter().filter(|d| filter.matches(d)).collect();
    for device in &candidates {
        info!(
            "Candidate card {} ({}) class {} authenticated={}",
            device.name,
            device.address,
            device.class_hex(),
            device.authenticated
        );
    }
    Ok(candidates)
}
