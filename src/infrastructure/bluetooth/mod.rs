//! Bluetooth Module
//!
//! Finds the GateKeeper Card, pairs with it and resolves the virtual serial
//! port the OS assigns to its Serial Port Profile service.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    BluetoothSession                      │
//! │  (pair -> enable SPP -> resolve COM port, one unit)      │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼─────────────┐
//!         │             │             │
//!         ▼             ▼             ▼
//! ┌───────────┐  ┌────────────┐  ┌──────────┐
//! │  Scanner  │  │ Connection │  │ Registry │
//! │           │  │            │  │          │
//! │ - Inquiry │  │ - Pairing  │  │ - Serial │
//! │ - Filters │  │ - SPP      │  │   ports  │
//! └───────────┘  └────────────┘  └──────────┘
//!                       │
//!                       ▼
//!             ┌───────────────────┐
//!             │ BluetoothBackend  │ (Win32 on Windows, fakes in tests)
//!             └───────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`scanner`] - Device inquiry and candidate filtering
//! - [`connection`] - Pairing, service activation and the session lifecycle
//! - [`registry`] - Serial port lookup for a paired device
//! - `windows` - Win32 Bluetooth backend

pub mod connection;
pub mod registry;
pub mod scanner;
#[cfg(windows)]
pub mod windows;

use crate::domain::error::Result;
use crate::domain::models::{BluetoothAddress, DeviceInfo};
use registry::SerialPortEntry;
use std::time::Duration;

pub use connection::{BluetoothSession, PairingStrategy, SessionConfig};
pub use scanner::DeviceFilter;

/// Outcome of a single pairing request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairResult {
    Paired,
    Rejected,
}

/// OS-level Bluetooth operations the session is built on.
pub trait BluetoothBackend: Send {
    /// Route every later call through the local radio with `address`.
    /// Without a selection the OS picks the radio.
    fn select_adapter(&mut self, address: BluetoothAddress) -> Result<()>;

    /// Run an inquiry for at most `timeout` and return every device seen,
    /// including remembered ones.
    fn discover(&mut self, timeout: Duration) -> Result<Vec<DeviceInfo>>;

    /// Devices currently paired (authenticated) with this host.
    fn paired_devices(&mut self) -> Result<Vec<DeviceInfo>>;

    /// Ask the device to pair using `pin`.
    ///
    /// Returns [`crate::domain::error::CardError::AccessDenied`] when the OS
    /// holds a stale record for the device.
    fn pair_request(&mut self, device: &DeviceInfo, pin: &str) -> Result<PairResult>;

    /// Turn on the Serial Port Profile service so the OS creates a COM port.
    fn enable_serial_service(&mut self, device: &DeviceInfo) -> Result<()>;

    /// Forget a device entirely.
    fn remove_device(&mut self, address: BluetoothAddress) -> Result<()>;

    /// Serial ports known to the OS.
    fn serial_ports(&mut self) -> Result<Vec<SerialPortEntry>>;
}

impl<B: BluetoothBackend + ?Sized> BluetoothBackend for Box<B> {
    fn select_adapter(&mut self, address: BluetoothAddress) -> Result<()> {
        (**self).select_adapter(address)
    }

    fn discover(&mut self, timeout: Duration) -> Result<Vec<DeviceInfo>> {
        (**self).discover(timeout)
    }

    fn paired_devices(&mut self) -> Result<Vec<DeviceInfo>> {
        (**self).paired_devices()
    }

    fn pair_request(&mut self, device: &DeviceInfo, pin: &str) -> Result<PairResult> {
        (**self).pair_request(device, pin)
    }

    fn enable_serial_service(&mut self, device: &DeviceInfo) -> Result<()> {
        (**self).enable_serial_service(device)
    }

    fn remove_device(&mut self, address: BluetoothAddress) -> Result<()> {
        (**self).remove_device(address)
    }

    fn serial_ports(&mut self) -> Result<Vec<SerialPortEntry>> {
        (**self).serial_ports()
    }
}

/// Backend for the platform this binary runs on.
#[cfg(windows)]
pub fn platform_backend() -> Result<Box<dyn BluetoothBackend>> {
    Ok(Box::new(windows::WinBluetooth::new()))
}

/// Backend for the platform this binary runs on.
#[cfg(not(windows))]
pub fn platform_backend() -> Result<Box<dyn BluetoothBackend>> {
    Err(crate::domain::error::CardError::BluetoothUnavailable)
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use crate::domain::error::CardError;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Scriptable backend that records what the session asked for.
    #[derive(Clone, Default)]
    pub(crate) struct FakeBackend {
        pub state: Arc<Mutex<FakeState>>,
    }

    #[derive(Default)]
    pub(crate) struct FakeState {
        pub adapters: Vec<BluetoothAddress>,
        pub discovered: Vec<DeviceInfo>,
        pub paired: Vec<BluetoothAddress>,
        /// Consumed front to back by `pair_request`; empty means success.
        pub pair_script: VecDeque<Result<PairResult>>,
        pub pair_calls: Vec<(BluetoothAddress, String)>,
        pub enabled: Vec<BluetoothAddress>,
        pub removed: Vec<BluetoothAddress>,
        pub ports: Vec<SerialPortEntry>,
    }

    impl FakeBackend {
        pub fn with_devices(devices: Vec<DeviceInfo>) -> Self {
            let backend = Self::default();
            backend.state.lock().unwrap().discovered = devices;
            backend
        }
    }

    pub(crate) fn card(address: u64, class: u32, name: &str) -> DeviceInfo {
        DeviceInfo {
            address: BluetoothAddress(address),
            class_of_device: class,
            name: name.to_string(),
            authenticated: false,
            remembered: false,
            connected: false,
        }
    }

    impl BluetoothBackend for FakeBackend {
        fn select_adapter(&mut self, address: BluetoothAddress) -> Result<()> {
            self.state.lock().unwrap().adapters.push(address);
            Ok(())
        }

        fn discover(&mut self, _timeout: Duration) -> Result<Vec<DeviceInfo>> {
            Ok(self.state.lock().unwrap().discovered.clone())
        }

        fn paired_devices(&mut self) -> Result<Vec<DeviceInfo>> {
            let state = self.state.lock().unwrap();
            Ok(state
                .discovered
                .iter()
                .filter(|d| state.paired.contains(&d.address))
                .cloned()
                .map(|mut d| {
                    d.authenticated = true;
                    d
                })
                .collect())
        }

        fn pair_request(&mut self, device: &DeviceInfo, pin: &str) -> Result<PairResult> {
            let mut state = self.state.lock().unwrap();
            state.pair_calls.push((device.address, pin.to_string()));
            let outcome = state.pair_script.pop_front().unwrap_or(Ok(PairResult::Paired));
            if let Ok(PairResult::Paired) = outcome {
                state.paired.push(device.address);
            }
            outcome
        }

        fn enable_serial_service(&mut self, device: &DeviceInfo) -> Result<()> {
            self.state.lock().unwrap().enabled.push(device.address);
            Ok(())
        }

        fn remove_device(&mut self, address: BluetoothAddress) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            state.removed.push(address);
            state.paired.retain(|a| *a != address);
            Ok(())
        }

        fn serial_ports(&mut self) -> Result<Vec<SerialPortEntry>> {
            Ok(self.state.lock().unwrap().ports.clone())
        }
    }

    pub(crate) fn access_denied(address: u64) -> Result<PairResult> {
        Err(CardError::AccessDenied(BluetoothAddress(address).to_string()))
    }
}
