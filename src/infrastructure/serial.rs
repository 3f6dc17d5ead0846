//! Serial transport to the card.
//!
//! The card link is a plain 115200 8N1 serial port. It is either the virtual
//! COM port created for the Bluetooth SPP service, or a port named in the
//! settings.

use crate::domain::error::{CardError, Result};
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::{BluetoothBackend, BluetoothSession, SessionConfig};
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::{Read, Write};
use std::time::Duration;
use tracing::{debug, info};

pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Open `name` as 8N1 without flow control.
pub fn open_serial_port(name: &str, baud_rate: u32, timeout: Duration) -> Result<Box<dyn SerialPort>> {
    debug!("Opening {} at {} baud", name, baud_rate);
    let port = serialport::new(name, baud_rate)
        .data_bits(DataBits::Eight)
        .stop_bits(StopBits::One)
        .parity(Parity::None)
        .flow_control(FlowControl::None)
        .timeout(timeout)
        .open()
        .map_err(|e| CardError::ConnectionFailed(format!("failed to open {}: {}", name, e)))?;
    info!("Serial port {} open", name);
    Ok(port)
}

/// Produces a fresh transport each time the card session (re)connects.
pub trait Connector: Send {
    type Transport: Read + Write + Send;

    fn connect(&mut self) -> Result<Self::Transport>;

    /// Release whatever `connect` acquired besides the transport itself.
    fn disconnect(&mut self) {}

    /// Human readable target, for logs.
    fn describe(&self) -> String;
}

/// Connects straight to a configured serial port.
#[derive(Debug, Clone)]
pub struct DirectSerialConnector {
    port_name: String,
    baud_rate: u32,
    timeout: Duration,
}

impl DirectSerialConnector {
    pub fn new(port_name: impl Into<String>, baud_rate: u32, timeout: Duration) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            timeout,
        }
    }
}

impl Connector for DirectSerialConnector {
    type Transport = Box<dyn SerialPort>;

    fn connect(&mut self) -> Result<Self::Transport> {
        open_serial_port(&self.port_name, self.baud_rate, self.timeout)
    }

    fn describe(&self) -> String {
        self.port_name.clone()
    }
}

/// Pairs with the card over Bluetooth and opens the COM port the OS assigns.
pub struct BluetoothConnector<B: BluetoothBackend> {
    session: BluetoothSession<B>,
    baud_rate: u32,
    timeout: Duration,
}

impl<B: BluetoothBackend> BluetoothConnector<B> {
    /// The inquiry runs on the first `connect`.
    pub fn new(backend: B, config: SessionConfig, baud_rate: u32, timeout: Duration) -> Self {
        Self {
            session: BluetoothSession::deferred(backend, config),
            baud_rate,
            timeout,
        }
    }

    pub fn from_settings(backend: B, settings: &Settings) -> Self {
        Self::new(
            backend,
            SessionConfig::from_settings(settings),
            settings.baud_rate,
            settings.read_timeout(),
        )
    }

    pub fn session(&self) -> &BluetoothSession<B> {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut BluetoothSession<B> {
        &mut self.session
    }
}

impl<B: BluetoothBackend> Connector for BluetoothConnector<B> {
    type Transport = Box<dyn SerialPort>;

    fn connect(&mut self) -> Result<Self::Transport> {
        if self.session.candidates().is_empty() {
            self.session.rediscover()?;
        }
        let port_name = self.session.connect()?;
        open_serial_port(&port_name, self.baud_rate, self.timeout)
    }

    fn describe(&self) -> String {
        match self.session.active_device() {
            Some(device) => format!("{} ({})", device.name, device.address),
            None => "GateKeeper Card".to_string(),
        }
    }
}
