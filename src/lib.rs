//! GateKeeper Card communication stack.
//!
//! The card exposes an FTP-like command set over a framed serial protocol,
//! carried by a Bluetooth Serial Port Profile link:
//!
//! ```text
//! integration   SyncBridge / CardRequest / StatusReporter
//!      │
//! card          CardClient ─ CardSession
//!      │
//! protocol      Multiplexer ─ FrameCodec
//!      │
//! transport     serial port  ◄─ BluetoothSession (pair, SPP, COM port)
//! ```

pub mod domain;
pub mod infrastructure;
pub mod integration;

pub use domain::error::{CardError, Result};
pub use domain::settings::{Settings, SettingsService};
pub use infrastructure::card::{CardClient, CardResponse, CardSession, CommandResponse};
