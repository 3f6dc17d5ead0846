//! Error types for card communication.

use thiserror::Error;

/// Main error type for all card operations.
#[derive(Debug, Error)]
pub enum CardError {
    /// No discovered device matched the class/name filter.
    #[error("Device search failed")]
    DeviceSearchFailed,

    /// A candidate was found but it is not paired with this host.
    #[error("Device not paired or not found: {0}")]
    NotPaired(String),

    /// Pairing with the given PIN was rejected by the device.
    #[error("Authentication failed for {address}: {reason}")]
    AuthenticationFailed { address: String, reason: String },

    /// The OS refused access to the device (stale pairing record).
    #[error("Access denied by device {0}")]
    AccessDenied(String),

    /// No Bluetooth radio is present or enabled.
    #[error("Bluetooth is disabled")]
    BluetoothUnavailable,

    /// Serial port open or Bluetooth connect failed.
    #[error("Can not connect to the card: {0}")]
    ConnectionFailed(String),

    /// A command was attempted without an open multiplexer.
    #[error("Not connected")]
    NotConnected,

    /// The card answered with a status other than the one this step requires.
    #[error("Unexpected status {status} (expected {expected}): {message}")]
    Protocol {
        expected: u16,
        status: u16,
        message: String,
    },

    /// The stream ended before a whole frame could be read.
    #[error("Incomplete frame: expected {expected} bytes, got {received}")]
    IncompleteFrame { expected: usize, received: usize },

    /// Strict mode only: the trailing checksum bytes were not zero.
    #[error("Frame checksum mismatch: {0:02X?}")]
    ChecksumMismatch([u8; 2]),

    /// A frame header or status line could not be parsed.
    #[error("Malformed data from card: {0}")]
    Malformed(String),

    /// Upload or download could not be verified.
    #[error("Transfer failed: {0}")]
    TransferFailed(String),

    /// The requested card file does not exist. Callers may recover by
    /// creating a default file.
    #[error("Not found on card: {0}")]
    NotFound(String),

    /// The request could not be routed to a card command.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// I/O error on the serial link or a local data sink.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CardError {
    /// Whether the error came from the transport or left the frame stream out
    /// of sync. These errors leave the session disconnected.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            CardError::Io(_)
                | CardError::IncompleteFrame { .. }
                | CardError::ChecksumMismatch(_)
                | CardError::Malformed(_)
        )
    }

    /// Whether the error is the recoverable "file does not exist" case.
    pub fn is_not_found(&self) -> bool {
        matches!(self, CardError::NotFound(_))
    }
}

/// Result type alias using CardError.
pub type Result<T> = std::result::Result<T, CardError>;
