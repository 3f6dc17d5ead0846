//! Card client: session ownership, the command state machine and its
//! responses.

pub mod client;
pub mod firmware;
pub mod response;
pub mod session;

pub use client::CardClient;
pub use firmware::{parse_firmware_version, DEFAULT_FIRMWARE_PATH};
pub use response::{CardResponse, CommandResponse, ResponseData};
pub use session::CardSession;
