//! Host-facing glue: blocking bridge, request routing and status events.

pub mod bridge;
pub mod request;
pub mod status;

pub use bridge::{MessagePump, NoPump, SyncBridge};
pub use request::{CardOperation, CardRequest, CardTarget, CardWebResponse, RequestMethod};
pub use status::{StatusGuard, StatusReporter};
