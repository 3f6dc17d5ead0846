//! Card wire protocol: framing and channel multiplexing.

pub mod frame;
pub mod multiplexer;

pub use frame::{Frame, FrameCodec, COMMAND_CHANNEL, DATA_CHANNEL};
pub use multiplexer::{Multiplexer, TransferProgress};
