//! Card frame codec.
//!
//! Every unit on the serial link is one frame:
//! ```text
//! ┌─────────┬──────────┬─────────────┬──────────┐
//! │ Channel │ Length   │ Payload     │ Checksum │
//! │ 1 byte  │ 2 bytes  │ Length - 5  │ 2 bytes  │
//! │         │ uint16 BE│             │ always 0 │
//! └─────────┴──────────┴─────────────┴──────────┘
//! ```
//!
//! `Length` counts the whole frame (header, payload and checksum). The card
//! never fills in the checksum; decoding skips it unless strict mode asks for
//! the zero bytes to be verified.

use crate::domain::error::{CardError, Result};
use std::io::{ErrorKind, Read};
use tracing::trace;

/// Channel byte plus the two length bytes.
pub const HEADER_SIZE: usize = 3;

/// Trailing checksum bytes.
pub const CHECKSUM_SIZE: usize = 2;

/// Bytes a frame adds around its payload.
pub const FRAME_OVERHEAD: usize = HEADER_SIZE + CHECKSUM_SIZE;

/// Largest payload whose length still fits the 16-bit field.
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize - FRAME_OVERHEAD;

/// Command lines and status responses.
pub const COMMAND_CHANNEL: u8 = 1;

/// File contents.
pub const DATA_CHANNEL: u8 = 2;

const CHECKSUM: [u8; CHECKSUM_SIZE] = [0x00, 0x00];

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub channel: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(channel: u8, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            channel,
            payload: payload.into(),
        }
    }

    /// Value of the length field for this frame.
    pub fn length(&self) -> usize {
        self.payload.len() + FRAME_OVERHEAD
    }

    pub fn is_data(&self) -> bool {
        self.channel == DATA_CHANNEL
    }

    /// Encode to wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        encode(&self.payload, self.channel)
    }
}

/// Encode `payload` as one frame on `channel`.
///
/// Payloads larger than [`MAX_PAYLOAD_SIZE`] do not fit the length field and
/// are rejected; callers split them first.
pub fn encode(payload: &[u8], channel: u8) -> Result<Vec<u8>> {
    let length = u16::try_from(payload.len() + FRAME_OVERHEAD).map_err(|_| {
        CardError::TransferFailed(format!(
            "payload of {} bytes does not fit one frame",
            payload.len()
        ))
    })?;

    let mut packet = Vec::with_capacity(payload.len() + FRAME_OVERHEAD);
    packet.push(channel);
    packet.extend_from_slice(&length.to_be_bytes());
    packet.extend_from_slice(payload);
    packet.extend_from_slice(&CHECKSUM);
    Ok(packet)
}

/// Frame decoder bound to a checksum policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec {
    /// Reject frames whose checksum bytes are not zero.
    pub strict_checksum: bool,
}

impl FrameCodec {
    pub fn new(strict_checksum: bool) -> Self {
        Self { strict_checksum }
    }

    /// Read exactly one frame from `reader`.
    ///
    /// Short reads are retried until the frame is complete. A read of zero
    /// bytes means the stream ended and yields [`CardError::IncompleteFrame`].
    pub fn decode<R: Read + ?Sized>(&self, reader: &mut R) -> Result<Frame> {
        let mut header = [0u8; HEADER_SIZE];
        fill(reader, &mut header)?;

        let channel = header[0];
        let length = u16::from_be_bytes([header[1], header[2]]) as usize;
        if length < FRAME_OVERHEAD {
            return Err(CardError::Malformed(format!(
                "frame length {} is shorter than the {} byte envelope",
                length, FRAME_OVERHEAD
            )));
        }

        let mut payload = vec![0u8; length - FRAME_OVERHEAD];
        fill(reader, &mut payload)?;

        let mut checksum = [0u8; CHECKSUM_SIZE];
        fill(reader, &mut checksum)?;
        if self.strict_checksum && checksum != CHECKSUM {
            return Err(CardError::ChecksumMismatch(checksum));
        }

        trace!("rx frame ch={} len={}", channel, payload.len());
        Ok(Frame { channel, payload })
    }
}

/// Decode one frame without checksum validation.
pub fn decode<R: Read + ?Sized>(reader: &mut R) -> Result<Frame> {
    FrameCodec::default().decode(reader)
}

fn fill<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                return Err(CardError::IncompleteFrame {
                    expected: buf.len(),
                    received: filled,
                })
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
