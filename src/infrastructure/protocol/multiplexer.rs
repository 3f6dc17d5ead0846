//! Command/data channel multiplexer over one serial link.
//!
//! The card speaks on two logical channels. Commands and status lines travel
//! on [`COMMAND_CHANNEL`], file contents on [`DATA_CHANNEL`]. A download is a
//! run of data frames closed by a single command frame carrying the final
//! status line.

use super::frame::{encode, Frame, FrameCodec, COMMAND_CHANNEL, DATA_CHANNEL};
use crate::domain::error::{CardError, Result};
use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Chunk size for outgoing data frames.
pub const MAXIMUM_PAYLOAD_SIZE: usize = 512;

/// Pause between data frames so the card's receive buffer keeps up.
pub const DEFAULT_UPLOAD_DELAY: Duration = Duration::from_millis(1);

const CARRIAGE_RETURN: u8 = b'\r';
const LINE_FEED: u8 = b'\n';

/// Byte counter for the transfer in flight, readable from other threads.
#[derive(Debug, Clone, Default)]
pub struct TransferProgress(Arc<AtomicU64>);

impl TransferProgress {
    pub fn bytes(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    fn add(&self, n: usize) {
        self.0.fetch_add(n as u64, Ordering::Relaxed);
    }

    fn reset(&self) {
        self.0.store(0, Ordering::Relaxed);
    }
}

/// Resets the progress counter when a transfer ends, however it ends.
struct ProgressScope(TransferProgress);

impl Drop for ProgressScope {
    fn drop(&mut self) {
        self.0.reset();
    }
}

pub struct Multiplexer<T: Read + Write> {
    port: Option<T>,
    codec: FrameCodec,
    upload_delay: Duration,
    progress: TransferProgress,
}

impl<T: Read + Write> Multiplexer<T> {
    pub fn new(port: T) -> Self {
        Self {
            port: Some(port),
            codec: FrameCodec::default(),
            upload_delay: DEFAULT_UPLOAD_DELAY,
            progress: TransferProgress::default(),
        }
    }

    pub fn with_codec(mut self, codec: FrameCodec) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_upload_delay(mut self, delay: Duration) -> Self {
        self.upload_delay = delay;
        self
    }

    /// Report transfer bytes into an existing counter.
    pub fn with_progress(mut self, progress: TransferProgress) -> Self {
        self.progress = progress;
        self
    }

    /// Handle on the running transfer byte count.
    pub fn progress(&self) -> TransferProgress {
        self.progress.clone()
    }

    pub fn is_open(&self) -> bool {
        self.port.is_some()
    }

    pub fn write_command(&mut self, data: &[u8]) -> Result<()> {
        self.write(data, COMMAND_CHANNEL)
    }

    pub fn write_data(&mut self, data: &[u8]) -> Result<()> {
        self.write(data, DATA_CHANNEL)
    }

    /// Stream `source` to the data channel in 512-byte frames.
    pub fn write_data_stream<R: Read + ?Sized>(&mut self, source: &mut R) -> Result<u64> {
        let _scope = ProgressScope(self.progress.clone());
        self.progress.reset();

        let mut buffer = [0u8; MAXIMUM_PAYLOAD_SIZE];
        let mut total = 0u64;
        loop {
            let read = match source.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            self.write_data(&buffer[..read])?;
            self.progress.add(read);
            total += read as u64;
            std::thread::sleep(self.upload_delay);
        }

        debug!("Wrote {} bytes to data channel", total);
        Ok(total)
    }

    /// Read frames until a CRLF shows up and return everything before it.
    pub fn read_command_line(&mut self) -> Result<Vec<u8>> {
        let frame = self.read_frame()?;
        self.read_command_line_from(frame)
    }

    /// Copy data-channel frames into `sink` until a frame arrives on any other
    /// channel; that frame opens the closing status line, which is returned.
    ///
    /// Any failure closes the link before the error propagates.
    pub fn read_data_to_sink<W: Write + ?Sized>(&mut self, sink: &mut W) -> Result<Vec<u8>> {
        let result = self.drain_data(sink);
        if let Err(e) = &result {
            warn!("Data transfer failed, closing link: {}", e);
            self.cleanup();
        }
        result
    }

    /// Close the serial link. Safe to call repeatedly.
    pub fn cleanup(&mut self) {
        if let Some(port) = self.port.take() {
            debug!("Closing serial link");
            drop(port);
        }
    }

    fn drain_data<W: Write + ?Sized>(&mut self, sink: &mut W) -> Result<Vec<u8>> {
        let _scope = ProgressScope(self.progress.clone());
        self.progress.reset();

        let mut frame = self.read_frame()?;
        while frame.channel == DATA_CHANNEL {
            sink.write_all(&frame.payload)?;
            self.progress.add(frame.payload.len());
            frame = self.read_frame()?;
        }
        sink.flush()?;

        debug!("Read {} bytes from data channel", self.progress.bytes());
        self.read_command_line_from(frame)
    }

    /// The CRLF may straddle two frames, so each search starts one byte
    /// before the newly appended payload.
    fn read_command_line_from(&mut self, mut frame: Frame) -> Result<Vec<u8>> {
        let mut line = Vec::new();
        loop {
            let from = line.len().saturating_sub(1);
            line.extend_from_slice(&frame.payload);
            if let Some(end) = find_crlf(&line[from..]) {
                line.truncate(from + end);
                return Ok(line);
            }
            frame = self.read_frame()?;
        }
    }

    fn read_frame(&mut self) -> Result<Frame> {
        let codec = self.codec;
        let port = self.port.as_mut().ok_or(CardError::NotConnected)?;
        codec.decode(port)
    }

    fn write(&mut self, data: &[u8], channel: u8) -> Result<()> {
        let packet = encode(data, channel)?;
        let port = self.port.as_mut().ok_or(CardError::NotConnected)?;
        trace!("tx frame ch={} len={}", channel, data.len());
        port.write_all(&packet)?;
        port.flush()?;
        Ok(())
    }
}

fn find_crlf(payload: &[u8]) -> Option<usize> {
    payload
        .windows(2)
        .position(|w| w[0] == CARRIAGE_RETURN && w[1] == LINE_FEED)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::infrastructure::protocol::frame::{self, MAX_PAYLOAD_SIZE};
    use std::io::Cursor;
    use std::sync::Mutex;

    /// Duplex test double: replays canned bytes and records every write.
    #[derive(Clone, Default)]
    pub(crate) struct ScriptedPort {
        pub input: Arc<Mutex<Cursor<Vec<u8>>>>,
        pub output: Arc<Mutex<Vec<u8>>>,
    }

    impl ScriptedPort {
        pub fn with_frames(frames: &[Frame]) -> Self {
            let bytes: Vec<u8> = frames.iter().flat_map(|f| f.encode().unwrap()).collect();
            Self {
                input: Arc::new(Mutex::new(Cursor::new(bytes))),
                output: Arc::default(),
            }
        }

        /// Frames written so far, decoded.
        pub fn written_frames(&self) -> Vec<Frame> {
            let bytes = self.output.lock().unwrap().clone();
            let mut cursor = Cursor::new(bytes);
            let mut frames = Vec::new();
            while let Ok(f) = frame::decode(&mut cursor) {
                frames.push(f);
            }
            frames
        }

        /// Command lines written so far, without CRLF.
        pub fn written_commands(&self) -> Vec<String> {
            self.written_frames()
                .into_iter()
                .filter(|f| f.channel == COMMAND_CHANNEL)
                .map(|f| {
                    String::from_utf8_lossy(&f.payload)
                        .trim_end_matches("\r\n")
                        .to_string()
                })
                .collect()
        }
    }

    impl Read for ScriptedPort {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.input.lock().unwrap().read(buf)
        }
    }

    impl Write for ScriptedPort {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.output.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn cmd(s: &str) -> Frame {
        Frame::new(COMMAND_CHANNEL, s.as_bytes())
    }

    fn data(b: &[u8]) -> Frame {
        Frame::new(DATA_CHANNEL, b)
    }

    #[test]
    fn test_command_line_single_frame() {
        let mut mux = Multiplexer::new(ScriptedPort::with_frames(&[cmd("257 \"/\"\r\n")]));
        assert_eq!(mux.read_command_line().unwrap(), b"257 \"/\"");
    }

    #[test]
    fn test_command_line_split_across_frames() {
        let line = "226 Transfer complete";
        for split in 1..line.len() {
            let (a, b) = line.split_at(split);
            let frames = [cmd(a), cmd(&format!("{}\r\n", b))];
            let mut mux = Multiplexer::new(ScriptedPort::with_frames(&frames));
            assert_eq!(mux.read_command_line().unwrap(), line.as_bytes());
        }
    }

    #[test]
    fn test_command_line_with_crlf_split_anywhere() {
        let line = "226 OK\r\n";
        for split in 1..line.len() {
            let (a, b) = line.split_at(split);
            let mut mux = Multiplexer::new(ScriptedPort::with_frames(&[cmd(a), cmd(b)]));
            assert_eq!(mux.read_command_line().unwrap(), b"226 OK", "split at {}", split);
        }
    }

    #[test]
    fn test_data_closing_line_split_anywhere() {
        let line = "226 OK\r\n";
        for split in 1..line.len() {
            let (a, b) = line.split_at(split);
            let frames = [data(b"AAAA"), cmd(a), cmd(b)];
            let mut mux = Multiplexer::new(ScriptedPort::with_frames(&frames));
            let mut sink = Vec::new();
            let closing = mux.read_data_to_sink(&mut sink).unwrap();
            assert_eq!(closing, b"226 OK", "split at {}", split);
            assert_eq!(sink, b"AAAA");
            assert!(mux.is_open());
        }
    }

    #[test]
    fn test_command_line_ignores_bytes_after_crlf() {
        let mut mux = Multiplexer::new(ScriptedPort::with_frames(&[cmd("150 ok\r\ntrailing")]));
        assert_eq!(mux.read_command_line().unwrap(), b"150 ok");
    }

    #[test]
    fn test_data_stops_at_command_frame() {
        let frames = [data(b"AAAA"), data(b"BBBB"), cmd("226 OK\r\n")];
        let mut mux = Multiplexer::new(ScriptedPort::with_frames(&frames));
        let mut sink = Vec::new();
        let line = mux.read_data_to_sink(&mut sink).unwrap();
        assert_eq!(sink, b"AAAABBBB");
        assert_eq!(line, b"226 OK");
        assert_eq!(mux.progress().bytes(), 0);
        assert!(mux.is_open());
    }

    #[test]
    fn test_data_failure_closes_link() {
        // stream ends in the middle of the transfer
        let frames = [data(b"AAAA")];
        let mut mux = Multiplexer::new(ScriptedPort::with_frames(&frames));
        let mut sink = Vec::new();
        let err = mux.read_data_to_sink(&mut sink).unwrap_err();
        assert!(matches!(err, CardError::IncompleteFrame { .. }));
        assert!(!mux.is_open());
        assert!(matches!(
            mux.write_command(b"PWD\r\n"),
            Err(CardError::NotConnected)
        ));
    }

    #[test]
    fn test_stream_upload_chunks() {
        let port = ScriptedPort::default();
        let mut mux = Multiplexer::new(port.clone()).with_upload_delay(Duration::ZERO);
        let payload: Vec<u8> = (0..1200u32).map(|i| i as u8).collect();
        let sent = mux.write_data_stream(&mut Cursor::new(payload.clone())).unwrap();
        assert_eq!(sent, 1200);

        let frames = port.written_frames();
        let sizes: Vec<usize> = frames.iter().map(|f| f.payload.len()).collect();
        assert_eq!(sizes, vec![512, 512, 176]);
        assert!(frames.iter().all(|f| f.channel == DATA_CHANNEL));
        let joined: Vec<u8> = frames.into_iter().flat_map(|f| f.payload).collect();
        assert_eq!(joined, payload);
        assert_eq!(mux.progress().bytes(), 0);
    }

    #[test]
    fn test_cleanup_is_idempotent() {
        let mut mux = Multiplexer::new(ScriptedPort::default());
        mux.cleanup();
        mux.cleanup();
        assert!(!mux.is_open());
    }

    #[test]
    fn test_oversized_write_rejected() {
        let mut mux = Multiplexer::new(ScriptedPort::default());
        let big = vec![0u8; MAX_PAYLOAD_SIZE + 1];
        assert!(matches!(
            mux.write_data(&big),
            Err(CardError::TransferFailed(_))
        ));
    }
}
