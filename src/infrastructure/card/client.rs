//! FTP-like command layer of the card.
//!
//! Every public operation is one exchange on the command channel, optionally
//! followed by a data phase. Only one command is ever outstanding: an
//! operation finishes its data phase and reads the closing status line before
//! it returns.

use super::response::{
    CardResponse, CommandResponse, ResponseData, STATUS_DATA_START, STATUS_PENDING,
    STATUS_TRANSFER_COMPLETE,
};
use super::session::CardSession;
use crate::domain::error::Result;
use crate::domain::files::{glob, parse_listing, resolve, CardFile};
use crate::domain::models::CardEvent;
use crate::domain::settings::{DataSinkKind, Settings};
use crate::infrastructure::protocol::TransferProgress;
use crate::infrastructure::serial::Connector;
use std::io::{Cursor, Read, Seek};
use tokio::sync::mpsc;
use tracing::{debug, info};

pub const LIST: &str = "LIST";
pub const STOR: &str = "STOR";
pub const RETR: &str = "RETR";
pub const MLST: &str = "MLST";
pub const SRFT: &str = "SRFT";
pub const DELE: &str = "DELE";
pub const RMD: &str = "RMD";
pub const MKD: &str = "MKD";
pub const RNFR: &str = "RNFR";
pub const RNTO: &str = "RNTO";
pub const PWD: &str = "PWD";
pub const CWD: &str = "CWD";

/// Format of the SRFT timestamp argument.
const SRFT_TIMESTAMP: &str = "%Y%m%d%H%M%S";

pub struct CardClient<C: Connector> {
    session: CardSession<C>,
    base_path: String,
    data_sink: DataSinkKind,
}

impl<C: Connector> CardClient<C> {
    pub fn new(session: CardSession<C>, base_path: impl Into<String>) -> Self {
        Self {
            session,
            base_path: base_path.into(),
            data_sink: DataSinkKind::default(),
        }
    }

    pub fn from_settings(connector: C, settings: &Settings) -> Self {
        Self::new(
            CardSession::from_settings(connector, settings),
            settings.base_path.clone(),
        )
        .with_data_sink(settings.data_sink)
    }

    pub fn with_data_sink(mut self, kind: DataSinkKind) -> Self {
        self.data_sink = kind;
        self
    }

    /// Send connection and transfer events to `event_tx`.
    pub fn with_events(mut self, event_tx: mpsc::UnboundedSender<CardEvent>) -> Self {
        self.session.set_events(event_tx);
        self
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    pub fn session(&self) -> &CardSession<C> {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut CardSession<C> {
        &mut self.session
    }

    pub fn progress(&self) -> TransferProgress {
        self.session.progress()
    }

    pub fn connect(&mut self) -> Result<()> {
        self.session.connect()
    }

    pub fn disconnect(&mut self) {
        self.session.disconnect()
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    /// Send `"{verb} {args} {path}"` and read the status line.
    pub fn call(
        &mut self,
        verb: &str,
        path: &str,
        args: Option<&str>,
        needs_prefix: bool,
    ) -> Result<CommandResponse> {
        let command = build_command(verb, args, &self.card_path(path, needs_prefix));
        self.session.run(|s| exchange(s, &command))
    }

    /// Like [`Self::call`], but a 150 reply is followed by a data phase whose
    /// bytes land in a fresh sink.
    pub fn get(
        &mut self,
        verb: &str,
        path: &str,
        args: Option<&str>,
        needs_prefix: bool,
    ) -> Result<CardResponse> {
        let command = build_command(verb, args, &self.card_path(path, needs_prefix));
        let sink = self.data_sink;
        self.session.run(|s| download(s, &command, sink))
    }

    /// Store `data` at `path` under the base directory.
    pub fn put(&mut self, path: &str, data: &[u8]) -> Result<CardResponse> {
        self.put_stream(path, &mut Cursor::new(data), true)
    }

    /// STOR, stream `source` on the data channel, then stamp the file with
    /// SRFT. Stops at the first status that is not the expected one and
    /// returns it.
    pub fn put_stream<R: Read + ?Sized>(
        &mut self,
        path: &str,
        source: &mut R,
        needs_prefix: bool,
    ) -> Result<CardResponse> {
        let target = self.card_path(path, needs_prefix);
        let stor = build_command(STOR, None, &target);
        self.session.run(|s| -> Result<CardResponse> {
            let stored = upload(s, &stor, source)?;
            if !stored.is(STATUS_TRANSFER_COMPLETE) {
                return Ok(stored.into());
            }
            let stamp = build_command(SRFT, Some(&timestamp()), &target);
            Ok(exchange(s, &stamp)?.into())
        })
    }

    /// Stamp `path` with the local time.
    pub fn srft(&mut self, path: &str) -> Result<CommandResponse> {
        self.call(SRFT, path, Some(&timestamp()), true)
    }

    /// RNFR `from`, then RNTO `to` only if the card answered 350.
    pub fn rename(&mut self, from: &str, to: &str) -> Result<CommandResponse> {
        let rnfr = build_command(RNFR, None, from);
        let rnto = build_command(RNTO, None, to);
        self.session.run(|s| {
            let pending = exchange(s, &rnfr)?;
            if !pending.is(STATUS_PENDING) {
                return Ok(pending);
            }
            exchange(s, &rnto)
        })
    }

    /// LIST the contents of `path` (`""` for the base directory).
    pub fn list(&mut self, path: &str) -> Result<CardResponse> {
        self.get(LIST, &glob(path), None, true)
    }

    /// LIST `path` and parse the reply into entries.
    pub fn list_files(&mut self, path: &str) -> Result<Vec<CardFile>> {
        let parent = self.card_path(path, true);
        let listing = self
            .list(path)?
            .expect_status(STATUS_TRANSFER_COMPLETE, &parent)?
            .read_data_to_string()?;
        Ok(parse_listing(&listing, &parent))
    }

    /// MLST with no path reports free memory.
    pub fn free_memory(&mut self) -> Result<CardResponse> {
        self.get(MLST, "", None, false)
    }

    pub fn mlst(&mut self, path: &str) -> Result<CardResponse> {
        self.get(MLST, path, None, false)
    }

    /// RETR `path` under the base directory.
    pub fn get_file(&mut self, path: &str) -> Result<CardResponse> {
        self.get(RETR, path, None, true)
    }

    pub fn delete(&mut self, path: &str) -> Result<CommandResponse> {
        self.call(DELE, path, None, false)
    }

    pub fn delete_path(&mut self, path: &str) -> Result<CommandResponse> {
        self.call(RMD, path, None, false)
    }

    pub fn create_path(&mut self, path: &str) -> Result<CommandResponse> {
        self.call(MKD, path, None, true)
    }

    pub fn change_working_directory(&mut self, path: &str) -> Result<CommandResponse> {
        self.call(CWD, path, None, false)
    }

    pub fn current_working_directory(&mut self) -> Result<CommandResponse> {
        self.call(PWD, "", None, false)
    }

    fn card_path(&self, path: &str, needs_prefix: bool) -> String {
        if needs_prefix {
            resolve(&self.base_path, path)
        } else {
            path.to_string()
        }
    }
}

fn build_command(verb: &str, args: Option<&str>, path: &str) -> String {
    match args {
        Some(args) if !args.is_empty() => format!("{} {} {}", verb, args, path),
        _ => format!("{} {}", verb, path),
    }
}

fn timestamp() -> String {
    chrono::Local::now().format(SRFT_TIMESTAMP).to_string()
}

fn exchange<C: Connector>(session: &mut CardSession<C>, command: &str) -> Result<CommandResponse> {
    debug!(">> {}", command);
    let line = format!("{}\r\n", command);
    let response = session.with_mux(|m| {
        m.write_command(line.as_bytes())?;
        CommandResponse::parse(&m.read_command_line()?)
    })?;
    debug!("<< {}", response);
    Ok(response)
}

fn download<C: Connector>(
    session: &mut CardSession<C>,
    command: &str,
    sink_kind: DataSinkKind,
) -> Result<CardResponse> {
    let ready = exchange(session, command)?;
    if !ready.is(STATUS_DATA_START) {
        return Ok(ready.into());
    }

    let mut sink = ResponseData::create(sink_kind)?;
    let done = session.with_mux(|m| CommandResponse::parse(&m.read_data_to_sink(&mut sink)?))?;
    sink.rewind()?;

    let bytes = sink.len()?;
    info!("Received {} bytes ({})", bytes, done);
    session.emit(CardEvent::TransferProgress { bytes });
    Ok(CardResponse::with_data(done, sink))
}

fn upload<C: Connector, R: Read + ?Sized>(
    session: &mut CardSession<C>,
    command: &str,
    source: &mut R,
) -> Result<CommandResponse> {
    let ready = exchange(session, command)?;
    if !ready.is(STATUS_DATA_START) {
        return Ok(ready);
    }

    let bytes = session.with_mux(|m| m.write_data_stream(source))?;
    session.emit(CardEvent::TransferProgress { bytes });
    let done = session.with_mux(|m| CommandResponse::parse(&m.read_command_line()?))?;
    info!("Sent {} bytes ({})", bytes, done);
    Ok(done)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::CardError;
    use crate::infrastructure::card::session::tests::FakeConnector;
    use crate::infrastructure::protocol::frame::{Frame, COMMAND_CHANNEL, DATA_CHANNEL};
    use crate::infrastructure::protocol::multiplexer::tests::ScriptedPort;
    use std::time::Duration;

    const BASE: &str = "/apps/vault/data";

    fn cmd(s: &str) -> Frame {
        Frame::new(COMMAND_CHANNEL, format!("{}\r\n", s))
    }

    fn client(frames: &[Frame], base: &str) -> (CardClient<FakeConnector>, ScriptedPort) {
        let port = ScriptedPort::with_frames(frames);
        let session = CardSession::new(FakeConnector::new(port.clone()))
            .with_upload_delay(Duration::ZERO);
        let client = CardClient::new(session, base).with_data_sink(DataSinkKind::Memory);
        (client, port)
    }

    #[test]
    fn test_call_formats_command() {
        let (mut c, port) = client(&[cmd("257 \"/\"")], BASE);
        let r = c.current_working_directory().unwrap();
        assert_eq!(r, CommandResponse::new(257, "\"/\""));
        assert_eq!(port.written_commands(), vec!["PWD "]);
    }

    #[test]
    fn test_prefix_rules() {
        let frames: Vec<Frame> = (0..5).map(|_| cmd("250 OK")).collect();
        let (mut c, port) = client(&frames, BASE);
        c.create_path("profiles").unwrap();
        c.delete("profiles/a.png").unwrap();
        c.delete_path("profiles").unwrap();
        c.change_working_directory("/apps").unwrap();
        c.call("NOOP", "x", Some("-a"), true).unwrap();
        assert_eq!(
            port.written_commands(),
            vec![
                "MKD /apps/vault/data/profiles",
                "DELE profiles/a.png",
                "RMD profiles",
                "CWD /apps",
                "NOOP -a /apps/vault/data/x",
            ]
        );
    }

    #[test]
    fn test_list_globs_path() {
        let (mut c, port) = client(&[cmd("550 none"), cmd("550 none")], "");
        c.list("").unwrap();
        c.list("pics").unwrap();
        assert_eq!(port.written_commands(), vec!["LIST *", "LIST pics/*"]);
    }

    #[test]
    fn test_get_end_to_end() {
        let payload: Vec<u8> = (0..=255u8).collect();
        let frames = [
            cmd("150 ready"),
            Frame::new(DATA_CHANNEL, payload.clone()),
            cmd("226 complete"),
        ];
        let (mut c, port) = client(&frames, BASE);

        let response = c.get_file("db.kdbx").unwrap();
        assert_eq!(response.status, 226);
        assert_eq!(response.message, "complete");
        let mut data = Vec::new();
        response.into_data().unwrap().unwrap().read_to_end(&mut data).unwrap();
        assert_eq!(data, payload);
        assert_eq!(port.written_commands(), vec!["RETR /apps/vault/data/db.kdbx"]);
    }

    #[test]
    fn test_get_without_data_phase() {
        let (mut c, _) = client(&[cmd("550 not found")], BASE);
        let response = c.get_file("missing").unwrap();
        assert_eq!(response.status, 550);
        assert!(!response.has_data());
    }

    #[test]
    fn test_put_stops_when_stor_refused() {
        let (mut c, port) = client(&[cmd("553 denied")], BASE);
        let response = c.put("a.bin", b"abc").unwrap();
        assert_eq!(response.status, 553);
        assert!(port.written_frames().iter().all(|f| f.channel == COMMAND_CHANNEL));
        assert_eq!(port.written_commands().len(), 1);
    }

    #[test]
    fn test_put_skips_srft_on_failed_transfer() {
        let (mut c, port) = client(&[cmd("150 go"), cmd("451 aborted")], BASE);
        let response = c.put("a.bin", b"abc").unwrap();
        assert_eq!(response.status, 451);
        assert_eq!(port.written_commands(), vec!["STOR /apps/vault/data/a.bin"]);
    }

    #[test]
    fn test_put_streams_then_stamps() {
        let (mut c, port) = client(&[cmd("150 go"), cmd("226 done"), cmd("213 stamped")], BASE);
        let body = vec![7u8; 600];
        let response = c.put("a.bin", &body).unwrap();
        assert_eq!(response.status, 213);

        let data: Vec<u8> = port
            .written_frames()
            .into_iter()
            .filter(|f| f.channel == DATA_CHANNEL)
            .flat_map(|f| f.payload)
            .collect();
        assert_eq!(data, body);

        let commands = port.written_commands();
        assert_eq!(commands[0], "STOR /apps/vault/data/a.bin");
        let parts: Vec<&str> = commands[1].split(' ').collect();
        assert_eq!(parts[0], "SRFT");
        assert_eq!(parts[1].len(), 14);
        assert!(parts[1].chars().all(|c| c.is_ascii_digit()));
        assert_eq!(parts[2], "/apps/vault/data/a.bin");
    }

    #[test]
    fn test_rename_gating() {
        let (mut c, port) = client(&[cmd("550 no such file")], BASE);
        let r = c.rename("a", "b").unwrap();
        assert_eq!(r.status, 550);
        assert_eq!(port.written_commands(), vec!["RNFR a"]);

        let (mut c, port) = client(&[cmd("350 pending"), cmd("250 renamed")], BASE);
        assert_eq!(c.rename("a", "b").unwrap().status, 250);
        assert_eq!(port.written_commands(), vec!["RNFR a", "RNTO b"]);
    }

    #[test]
    fn test_list_files_parses_listing() {
        let listing = "drwxr-xr-x 1 card card 0 Jan 1 2020 pics\r\n-rw-r--r-- 1 card card 42 Jan 1 2020 db.kdbx\r\n";
        let frames = [
            cmd("150 listing"),
            Frame::new(DATA_CHANNEL, listing),
            cmd("226 done"),
        ];
        let (mut c, _) = client(&frames, "");
        let files = c.list_files("").unwrap();
        assert_eq!(files.len(), 2);
        assert!(files[0].is_directory());
        assert_eq!(files[1].name, "db.kdbx");
        assert_eq!(files[1].size, 42);
    }

    #[test]
    fn test_broken_stream_disconnects() {
        let frames = [cmd("150 ready"), Frame::new(DATA_CHANNEL, vec![1, 2, 3])];
        let (mut c, _) = client(&frames, BASE);
        c.session_mut().connect().unwrap();
        let err = c.get_file("db.kdbx").unwrap_err();
        assert!(matches!(err, CardError::IncompleteFrame { .. }));
        assert!(!c.is_connected());
    }
}
