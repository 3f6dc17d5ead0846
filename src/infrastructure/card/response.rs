//! Card status lines and data-bearing responses.

use crate::domain::error::{CardError, Result};
use crate::domain::settings::DataSinkKind;
use std::fmt;
use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};

/// Data transfer about to start.
pub const STATUS_DATA_START: u16 = 150;
/// Single-value success (stat, firmware, stamp).
pub const STATUS_OK: u16 = 213;
/// Data transfer complete.
pub const STATUS_TRANSFER_COMPLETE: u16 = 226;
/// Requested file action completed.
pub const STATUS_FILE_ACTION_OK: u16 = 250;
/// First half of a two-step command accepted.
pub const STATUS_PENDING: u16 = 350;
/// File or directory unavailable.
pub const STATUS_NOT_FOUND: u16 = 550;

/// One parsed command-channel line: `"{status} {message}"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResponse {
    pub status: u16,
    pub message: String,
}

impl CommandResponse {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// The first whitespace-delimited token is the status, the rest of the
    /// line after one separator is the message.
    pub fn parse(line: &[u8]) -> Result<Self> {
        let text = String::from_utf8_lossy(line);
        let trimmed = text.trim_start();
        let (code, message) = trimmed
            .split_once(char::is_whitespace)
            .unwrap_or((trimmed, ""));
        let status = code
            .parse::<u16>()
            .map_err(|_| CardError::Malformed(format!("status line {:?}", text)))?;
        Ok(Self::new(status, message))
    }

    pub fn is(&self, status: u16) -> bool {
        self.status == status
    }

    /// Any 2xx completion.
    pub fn is_positive(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Turn a non-2xx status into [`CardError::Protocol`], or
    /// [`CardError::NotFound`] for 550.
    pub fn ensure_positive(self, target: &str) -> Result<Self> {
        if self.is_positive() {
            return Ok(self);
        }
        if self.status == STATUS_NOT_FOUND {
            return Err(CardError::NotFound(target.to_string()));
        }
        Err(CardError::Protocol {
            expected: STATUS_FILE_ACTION_OK,
            status: self.status,
            message: self.message,
        })
    }
}

impl fmt::Display for CommandResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.status, self.message)
    }
}

/// Where downloaded bytes land: an anonymous temp file or memory.
#[derive(Debug)]
pub enum ResponseData {
    Memory(Cursor<Vec<u8>>),
    TempFile(File),
}

impl ResponseData {
    /// Fresh, empty sink of the requested kind. Temp files are deleted by the
    /// OS once dropped.
    pub fn create(kind: DataSinkKind) -> Result<Self> {
        Ok(match kind {
            DataSinkKind::Memory => Self::Memory(Cursor::new(Vec::new())),
            DataSinkKind::TempFile => Self::TempFile(tempfile::tempfile()?),
        })
    }

    pub fn len(&mut self) -> Result<u64> {
        Ok(match self {
            Self::Memory(c) => c.get_ref().len() as u64,
            Self::TempFile(f) => f.metadata()?.len(),
        })
    }

    pub fn is_empty(&mut self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Everything written so far, from the start.
    pub fn to_vec(&mut self) -> Result<Vec<u8>> {
        self.rewind()?;
        let mut buf = Vec::new();
        self.read_to_end(&mut buf)?;
        self.rewind()?;
        Ok(buf)
    }
}

impl Read for ResponseData {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Memory(c) => c.read(buf),
            Self::TempFile(f) => f.read(buf),
        }
    }
}

impl Write for ResponseData {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Memory(c) => c.write(buf),
            Self::TempFile(f) => f.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Memory(c) => c.flush(),
            Self::TempFile(f) => f.flush(),
        }
    }
}

impl Seek for ResponseData {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match self {
            Self::Memory(c) => c.seek(pos),
            Self::TempFile(f) => f.seek(pos),
        }
    }
}

/// Final status of an operation plus any data it produced.
#[derive(Debug)]
pub struct CardResponse {
    pub status: u16,
    pub message: String,
    data: Option<ResponseData>,
}

impl CardResponse {
    pub fn with_data(line: CommandResponse, data: ResponseData) -> Self {
        Self {
            status: line.status,
            message: line.message,
            data: Some(data),
        }
    }

    pub fn is(&self, status: u16) -> bool {
        self.status == status
    }

    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }

    /// Turn an unexpected status into [`CardError::Protocol`], or
    /// [`CardError::NotFound`] for 550.
    pub fn expect_status(self, expected: u16, target: &str) -> Result<Self> {
        if self.status == expected {
            return Ok(self);
        }
        if self.status == STATUS_NOT_FOUND {
            return Err(CardError::NotFound(target.to_string()));
        }
        Err(CardError::Protocol {
            expected,
            status: self.status,
            message: self.message,
        })
    }

    /// Downloaded data as text; empty when the response carries none.
    pub fn read_data_to_string(&mut self) -> Result<String> {
        match self.data.as_mut() {
            Some(data) => Ok(String::from_utf8_lossy(&data.to_vec()?).into_owned()),
            None => Ok(String::new()),
        }
    }

    /// Take the data stream, positioned at its start.
    pub fn into_data(self) -> Result<Option<ResponseData>> {
        match self.data {
            Some(mut data) => {
                data.rewind()?;
                Ok(Some(data))
            }
            None => Ok(None),
        }
    }

    pub fn data_mut(&mut self) -> Option<&mut ResponseData> {
        self.data.as_mut()
    }
}

impl From<CommandResponse> for CardResponse {
    fn from(line: CommandResponse) -> Self {
        Self {
            status: line.status,
            message: line.message,
            data: None,
        }
    }
}

impl fmt::Display for CardResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.status, self.message)
    }
}
