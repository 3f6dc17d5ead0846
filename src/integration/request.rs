//! `cybergate://` requests from a virtual file system host.
//!
//! A request names a card file by URI, e.g. `cybergate://vault.kdbx` or
//! `cybergate://vault.kdbx.tmp/backups`. The host part is the file name; a
//! `.tmp` suffix marks the temporary copy a safe save writes before moving it
//! over the final file. The optional path places the file in a directory
//! under the card's base path.

use super::bridge::{MessagePump, SyncBridge};
use super::status::StatusReporter;
use crate::domain::error::{CardError, Result};
use crate::domain::files::{join_path, resolve};
use crate::infrastructure::card::response::{ResponseData, STATUS_OK, STATUS_TRANSFER_COMPLETE};
use crate::infrastructure::card::CardClient;
use crate::infrastructure::serial::Connector;
use std::io::{self, Read};
use tracing::debug;
use url::Url;

pub const SCHEME: &str = "cybergate";
pub const TEMP_SUFFIX: &str = ".tmp";
pub const CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RequestMethod {
    /// Download, or upload when the request carries a body.
    #[default]
    Get,
    Put,
    Delete,
    /// Rename to another `cybergate://` URI or base-relative path.
    Move { to: String },
}

/// The card file a URI points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardTarget {
    pub name: String,
    /// Path relative to the card's base directory.
    pub card_path: String,
    pub temporary: bool,
}

impl CardTarget {
    pub fn from_uri(uri: &Url) -> Result<Self> {
        if uri.scheme() != SCHEME {
            return Err(CardError::InvalidRequest(format!(
                "unsupported scheme {:?} in {}",
                uri.scheme(),
                uri
            )));
        }
        let name = uri
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| CardError::InvalidRequest(format!("no file name in {}", uri)))?
            .to_string();

        let mut parts: Vec<&str> = uri
            .path_segments()
            .map(|segments| segments.filter(|s| !s.is_empty()).collect())
            .unwrap_or_default();
        parts.push(&name);

        Ok(Self {
            card_path: join_path(&parts),
            temporary: name.ends_with(TEMP_SUFFIX),
            name,
        })
    }

    /// Accepts a full URI or a plain base-relative path.
    pub fn parse(location: &str) -> Result<Self> {
        if location.starts_with(&format!("{}:", SCHEME)) {
            let uri = Url::parse(location)
                .map_err(|e| CardError::InvalidRequest(format!("{}: {}", location, e)))?;
            return Self::from_uri(&uri);
        }
        let card_path = location.trim_matches('/').to_string();
        let name = card_path.rsplit('/').next().unwrap_or_default().to_string();
        if name.is_empty() {
            return Err(CardError::InvalidRequest(format!("no file name in {:?}", location)));
        }
        Ok(Self {
            temporary: name.ends_with(TEMP_SUFFIX),
            name,
            card_path,
        })
    }
}

/// What a request turns into on the card, paths relative to the base.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CardOperation {
    Retrieve { path: String },
    Store { path: String },
    Delete { path: String },
    Rename { from: String, to: String },
}

impl CardOperation {
    fn label(&self) -> &'static str {
        match self {
            Self::Retrieve { .. } => "Downloading file...",
            Self::Store { .. } => "Uploading file...",
            Self::Delete { .. } => "Deleting file...",
            Self::Rename { .. } => "Moving file...",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CardRequest {
    uri: Url,
    target: CardTarget,
    method: RequestMethod,
    body: Vec<u8>,
}

impl CardRequest {
    pub fn new(uri: &str) -> Result<Self> {
        let uri =
            Url::parse(uri).map_err(|e| CardError::InvalidRequest(format!("{}: {}", uri, e)))?;
        let target = CardTarget::from_uri(&uri)?;
        Ok(Self {
            uri,
            target,
            method: RequestMethod::default(),
            body: Vec::new(),
        })
    }

    pub fn with_method(mut self, method: RequestMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn uri(&self) -> &Url {
        &self.uri
    }

    pub fn target(&self) -> &CardTarget {
        &self.target
    }

    pub fn method(&self) -> &RequestMethod {
        &self.method
    }

    pub fn set_method(&mut self, method: RequestMethod) {
        self.method = method;
    }

    /// Fresh upload body for the host to write into.
    pub fn request_stream(&mut self) -> &mut Vec<u8> {
        self.body.clear();
        &mut self.body
    }

    /// Pick the card operation for this method and body.
    pub fn route(&self) -> Result<CardOperation> {
        let path = self.target.card_path.clone();
        Ok(match &self.method {
            RequestMethod::Delete => CardOperation::Delete { path },
            RequestMethod::Move { to } => CardOperation::Rename {
                from: path,
                to: CardTarget::parse(to)?.card_path,
            },
            RequestMethod::Put => CardOperation::Store { path },
            RequestMethod::Get if !self.body.is_empty() => CardOperation::Store { path },
            RequestMethod::Get => CardOperation::Retrieve { path },
        })
    }

    /// Carry out the request on the card through `bridge`.
    ///
    /// A missing file surfaces as [`CardError::NotFound`] so the host can
    /// fall back to creating it.
    pub fn get_response<C, P>(
        &self,
        client: &mut CardClient<C>,
        bridge: &mut SyncBridge<P>,
        status: &StatusReporter,
    ) -> Result<CardWebResponse>
    where
        C: Connector,
        P: MessagePump,
    {
        let operation = self.route()?;
        debug!("{} -> {:?}", self.uri, operation);
        let _status = status.begin(operation.label());

        match operation {
            CardOperation::Retrieve { path } => {
                let response = bridge.run(|| client.get_file(&path))?;
                match response.expect_status(STATUS_TRANSFER_COMPLETE, &path)?.into_data()? {
                    Some(data) => CardWebResponse::from_data(data),
                    None => Ok(CardWebResponse::empty()),
                }
            }
            CardOperation::Store { path } => {
                let body = &self.body;
                bridge
                    .run(|| client.put(&path, body))?
                    .expect_status(STATUS_OK, &path)?;
                Ok(CardWebResponse::empty())
            }
            CardOperation::Delete { path } => {
                let full = resolve(client.base_path(), &path);
                bridge.run(|| client.delete(&full))?.ensure_positive(&path)?;
                Ok(CardWebResponse::empty())
            }
            CardOperation::Rename { from, to } => {
                let base = client.base_path().to_string();
                let (src, dst) = (resolve(&base, &from), resolve(&base, &to));
                bridge.run(|| client.rename(&src, &dst))?.ensure_positive(&from)?;
                Ok(CardWebResponse::empty())
            }
        }
    }
}

/// What the host reads back: a byte stream and its length.
#[derive(Debug, Default)]
pub struct CardWebResponse {
    stream: Option<ResponseData>,
    content_length: u64,
}

impl CardWebResponse {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_data(mut data: ResponseData) -> Result<Self> {
        let content_length = data.len()?;
        Ok(Self {
            stream: Some(data),
            content_length,
        })
    }

    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    pub fn content_type(&self) -> &'static str {
        CONTENT_TYPE
    }

    /// Release the stream; later reads return nothing.
    pub fn close(&mut self) {
        self.stream = None;
    }
}

impl Read for CardWebResponse {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.stream.as_mut() {
            Some(stream) => stream.read(buf),
            None => Ok(0),
        }
    }
}
