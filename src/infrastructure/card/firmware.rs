//! Firmware upload and version query.

use super::client::CardClient;
use super::response::{STATUS_OK, STATUS_TRANSFER_COMPLETE};
use crate::domain::error::{CardError, Result};
use crate::infrastructure::serial::Connector;
use regex::Regex;
use std::io::Cursor;
use std::sync::LazyLock;
use tracing::info;

pub const DEFAULT_FIRMWARE_PATH: &str = "/device/firmware";

static FIRMWARE_VERSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"FIRM: ([\d.]*)").expect("valid firmware regex"));

/// Version number following `FIRM: ` in a firmware report.
pub fn parse_firmware_version(report: &str) -> Option<String> {
    FIRMWARE_VERSION
        .captures(report)
        .map(|caps| caps[1].to_string())
        .filter(|v| !v.is_empty())
}

impl<C: Connector> CardClient<C> {
    /// Store a firmware image at `path`. The card answers 213 once the image
    /// is accepted; it then needs time to flash before it responds again.
    pub fn upload_firmware(&mut self, path: &str, image: &[u8]) -> Result<()> {
        info!("Uploading {} byte firmware image to {}", image.len(), path);
        let response = self.put_stream(path, &mut Cursor::new(image), false)?;
        if !response.is(STATUS_OK) {
            return Err(CardError::TransferFailed(format!(
                "firmware was not uploaded: {}",
                response
            )));
        }
        Ok(())
    }

    /// Read the firmware report at `path` and extract the version.
    pub fn firmware_version(&mut self, path: &str) -> Result<String> {
        let mut response = self.get(super::client::RETR, path, None, false)?;
        if !response.is(STATUS_OK) && !response.is(STATUS_TRANSFER_COMPLETE) {
            return Err(CardError::TransferFailed(format!(
                "firmware report was not downloaded: {}",
                response
            )));
        }
        let report = match response.read_data_to_string()? {
            data if data.is_empty() => response.message.clone(),
            data => data,
        };
        parse_firmware_version(&report).ok_or_else(|| {
            CardError::TransferFailed(format!("no firmware version in {:?}", report.trim()))
        })
    }
}
