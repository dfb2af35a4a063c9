//! APDU command and response buffers
//!
//! Commands are immutable byte sequences sent verbatim to the card. Responses
//! keep every byte the reader returned; the last two are the status word.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::utils::{format_hex_spaced, parse_hex};

/// Class byte of GSM 11.11 SIM commands
pub const CLA_GSM: u8 = 0xA0;

pub const INS_SELECT: u8 = 0xA4;
pub const INS_GET_RESPONSE: u8 = 0xC0;
pub const INS_READ_RECORD: u8 = 0xB2;

/// READ RECORD P2: absolute record number in P1
pub const RECORD_MODE_ABSOLUTE: u8 = 0x04;

/// Length of the trailing SW1 SW2 pair
pub const STATUS_WORD_LEN: usize = 2;

/// A command buffer plus the minimum number of response bytes it is documented to yield
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApduCommand {
    bytes: Vec<u8>,
    expected_min_len: usize,
}

impl ApduCommand {
    /// Create a command from raw bytes. Empty commands are rejected.
    pub fn new(bytes: Vec<u8>, expected_min_len: usize) -> Result<Self> {
        if bytes.is_empty() {
            bail!("APDU cannot be empty");
        }

        Ok(Self {
            bytes,
            expected_min_len,
        })
    }

    /// Parse a command from hex; only the status word is expected back
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let bytes = parse_hex(hex_str).context("Failed to parse APDU hex string")?;
        Self::new(bytes, STATUS_WORD_LEN)
    }

    /// SELECT by file identifier (`A0 A4 00 00 02 <fid>`)
    pub fn select(file_id: u16) -> Self {
        let [hi, lo] = file_id.to_be_bytes();
        Self {
            bytes: vec![CLA_GSM, INS_SELECT, 0x00, 0x00, 0x02, hi, lo],
            expected_min_len: STATUS_WORD_LEN,
        }
    }

    /// GET RESPONSE for `le` bytes (`A0 C0 00 00 <le>`)
    pub fn get_response(le: u8) -> Self {
        Self {
            bytes: vec![CLA_GSM, INS_GET_RESPONSE, 0x00, 0x00, le],
            expected_min_len: le as usize + STATUS_WORD_LEN,
        }
    }

    /// READ RECORD (`A0 B2 <record> <mode> <le>`)
    pub fn read_record(record: u8, mode: u8, le: u8) -> Self {
        Self {
            bytes: vec![CLA_GSM, INS_READ_RECORD, record, mode, le],
            expected_min_len: le as usize + STATUS_WORD_LEN,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn expected_min_len(&self) -> usize {
        self.expected_min_len
    }
}

impl std::fmt::Display for ApduCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&format_hex_spaced(&self.bytes))
    }
}

/// The bytes a reader returned for one command, status word included
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApduResponse {
    bytes: Vec<u8>,
}

impl ApduResponse {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Response body without the status word
    pub fn data(&self) -> &[u8] {
        let end = self.bytes.len().saturating_sub(STATUS_WORD_LEN);
        &self.bytes[..end]
    }

    pub fn sw1(&self) -> Option<u8> {
        self.status_word().map(|(sw1, _)| sw1)
    }

    pub fn sw2(&self) -> Option<u8> {
        self.status_word().map(|(_, sw2)| sw2)
    }

    /// SW1 and SW2, or `None` when the reader returned fewer than two bytes
    pub fn status_word(&self) -> Option<(u8, u8)> {
        match self.bytes.as_slice() {
            [.., sw1, sw2] => Some((*sw1, *sw2)),
            _ => None,
        }
    }
}

impl std::fmt::Display for ApduResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&format_hex_spaced(&self.bytes))
    }
}
