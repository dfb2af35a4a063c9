use anyhow::{Context as AnyhowContext, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::core::apdu::{ApduCommand, ApduResponse};
use crate::core::backend::ReaderBackend;
use crate::core::session::CardSession;
use crate::core::utils::format_hex_spaced;

/// Size of the response buffer handed to the reader
pub const RESPONSE_CAPACITY: usize = 256;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransmitError {
    #[error("No card connected")]
    NotConnected,

    #[error("Transmit failed: {0}")]
    TransmitFailed(#[source] pcsc::Error),

    #[error("Transmit timed out after {}ms", .0.as_millis())]
    TimedOut(Duration),
}

/// One command/response exchange, as handed to whatever renders the log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeRecord {
    pub timestamp: DateTime<Utc>,
    pub command: Vec<u8>,
    pub response: Vec<u8>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl ExchangeRecord {
    /// "Sending command" / "Command response" lines in the usual hex rendering
    pub fn log_lines(&self) -> (String, String) {
        let sent = format!("Sending command: {}", format_hex_spaced(&self.command));
        let received = match &self.error {
            Some(error) => format!("Command failed: {error}"),
            None => format!("Command response: {}", format_hex_spaced(&self.response)),
        };
        (sent, received)
    }
}

/// Statistics about the exchange history
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeStatistics {
    pub total_commands: usize,
    pub successful_commands: usize,
    pub failed_commands: usize,
    pub average_duration_ms: u64,
}

/// Sends single commands over a connected session and keeps their history
#[derive(Debug, Default)]
pub struct ApduTransmitter {
    history: Vec<ExchangeRecord>,
}

impl ApduTransmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Send `command` verbatim over the session's negotiated protocol.
    ///
    /// The response is cut to the bytes the reader actually returned, at most
    /// [`RESPONSE_CAPACITY`]. With `timeout` set the wait for the reader is
    /// bounded. The session itself is never modified.
    pub fn transmit<B: ReaderBackend>(
        &mut self,
        session: &CardSession<B>,
        command: &ApduCommand,
        timeout: Option<Duration>,
    ) -> Result<ApduResponse, TransmitError> {
        if session.active_protocol().is_err() {
            log::warn!("Refusing to transmit {command}: no card connected");
            return Err(TransmitError::NotConnected);
        }

        let start_time = Instant::now();
        let timestamp = Utc::now();

        log::info!("Sending command: {}", command);

        let mut response_buf = [0u8; RESPONSE_CAPACITY];
        let result = session
            .backend()
            .transmit(command.as_bytes(), &mut response_buf, timeout);
        let duration_ms = start_time.elapsed().as_millis() as u64;

        match result {
            Ok(len) => {
                let len = len.min(RESPONSE_CAPACITY);
                let response = ApduResponse::new(response_buf[..len].to_vec());
                log::info!("Command response: {}", response);

                if response.len() < command.expected_min_len() {
                    log::debug!(
                        "Response to {} is {} bytes, documented minimum is {}",
                        command,
                        response.len(),
                        command.expected_min_len()
                    );
                }

                self.history.push(ExchangeRecord {
                    timestamp,
                    command: command.as_bytes().to_vec(),
                    response: response.as_bytes().to_vec(),
                    success: true,
                    error: None,
                    duration_ms,
                });

                Ok(response)
            }
            Err(e) => {
                let error = match (e, timeout) {
                    (pcsc::Error::Timeout, Some(limit)) => TransmitError::TimedOut(limit),
                    (e, _) => TransmitError::TransmitFailed(e),
                };
                log::error!("{error}");

                self.history.push(ExchangeRecord {
                    timestamp,
                    command: command.as_bytes().to_vec(),
                    response: Vec::new(),
                    success: false,
                    error: Some(error.to_string()),
                    duration_ms,
                });

                Err(error)
            }
        }
    }

    pub fn history(&self) -> &[ExchangeRecord] {
        &self.history
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    /// Export history to JSON
    pub fn export_history(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.history).context("Failed to serialize exchange history")
    }

    /// Append records previously produced by [`Self::export_history`]
    pub fn import_history(&mut self, json: &str) -> Result<()> {
        let imported: Vec<ExchangeRecord> =
            serde_json::from_str(json).context("Failed to deserialize exchange history")?;

        self.history.extend(imported);
        Ok(())
    }

    pub fn statistics(&self) -> ExchangeStatistics {
        let total_commands = self.history.len();
        let successful_commands = self.history.iter().filter(|r| r.success).count();

        let average_duration_ms = if total_commands > 0 {
            // imported records carry arbitrary durations, u128 cannot overflow here
            let total_ms: u128 = self.history.iter().map(|r| u128::from(r.duration_ms)).sum();
            (total_ms / total_commands as u128) as u64
        } else {
            0
        };

        ExchangeStatistics {
            total_commands,
            successful_commands,
            failed_commands: total_commands - successful_commands,
            average_duration_ms,
        }
    }
}
