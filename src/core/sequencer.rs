//! Ordered APDU workflows
//!
//! A sequence is a list of named commands sent one after another over a single
//! session. Status words are not inspected between steps: a step runs as long
//! as the previous transmit reached the card, whatever the card answered.

use std::time::Duration;
use thiserror::Error;

use crate::core::apdu::{ApduCommand, ApduResponse, RECORD_MODE_ABSOLUTE};
use crate::core::backend::ReaderBackend;
use crate::core::session::CardSession;
use crate::core::transmitter::{ApduTransmitter, TransmitError};

/// DF telecom
pub const DF_TELECOM: u16 = 0x7F10;
/// EF SMS under DF telecom
pub const EF_SMS: u16 = 0x6F3C;
/// Length of an EF SMS record
pub const SMS_RECORD_LEN: u8 = 0xB0;

/// A transmit failure, with the 1-based position of the step that hit it
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Step {step} ({name}) failed: {source}")]
pub struct SequenceError {
    pub step: usize,
    pub name: String,
    #[source]
    pub source: TransmitError,
}

#[derive(Error, Debug)]
pub enum ScriptError {
    #[error("Line {line}: {message}")]
    InvalidLine { line: usize, message: String },

    #[error("Script contains no commands")]
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceStep {
    pub name: String,
    pub command: ApduCommand,
}

impl SequenceStep {
    pub fn new(name: impl Into<String>, command: ApduCommand) -> Self {
        Self {
            name: name.into(),
            command,
        }
    }
}

/// Runs a fixed list of commands in order, aborting on the first transmit failure
#[derive(Debug)]
pub struct CommandSequencer {
    steps: Vec<SequenceStep>,
    timeout: Option<Duration>,
    transmitter: ApduTransmitter,
}

impl CommandSequencer {
    pub fn new(steps: Vec<SequenceStep>) -> Self {
        Self {
            steps,
            timeout: None,
            transmitter: ApduTransmitter::new(),
        }
    }

    /// The SIM workflow that reads the first SMS record:
    /// select DF telecom, fetch its response, select EF SMS, fetch its
    /// response, read record 1.
    pub fn sim_sms() -> Self {
        Self::new(vec![
            SequenceStep::new("SELECT DF telecom", ApduCommand::select(DF_TELECOM)),
            SequenceStep::new("GET RESPONSE", ApduCommand::get_response(0x16)),
            SequenceStep::new("SELECT EF SMS", ApduCommand::select(EF_SMS)),
            SequenceStep::new("GET RESPONSE", ApduCommand::get_response(0x0F)),
            SequenceStep::new(
                "READ RECORD",
                ApduCommand::read_record(1, RECORD_MODE_ABSOLUTE, SMS_RECORD_LEN),
            ),
        ])
    }

    /// Build a sequence from a script: one `[name:] <hex apdu>` per line.
    ///
    /// Blank lines and lines starting with `#` or `//` are skipped.
    pub fn from_script(script: &str) -> Result<Self, ScriptError> {
        let mut steps = Vec::new();

        for (index, raw) in script.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with("//") {
                continue;
            }

            let (name, hex) = match line.split_once(':') {
                Some((name, hex)) if !name.trim().is_empty() && !is_colon_separated_hex(line) => {
                    (name.trim().to_string(), hex)
                }
                _ => (format!("Command {}", steps.len() + 1), line),
            };

            let command = ApduCommand::from_hex(hex).map_err(|e| ScriptError::InvalidLine {
                line: index + 1,
                message: format!("{e:#}"),
            })?;
            steps.push(SequenceStep::new(name, command));
        }

        if steps.is_empty() {
            return Err(ScriptError::Empty);
        }

        Ok(Self::new(steps))
    }

    /// Bound the wait for every transmit in the sequence
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn steps(&self) -> &[SequenceStep] {
        &self.steps
    }

    pub fn transmitter(&self) -> &ApduTransmitter {
        &self.transmitter
    }

    /// Transmit every step in order and return one response per step.
    ///
    /// Stops at the first failing transmit; later steps are not attempted.
    pub fn run_sequence<B: ReaderBackend>(
        &mut self,
        session: &CardSession<B>,
    ) -> Result<Vec<ApduResponse>, SequenceError> {
        let mut responses = Vec::with_capacity(self.steps.len());

        for (index, step) in self.steps.iter().enumerate() {
            log::debug!("Step {}/{}: {}", index + 1, self.steps.len(), step.name);

            let response = self
                .transmitter
                .transmit(session, &step.command, self.timeout)
                .map_err(|source| {
                    log::error!("Sequence aborted at step {} ({})", index + 1, step.name);
                    SequenceError {
                        step: index + 1,
                        name: step.name.clone(),
                        source,
                    }
                })?;
            responses.push(response);
        }

        log::info!("Sequence completed: {} responses", responses.len());
        Ok(responses)
    }

    /// The response of interest: the last one, i.e. the record read
    pub fn payload(responses: &[ApduResponse]) -> Option<&ApduResponse> {
        responses.last()
    }
}

// "A0:A4:00:00" is an APDU, "EF: A0 A4 ..." is a step named EF
fn is_colon_separated_hex(line: &str) -> bool {
    line.split(':')
        .all(|byte| byte.len() == 2 && byte.chars().all(|c| c.is_ascii_hexdigit()))
}
