/// SIM SMS reader - reads the SMS file of a SIM card over PC/SC
///
/// The core connects to a reader, sends a fixed sequence of GSM 11.11 APDUs
/// and hands the raw responses back; the CLI renders them.
pub mod cli;
pub mod core;

// Re-export commonly used types
pub use crate::core::{
    apdu::{ApduCommand, ApduResponse},
    backend::{PcscBackend, ReaderBackend},
    sequencer::{CommandSequencer, SequenceError, SequenceStep},
    session::{CardSession, ConnectError, ProtocolKind, SessionError, SessionState},
    transmitter::{ApduTransmitter, ExchangeRecord, TransmitError},
    utils::{format_hex_spaced, parse_hex},
};
