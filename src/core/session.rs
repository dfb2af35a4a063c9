use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::backend::{PcscBackend, ReaderBackend};

/// Transmission protocol negotiated with the card
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolKind {
    T0,
    T1,
    Unknown,
}

impl std::fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolKind::T0 => f.write_str("T=0"),
            ProtocolKind::T1 => f.write_str("T=1"),
            ProtocolKind::Unknown => f.write_str("unknown"),
        }
    }
}

/// Connection state of a [`CardSession`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connected,
}

#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("Reader '{reader}' is unavailable: {source}")]
    ReaderUnavailable {
        reader: String,
        #[source]
        source: pcsc::Error,
    },

    #[error("Reader '{reader}' negotiated an unsupported protocol ({protocol})")]
    ProtocolMismatch {
        reader: String,
        protocol: ProtocolKind,
    },
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    #[error("No card connected")]
    NotConnected,
}

/// A connection to one reader and the protocol it negotiated.
///
/// The session exclusively owns its backend; nothing here is shared across
/// threads and commands go out one at a time.
pub struct CardSession<B: ReaderBackend = PcscBackend> {
    backend: B,
    reader_name: Option<String>,
    protocol: Option<ProtocolKind>,
}

impl<B: ReaderBackend> CardSession<B> {
    /// Create a disconnected session on top of a backend
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            reader_name: None,
            protocol: None,
        }
    }

    /// Connect to a reader in shared mode.
    ///
    /// An existing connection is released first. On any failure the session
    /// is left `Disconnected`.
    pub fn connect(&mut self, reader_name: &str) -> Result<ProtocolKind, ConnectError> {
        if self.is_connected() {
            self.disconnect();
        }

        log::info!("Connecting to reader: {}", reader_name);

        let protocol = self.backend.connect(reader_name).map_err(|source| {
            log::error!("Failed to connect to reader {reader_name}: {source}");
            ConnectError::ReaderUnavailable {
                reader: reader_name.to_string(),
                source,
            }
        })?;

        if !matches!(protocol, ProtocolKind::T0 | ProtocolKind::T1) {
            log::error!("Not supported protocol: {protocol}");
            self.backend.disconnect();
            return Err(ConnectError::ProtocolMismatch {
                reader: reader_name.to_string(),
                protocol,
            });
        }

        self.reader_name = Some(reader_name.to_string());
        self.protocol = Some(protocol);

        log::info!("Connected to reader {} using {}", reader_name, protocol);
        Ok(protocol)
    }

    /// Release the connection. Idempotent.
    pub fn disconnect(&mut self) {
        if self.protocol.take().is_none() {
            return;
        }

        self.backend.disconnect();
        if let Some(reader) = self.reader_name.take() {
            log::info!("Disconnected from reader: {}", reader);
        }
    }

    pub fn active_protocol(&self) -> Result<ProtocolKind, SessionError> {
        self.protocol.ok_or(SessionError::NotConnected)
    }

    pub fn state(&self) -> SessionState {
        if self.protocol.is_some() {
            SessionState::Connected
        } else {
            SessionState::Disconnected
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Name of the connected reader
    pub fn reader_name(&self) -> Option<&str> {
        self.reader_name.as_deref()
    }

    /// Answer-to-reset of the connected card
    pub fn atr(&self) -> Option<Vec<u8>> {
        if self.is_connected() {
            self.backend.atr()
        } else {
            None
        }
    }

    /// Reader names visible to the backend, for reader selection
    pub fn list_readers(&self) -> Result<Vec<String>, pcsc::Error> {
        self.backend.list_readers()
    }

    pub(crate) fn backend(&self) -> &B {
        &self.backend
    }
}

impl<B: ReaderBackend> Drop for CardSession<B> {
    fn drop(&mut self) {
        self.disconnect();
    }
}
