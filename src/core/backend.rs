use pcsc::{Card, Context, Disposition, Protocols, Scope, ShareMode};
use std::ffi::CString;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::core::session::ProtocolKind;

/// Low-level access to a smart card reader.
///
/// `CardSession` and `ApduTransmitter` only talk to the reader through this
/// trait, so tests can stand in for the hardware.
#[cfg_attr(test, mockall::automock)]
pub trait ReaderBackend {
    /// Names of the readers currently known to the service
    fn list_readers(&self) -> Result<Vec<String>, pcsc::Error>;

    /// Open a shared connection and report the protocol the reader negotiated
    fn connect(&mut self, reader_name: &str) -> Result<ProtocolKind, pcsc::Error>;

    /// Send `command` and write the reply into `response`.
    ///
    /// Returns how many bytes of `response` the reader filled. With a timeout
    /// the call gives up with `pcsc::Error::Timeout` once it elapses.
    fn transmit(
        &self,
        command: &[u8],
        response: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<usize, pcsc::Error>;

    /// Answer-to-reset of the connected card
    fn atr(&self) -> Option<Vec<u8>>;

    /// Release the card handle. Safe to call when nothing is connected.
    fn disconnect(&mut self);
}

/// Backend driving a real reader through the PC/SC service
pub struct PcscBackend {
    context: Context,
    card: Option<Arc<Mutex<Card>>>,
    atr: Option<Vec<u8>>,
}

impl PcscBackend {
    /// Establish a PC/SC context in the given scope
    pub fn establish(scope: Scope) -> Result<Self, pcsc::Error> {
        let context = Context::establish(scope)?;
        log::debug!("PCSC context established");

        Ok(Self {
            context,
            card: None,
            atr: None,
        })
    }
}

impl ReaderBackend for PcscBackend {
    fn list_readers(&self) -> Result<Vec<String>, pcsc::Error> {
        match self.context.list_readers_owned() {
            Ok(names) => Ok(names
                .into_iter()
                .map(|name| name.to_string_lossy().into_owned())
                .collect()),
            Err(pcsc::Error::NoReadersAvailable) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    fn connect(&mut self, reader_name: &str) -> Result<ProtocolKind, pcsc::Error> {
        let reader_cstr = CString::new(reader_name).map_err(|_| pcsc::Error::UnknownReader)?;
        let card = self
            .context
            .connect(&reader_cstr, ShareMode::Shared, Protocols::ANY)?;

        let status = card.status2_owned()?;
        let protocol = match status.protocol2() {
            Some(pcsc::Protocol::T0) => ProtocolKind::T0,
            Some(pcsc::Protocol::T1) => ProtocolKind::T1,
            _ => ProtocolKind::Unknown,
        };

        self.atr = Some(status.atr().to_vec());
        self.card = Some(Arc::new(Mutex::new(card)));
        Ok(protocol)
    }

    fn transmit(
        &self,
        command: &[u8],
        response: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<usize, pcsc::Error> {
        let card = self.card.as_ref().ok_or(pcsc::Error::InvalidHandle)?;

        let Some(limit) = timeout else {
            let card = card.lock().map_err(|_| pcsc::Error::InternalError)?;
            return card.transmit(command, response).map(|reply| reply.len());
        };

        // The PC/SC call itself cannot be bounded, so it runs on a worker
        // that keeps its own handle to the card until the reader answers.
        let card = Arc::clone(card);
        let command = command.to_vec();
        let capacity = response.len();

        let reply = run_with_deadline(limit, move || {
            let mut buf = vec![0u8; capacity];
            let card = card.lock().map_err(|_| pcsc::Error::InternalError)?;
            let len = card.transmit(&command, &mut buf)?.len();
            buf.truncate(len);
            Ok(buf)
        })?;
        fill_response(response, &reply)
    }

    fn atr(&self) -> Option<Vec<u8>> {
        self.atr.clone()
    }

    fn disconnect(&mut self) {
        self.atr = None;
        let Some(card) = self.card.take() else {
            return;
        };

        match Arc::try_unwrap(card) {
            Ok(card) => match card.into_inner() {
                Ok(card) => {
                    if let Err((_, e)) = card.disconnect(Disposition::LeaveCard) {
                        log::warn!("Failed to disconnect cleanly from card: {e}");
                    }
                }
                Err(_) => log::warn!("Card handle poisoned, dropping it"),
            },
            // A timed-out transmit still holds the handle; it is released
            // when that worker finishes.
            Err(_) => log::warn!("Card busy with a pending transmit, releasing it later"),
        }
    }
}

impl Drop for PcscBackend {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Run `job` on a worker thread and wait at most `limit` for its result.
///
/// An overrun yields `pcsc::Error::Timeout` and the worker is left to finish
/// on its own.
fn run_with_deadline<T, F>(limit: Duration, job: F) -> Result<T, pcsc::Error>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, pcsc::Error> + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(job());
    });

    match rx.recv_timeout(limit) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => Err(pcsc::Error::Timeout),
        Err(RecvTimeoutError::Disconnected) => Err(pcsc::Error::InternalError),
    }
}

/// Copy a reply produced off-thread into the caller's buffer
fn fill_response(response: &mut [u8], reply: &[u8]) -> Result<usize, pcsc::Error> {
    let target = response
        .get_mut(..reply.len())
        .ok_or(pcsc::Error::InsufficientBuffer)?;
    target.copy_from_slice(reply);
    Ok(reply.len())
}
