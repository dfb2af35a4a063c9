/// Session, transmitter and sequencer behaviour against a stub reader

use sim_sms_reader::{
    ApduCommand, ApduTransmitter, CardSession, CommandSequencer, ConnectError, ProtocolKind,
    ReaderBackend, SessionError, SessionState, TransmitError,
};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

/// Scripted reader: replies are consumed in order, every transmit is recorded
#[derive(Clone)]
struct StubReader {
    protocol: Result<ProtocolKind, pcsc::Error>,
    replies: Rc<RefCell<VecDeque<Result<Vec<u8>, pcsc::Error>>>>,
    sent: Rc<RefCell<Vec<Vec<u8>>>>,
    disconnects: Rc<RefCell<usize>>,
    connected: bool,
}

impl StubReader {
    fn new(protocol: ProtocolKind) -> Self {
        Self {
            protocol: Ok(protocol),
            replies: Rc::new(RefCell::new(VecDeque::new())),
            sent: Rc::new(RefCell::new(Vec::new())),
            disconnects: Rc::new(RefCell::new(0)),
            connected: false,
        }
    }

    fn failing_connect(error: pcsc::Error) -> Self {
        Self {
            protocol: Err(error),
            ..Self::new(ProtocolKind::T0)
        }
    }

    fn reply(self, bytes: &[u8]) -> Self {
        self.replies.borrow_mut().push_back(Ok(bytes.to_vec()));
        self
    }

    fn fail(self, error: pcsc::Error) -> Self {
        self.replies.borrow_mut().push_back(Err(error));
        self
    }

    fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.borrow().clone()
    }
}

impl ReaderBackend for StubReader {
    fn list_readers(&self) -> Result<Vec<String>, pcsc::Error> {
        Ok(vec!["Stub SIM Reader 0".to_string()])
    }

    fn connect(&mut self, _reader_name: &str) -> Result<ProtocolKind, pcsc::Error> {
        let protocol = self.protocol?;
        self.connected = true;
        Ok(protocol)
    }

    fn transmit(
        &self,
        command: &[u8],
        response: &mut [u8],
        _timeout: Option<Duration>,
    ) -> Result<usize, pcsc::Error> {
        assert!(self.connected, "transmit reached a disconnected reader");
        self.sent.borrow_mut().push(command.to_vec());

        let reply = self
            .replies
            .borrow_mut()
            .pop_front()
            .unwrap_or(Err(pcsc::Error::NoSmartcard))?;
        response[..reply.len()].copy_from_slice(&reply);
        Ok(reply.len())
    }

    fn atr(&self) -> Option<Vec<u8>> {
        self.connected.then(|| vec![0x3B, 0x16, 0x94, 0x71, 0x01, 0x01, 0x05, 0x02, 0x00])
    }

    fn disconnect(&mut self) {
        self.connected = false;
        *self.disconnects.borrow_mut() += 1;
    }
}

fn with_status(data_len: usize) -> Vec<u8> {
    let mut reply: Vec<u8> = (0..data_len).map(|i| i as u8).collect();
    reply.extend_from_slice(&[0x90, 0x00]);
    reply
}

#[test]
fn test_connect_reports_simulated_protocol() {
    for kind in [ProtocolKind::T0, ProtocolKind::T1] {
        let mut session = CardSession::new(StubReader::new(kind));
        assert_eq!(session.connect("Stub SIM Reader 0").unwrap(), kind);
        assert_eq!(session.active_protocol(), Ok(kind));
        assert_eq!(session.state(), SessionState::Connected);
        assert!(session.atr().is_some());
    }
}

#[test]
fn test_unsupported_protocol_leaves_session_disconnected() {
    let stub = StubReader::new(ProtocolKind::Unknown);
    let disconnects = Rc::clone(&stub.disconnects);
    let mut session = CardSession::new(stub);

    let err = session.connect("Stub SIM Reader 0").unwrap_err();
    assert!(matches!(err, ConnectError::ProtocolMismatch { .. }));
    assert_eq!(session.state(), SessionState::Disconnected);
    assert_eq!(session.active_protocol(), Err(SessionError::NotConnected));
    assert_eq!(*disconnects.borrow(), 1);
}

#[test]
fn test_unavailable_reader() {
    let mut session = CardSession::new(StubReader::failing_connect(pcsc::Error::UnknownReader));

    let err = session.connect("No Such Reader").unwrap_err();
    assert!(err.to_string().contains("No Such Reader"));
    assert!(matches!(err, ConnectError::ReaderUnavailable { .. }));
    assert_eq!(session.state(), SessionState::Disconnected);
}

#[test]
fn test_transmit_on_disconnected_session_performs_no_io() {
    let stub = StubReader::new(ProtocolKind::T0).reply(&[0x90, 0x00]);
    let observer = stub.clone();
    let session = CardSession::new(stub);

    let mut transmitter = ApduTransmitter::new();
    let result = transmitter.transmit(&session, &ApduCommand::select(0x7F10), None);

    assert_eq!(result, Err(TransmitError::NotConnected));
    assert!(observer.sent().is_empty());
}

#[test]
fn test_select_telecom_returns_bare_status_word() {
    let stub = StubReader::new(ProtocolKind::T0).reply(&[0x90, 0x00]);
    let observer = stub.clone();
    let mut session = CardSession::new(stub);
    session.connect("Stub SIM Reader 0").unwrap();

    let command = ApduCommand::from_hex("A0 A4 00 00 02 7F 10").unwrap();
    let response = ApduTransmitter::new()
        .transmit(&session, &command, None)
        .unwrap();

    assert_eq!(response.as_bytes(), &[0x90, 0x00]);
    assert_eq!(observer.sent(), vec![vec![0xA0, 0xA4, 0x00, 0x00, 0x02, 0x7F, 0x10]]);
}

#[test]
fn test_get_response_keeps_exact_length() {
    let reply = with_status(22);
    let mut session = CardSession::new(StubReader::new(ProtocolKind::T1).reply(&reply));
    session.connect("Stub SIM Reader 0").unwrap();

    let command = ApduCommand::from_hex("A0 C0 00 00 16").unwrap();
    let response = ApduTransmitter::new()
        .transmit(&session, &command, None)
        .unwrap();

    assert_eq!(response.len(), 24);
    assert_eq!(response.as_bytes(), reply.as_slice());
    assert_eq!(response.status_word(), Some((0x90, 0x00)));
    assert_eq!(response.data().len(), 22);
}

#[test]
fn test_full_sequence_returns_five_responses_in_order() {
    let replies = [
        vec![0x9F, 0x16],
        with_status(22),
        vec![0x9F, 0x0F],
        with_status(15),
        with_status(176),
    ];
    let mut stub = StubReader::new(ProtocolKind::T0);
    for reply in &replies {
        stub = stub.reply(reply);
    }
    let observer = stub.clone();

    let mut session = CardSession::new(stub);
    session.connect("Stub SIM Reader 0").unwrap();

    let mut sequencer = CommandSequencer::sim_sms();
    let responses = sequencer.run_sequence(&session).unwrap();

    assert_eq!(responses.len(), 5);
    for (response, reply) in responses.iter().zip(&replies) {
        assert_eq!(response.as_bytes(), reply.as_slice());
    }

    let sent = observer.sent();
    assert_eq!(
        sent,
        vec![
            vec![0xA0, 0xA4, 0x00, 0x00, 0x02, 0x7F, 0x10],
            vec![0xA0, 0xC0, 0x00, 0x00, 0x16],
            vec![0xA0, 0xA4, 0x00, 0x00, 0x02, 0x6F, 0x3C],
            vec![0xA0, 0xC0, 0x00, 0x00, 0x0F],
            vec![0xA0, 0xB2, 0x01, 0x04, 0xB0],
        ]
    );

    let sms = CommandSequencer::payload(&responses).unwrap();
    assert_eq!(sms.len(), 178);
    assert_eq!(sequencer.transmitter().statistics().successful_commands, 5);
}

#[test]
fn test_sequence_does_not_check_status_words() {
    // every step answers "file not found", the sequence still runs to the end
    let mut stub = StubReader::new(ProtocolKind::T0);
    for _ in 0..5 {
        stub = stub.reply(&[0x94, 0x04]);
    }
    let mut session = CardSession::new(stub);
    session.connect("Stub SIM Reader 0").unwrap();

    let responses = CommandSequencer::sim_sms().run_sequence(&session).unwrap();
    assert_eq!(responses.len(), 5);
    assert!(responses.iter().all(|r| r.status_word() == Some((0x94, 0x04))));
}

#[test]
fn test_sequence_failure_at_step_three_skips_the_rest() {
    let stub = StubReader::new(ProtocolKind::T1)
        .reply(&[0x9F, 0x16])
        .reply(&with_status(22))
        .fail(pcsc::Error::RemovedCard)
        .reply(&[0x9F, 0x0F])
        .reply(&with_status(176));
    let observer = stub.clone();

    let mut session = CardSession::new(stub);
    session.connect("Stub SIM Reader 0").unwrap();

    let mut sequencer = CommandSequencer::sim_sms();
    let err = sequencer.run_sequence(&session).unwrap_err();

    assert_eq!(err.step, 3);
    assert_eq!(
        err.source,
        TransmitError::TransmitFailed(pcsc::Error::RemovedCard)
    );
    assert!(err.to_string().starts_with("Step 3 (SELECT EF SMS) failed"));
    assert_eq!(observer.sent().len(), 3);

    let history = sequencer.transmitter().history();
    assert_eq!(history.len(), 3);
    assert!(!history[2].success);
}

#[test]
fn test_disconnect_twice_is_harmless() {
    let stub = StubReader::new(ProtocolKind::T0);
    let disconnects = Rc::clone(&stub.disconnects);
    let mut session = CardSession::new(stub);

    session.disconnect();
    assert_eq!(session.state(), SessionState::Disconnected);

    session.connect("Stub SIM Reader 0").unwrap();
    session.disconnect();
    session.disconnect();
    assert_eq!(session.state(), SessionState::Disconnected);
    assert_eq!(*disconnects.borrow(), 1);

    drop(session);
    assert_eq!(*disconnects.borrow(), 1);
}

#[test]
fn test_script_sequence_runs_against_stub() {
    let script = "\
# select MF then ICCID
select mf: A0 A4 00 00 02 3F 00
select iccid: A0 A4 00 00 02 2F E2
read binary: A0 B0 00 00 0A
";
    let stub = StubReader::new(ProtocolKind::T0)
        .reply(&[0x9F, 0x1A])
        .reply(&[0x9F, 0x0F])
        .reply(&with_status(10));
    let mut session = CardSession::new(stub);
    session.connect("Stub SIM Reader 0").unwrap();

    let mut sequencer = CommandSequencer::from_script(script).unwrap();
    let responses = sequencer.run_sequence(&session).unwrap();

    assert_eq!(responses.len(), 3);
    assert_eq!(responses[2].data(), &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);

    let exported = sequencer.transmitter().export_history().unwrap();
    assert!(exported.contains("\"success\": true"));
}
