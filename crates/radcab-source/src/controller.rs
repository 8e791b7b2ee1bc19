//! Serial link to the source controller: echo-verified commands and the
//! fire-sequence state machine.
//!
//! The controller is generic over the port so the handshake logic can be
//! exercised against an in-memory port; `open` wires it to a real serial
//! device. One controller instance owns the port exclusively, which is all
//! the locking this protocol needs.

use crate::protocol::{
    ack, cmd, FireState, SourceMode, SourceState, BAUD_RATE, KVP_MAX, KVP_MIN, TIMER_DS_MAX,
    TIMER_DS_MIN,
};
use serialport::SerialPort;
use std::io::{Read, Write};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Serial read timeout. Long enough to ride out the controller's habit of
/// occasionally swallowing a command.
const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on reply length; anything longer is line noise.
const MAX_REPLY_LEN: usize = 60;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("serial i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("timed out waiting for the source controller")]
    Timeout,
    #[error("echo mismatch: sent {sent:?}, received {received:?}")]
    EchoMismatch { sent: String, received: String },
    #[error("malformed reply to {command}: {reply:?}")]
    BadReply {
        command: &'static str,
        reply: String,
    },
    #[error("door open")]
    DoorOpen,
    #[error("tube warming up")]
    WarmingUp,
    #[error("door opened during exposure")]
    DoorOpenedDuringExposure,
    #[error("re-query after setting {what} returned {got:?}, wanted {want:?}")]
    VerifyFailed {
        what: &'static str,
        want: String,
        got: String,
    },
    #[error("kVp {0} out of range [{KVP_MIN}, {KVP_MAX}]")]
    KvpOutOfRange(u8),
    #[error("exposure {0} ds out of range [{TIMER_DS_MIN}, {TIMER_DS_MAX}]")]
    TimerOutOfRange(u16),
    #[error("fire handshake: expected {expected:?}, received {received:?}")]
    UnexpectedAck { expected: char, received: char },
    #[error("no fire sequence in progress")]
    NotFiring,
}

pub struct SourceController<P> {
    port: P,
    fire_state: FireState,
}

impl SourceController<Box<dyn SerialPort>> {
    /// Open the controller's serial port and drain any stale input.
    pub fn open(path: &str) -> Result<Self, SourceError> {
        let port = serialport::new(path, BAUD_RATE)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(READ_TIMEOUT)
            .open()?;
        tracing::info!(path, "opened source controller");
        let mut ctl = Self::with_port(port);
        ctl.flush_input()?;
        Ok(ctl)
    }
}

impl<P: Read + Write> SourceController<P> {
    /// Wrap an already-open port. Used directly by tests.
    pub fn with_port(port: P) -> Self {
        Self {
            port,
            fire_state: FireState::Idle,
        }
    }

    /// Current position in the fire handshake.
    pub fn fire_state(&self) -> FireState {
        self.fire_state
    }

    // -- queries -----------------------------------------------------------

    pub fn get_device(&mut self) -> Result<String, SourceError> {
        self.command(cmd::GET_DEVICE)
    }

    pub fn get_revision(&mut self) -> Result<String, SourceError> {
        self.command(cmd::GET_REVISION)
    }

    pub fn get_state(&mut self) -> Result<SourceState, SourceError> {
        let reply = self.command(cmd::GET_STATE)?;
        SourceState::parse(&reply).ok_or(SourceError::BadReply {
            command: cmd::GET_STATE,
            reply,
        })
    }

    pub fn get_mode(&mut self) -> Result<SourceMode, SourceError> {
        let reply = self.command(cmd::GET_MODE)?;
        SourceMode::parse(&reply).ok_or(SourceError::BadReply {
            command: cmd::GET_MODE,
            reply,
        })
    }

    pub fn get_kvp(&mut self) -> Result<u8, SourceError> {
        let reply = self.command(cmd::GET_KVP)?;
        match reply.parse::<u8>() {
            Ok(kvp) if (KVP_MIN..=KVP_MAX).contains(&kvp) => Ok(kvp),
            _ => Err(SourceError::BadReply {
                command: cmd::GET_KVP,
                reply,
            }),
        }
    }

    pub fn get_exposure_deciseconds(&mut self) -> Result<u16, SourceError> {
        let reply = self.command(cmd::GET_TIMER)?;
        match reply.parse::<u16>() {
            Ok(ds) if (TIMER_DS_MIN..=TIMER_DS_MAX).contains(&ds) => Ok(ds),
            _ => Err(SourceError::BadReply {
                command: cmd::GET_TIMER,
                reply,
            }),
        }
    }

    // -- mutations, each verified by re-query ------------------------------

    pub fn set_mode_remote(&mut self) -> Result<(), SourceError> {
        self.command(cmd::SET_MODE_REMOTE)?;
        match self.get_mode()? {
            SourceMode::Remote => Ok(()),
            other => Err(SourceError::VerifyFailed {
                what: "mode",
                want: "Remote".into(),
                got: format!("{other:?}"),
            }),
        }
    }

    pub fn set_kvp(&mut self, kvp: u8) -> Result<(), SourceError> {
        if !(KVP_MIN..=KVP_MAX).contains(&kvp) {
            return Err(SourceError::KvpOutOfRange(kvp));
        }
        self.command(&cmd::set_kvp(kvp))?;
        let got = self.get_kvp()?;
        if got != kvp {
            return Err(SourceError::VerifyFailed {
                what: "kVp",
                want: kvp.to_string(),
                got: got.to_string(),
            });
        }
        Ok(())
    }

    pub fn set_exposure_deciseconds(&mut self, deciseconds: u16) -> Result<(), SourceError> {
        if !(TIMER_DS_MIN..=TIMER_DS_MAX).contains(&deciseconds) {
            return Err(SourceError::TimerOutOfRange(deciseconds));
        }
        self.command(&cmd::set_timer(deciseconds))?;
        let got = self.get_exposure_deciseconds()?;
        if got != deciseconds {
            return Err(SourceError::VerifyFailed {
                what: "exposure timer",
                want: deciseconds.to_string(),
                got: got.to_string(),
            });
        }
        Ok(())
    }

    // -- fire sequence -----------------------------------------------------

    /// Start emission: `!B` → `X` → `C` → `P`. Returns with the exposure
    /// running (`AwaitingComplete`). Any failure past the precondition
    /// check sends the abort character before propagating.
    ///
    /// Preconditions are named errors: a door that is open or a tube still
    /// warming up is the caller's problem to resolve, not a protocol
    /// fault.
    pub fn fire_begin(&mut self) -> Result<(), SourceError> {
        match self.get_state()? {
            SourceState::Ready => {}
            SourceState::DoorOpen => return Err(SourceError::DoorOpen),
            SourceState::WarmingUp => return Err(SourceError::WarmingUp),
        }
        if let Err(e) = self.fire_handshake() {
            tracing::warn!(error = %e, "fire handshake failed; aborting");
            self.fire_abort()?;
            return Err(e);
        }
        Ok(())
    }

    fn fire_handshake(&mut self) -> Result<(), SourceError> {
        tracing::info!("initiating fire sequence");
        self.send_raw(cmd::FIRE)?;
        self.send_raw("\r")?;
        self.fire_state = FireState::AwaitingXAck;

        self.expect_ack(ack::XRAY)?;
        self.send_char(ack::CONTINUE)?;
        self.fire_state = FireState::AwaitingProcessingAck;

        self.expect_ack(ack::PROCESSING)?;
        self.fire_state = FireState::AwaitingComplete;
        tracing::info!("emission in progress");
        Ok(())
    }

    /// Wait for the completion `S`, then re-check the interlock state: a
    /// door opened mid-exposure silently ends emission early and is only
    /// visible in the state query afterwards.
    pub fn wait_complete(&mut self, wait: Duration) -> Result<(), SourceError> {
        if self.fire_state != FireState::AwaitingComplete {
            return Err(SourceError::NotFiring);
        }
        let deadline = Instant::now() + wait;
        loop {
            match self.recv_ack() {
                Ok(c) if c == ack::COMPLETE => break,
                Ok(c) => {
                    self.fire_abort()?;
                    return Err(SourceError::UnexpectedAck {
                        expected: ack::COMPLETE,
                        received: c,
                    });
                }
                Err(SourceError::Timeout) if Instant::now() < deadline => continue,
                Err(e) => {
                    self.fire_abort()?;
                    return Err(e);
                }
            }
        }
        self.fire_state = FireState::Idle;
        tracing::info!("exposure complete");

        match self.get_state()? {
            SourceState::Ready => Ok(()),
            _ => Err(SourceError::DoorOpenedDuringExposure),
        }
    }

    /// Unconditional abort: send the single `A` and drop back to idle.
    /// Safe to call at any point in the sequence, including when idle.
    pub fn fire_abort(&mut self) -> Result<(), SourceError> {
        tracing::warn!(state = ?self.fire_state, "aborting fire sequence");
        self.send_char(ack::ABORT)?;
        self.fire_state = FireState::Idle;
        Ok(())
    }

    /// One-shot convenience: begin, then wait out the exposure.
    pub fn fire(&mut self, exposure_wait: Duration) -> Result<(), SourceError> {
        self.fire_begin()?;
        self.wait_complete(exposure_wait)
    }

    // -- wire helpers ------------------------------------------------------

    /// Drain whatever the controller has buffered; it occasionally replays
    /// the tail of an earlier reply after a reconnect.
    fn flush_input(&mut self) -> Result<(), SourceError> {
        let mut byte = [0u8; 1];
        for _ in 0..4096 {
            match self.port.read(&mut byte) {
                Ok(0) => return Ok(()),
                Ok(_) => continue,
                Err(e) if is_timeout(&e) => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn send_raw(&mut self, s: &str) -> Result<(), SourceError> {
        tracing::trace!(out = s, "serial write");
        self.port.write_all(s.as_bytes())?;
        self.port.flush()?;
        Ok(())
    }

    fn send_char(&mut self, c: char) -> Result<(), SourceError> {
        let mut buf = [0u8; 1];
        self.send_raw(c.encode_utf8(&mut buf))
    }

    /// Read one CR-terminated reply line (CR stripped).
    fn recv_line(&mut self) -> Result<String, SourceError> {
        let mut line = String::new();
        for _ in 0..MAX_REPLY_LEN {
            let c = self.recv_ack()?;
            if c == '\r' {
                tracing::trace!(line, "serial reply");
                return Ok(line);
            }
            line.push(c);
        }
        Err(SourceError::BadReply {
            command: "(unterminated)",
            reply: line,
        })
    }

    /// Read a single ASCII character.
    fn recv_ack(&mut self) -> Result<char, SourceError> {
        let mut byte = [0u8; 1];
        match self.port.read(&mut byte) {
            Ok(0) => Err(SourceError::Timeout),
            Ok(_) => Ok(byte[0] as char),
            Err(e) if is_timeout(&e) => Err(SourceError::Timeout),
            Err(e) => Err(e.into()),
        }
    }

    fn expect_ack(&mut self, expected: char) -> Result<(), SourceError> {
        let received = self.recv_ack()?;
        if received != expected {
            return Err(SourceError::UnexpectedAck { expected, received });
        }
        Ok(())
    }

    /// Send a CR-terminated command and return the reply with its echo
    /// verified and stripped.
    fn command(&mut self, command: &str) -> Result<String, SourceError> {
        self.send_raw(command)?;
        self.send_raw("\r")?;
        let line = self.recv_line()?;
        if !line.starts_with(command) {
            return Err(SourceError::EchoMismatch {
                sent: command.to_string(),
                received: line,
            });
        }
        Ok(line[command.len()..].to_string())
    }
}

fn is_timeout(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    /// In-memory port: scripted controller output, captured host output.
    /// An exhausted script reads as a timeout, which doubles as the
    /// cancellation-injection mechanism.
    struct MockPort {
        rx: std::io::Cursor<Vec<u8>>,
        tx: Vec<u8>,
    }

    impl MockPort {
        fn new(script: &str) -> Self {
            Self {
                rx: std::io::Cursor::new(script.as_bytes().to_vec()),
                tx: Vec::new(),
            }
        }
    }

    impl Read for MockPort {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            // One byte at a time, like a slow UART.
            self.rx.read(&mut buf[..1])
        }
    }

    impl Write for MockPort {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.tx.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn sent(port: &MockPort) -> String {
        String::from_utf8_lossy(&port.tx).into_owned()
    }

    #[test]
    fn queries_verify_and_strip_the_echo() {
        let mut port = MockPort::new("?DMX-20\r?R4.2\r?SR\r?MF\r?V26\r?T0140\r");
        let mut ctl = SourceController::with_port(&mut port);
        assert_eq!(ctl.get_device().unwrap(), "MX-20");
        assert_eq!(ctl.get_revision().unwrap(), "4.2");
        assert_eq!(ctl.get_state().unwrap(), SourceState::Ready);
        assert_eq!(ctl.get_mode().unwrap(), SourceMode::FrontPanel);
        assert_eq!(ctl.get_kvp().unwrap(), 26);
        assert_eq!(ctl.get_exposure_deciseconds().unwrap(), 140);
        assert_eq!(sent(&port), "?D\r?R\r?S\r?M\r?V\r?T\r");
    }

    #[test]
    fn echo_mismatch_is_fatal() {
        let mut port = MockPort::new("?V26\r");
        let mut ctl = SourceController::with_port(&mut port);
        let err = ctl.get_exposure_deciseconds().unwrap_err();
        assert!(matches!(err, SourceError::EchoMismatch { .. }));
    }

    #[test]
    fn set_kvp_rejects_out_of_range_without_writing() {
        let mut port = MockPort::new("");
        let mut ctl = SourceController::with_port(&mut port);
        assert!(matches!(
            ctl.set_kvp(9),
            Err(SourceError::KvpOutOfRange(9))
        ));
        assert!(matches!(
            ctl.set_kvp(36),
            Err(SourceError::KvpOutOfRange(36))
        ));
        assert!(sent(&port).is_empty());
    }

    #[test]
    fn set_timer_rejects_out_of_range_without_writing() {
        let mut port = MockPort::new("");
        let mut ctl = SourceController::with_port(&mut port);
        assert!(matches!(
            ctl.set_exposure_deciseconds(0),
            Err(SourceError::TimerOutOfRange(0))
        ));
        assert!(matches!(
            ctl.set_exposure_deciseconds(10000),
            Err(SourceError::TimerOutOfRange(10000))
        ));
        assert!(sent(&port).is_empty());
    }

    #[test]
    fn set_kvp_is_verified_by_requery() {
        let mut port = MockPort::new("!V26\r?V26\r");
        let mut ctl = SourceController::with_port(&mut port);
        ctl.set_kvp(26).unwrap();
        assert_eq!(sent(&port), "!V26\r?V\r");
    }

    #[test]
    fn set_kvp_requery_divergence_is_an_error() {
        let mut port = MockPort::new("!V26\r?V25\r");
        let mut ctl = SourceController::with_port(&mut port);
        assert!(matches!(
            ctl.set_kvp(26),
            Err(SourceError::VerifyFailed { what: "kVp", .. })
        ));
    }

    #[test]
    fn set_mode_remote_verified_by_requery() {
        let mut port = MockPort::new("!MR\r?MR\r");
        let mut ctl = SourceController::with_port(&mut port);
        ctl.set_mode_remote().unwrap();
        assert_eq!(sent(&port), "!MR\r?M\r");
    }

    #[test]
    fn fire_with_door_open_sends_no_fire_bytes() {
        let mut port = MockPort::new("?SD\r");
        let mut ctl = SourceController::with_port(&mut port);
        assert!(matches!(ctl.fire_begin(), Err(SourceError::DoorOpen)));
        assert_eq!(ctl.fire_state(), FireState::Idle);
        // Only the state query went out; no `!B`, no abort.
        assert_eq!(sent(&port), "?S\r");
    }

    #[test]
    fn fire_while_warming_up_is_a_named_error() {
        let mut port = MockPort::new("?SW\r");
        let mut ctl = SourceController::with_port(&mut port);
        assert!(matches!(ctl.fire_begin(), Err(SourceError::WarmingUp)));
    }

    #[test]
    fn full_fire_sequence_round_trip() {
        let mut port = MockPort::new("?SR\rXPS?SR\r");
        let mut ctl = SourceController::with_port(&mut port);
        ctl.fire_begin().unwrap();
        assert_eq!(ctl.fire_state(), FireState::AwaitingComplete);
        ctl.wait_complete(Duration::from_millis(10)).unwrap();
        assert_eq!(ctl.fire_state(), FireState::Idle);
        assert_eq!(sent(&port), "?S\r!B\rC?S\r");
    }

    #[test]
    fn cancellation_mid_processing_ack_sends_abort() {
        // Script ends after `X`: the read for `P` times out, standing in
        // for an injected cancellation mid-AwaitingProcessingAck.
        let mut port = MockPort::new("?SR\rX");
        let mut ctl = SourceController::with_port(&mut port);
        assert!(matches!(ctl.fire_begin(), Err(SourceError::Timeout)));
        assert_eq!(ctl.fire_state(), FireState::Idle);
        assert!(sent(&port).ends_with('A'));
    }

    #[test]
    fn wrong_ack_character_aborts() {
        let mut port = MockPort::new("?SR\rQ");
        let mut ctl = SourceController::with_port(&mut port);
        assert!(matches!(
            ctl.fire_begin(),
            Err(SourceError::UnexpectedAck {
                expected: 'X',
                received: 'Q'
            })
        ));
        assert_eq!(ctl.fire_state(), FireState::Idle);
        assert!(sent(&port).ends_with('A'));
    }

    #[test]
    fn door_opened_mid_exposure_is_detected_after_completion() {
        let mut port = MockPort::new("?SR\rXPS?SD\r");
        let mut ctl = SourceController::with_port(&mut port);
        ctl.fire_begin().unwrap();
        assert!(matches!(
            ctl.wait_complete(Duration::from_millis(10)),
            Err(SourceError::DoorOpenedDuringExposure)
        ));
    }

    #[test]
    fn wait_complete_without_a_sequence_is_an_error() {
        let mut port = MockPort::new("");
        let mut ctl = SourceController::with_port(&mut port);
        assert!(matches!(
            ctl.wait_complete(Duration::from_millis(1)),
            Err(SourceError::NotFiring)
        ));
    }

    #[test]
    fn abort_when_idle_is_harmless() {
        let mut port = MockPort::new("");
        let mut ctl = SourceController::with_port(&mut port);
        ctl.fire_abort().unwrap();
        assert_eq!(ctl.fire_state(), FireState::Idle);
        assert_eq!(sent(&port), "A");
    }
}
