//! Source controller command set: mnemonics, reply parsing, valid ranges.
//!
//! Lifted from the cabinet vendor's serial command notes for this
//! controller family. Queries start with `?`, mutations with `!`; all are
//! CR-terminated except the single-character fire-handshake tokens.

/// 9600-8-N-1, no flow control.
pub const BAUD_RATE: u32 = 9600;

/// Tube voltage range in kVp accepted by `!V`.
pub const KVP_MIN: u8 = 10;
pub const KVP_MAX: u8 = 35;

/// Exposure timer range in deciseconds accepted by `!T`.
pub const TIMER_DS_MIN: u16 = 1;
pub const TIMER_DS_MAX: u16 = 9999;

/// CR-terminated command mnemonics.
pub(crate) mod cmd {
    pub const GET_DEVICE: &str = "?D";
    pub const GET_REVISION: &str = "?R";
    pub const GET_STATE: &str = "?S";
    pub const GET_MODE: &str = "?M";
    pub const GET_KVP: &str = "?V";
    pub const GET_TIMER: &str = "?T";
    pub const SET_MODE_REMOTE: &str = "!MR";
    pub const FIRE: &str = "!B";

    pub fn set_kvp(kvp: u8) -> String {
        format!("!V{kvp:02}")
    }

    pub fn set_timer(deciseconds: u16) -> String {
        format!("!T{deciseconds:04}")
    }
}

/// Single-character fire-handshake tokens (no CR in either direction).
pub(crate) mod ack {
    /// Controller is ready to emit; reply to `!B`.
    pub const XRAY: char = 'X';
    /// Host confirmation to actually start emission.
    pub const CONTINUE: char = 'C';
    /// Emission in progress.
    pub const PROCESSING: char = 'P';
    /// Exposure complete.
    pub const COMPLETE: char = 'S';
    /// Host abort; valid at any point in the sequence.
    pub const ABORT: char = 'A';
}

/// Hardware-driven interlock state; queried, never set from here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Ready,
    DoorOpen,
    WarmingUp,
}

impl SourceState {
    /// Parse the value part of a `?S` reply (`R` / `D` / `W`).
    pub(crate) fn parse(reply: &str) -> Option<Self> {
        match reply {
            "R" => Some(Self::Ready),
            "D" => Some(Self::DoorOpen),
            "W" => Some(Self::WarmingUp),
            _ => None,
        }
    }
}

/// Control mode; remote mode is required before any `!` command sticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceMode {
    Remote,
    FrontPanel,
}

impl SourceMode {
    /// Parse the value part of a `?M` reply (`R` / `F`).
    pub(crate) fn parse(reply: &str) -> Option<Self> {
        match reply {
            "R" => Some(Self::Remote),
            "F" => Some(Self::FrontPanel),
            _ => None,
        }
    }
}

/// Position in the fire handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FireState {
    #[default]
    Idle,
    /// `!B` sent, waiting for the controller's `X`.
    AwaitingXAck,
    /// `C` sent, waiting for `P`.
    AwaitingProcessingAck,
    /// Emission running, waiting for `S`.
    AwaitingComplete,
}
