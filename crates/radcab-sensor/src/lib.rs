//! radcab-sensor — USB driver for the cabinet's flat-panel area sensor.
//!
//! Covers the reverse-engineered command protocol (opcode/payload exchanges
//! on the command endpoints), the captured initialization handshake, and
//! the streaming capture engine that reassembles frames out of bulk
//! completions interleaved with in-band sync markers.

pub mod capture;
pub mod command;
pub mod frame;
pub mod proto;
pub mod session;
pub mod variant;

pub use capture::{CaptureEngine, CaptureError, CaptureOptions, DropPolicy};
pub use command::{CommandChannel, CommandError};
pub use frame::RawFrame;
pub use session::{DeviceIdentity, DeviceSession, SessionError, TriggerMode};
pub use variant::{Geometry, SensorVariant};
