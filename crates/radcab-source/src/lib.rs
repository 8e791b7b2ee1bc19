//! radcab-source — serial driver for the cabinet's X-ray source controller.
//!
//! The source speaks a short ASCII mnemonic protocol at 9600-8-N-1. Most
//! commands echo themselves followed by a value and a CR; the fire
//! handshake instead exchanges single unterminated characters. Emission is
//! only ever started through the multi-step fire sequence, and every error
//! path ends in the unconditional single-character abort.

pub mod controller;
pub mod protocol;

pub use controller::{SourceController, SourceError};
pub use protocol::{FireState, SourceMode, SourceState};
