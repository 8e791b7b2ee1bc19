//! Wire-level constants and helpers for the sensor's USB protocol.
//!
//! Everything here was reverse-engineered from bulk traffic captures of the
//! vendor acquisition tool; opcodes whose meaning is not understood keep
//! their raw number in the name.

/// Bulk-out endpoint for command writes.
pub const EP_CMD_OUT: u8 = 0x01;
/// Bulk-in endpoint for command responses.
pub const EP_CMD_IN: u8 = 0x83;
/// Bulk-in endpoint carrying the pixel stream.
pub const EP_STREAM_IN: u8 = 0x82;

/// Maximum length of a single command response read.
pub const CMD_RESPONSE_LEN: usize = 512;

/// Length of the small reads used to hunt for frame-boundary markers.
pub const SYNC_READ_LEN: usize = 512;

/// Command opcodes, written big-endian on the wire.
pub mod op {
    pub const PING: u32 = 0x00;
    pub const GET_INFO: u32 = 0x01;
    pub const GET_CAPS: u32 = 0x02;
    pub const GET_ROI: u32 = 0x04;
    pub const SET_ROI: u32 = 0x09;
    pub const COMMIT: u32 = 0x0E;
    pub const GET_EXPOSURE: u32 = 0x1F;
    pub const SET_EXPOSURE: u32 = 0x20;
    pub const GET_CAL: u32 = 0x21;
    pub const STATUS_23: u32 = 0x23;
    pub const STATUS_24: u32 = 0x24;
    pub const STATUS_29: u32 = 0x29;
    pub const STATUS_2A: u32 = 0x2A;
    /// Write-only: the device answers on the streaming endpoint with an
    /// ABORTED marker instead of a command response.
    pub const ABORT_STREAM: u32 = 0x2C;
    pub const TRIGGER: u32 = 0x2D;
    pub const REG_WRITE: u32 = 0x2E;
    pub const STATUS_39: u32 = 0x39;
    pub const STATUS_3A: u32 = 0x3A;
    pub const STATUS_3B: u32 = 0x3B;
    pub const STATUS_3C: u32 = 0x3C;
    pub const STATUS_3D: u32 = 0x3D;
    pub const STATUS_4A: u32 = 0x4A;
    pub const STATUS_4F: u32 = 0x4F;
}

/// Pixel samples never reach this value; any 16-bit word at or above it
/// embedded in the stream is a framing word, not image data. The entire
/// reassembly algorithm rests on this invariant.
pub const MARKER_FLOOR: u16 = 0x4000;

/// In-band frame-boundary markers on the streaming endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMarker {
    /// Start of a frame's pixel payload.
    Begin,
    /// End of frame; followed by a 4-byte status + counter trailer.
    End,
    /// Mid-stream corruption signal; the frame in progress is unusable.
    Error,
    /// Acknowledgement of an abort-stream command.
    Aborted,
}

impl SyncMarker {
    pub const BEGIN: u16 = 0x8002;
    pub const END: u16 = 0x8004;
    pub const ERROR: u16 = 0x8005;
    pub const ABORTED: u16 = 0x8001;

    pub fn word(self) -> u16 {
        match self {
            SyncMarker::Begin => Self::BEGIN,
            SyncMarker::End => Self::END,
            SyncMarker::Error => Self::ERROR,
            SyncMarker::Aborted => Self::ABORTED,
        }
    }
}

/// Classification of the leading 16-bit word of a stream buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamWord {
    /// Ordinary pixel data (< [`MARKER_FLOOR`]).
    Pixel(u16),
    /// A recognized framing marker.
    Marker(SyncMarker),
    /// In marker range but not a value we know; protocol drift.
    Unknown(u16),
}

/// Classify a little-endian 16-bit stream word.
pub fn classify_word(word: u16) -> StreamWord {
    if word < MARKER_FLOOR {
        return StreamWord::Pixel(word);
    }
    match word {
        SyncMarker::BEGIN => StreamWord::Marker(SyncMarker::Begin),
        SyncMarker::END => StreamWord::Marker(SyncMarker::End),
        SyncMarker::ERROR => StreamWord::Marker(SyncMarker::Error),
        SyncMarker::ABORTED => StreamWord::Marker(SyncMarker::Aborted),
        other => StreamWord::Unknown(other),
    }
}

/// First little-endian 16-bit word of a buffer, if it holds one.
pub fn first_word(buf: &[u8]) -> Option<u16> {
    if buf.len() < 2 {
        return None;
    }
    Some(u16::from_le_bytes([buf[0], buf[1]]))
}

/// Encode a command for the wire: `opcode:u32-be | len:u32-be | payload`,
/// written as a single bulk transfer.
pub fn encode_command(opcode: u32, payload: &[u8]) -> Vec<u8> {
    let mut wire = Vec::with_capacity(8 + payload.len());
    wire.extend_from_slice(&opcode.to_be_bytes());
    wire.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    wire.extend_from_slice(payload);
    wire
}

/// Parse the 4-byte trailer following an END marker into (status, counter).
///
/// `buf` is the whole END read, marker word included.
pub fn parse_end_trailer(buf: &[u8]) -> Option<(u16, u16)> {
    if buf.len() < 6 {
        return None;
    }
    let status = u16::from_le_bytes([buf[2], buf[3]]);
    let counter = u16::from_le_bytes([buf[4], buf[5]]);
    Some((status, counter))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markers_classify_exactly() {
        assert_eq!(
            classify_word(SyncMarker::BEGIN),
            StreamWord::Marker(SyncMarker::Begin)
        );
        assert_eq!(
            classify_word(SyncMarker::END),
            StreamWord::Marker(SyncMarker::End)
        );
        assert_eq!(
            classify_word(SyncMarker::ERROR),
            StreamWord::Marker(SyncMarker::Error)
        );
        assert_eq!(
            classify_word(SyncMarker::ABORTED),
            StreamWord::Marker(SyncMarker::Aborted)
        );
    }

    #[test]
    fn pixels_are_never_markers() {
        // Exhaustive over the entire pixel range.
        for word in 0..MARKER_FLOOR {
            assert_eq!(classify_word(word), StreamWord::Pixel(word));
        }
    }

    #[test]
    fn unknown_marker_range_is_flagged() {
        assert_eq!(classify_word(0x4000), StreamWord::Unknown(0x4000));
        assert_eq!(classify_word(0x8003), StreamWord::Unknown(0x8003));
        assert_eq!(classify_word(0xFFFF), StreamWord::Unknown(0xFFFF));
    }

    #[test]
    fn command_encoding_matches_captured_wire_bytes() {
        // Exposure set to 500 ms, as seen in the traffic capture.
        assert_eq!(
            encode_command(op::SET_EXPOSURE, &500u32.to_be_bytes()),
            [0x00, 0x00, 0x00, 0x20, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x01, 0xF4]
        );
        // Zero-payload query.
        assert_eq!(
            encode_command(op::GET_EXPOSURE, &[]),
            [0x00, 0x00, 0x00, 0x1F, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn end_trailer_parses_status_and_counter() {
        let buf = [0x04, 0x80, 0x01, 0x00, 0x2A, 0x00];
        assert_eq!(first_word(&buf), Some(SyncMarker::END));
        assert_eq!(parse_end_trailer(&buf), Some((0x0001, 0x002A)));
        assert_eq!(parse_end_trailer(&buf[..4]), None);
    }

    #[test]
    fn short_buffers_have_no_word() {
        assert_eq!(first_word(&[]), None);
        assert_eq!(first_word(&[0x01]), None);
    }
}
