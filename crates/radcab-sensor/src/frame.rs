//! Captured frame type and payload split/encode helpers.

use crate::variant::Geometry;

/// One complete captured frame: pixel payload, trailer, and the status and
/// counter words the device reported at the END marker.
#[derive(Clone)]
pub struct RawFrame {
    /// Row-major pixel payload, width*height u16 little-endian samples.
    data: Vec<u8>,
    width: u16,
    height: u16,
    /// Opaque firmware-reported word following the payload. Looks like a
    /// running average in captures, but that was never confirmed; treated
    /// as opaque on purpose.
    pub trailer: u16,
    /// Device-assigned frame counter; increments across captures.
    pub counter: u16,
    /// Status word from the END trailer.
    pub status: u16,
}

impl RawFrame {
    /// Split a fully accumulated stream buffer (payload + 2-byte trailer)
    /// into a frame.
    pub fn from_stream(
        geometry: Geometry,
        mut buf: Vec<u8>,
        status: u16,
        counter: u16,
    ) -> Result<Self, FrameError> {
        let expected = geometry.frame_bytes();
        if buf.len() != expected {
            return Err(FrameError::LengthMismatch {
                expected,
                actual: buf.len(),
            });
        }
        let trailer = u16::from_le_bytes([buf[expected - 2], buf[expected - 1]]);
        buf.truncate(geometry.payload_bytes());
        Ok(Self {
            data: buf,
            width: geometry.width,
            height: geometry.height,
            trailer,
            counter,
            status,
        })
    }

    pub fn width(&self) -> u16 {
        self.width
    }

    pub fn height(&self) -> u16 {
        self.height
    }

    /// Pixel payload bytes as received on the wire.
    pub fn payload(&self) -> &[u8] {
        &self.data
    }

    /// Sample at (x, y). Panics on out-of-range coordinates.
    pub fn sample(&self, x: u16, y: u16) -> u16 {
        assert!(x < self.width && y < self.height);
        let idx = (y as usize * self.width as usize + x as usize) * Geometry::DEPTH;
        u16::from_le_bytes([self.data[idx], self.data[idx + 1]])
    }

    /// Iterator over all samples in row-major order.
    pub fn samples(&self) -> impl Iterator<Item = u16> + '_ {
        self.data
            .chunks_exact(Geometry::DEPTH)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
    }

    /// Mean sample value; handy next to the trailer when eyeballing
    /// whether the "running average" guess holds up.
    pub fn mean_sample(&self) -> f64 {
        if self.data.is_empty() {
            return 0.0;
        }
        let sum: u64 = self.samples().map(u64::from).sum();
        sum as f64 / (self.data.len() / Geometry::DEPTH) as f64
    }

    /// Re-encode payload + trailer exactly as they arrived on the wire.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.data.len() + 2);
        out.extend_from_slice(&self.data);
        out.extend_from_slice(&self.trailer.to_le_bytes());
        out
    }
}

impl std::fmt::Debug for RawFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("counter", &self.counter)
            .field("status", &self.status)
            .field("trailer", &self.trailer)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_geometry() -> Geometry {
        // Test-only geometry; real sizes are asserted in session/variant.
        Geometry {
            width: 4,
            height: 2,
        }
    }

    fn sample_stream() -> Vec<u8> {
        let mut buf = Vec::new();
        for s in 0u16..8 {
            buf.extend_from_slice(&(s * 100).to_le_bytes());
        }
        buf.extend_from_slice(&0x0123u16.to_le_bytes()); // trailer
        buf
    }

    #[test]
    fn split_and_roundtrip_is_byte_exact() {
        let stream = sample_stream();
        let frame = RawFrame::from_stream(tiny_geometry(), stream.clone(), 1, 7).unwrap();
        assert_eq!(frame.trailer, 0x0123);
        assert_eq!(frame.counter, 7);
        assert_eq!(frame.payload().len(), 16);
        assert_eq!(frame.encode(), stream);

        // Re-parsing the encoding reproduces every sample.
        let again = RawFrame::from_stream(tiny_geometry(), frame.encode(), 1, 7).unwrap();
        assert!(frame.samples().eq(again.samples()));
    }

    #[test]
    fn sample_access_is_row_major_little_endian() {
        let frame = RawFrame::from_stream(tiny_geometry(), sample_stream(), 1, 0).unwrap();
        assert_eq!(frame.sample(0, 0), 0);
        assert_eq!(frame.sample(3, 0), 300);
        assert_eq!(frame.sample(0, 1), 400);
        assert_eq!(frame.sample(3, 1), 700);
    }

    #[test]
    fn mean_sample_matches_hand_computation() {
        let frame = RawFrame::from_stream(tiny_geometry(), sample_stream(), 1, 0).unwrap();
        assert_eq!(frame.mean_sample(), 350.0);
    }

    #[test]
    fn wrong_length_is_rejected() {
        let mut stream = sample_stream();
        stream.pop();
        let err = RawFrame::from_stream(tiny_geometry(), stream, 1, 0).unwrap_err();
        assert!(matches!(
            err,
            FrameError::LengthMismatch {
                expected: 18,
                actual: 17
            }
        ));
    }
}
