//! Sensor variant database.
//!
//! Maps USB VID:PID to everything that differs between the two supported
//! sensors: geometry, stream chunking, and the status codes the firmware
//! reports. Variant files are embedded at compile time from
//! `contrib/sensors/*.toml`, so supporting another sensor of the same
//! family is a data change, not a code change.

use serde::Deserialize;
use std::sync::OnceLock;

const VARIANT_0661_A802: &str = include_str!("../../../contrib/sensors/0661-a802.toml");
const VARIANT_0661_A800: &str = include_str!("../../../contrib/sensors/0661-a800.toml");

static VARIANT_DB: OnceLock<Vec<SensorVariant>> = OnceLock::new();

/// Top-level variant file structure (one per `contrib/sensors/*.toml`).
#[derive(Debug, Clone, Deserialize)]
pub struct SensorVariant {
    pub device: DeviceIds,
    pub geometry: Geometry,
    pub stream: StreamLayout,
}

/// USB identification fields from the `[device]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceIds {
    pub vendor_id: u16,
    pub product_id: u16,
    pub model: String,
}

/// Sensor pixel geometry. Depth is 2 bytes/pixel for both variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Geometry {
    pub width: u16,
    pub height: u16,
}

impl Geometry {
    /// Bytes per pixel, fixed across the family.
    pub const DEPTH: usize = 2;

    /// Pixel payload size in bytes.
    pub fn payload_bytes(&self) -> usize {
        self.width as usize * self.height as usize * Self::DEPTH
    }

    /// Payload plus the 2-byte frame trailer.
    pub fn frame_bytes(&self) -> usize {
        self.payload_bytes() + 2
    }
}

/// Streaming-endpoint chunking from the `[stream]` section.
///
/// The per-slot size exceptions are firmware behavior observed in traffic
/// captures, not a policy of ours.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamLayout {
    /// Number of transfers kept in flight at frame start.
    pub pool_slots: usize,
    /// Default bulk read length.
    pub chunk_bytes: usize,
    /// (slot index, length) exceptions for the initial pool submission.
    #[serde(default)]
    pub slot_overrides: Vec<(usize, usize)>,
    /// Frame status words that mean a good exposure.
    pub ok_status: Vec<u16>,
}

impl StreamLayout {
    /// Transfer length for the initial submission at pool index `slot`.
    pub fn slot_len(&self, slot: usize) -> usize {
        self.slot_overrides
            .iter()
            .find(|(idx, _)| *idx == slot)
            .map(|(_, len)| *len)
            .unwrap_or(self.chunk_bytes)
    }

    /// Whether a frame status word is a known-good code.
    pub fn status_ok(&self, status: u16) -> bool {
        self.ok_status.contains(&status)
    }
}

fn variant_db() -> &'static Vec<SensorVariant> {
    VARIANT_DB.get_or_init(|| {
        let mut db = Vec::new();
        for src in [VARIANT_0661_A802, VARIANT_0661_A800] {
            match toml::from_str::<SensorVariant>(src) {
                Ok(v) => db.push(v),
                Err(e) => eprintln!("radcab-sensor: bad variant TOML: {e}"),
            }
        }
        db
    })
}

/// Look up a variant by USB vendor:product ID.
/// Returns a `'static` reference into the embedded database.
pub fn lookup(vid: u16, pid: u16) -> Option<&'static SensorVariant> {
    variant_db()
        .iter()
        .find(|v| v.device.vendor_id == vid && v.device.product_id == pid)
}

/// Look up a variant by reported pixel geometry.
pub fn for_geometry(width: u16, height: u16) -> Option<&'static SensorVariant> {
    variant_db()
        .iter()
        .find(|v| v.geometry.width == width && v.geometry.height == height)
}

/// All known variants.
pub fn all() -> &'static [SensorVariant] {
    variant_db()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_variants_parse() {
        assert_eq!(all().len(), 2);
    }

    #[test]
    fn lookup_by_usb_ids() {
        let a = lookup(0x0661, 0xA802).unwrap();
        assert_eq!(a.device.model, "C9730DK-11");
        assert_eq!((a.geometry.width, a.geometry.height), (1032, 1032));

        let b = lookup(0x0661, 0xA800).unwrap();
        assert_eq!(b.device.model, "C7942CA-22");
        assert_eq!((b.geometry.width, b.geometry.height), (2368, 2340));

        assert!(lookup(0x0661, 0xBEEF).is_none());
    }

    #[test]
    fn geometry_sizes() {
        let g = Geometry {
            width: 1032,
            height: 1032,
        };
        assert_eq!(g.payload_bytes(), 1032 * 1032 * 2);
        assert_eq!(g.frame_bytes(), 1032 * 1032 * 2 + 2);
    }

    #[test]
    fn slot_overrides_apply_only_to_named_slots() {
        let layout = &lookup(0x0661, 0xA802).unwrap().stream;
        assert_eq!(layout.slot_len(0), 16384);
        assert_eq!(layout.slot_len(1), 3584);
        assert_eq!(layout.slot_len(2), 16384);
        assert_eq!(layout.slot_len(31), 12800);
    }

    #[test]
    fn status_tables_differ_per_variant() {
        let a = &lookup(0x0661, 0xA802).unwrap().stream;
        let b = &lookup(0x0661, 0xA800).unwrap().stream;
        assert!(a.status_ok(0x0001) && a.status_ok(0x0002));
        assert!(!a.status_ok(0x0003));
        assert!(b.status_ok(0x0001) && b.status_ok(0x0003));
        assert!(!b.status_ok(0x0002));
    }

    #[test]
    fn supported_geometries_resolve() {
        assert!(for_geometry(1032, 1032).is_some());
        assert!(for_geometry(2368, 2340).is_some());
        assert!(for_geometry(1024, 1024).is_none());
    }
}
