//! Device discovery, the captured initialization handshake, and the
//! query/mutate surface of the sensor.
//!
//! Initialization replays a fixed, ordered script of command exchanges
//! recorded from a known-good session, asserting every response
//! byte-for-byte. Only the geometry-bearing steps differ between the two
//! sensor variants; everything else validates against the same constants
//! regardless of model, and a test pins that property.

use crate::capture::{CaptureEngine, CaptureOptions};
use crate::command::{CommandChannel, CommandError};
use crate::proto::op;
use crate::variant::{self, Geometry, SensorVariant};
use nusb::Interface;
use std::time::Duration;
use thiserror::Error;

/// Exposure programmed during the init script, re-settable afterwards.
pub const DEFAULT_EXPOSURE_MS: u32 = 500;

/// Inclusive exposure range the device accepts. Below 30 the write is
/// rejected; above 2000 the firmware silently clamps, so we refuse to send
/// rather than rely on the clamp.
pub const EXPOSURE_MS_MIN: u32 = 30;
pub const EXPOSURE_MS_MAX: u32 = 2000;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no supported sensor attached")]
    DeviceNotFound,
    #[error("initialization failed at step {step}: {source}")]
    InitFailed {
        step: &'static str,
        source: CommandError,
    },
    #[error("exposure {0} ms out of range [{EXPOSURE_MS_MIN}, {EXPOSURE_MS_MAX}]")]
    ExposureOutOfRange(u32),
    #[error("unsupported sensor geometry {width}x{height}")]
    UnsupportedGeometry { width: u16, height: u16 },
    #[error("malformed {what} response: {bytes:02X?}")]
    MalformedResponse { what: &'static str, bytes: Vec<u8> },
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("usb: {0}")]
    Usb(#[from] std::io::Error),
}

/// Identity block: four fixed-width ASCII fields, NUL-padded on the wire.
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    pub vendor: String,
    pub model: String,
    pub firmware: String,
    pub serial: String,
}

impl DeviceIdentity {
    const BLOCK_LEN: usize = 128;
    const FIELD_LEN: usize = 32;

    /// Parse the 128-byte info block (fields at 0x00/0x20/0x40/0x60).
    pub fn parse(block: &[u8]) -> Result<Self, SessionError> {
        if block.len() != Self::BLOCK_LEN {
            return Err(SessionError::MalformedResponse {
                what: "identity",
                bytes: block.to_vec(),
            });
        }
        let field = |idx: usize| -> String {
            let raw = &block[idx * Self::FIELD_LEN..(idx + 1) * Self::FIELD_LEN];
            String::from_utf8_lossy(raw)
                .trim_end_matches('\0')
                .to_string()
        };
        Ok(Self {
            vendor: field(0),
            model: field(1),
            firmware: field(2),
            serial: field(3),
        })
    }
}

/// Capture trigger source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    /// Free-running exposure timed by the sensor itself.
    Internal = 0x01,
    /// Exposure gated by the external sync input.
    External = 0x05,
}

/// An open, initialized sensor.
pub struct DeviceSession {
    pub(crate) channel: CommandChannel,
    pub(crate) interface: Interface,
    pub(crate) variant: &'static SensorVariant,
}

impl DeviceSession {
    /// Enumerate USB devices, claim the first supported sensor, and run the
    /// initialization handshake.
    pub async fn open() -> Result<Self, SessionError> {
        let mut found = None;
        for info in nusb::list_devices()? {
            if let Some(v) = variant::lookup(info.vendor_id(), info.product_id()) {
                found = Some((info, v));
                break;
            }
        }
        let (info, variant) = found.ok_or(SessionError::DeviceNotFound)?;
        tracing::info!(
            model = %variant.device.model,
            bus = info.bus_number(),
            addr = info.device_address(),
            "found sensor"
        );

        let device = info.open()?;
        device.reset()?;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let interface = device.detach_and_claim_interface(0)?;

        let mut session = Self {
            channel: CommandChannel::new(interface.clone()),
            interface,
            variant,
        };
        session.initialize(DEFAULT_EXPOSURE_MS).await?;
        Ok(session)
    }

    /// Replay the captured handshake. Any mismatch is fatal and names the
    /// failing step.
    async fn initialize(&mut self, exposure_ms: u32) -> Result<(), SessionError> {
        let script = init_script(self.variant.geometry, exposure_ms);
        tracing::debug!(steps = script.len(), "running init script");
        for step in &script {
            match &step.expect {
                Expect::Bytes(expected) => {
                    self.channel
                        .validate(step.label, step.opcode, &step.payload, expected)
                        .await
                        .map_err(|source| SessionError::InitFailed {
                            step: step.label,
                            source,
                        })?;
                }
                Expect::InfoBlock => {
                    let block = self
                        .channel
                        .execute(step.opcode, &step.payload)
                        .await
                        .map_err(|source| SessionError::InitFailed {
                            step: step.label,
                            source,
                        })?;
                    let identity = DeviceIdentity::parse(&block)?;
                    tracing::info!(
                        vendor = %identity.vendor,
                        model = %identity.model,
                        firmware = %identity.firmware,
                        serial = %identity.serial,
                        "sensor identity"
                    );
                }
            }
        }
        tracing::info!("sensor initialized");
        Ok(())
    }

    /// Variant table the session was opened against.
    pub fn variant(&self) -> &'static SensorVariant {
        self.variant
    }

    /// Query and parse the identity block.
    pub async fn identity(&mut self) -> Result<DeviceIdentity, SessionError> {
        let block = self.channel.execute(op::GET_INFO, &[]).await?;
        DeviceIdentity::parse(&block)
    }

    /// Query sensor geometry and assert it is one of the supported pairs.
    pub async fn geometry(&mut self) -> Result<Geometry, SessionError> {
        let resp = self.channel.execute(op::GET_CAPS, &[]).await?;
        if resp.len() < 12 {
            return Err(SessionError::MalformedResponse {
                what: "capabilities",
                bytes: resp,
            });
        }
        let width = u16::from_be_bytes([resp[6], resp[7]]);
        let height = u16::from_be_bytes([resp[10], resp[11]]);
        if variant::for_geometry(width, height).is_none() {
            return Err(SessionError::UnsupportedGeometry { width, height });
        }
        let geometry = Geometry { width, height };
        if geometry != self.variant.geometry {
            tracing::warn!(
                reported = ?geometry,
                expected = ?self.variant.geometry,
                "geometry differs from the variant matched at discovery"
            );
        }
        Ok(geometry)
    }

    /// Current exposure in milliseconds.
    pub async fn exposure_ms(&mut self) -> Result<u32, SessionError> {
        let resp = self.channel.execute(op::GET_EXPOSURE, &[]).await?;
        let bytes: [u8; 4] = resp
            .as_slice()
            .try_into()
            .map_err(|_| SessionError::MalformedResponse {
                what: "exposure",
                bytes: resp.clone(),
            })?;
        Ok(u32::from_be_bytes(bytes))
    }

    /// Program the exposure. Out-of-range values are rejected before any
    /// write; a readback mismatch is a soft warning only, since the
    /// firmware does not echo reliably.
    pub async fn set_exposure_ms(&mut self, ms: u32) -> Result<(), SessionError> {
        check_exposure_ms(ms)?;
        self.channel
            .validate("exposure-set", op::SET_EXPOSURE, &ms.to_be_bytes(), &[0x01])
            .await?;
        let reported = self.exposure_ms().await?;
        if reported != ms {
            tracing::warn!(requested = ms, reported, "exposure readback mismatch");
        }
        // Without the commit the device keeps exposing with the old value.
        self.channel
            .validate("exposure-commit", op::COMMIT, &[0x01], &[0x01])
            .await?;
        Ok(())
    }

    /// Programmed region of interest (full-sensor for both variants).
    pub async fn roi(&mut self) -> Result<(u16, u16), SessionError> {
        let resp = self.channel.execute(op::GET_ROI, &[]).await?;
        if resp.len() != 8 {
            return Err(SessionError::MalformedResponse {
                what: "roi",
                bytes: resp,
            });
        }
        let width = u16::from_be_bytes([resp[2], resp[3]]);
        let height = u16::from_be_bytes([resp[6], resp[7]]);
        Ok((width, height))
    }

    pub async fn set_roi(&mut self, width: u16, height: u16) -> Result<(), SessionError> {
        self.channel
            .validate(
                "roi-program",
                op::SET_ROI,
                &roi_payload(width, height),
                &[0x01],
            )
            .await?;
        Ok(())
    }

    /// Select the capture trigger source.
    pub async fn trigger(&mut self, mode: TriggerMode) -> Result<(), SessionError> {
        self.channel
            .validate("trigger", op::TRIGGER, &[0x00, mode as u8], &[0x00])
            .await?;
        Ok(())
    }

    /// Commit pending configuration and arm the next exposure.
    pub async fn force_trigger(&mut self) -> Result<(), SessionError> {
        self.channel
            .validate("force-trigger", op::COMMIT, &[0x01], &[0x01])
            .await?;
        Ok(())
    }

    /// Borrow the session exclusively into a single-use capture engine.
    pub fn capture_engine(&mut self, options: CaptureOptions) -> CaptureEngine<'_> {
        CaptureEngine::new(self, options)
    }
}

/// Range check shared by `set_exposure_ms` and callers that want to fail
/// early, before a device is even open.
pub fn check_exposure_ms(ms: u32) -> Result<(), SessionError> {
    if !(EXPOSURE_MS_MIN..=EXPOSURE_MS_MAX).contains(&ms) {
        return Err(SessionError::ExposureOutOfRange(ms));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Init script
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq)]
pub(crate) enum Expect {
    /// Response must equal these bytes exactly.
    Bytes(Vec<u8>),
    /// Response is the 128-byte identity block; parsed, not byte-compared.
    InfoBlock,
}

#[derive(Debug, PartialEq)]
pub(crate) struct InitStep {
    pub label: &'static str,
    pub opcode: u32,
    pub payload: Vec<u8>,
    pub expect: Expect,
}

impl InitStep {
    fn validate(label: &'static str, opcode: u32, payload: &[u8], expect: &[u8]) -> Self {
        Self {
            label,
            opcode,
            payload: payload.to_vec(),
            expect: Expect::Bytes(expect.to_vec()),
        }
    }
}

fn roi_payload(width: u16, height: u16) -> Vec<u8> {
    let mut p = vec![0x00, 0x01, 0x00, 0x00, 0x00, 0x00];
    p.extend_from_slice(&width.to_be_bytes());
    p.extend_from_slice(&height.to_be_bytes());
    p
}

fn roi_readback(g: Geometry) -> Vec<u8> {
    let mut r = Vec::with_capacity(8);
    r.extend_from_slice(&(g.width as u32).to_be_bytes());
    r.extend_from_slice(&(g.height as u32).to_be_bytes());
    r
}

fn caps_readback(g: Geometry) -> Vec<u8> {
    let mut r = vec![0x00, 0x00, 0x00, 0x14];
    r.extend_from_slice(&(g.width as u32).to_be_bytes());
    r.extend_from_slice(&(g.height as u32).to_be_bytes());
    r.extend_from_slice(&[0x00, 0x00, 0x00, 0x10]); // bits per sample
    r.extend_from_slice(&[0x00, 0x00, 0x00, 0x01]);
    r
}

/// Build the full captured handshake for a given geometry and exposure.
///
/// Every response below is a constant lifted from a known-good traffic
/// recording; only the geometry-bearing steps vary per variant.
pub(crate) fn init_script(g: Geometry, exposure_ms: u32) -> Vec<InitStep> {
    // Opaque readbacks with stable values across both sensor models.
    const STATUS_24: [u8; 12] = [
        0x00, 0x00, 0x00, 0x06, 0x00, 0x00, 0x00, 0x20, 0x00, 0x00, 0x00, 0x03,
    ];
    const CAL_0: [u8; 8] = [0x3F, 0x9E, 0xB8, 0x51, 0xEB, 0x85, 0x1E, 0xB8];
    const CAL_1: [u8; 8] = [0x40, 0x34, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
    const CAL_2: [u8; 8] = [0x3F, 0x50, 0x62, 0x4D, 0xD2, 0xF1, 0xA9, 0xFC];
    const CAL_3: [u8; 8] = [0x00; 8];

    let exp = exposure_ms.to_be_bytes();
    let roi = roi_payload(g.width, g.height);

    let mut script = vec![
        // The device acks the first two pings identically at power-on.
        InitStep::validate("ping", op::PING, &[], &[0x01]),
        InitStep::validate("ping-2", op::PING, &[], &[0x01]),
        InitStep {
            label: "identity",
            opcode: op::GET_INFO,
            payload: Vec::new(),
            expect: Expect::InfoBlock,
        },
        InitStep::validate("capabilities", op::GET_CAPS, &[], &caps_readback(g)),
        InitStep::validate("status-24", op::STATUS_24, &[], &STATUS_24),
        InitStep::validate("status-2A", op::STATUS_2A, &[], &[0x00]),
        InitStep::validate("status-39", op::STATUS_39, &[], &[0x00]),
        InitStep::validate("status-3A", op::STATUS_3A, &[], &[0x00]),
        InitStep::validate("status-3B", op::STATUS_3B, &[], &[0x00]),
        InitStep::validate("status-3C", op::STATUS_3C, &[], &[0x00]),
        InitStep::validate("status-3D", op::STATUS_3D, &[], &[0x00]),
        InitStep::validate("status-4A", op::STATUS_4A, &[], &[0x00]),
        InitStep::validate("status-4F", op::STATUS_4F, &[], &[0x00]),
        InitStep::validate("status-23", op::STATUS_23, &[], &[0x01]),
        InitStep::validate("status-29", op::STATUS_29, &[], &[0x00]),
        InitStep::validate("roi-program", op::SET_ROI, &roi, &[0x01]),
        InitStep::validate("roi-readback", op::GET_ROI, &[], &roi_readback(g)),
        InitStep::validate("reg-02", op::REG_WRITE, &[0x00, 0x00, 0x00, 0x02], &[0x00]),
        InitStep::validate("reg-12", op::REG_WRITE, &[0x00, 0x00, 0x00, 0x12], &[0x00]),
        InitStep::validate("reg-18", op::REG_WRITE, &[0x00, 0x00, 0x00, 0x18], &[0x00]),
        InitStep::validate("cal-0", op::GET_CAL, &[0x00, 0x00, 0x00, 0x00], &CAL_0),
        InitStep::validate("cal-1", op::GET_CAL, &[0x00, 0x00, 0x00, 0x01], &CAL_1),
        InitStep::validate("cal-2", op::GET_CAL, &[0x00, 0x00, 0x00, 0x02], &CAL_2),
        InitStep::validate("cal-3", op::GET_CAL, &[0x00, 0x00, 0x00, 0x03], &CAL_3),
    ];

    // Two exposure/trigger cycles, exactly as captured. The second cycle is
    // what actually latches the exposure in firmware.
    for _ in 0..2 {
        script.push(InitStep::validate(
            "exposure-set",
            op::SET_EXPOSURE,
            &exp,
            &[0x01],
        ));
        script.push(InitStep::validate(
            "exposure-readback",
            op::GET_EXPOSURE,
            &[],
            &exp,
        ));
        script.push(InitStep::validate(
            "trigger-internal",
            op::TRIGGER,
            &[0x00, TriggerMode::Internal as u8],
            &[0x00],
        ));
        script.push(InitStep::validate(
            "reg-12-rearm",
            op::REG_WRITE,
            &[0x00, 0x00, 0x00, 0x12],
            &[0x00],
        ));
        script.push(InitStep::validate(
            "reg-02-rearm",
            op::REG_WRITE,
            &[0x00, 0x00, 0x00, 0x02],
            &[0x00],
        ));
    }

    script.push(InitStep::validate(
        "roi-confirm",
        op::SET_ROI,
        &roi,
        &[0x01],
    ));
    script.push(InitStep::validate(
        "roi-confirm-readback",
        op::GET_ROI,
        &[],
        &roi_readback(g),
    ));
    script.push(InitStep::validate("commit", op::COMMIT, &[0x01], &[0x01]));
    script
}
