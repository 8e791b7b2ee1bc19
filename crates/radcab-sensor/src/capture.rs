//! Streaming capture: frame-sync state machine, transfer pool, reassembly.
//!
//! The streaming endpoint carries raw little-endian u16 pixel samples,
//! interleaved only at frame boundaries with the sync markers defined in
//! [`crate::proto`]. Reassembly is a pure state machine fed completion
//! buffers one at a time; the engine maps its outcomes onto a pool of
//! outstanding bulk-in transfers. Keeping those two apart is what makes
//! the sync logic testable without a device on the bus.
//!
//! A bug here produces silently corrupted radiographs rather than a crash,
//! so byte accounting and marker classification are enforced with hard
//! checks, not heuristics.

use crate::command::CommandError;
use crate::frame::{FrameError, RawFrame};
use crate::proto::{
    self, op, StreamWord, SyncMarker, EP_STREAM_IN, SYNC_READ_LEN,
};
use crate::session::DeviceSession;
use crate::variant::{Geometry, StreamLayout};
use nusb::transfer::RequestBuffer;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::time::timeout;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("frame capture timed out after {0:?}")]
    Timeout(Duration),
    #[error("stream cleanup failed: no ABORTED acknowledgement within {0:?}")]
    CleanupFailed(Duration),
    #[error("frame overran its target: {accumulated} bytes banked, target {target}")]
    Overrun { accumulated: usize, target: usize },
    #[error("usb transfer failed: {0}")]
    Transfer(nusb::transfer::TransferError),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// What to do when a completed frame reports a bad status word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DropPolicy {
    /// Drop the frame and return fewer than requested. Matches the
    /// behavior of later firmware tooling revisions.
    #[default]
    ReturnFewer,
    /// Keep capturing (up to 3x the requested count) until the full count
    /// of good frames is collected.
    Replace,
}

#[derive(Debug, Clone)]
pub struct CaptureOptions {
    /// Deadline for one frame, resyncs included.
    pub frame_timeout: Duration,
    /// How long to wait for the ABORTED acknowledgement during cleanup.
    pub abort_timeout: Duration,
    /// Event-loop slice between deadline checks.
    pub poll_slice: Duration,
    pub drop_policy: DropPolicy,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            frame_timeout: Duration::from_millis(2500),
            abort_timeout: Duration::from_secs(1),
            poll_slice: Duration::from_millis(100),
            drop_policy: DropPolicy::default(),
        }
    }
}

impl CaptureOptions {
    /// Frame deadline sized to the programmed exposure plus transfer margin.
    pub fn for_exposure_ms(exposure_ms: u32) -> Self {
        Self {
            frame_timeout: Duration::from_millis(u64::from(exposure_ms) + 500),
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Pure reassembly state machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    /// Hunting for a BEGIN marker between frames.
    AwaitingBegin,
    /// Banking pixel bytes until the frame target is reached.
    Accumulating,
    /// Frame full; expecting the END marker and its status trailer.
    AwaitingEnd,
    /// Unrecoverable; only reached on byte-accounting violations.
    Aborted,
}

/// Outcome of feeding one buffer into the assembler.
#[derive(Debug, PartialEq)]
pub(crate) enum Step {
    /// Nothing actionable (empty read, stray idle bytes). Keep reading.
    Pending,
    /// Bytes banked; `complete` once the whole frame is in.
    Progress { complete: bool },
    /// BEGIN marker mid-frame: partial accumulation dropped, a fresh frame
    /// has already started.
    Restarted,
    /// ERROR marker: partial accumulation dropped; wait for a new BEGIN.
    Resync,
    /// A marker that must not appear in this phase.
    Unexpected(u16),
    /// More bytes arrived than the frame can hold. Protocol violation.
    Overrun { accumulated: usize },
}

/// Outcome of the post-frame END read.
#[derive(Debug, PartialEq)]
pub(crate) enum EndStep {
    Done { status: u16, counter: u16 },
    Pending,
    /// ERROR at the frame boundary; the frame is unusable.
    Resync,
    Unexpected(u16),
}

pub(crate) struct Assembler {
    target: usize,
    buf: Vec<u8>,
    phase: Phase,
}

impl Assembler {
    pub(crate) fn new(target: usize) -> Self {
        Self {
            target,
            buf: Vec::with_capacity(target),
            phase: Phase::AwaitingBegin,
        }
    }

    pub(crate) fn phase(&self) -> Phase {
        self.phase
    }

    pub(crate) fn target(&self) -> usize {
        self.target
    }

    pub(crate) fn accumulated(&self) -> usize {
        self.buf.len()
    }

    fn bank(&mut self, bytes: &[u8]) -> Step {
        self.buf.extend_from_slice(bytes);
        if self.buf.len() > self.target {
            self.phase = Phase::Aborted;
            return Step::Overrun {
                accumulated: self.buf.len(),
            };
        }
        let complete = self.buf.len() == self.target;
        if complete {
            self.phase = Phase::AwaitingEnd;
        }
        Step::Progress { complete }
    }

    /// Feed a short idle read taken while hunting for frame start.
    pub(crate) fn on_sync_read(&mut self, bytes: &[u8]) -> Step {
        debug_assert_eq!(self.phase, Phase::AwaitingBegin);
        let Some(word) = proto::first_word(bytes) else {
            return Step::Pending;
        };
        match proto::classify_word(word) {
            StreamWord::Marker(SyncMarker::Begin) => {
                self.phase = Phase::Accumulating;
                // Anything after the marker word is already pixel data.
                self.bank(&bytes[2..])
            }
            StreamWord::Marker(SyncMarker::Error) => Step::Resync,
            StreamWord::Marker(m) => Step::Unexpected(m.word()),
            StreamWord::Unknown(w) => Step::Unexpected(w),
            // The device emits stray bytes while idle; discard them.
            StreamWord::Pixel(_) => Step::Pending,
        }
    }

    /// Feed one transfer completion while accumulating.
    pub(crate) fn on_chunk(&mut self, bytes: &[u8]) -> Step {
        debug_assert_eq!(self.phase, Phase::Accumulating);
        let Some(word) = proto::first_word(bytes) else {
            return Step::Pending;
        };
        match proto::classify_word(word) {
            StreamWord::Marker(SyncMarker::Begin) => {
                // The device gave up on the frame in progress and started
                // over; everything banked so far belongs to a dead frame.
                self.buf.clear();
                Step::Restarted
            }
            StreamWord::Marker(SyncMarker::Error) => {
                self.buf.clear();
                self.phase = Phase::AwaitingBegin;
                Step::Resync
            }
            StreamWord::Marker(m) => {
                self.buf.clear();
                self.phase = Phase::AwaitingBegin;
                Step::Unexpected(m.word())
            }
            StreamWord::Unknown(w) => {
                self.buf.clear();
                self.phase = Phase::AwaitingBegin;
                Step::Unexpected(w)
            }
            StreamWord::Pixel(_) => self.bank(bytes),
        }
    }

    /// Feed the small read expected to carry the END marker.
    pub(crate) fn on_end_read(&mut self, bytes: &[u8]) -> EndStep {
        debug_assert_eq!(self.phase, Phase::AwaitingEnd);
        let Some(word) = proto::first_word(bytes) else {
            return EndStep::Pending;
        };
        match proto::classify_word(word) {
            StreamWord::Marker(SyncMarker::End) => match proto::parse_end_trailer(bytes) {
                Some((status, counter)) => EndStep::Done { status, counter },
                // END without its trailer never occurs on real hardware.
                None => {
                    self.reset();
                    EndStep::Unexpected(word)
                }
            },
            StreamWord::Marker(SyncMarker::Error) => {
                self.reset();
                EndStep::Resync
            }
            _ => {
                self.reset();
                EndStep::Unexpected(word)
            }
        }
    }

    fn reset(&mut self) {
        self.buf.clear();
        self.phase = Phase::AwaitingBegin;
    }

    /// Hand over the accumulated frame bytes. Only valid once complete.
    pub(crate) fn take(self) -> Vec<u8> {
        assert_eq!(self.phase, Phase::AwaitingEnd);
        assert_eq!(self.buf.len(), self.target);
        self.buf
    }
}

// ---------------------------------------------------------------------------
// Transfer pool sizing
// ---------------------------------------------------------------------------

/// Per-slot transfer sizing and retire policy for one frame.
pub(crate) struct SlotPlan<'a> {
    layout: &'a StreamLayout,
    target: usize,
}

impl<'a> SlotPlan<'a> {
    pub(crate) fn new(layout: &'a StreamLayout, target: usize) -> Self {
        Self { layout, target }
    }

    /// Length for the initial submission at pool index `slot`, capped so
    /// the pool never promises more bytes than the frame holds. `promised`
    /// counts bytes already banked plus earlier pool submissions.
    pub(crate) fn initial_len(&self, slot: usize, promised: usize) -> Option<usize> {
        let remaining = self.target.saturating_sub(promised);
        if remaining == 0 {
            return None;
        }
        Some(self.layout.slot_len(slot).min(remaining))
    }

    /// Re-arm length for a completed slot, given bytes already banked and
    /// bytes still promised by other in-flight slots. `None` retires the
    /// slot: exactly enough transfers stay outstanding to finish the frame
    /// without overrunning its boundary.
    pub(crate) fn resubmit_len(&self, accumulated: usize, outstanding: usize) -> Option<usize> {
        let remaining = self.target.saturating_sub(accumulated + outstanding);
        if remaining == 0 {
            return None;
        }
        Some(self.layout.chunk_bytes.min(remaining))
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Single-use capture engine.
///
/// Holds the session (and with it the device handle and the transfer pool)
/// exclusively for the duration of one `capture` call; the call consumes
/// the engine, so a fresh instance is required per batch.
pub struct CaptureEngine<'a> {
    session: &'a mut DeviceSession,
    options: CaptureOptions,
}

impl<'a> CaptureEngine<'a> {
    pub(crate) fn new(session: &'a mut DeviceSession, options: CaptureOptions) -> Self {
        Self { session, options }
    }

    /// Collect up to `n` frames, then abort the stream and wait for the
    /// device's acknowledgement. Cleanup runs on fatal errors too; the
    /// device must never be left mid-stream for the next session.
    pub async fn capture(mut self, n: usize) -> Result<Vec<RawFrame>, CaptureError> {
        let run = self.run(n).await;
        let cleanup = self.abort_stream().await;
        match (run, cleanup) {
            (Ok(frames), Ok(())) => Ok(frames),
            (Err(e), cleanup) => {
                if let Err(c) = cleanup {
                    tracing::error!(error = %c, "cleanup after failed capture also failed");
                }
                Err(e)
            }
            (Ok(_), Err(c)) => Err(c),
        }
    }

    async fn run(&mut self, n: usize) -> Result<Vec<RawFrame>, CaptureError> {
        let geometry = self.session.variant.geometry;
        let max_attempts = match self.options.drop_policy {
            DropPolicy::ReturnFewer => n,
            DropPolicy::Replace => n.saturating_mul(3),
        };

        let mut frames = Vec::with_capacity(n);
        let mut last_counter: Option<u16> = None;
        let mut attempts = 0usize;
        while frames.len() < n && attempts < max_attempts {
            attempts += 1;
            if let Some(frame) = self.capture_one(geometry).await? {
                if let Some(prev) = last_counter {
                    if frame.counter < prev {
                        tracing::warn!(
                            prev,
                            counter = frame.counter,
                            "device frame counter went backwards"
                        );
                    }
                }
                last_counter = Some(frame.counter);
                tracing::debug!(
                    counter = frame.counter,
                    trailer = frame.trailer,
                    "frame captured"
                );
                frames.push(frame);
            }
        }
        if frames.len() < n {
            tracing::warn!(
                requested = n,
                captured = frames.len(),
                "returning fewer frames than requested"
            );
        }
        Ok(frames)
    }

    /// One full device capture cycle. `Ok(None)` is a frame dropped for a
    /// bad status word — recoverable, the batch continues.
    async fn capture_one(&mut self, geometry: Geometry) -> Result<Option<RawFrame>, CaptureError> {
        let target = geometry.frame_bytes();
        let deadline = Instant::now() + self.options.frame_timeout;
        let mut asm = Assembler::new(target);

        loop {
            match asm.phase() {
                Phase::AwaitingBegin => self.await_begin(&mut asm, deadline).await?,
                Phase::Accumulating => self.accumulate(&mut asm, deadline).await?,
                Phase::AwaitingEnd => match self.read_end(&mut asm, deadline).await? {
                    Some((status, counter)) => {
                        if !self.session.variant.stream.status_ok(status) {
                            tracing::warn!(status, counter, "dropping frame with bad status");
                            return Ok(None);
                        }
                        let frame = RawFrame::from_stream(geometry, asm.take(), status, counter)?;
                        return Ok(Some(frame));
                    }
                    // Frame lost at the boundary; resynchronize and retry
                    // within the same deadline.
                    None => asm = Assembler::new(target),
                },
                Phase::Aborted => {
                    return Err(CaptureError::Overrun {
                        accumulated: asm.accumulated(),
                        target,
                    })
                }
            }
        }
    }

    /// Hunt for the BEGIN marker with small synchronous reads.
    async fn await_begin(
        &mut self,
        asm: &mut Assembler,
        deadline: Instant,
    ) -> Result<(), CaptureError> {
        while asm.phase() == Phase::AwaitingBegin {
            let Some(buf) = self.stream_read(SYNC_READ_LEN, deadline).await? else {
                continue;
            };
            match asm.on_sync_read(&buf) {
                Step::Pending | Step::Progress { .. } => {}
                Step::Resync => {
                    tracing::debug!("error marker while idle; still waiting for begin");
                }
                Step::Unexpected(w) => {
                    tracing::warn!(marker = w, "unexpected marker while awaiting begin");
                }
                other => {
                    tracing::warn!(?other, "unreachable assembler outcome while awaiting begin");
                }
            }
        }
        Ok(())
    }

    /// Drive the transfer pool until the frame is full or the state machine
    /// demands a resync.
    async fn accumulate(
        &mut self,
        asm: &mut Assembler,
        deadline: Instant,
    ) -> Result<(), CaptureError> {
        let layout = &self.session.variant.stream;
        let plan = SlotPlan::new(layout, asm.target());
        let mut queue = self.session.interface.bulk_in_queue(EP_STREAM_IN);

        // Completions arrive in submission order, so a queue of requested
        // lengths is enough to account for in-flight bytes.
        let mut pending: VecDeque<usize> = VecDeque::new();
        let mut promised = asm.accumulated();
        let mut outstanding = 0usize;
        for slot in 0..layout.pool_slots {
            let Some(len) = plan.initial_len(slot, promised) else {
                break;
            };
            queue.submit(RequestBuffer::new(len));
            pending.push_back(len);
            promised += len;
            outstanding += len;
        }

        while asm.phase() == Phase::Accumulating {
            if Instant::now() >= deadline {
                queue.cancel_all();
                return Err(CaptureError::Timeout(self.options.frame_timeout));
            }
            let completion = match timeout(self.options.poll_slice, queue.next_complete()).await {
                Err(_) => continue,
                Ok(c) => c,
            };
            let requested = pending.pop_front().unwrap_or(0);
            outstanding = outstanding.saturating_sub(requested);
            if let Err(e) = completion.status {
                queue.cancel_all();
                return Err(CaptureError::Transfer(e));
            }

            let data = completion.data;
            match asm.on_chunk(&data) {
                Step::Pending => {}
                Step::Progress { complete } => {
                    if complete {
                        break;
                    }
                    if let Some(len) = plan.resubmit_len(asm.accumulated(), outstanding) {
                        queue.submit(RequestBuffer::reuse(data, len));
                        pending.push_back(len);
                        outstanding += len;
                    }
                    // else: retired; enough bytes are already promised.
                }
                Step::Restarted => {
                    tracing::warn!("begin marker mid-frame; accumulation restarted");
                    if let Some(len) = plan.resubmit_len(asm.accumulated(), outstanding) {
                        queue.submit(RequestBuffer::reuse(data, len));
                        pending.push_back(len);
                        outstanding += len;
                    }
                }
                Step::Resync => {
                    tracing::warn!("error marker mid-frame; resynchronizing");
                }
                Step::Unexpected(w) => {
                    tracing::warn!(marker = w, "unexpected marker mid-frame; resynchronizing");
                }
                Step::Overrun { accumulated } => {
                    queue.cancel_all();
                    return Err(CaptureError::Overrun {
                        accumulated,
                        target: asm.target(),
                    });
                }
            }
        }

        // Nothing submitted for this frame may outlive it.
        queue.cancel_all();
        while queue.pending() > 0 {
            let _ = queue.next_complete().await;
        }
        Ok(())
    }

    /// Read the END marker and its (status, counter) trailer. `Ok(None)`
    /// means the frame was lost at the boundary.
    async fn read_end(
        &mut self,
        asm: &mut Assembler,
        deadline: Instant,
    ) -> Result<Option<(u16, u16)>, CaptureError> {
        loop {
            let Some(buf) = self.stream_read(SYNC_READ_LEN, deadline).await? else {
                continue;
            };
            match asm.on_end_read(&buf) {
                EndStep::Done { status, counter } => return Ok(Some((status, counter))),
                EndStep::Pending => {}
                EndStep::Resync => {
                    tracing::warn!("error marker at frame end; dropping frame");
                    return Ok(None);
                }
                EndStep::Unexpected(w) => {
                    tracing::warn!(word = w, "unexpected word at frame end; dropping frame");
                    return Ok(None);
                }
            }
        }
    }

    /// One short read on the streaming endpoint, bounded by the poll slice.
    /// `Ok(None)` means the slice elapsed without data.
    async fn stream_read(
        &mut self,
        len: usize,
        deadline: Instant,
    ) -> Result<Option<Vec<u8>>, CaptureError> {
        let now = Instant::now();
        if now >= deadline {
            return Err(CaptureError::Timeout(self.options.frame_timeout));
        }
        let slice = self.options.poll_slice.min(deadline - now);
        let read = self
            .session
            .interface
            .bulk_in(EP_STREAM_IN, RequestBuffer::new(len));
        match timeout(slice, read).await {
            Err(_) => Ok(None),
            Ok(completion) => completion
                .into_result()
                .map(Some)
                .map_err(CaptureError::Transfer),
        }
    }

    /// Issue the write-only abort command and drain the stream until the
    /// device acknowledges with an ABORTED marker.
    async fn abort_stream(&mut self) -> Result<(), CaptureError> {
        self.session.channel.send_only(op::ABORT_STREAM, &[]).await?;
        let deadline = Instant::now() + self.options.abort_timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(CaptureError::CleanupFailed(self.options.abort_timeout));
            }
            let slice = self.options.poll_slice.min(deadline - now);
            let read = self
                .session
                .interface
                .bulk_in(EP_STREAM_IN, RequestBuffer::new(SYNC_READ_LEN));
            let completion = match timeout(slice, read).await {
                Err(_) => continue,
                Ok(c) => c,
            };
            let buf = completion.into_result().map_err(CaptureError::Transfer)?;
            if let Some(word) = proto::first_word(&buf) {
                if proto::classify_word(word) == StreamWord::Marker(SyncMarker::Aborted) {
                    tracing::debug!("stream abort acknowledged");
                    return Ok(());
                }
            }
            // Tail of the dead stream; keep draining.
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TARGET: usize = 18; // 8 pixels + 2-byte trailer

    fn word(v: u16) -> Vec<u8> {
        v.to_le_bytes().to_vec()
    }

    fn pixels(n: usize) -> Vec<u8> {
        // All sample values stay below the marker floor by construction.
        (0..n).flat_map(|i| ((i as u16) % 0x4000).to_le_bytes()).collect()
    }

    fn layout() -> StreamLayout {
        StreamLayout {
            pool_slots: 4,
            chunk_bytes: 8,
            slot_overrides: vec![(1, 2), (3, 4)],
            ok_status: vec![0x0001, 0x0002],
        }
    }

    fn end_packet(status: u16, counter: u16) -> Vec<u8> {
        let mut p = word(SyncMarker::END);
        p.extend_from_slice(&status.to_le_bytes());
        p.extend_from_slice(&counter.to_le_bytes());
        p
    }

    fn assemble_good_frame(asm: &mut Assembler) -> (u16, u16) {
        assert_eq!(
            asm.on_sync_read(&word(SyncMarker::BEGIN)),
            Step::Progress { complete: false }
        );
        assert_eq!(asm.on_chunk(&pixels(4)), Step::Progress { complete: false });
        assert_eq!(asm.on_chunk(&pixels(5)), Step::Progress { complete: true });
        assert_eq!(asm.phase(), Phase::AwaitingEnd);
        let EndStep::Done { status, counter } = asm.on_end_read(&end_packet(0x0001, 0x0042))
        else {
            panic!("expected end trailer");
        };
        (status, counter)
    }

    #[test]
    fn full_cycle_assembles_exact_byte_count() {
        let mut asm = Assembler::new(TARGET);
        let (status, counter) = assemble_good_frame(&mut asm);
        assert_eq!((status, counter), (0x0001, 0x0042));
        let buf = asm.take();
        assert_eq!(buf.len(), TARGET);
    }

    #[test]
    fn stray_idle_bytes_are_discarded_before_begin() {
        let mut asm = Assembler::new(TARGET);
        assert_eq!(asm.on_sync_read(&pixels(1)), Step::Pending);
        assert_eq!(asm.on_sync_read(&[]), Step::Pending);
        assert_eq!(asm.phase(), Phase::AwaitingBegin);
        assert_eq!(
            asm.on_sync_read(&word(SyncMarker::BEGIN)),
            Step::Progress { complete: false }
        );
        assert_eq!(asm.phase(), Phase::Accumulating);
    }

    #[test]
    fn begin_read_may_carry_leading_pixels() {
        let mut asm = Assembler::new(TARGET);
        let mut buf = word(SyncMarker::BEGIN);
        buf.extend_from_slice(&pixels(3));
        assert_eq!(asm.on_sync_read(&buf), Step::Progress { complete: false });
        assert_eq!(asm.accumulated(), 6);
    }

    #[test]
    fn stale_aborted_ack_is_ignored_while_awaiting_begin() {
        // Leftover acknowledgement from a previous abort must not derail a
        // fresh capture call.
        let mut asm = Assembler::new(TARGET);
        assert_eq!(
            asm.on_sync_read(&word(SyncMarker::ABORTED)),
            Step::Unexpected(SyncMarker::ABORTED)
        );
        assert_eq!(asm.phase(), Phase::AwaitingBegin);
        assert_eq!(
            asm.on_sync_read(&word(SyncMarker::BEGIN)),
            Step::Progress { complete: false }
        );
    }

    #[test]
    fn error_marker_mid_frame_resynchronizes() {
        let mut asm = Assembler::new(TARGET);
        assert_eq!(
            asm.on_sync_read(&word(SyncMarker::BEGIN)),
            Step::Progress { complete: false }
        );
        assert_eq!(asm.on_chunk(&pixels(4)), Step::Progress { complete: false });
        assert_eq!(asm.on_chunk(&word(SyncMarker::ERROR)), Step::Resync);
        assert_eq!(asm.phase(), Phase::AwaitingBegin);
        assert_eq!(asm.accumulated(), 0);
    }

    #[test]
    fn error_on_second_frame_leaves_first_frame_intact() {
        // Scenario: frame 1 emitted, then frame 2 hits a mid-stream ERROR
        // and is recaptured. Frame 1's bytes must be untouched throughout.
        let mut asm = Assembler::new(TARGET);
        assemble_good_frame(&mut asm);
        let frame1 = asm.take();
        let frame1_copy = frame1.clone();

        let mut asm = Assembler::new(TARGET);
        assert_eq!(
            asm.on_sync_read(&word(SyncMarker::BEGIN)),
            Step::Progress { complete: false }
        );
        assert_eq!(asm.on_chunk(&word(SyncMarker::ERROR)), Step::Resync);

        // Retry succeeds.
        assemble_good_frame(&mut asm);
        let frame2 = asm.take();
        assert_eq!(frame1, frame1_copy);
        assert_eq!(frame2.len(), TARGET);
    }

    #[test]
    fn begin_marker_mid_frame_restarts_accumulation() {
        let mut asm = Assembler::new(TARGET);
        assert_eq!(
            asm.on_sync_read(&word(SyncMarker::BEGIN)),
            Step::Progress { complete: false }
        );
        assert_eq!(asm.on_chunk(&pixels(4)), Step::Progress { complete: false });
        assert_eq!(asm.on_chunk(&word(SyncMarker::BEGIN)), Step::Restarted);
        // Still accumulating, but from scratch: the restart consumed the
        // new frame's begin marker.
        assert_eq!(asm.phase(), Phase::Accumulating);
        assert_eq!(asm.accumulated(), 0);
    }

    #[test]
    fn overrun_is_a_hard_failure() {
        let mut asm = Assembler::new(TARGET);
        assert_eq!(
            asm.on_sync_read(&word(SyncMarker::BEGIN)),
            Step::Progress { complete: false }
        );
        assert_eq!(
            asm.on_chunk(&pixels(10)),
            Step::Overrun { accumulated: 20 }
        );
        assert_eq!(asm.phase(), Phase::Aborted);
    }

    #[test]
    fn end_read_rejects_pixel_data_after_frame_boundary() {
        let mut asm = Assembler::new(TARGET);
        assert_eq!(
            asm.on_sync_read(&word(SyncMarker::BEGIN)),
            Step::Progress { complete: false }
        );
        assert_eq!(asm.on_chunk(&pixels(9)), Step::Progress { complete: true });
        assert_eq!(asm.on_end_read(&pixels(1)), EndStep::Unexpected(0));
        assert_eq!(asm.phase(), Phase::AwaitingBegin);
    }

    #[test]
    fn end_read_error_marker_drops_the_frame() {
        let mut asm = Assembler::new(TARGET);
        assert_eq!(
            asm.on_sync_read(&word(SyncMarker::BEGIN)),
            Step::Progress { complete: false }
        );
        assert_eq!(asm.on_chunk(&pixels(9)), Step::Progress { complete: true });
        assert_eq!(asm.on_end_read(&word(SyncMarker::ERROR)), EndStep::Resync);
        assert_eq!(asm.phase(), Phase::AwaitingBegin);
        assert_eq!(asm.accumulated(), 0);
    }

    #[test]
    fn three_frames_with_nondecreasing_counters() {
        // Scenario: capture(3), all good; counters as the device reports
        // them must come back in observation order.
        let mut counters = Vec::new();
        for expected in [7u16, 8, 8] {
            let mut asm = Assembler::new(TARGET);
            assert_eq!(
                asm.on_sync_read(&word(SyncMarker::BEGIN)),
                Step::Progress { complete: false }
            );
            assert_eq!(asm.on_chunk(&pixels(9)), Step::Progress { complete: true });
            let EndStep::Done { status, counter } =
                asm.on_end_read(&end_packet(0x0002, expected))
            else {
                panic!("expected end trailer");
            };
            assert_eq!(status, 0x0002);
            assert_eq!(asm.take().len(), TARGET);
            counters.push(counter);
        }
        assert!(counters.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn slot_plan_applies_per_index_sizes() {
        let layout = layout();
        let plan = SlotPlan::new(&layout, 100);
        assert_eq!(plan.initial_len(0, 0), Some(8));
        assert_eq!(plan.initial_len(1, 8), Some(2));
        assert_eq!(plan.initial_len(2, 10), Some(8));
        assert_eq!(plan.initial_len(3, 18), Some(4));
    }

    #[test]
    fn slot_plan_never_promises_past_the_frame_boundary() {
        let layout = layout();
        let plan = SlotPlan::new(&layout, 10);
        // First slot is capped to the frame, second gets the remainder,
        // the rest of the pool is not armed at all.
        assert_eq!(plan.initial_len(0, 0), Some(8));
        assert_eq!(plan.initial_len(1, 8), Some(2));
        assert_eq!(plan.initial_len(2, 10), None);

        // Re-arm accounting: retire once banked + in-flight covers the
        // target.
        assert_eq!(plan.resubmit_len(4, 6), None);
        assert_eq!(plan.resubmit_len(4, 2), Some(4));
        assert_eq!(plan.resubmit_len(10, 0), None);
    }

    #[test]
    fn fresh_assembler_per_call_resets_cleanly() {
        let mut asm = Assembler::new(TARGET);
        assemble_good_frame(&mut asm);
        drop(asm);
        // A new engine call starts over from AwaitingBegin with an empty
        // buffer regardless of what the previous call saw.
        let asm = Assembler::new(TARGET);
        assert_eq!(asm.phase(), Phase::AwaitingBegin);
        assert_eq!(asm.accumulated(), 0);
    }
}
