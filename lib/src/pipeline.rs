//! Interrupt-driven frame pipeline.
//!
//! The write-back hardware latches a new destination address at every frame
//! boundary, so the driver always keeps two buffers in play: `cur_frm` is
//! the one being written, `next_frm` the one programmed to be written after
//! it. When both designate the same buffer, nothing is queued behind the
//! frame in flight.
//!
//! At each frame-done interrupt, the outgoing `cur_frm` completes (unless it
//! was the first interrupt after stream-on, or no new frame was programmed),
//! `next_frm` becomes current, and the head of the pending FIFO is programmed
//! as the new `next_frm`.
//!
//! Frames are indices into the buffer array of the `VideoBufQueue`; the
//! pipeline never owns buffers.
use std::collections::VecDeque;
use std::sync::Arc;

use log::{debug, error, trace, warn};
use nix::errno::Errno;
use nix::sys::time::TimeVal;
use nix::time::{clock_gettime, ClockId};
use thiserror::Error;

use crate::format::ColorMode;
use crate::platform::{
    DisplaySubsystem, IrqMask, PhysAddr, PlatformError, WbCaptureMode, WbSource, WbSourceType,
};
use crate::videobuf::{BufferState, VideoBufQueue, VideoBuffer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Not streaming.
    Idle,
    /// Stream-on issued, first interrupt pending.
    Armed,
    /// Steady state.
    Running,
}

/// Where the hardware writes a given buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaAddr {
    pub luma: PhysAddr,
    /// Chroma plane, for NV12 only.
    pub chroma: Option<PhysAddr>,
}

/// Write-back settings that stay the same for a whole streaming session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WbProgram {
    pub source: WbSource,
    pub source_type: WbSourceType,
    pub capture_mode: WbCaptureMode,
    pub color_mode: ColorMode,
    /// Region read from the source.
    pub width: u32,
    pub height: u32,
    /// Image written to memory.
    pub out_width: u32,
    pub out_height: u32,
}

/// Counters of the pipeline activity.
///
/// Programming failures happen in interrupt context and cannot be reported
/// to any caller; they are only visible here and in the log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub interrupts: u64,
    pub frames_done: u64,
    pub programmed: u64,
    pub program_failures: u64,
    pub last_failure: Option<PlatformError>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("pipeline is already streaming")]
    Streaming,
    #[error("no buffer queued")]
    NoBuffers,
}

impl From<PipelineError> for Errno {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Streaming => Errno::EBUSY,
            PipelineError::NoBuffers => Errno::EIO,
        }
    }
}

/// Current time on the clock buffer timestamps are taken from.
pub fn now() -> TimeVal {
    match clock_gettime(ClockId::CLOCK_MONOTONIC) {
        Ok(ts) => TimeVal::new(ts.tv_sec(), (ts.tv_nsec() / 1000) as _),
        Err(e) => {
            warn!("Cannot read the monotonic clock: {}", e);
            TimeVal::new(0, 0)
        }
    }
}

pub struct FramePipeline {
    wb: usize,
    dss: Arc<dyn DisplaySubsystem>,
    program: WbProgram,
    streaming: bool,
    first_int: bool,
    cur_frm: Option<usize>,
    next_frm: Option<usize>,
    dma_queue: VecDeque<usize>,
    dma_addrs: Vec<Option<DmaAddr>>,
    sequence: u32,
    stats: PipelineStats,
}

impl FramePipeline {
    pub fn new(wb: usize, dss: Arc<dyn DisplaySubsystem>) -> Self {
        FramePipeline {
            wb,
            dss,
            program: Default::default(),
            streaming: false,
            first_int: false,
            cur_frm: None,
            next_frm: None,
            dma_queue: VecDeque::new(),
            dma_addrs: Vec::new(),
            sequence: 0,
            stats: Default::default(),
        }
    }

    pub fn state(&self) -> PipelineState {
        match (self.streaming, self.first_int) {
            (false, _) => PipelineState::Idle,
            (true, true) => PipelineState::Armed,
            (true, false) => PipelineState::Running,
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn cur_frm(&self) -> Option<usize> {
        self.cur_frm
    }

    pub fn next_frm(&self) -> Option<usize> {
        self.next_frm
    }

    /// Buffers waiting to be handed to the hardware, in order.
    pub fn pending(&self) -> impl Iterator<Item = usize> + '_ {
        self.dma_queue.iter().copied()
    }

    pub fn has_pending(&self) -> bool {
        !self.dma_queue.is_empty()
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    /// Record the addresses to program when buffer `index` becomes active.
    pub fn set_dma_addr(&mut self, index: usize, addr: DmaAddr) {
        if self.dma_addrs.len() <= index {
            self.dma_addrs.resize(index + 1, None);
        }
        self.dma_addrs[index] = Some(addr);
    }

    pub fn dma_addr(&self, index: usize) -> Option<DmaAddr> {
        self.dma_addrs.get(index).copied().flatten()
    }

    pub fn clear_dma_addrs(&mut self) {
        self.dma_addrs.clear();
    }

    /// Replace the settings used from the next programmed frame on.
    pub fn set_program(&mut self, program: WbProgram) {
        self.program = program;
    }

    pub fn program(&self) -> &WbProgram {
        &self.program
    }

    /// Take ownership of a prepared buffer. The hardware is not touched.
    pub fn enqueue(&mut self, buf: &mut VideoBuffer) {
        buf.state = BufferState::Queued;
        self.dma_queue.push_back(buf.index);
        trace!("wb{}: buffer {} pending", self.wb, buf.index);
    }

    /// Start capturing into the first pending buffer.
    pub fn stream_on(
        &mut self,
        queue: &mut VideoBufQueue,
        program: WbProgram,
    ) -> Result<(), PipelineError> {
        if self.streaming {
            return Err(PipelineError::Streaming);
        }
        let first = *self.dma_queue.front().ok_or(PipelineError::NoBuffers)?;

        self.program = program;
        self.streaming = true;
        self.first_int = true;
        self.sequence = 0;
        self.cur_frm = Some(first);
        self.process_frame(queue);
        debug!("wb{}: streaming from buffer {}", self.wb, first);

        Ok(())
    }

    /// Program the head of the pending FIFO as the next frame to write.
    pub fn process_frame(&mut self, queue: &mut VideoBufQueue) {
        let Some(index) = self.dma_queue.pop_front() else {
            return;
        };
        if let Some(buf) = queue.buffer_mut(index) {
            buf.state = BufferState::Active;
        }
        self.next_frm = Some(index);
        if self.cur_frm.is_none() {
            self.cur_frm = Some(index);
        }

        match self.dma_addr(index) {
            Some(addr) => self.program_hw(addr),
            None => {
                error!("wb{}: buffer {} has no DMA address", self.wb, index);
                self.stats.program_failures += 1;
            }
        }
    }

    fn apply(&self, addr: DmaAddr) -> Result<(), PlatformError> {
        let mut info = self.dss.get_wb_info(self.wb)?;
        // Streaming alone decides whether write-back runs.
        info.enabled = true;
        info.info_dirty = true;
        info.source = self.program.source;
        info.source_type = self.program.source_type;
        info.capture_mode = self.program.capture_mode;
        info.color_mode = self.program.color_mode;
        info.width = self.program.width;
        info.height = self.program.height;
        info.out_width = self.program.out_width;
        info.out_height = self.program.out_height;
        info.paddr = addr.luma;
        info.p_uv_addr = addr.chroma.unwrap_or(0);
        self.dss.set_wb_info(self.wb, &info)?;
        self.dss.wb_apply(self.wb)
    }

    fn program_hw(&mut self, addr: DmaAddr) {
        match self.apply(addr) {
            Ok(()) => {
                self.stats.programmed += 1;
                trace!("wb{}: programmed 0x{:08x}", self.wb, addr.luma);
            }
            Err(e) => {
                error!("wb{}: failed to program write-back: {}", self.wb, e);
                self.stats.program_failures += 1;
                self.stats.last_failure = Some(e);
            }
        }
    }

    /// To be called after a buffer has been queued while streaming.
    /// `was_empty` tells whether the pending FIFO was empty before.
    ///
    /// If the hardware has a frame in flight and nothing programmed behind
    /// it, the new buffer is programmed right away instead of waiting for
    /// the next interrupt. Returns whether that happened.
    pub fn qbuf_kick(&mut self, queue: &mut VideoBufQueue, was_empty: bool) -> bool {
        if !self.streaming || !was_empty || self.dma_queue.is_empty() {
            return false;
        }
        let (Some(cur), Some(next)) = (self.cur_frm, self.next_frm) else {
            return false;
        };
        let active = |i| queue.buffer(i).map(|b| b.state) == Some(BufferState::Active);
        if cur != next || !active(cur) || !active(next) {
            return false;
        }

        self.process_frame(queue);
        true
    }

    /// Frame-done interrupt. Returns whether a buffer completed, in which
    /// case waiters must be woken up.
    pub fn handle_irq(&mut self, queue: &mut VideoBufQueue, status: IrqMask, now: TimeVal) -> bool {
        if !self.streaming || !status.contains(IrqMask::FRAME_DONE_WB) {
            return false;
        }
        self.stats.interrupts += 1;

        let mut completed = false;
        if !self.first_int && self.cur_frm != self.next_frm {
            if let Some(buf) = self.cur_frm.and_then(|i| queue.buffer_mut(i)) {
                buf.state = BufferState::Done;
                buf.timestamp = Some(now);
                buf.sequence = self.sequence;
                trace!("wb{}: buffer {} done, seq {}", self.wb, buf.index, buf.sequence);
                self.sequence = self.sequence.wrapping_add(1);
                self.stats.frames_done += 1;
                completed = true;
            }
            self.cur_frm = self.next_frm;
        }
        self.first_int = false;

        if self.cur_frm == self.next_frm && !self.dma_queue.is_empty() {
            self.process_frame(queue);
        }

        completed
    }

    /// Forget every frame. Buffer states are left to the queue cancellation.
    pub fn stream_off(&mut self) {
        self.streaming = false;
        self.first_int = false;
        self.cur_frm = None;
        self.next_frm = None;
        self.dma_queue.clear();
        debug!("wb{}: stream off", self.wb);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{negotiate, NegotiatedFormat};
    use crate::ioctl::BufferField;
    use crate::memory::MemoryType;
    use crate::platform::sim::{SimDss, SimTiler};
    use crate::queue_ops::WbQueueOps;
    use crate::tiler::TilerBuffers;
    use crate::{Format, PixelFormat, QueueType};

    struct Harness {
        dss: Arc<SimDss>,
        format: NegotiatedFormat,
        tiler: TilerBuffers,
        queue: VideoBufQueue,
        frames: FramePipeline,
    }

    impl Harness {
        fn new(count: u32) -> Self {
            let dss = Arc::new(SimDss::default());
            let format = negotiate(&Format::from((PixelFormat::RGB32, (160, 120))), 4096).unwrap();
            let mut h = Harness {
                dss: dss.clone(),
                format,
                tiler: TilerBuffers::new(Arc::new(SimTiler::new()), 32),
                queue: VideoBufQueue::new(QueueType::VideoCapture, BufferField::None, 4096, 32),
                frames: FramePipeline::new(0, dss),
            };
            let mut ops = WbQueueOps {
                format: &h.format,
                tiler: &mut h.tiler,
                frames: &mut h.frames,
            };
            h.queue.reqbufs(&mut ops, MemoryType::MMAP, count).unwrap();
            h
        }

        fn qbuf(&mut self, index: usize) -> bool {
            let was_empty = !self.frames.has_pending();
            let mut ops = WbQueueOps {
                format: &self.format,
                tiler: &mut self.tiler,
                frames: &mut self.frames,
            };
            self.queue
                .qbuf(&mut ops, index, MemoryType::MMAP, None)
                .unwrap();
            self.frames.qbuf_kick(&mut self.queue, was_empty)
        }

        fn streamon(&mut self) -> Result<(), PipelineError> {
            let mut ops = WbQueueOps {
                format: &self.format,
                tiler: &mut self.tiler,
                frames: &mut self.frames,
            };
            self.queue.streamon(&mut ops).unwrap();
            self.frames.stream_on(&mut self.queue, WbProgram::default())
        }

        fn streamoff(&mut self) {
            self.frames.stream_off();
            let mut ops = WbQueueOps {
                format: &self.format,
                tiler: &mut self.tiler,
                frames: &mut self.frames,
            };
            self.queue.streamoff(&mut ops).unwrap();
        }

        fn irq(&mut self, secs: i64) -> bool {
            self.frames.handle_irq(
                &mut self.queue,
                IrqMask::FRAME_DONE_WB,
                TimeVal::new(secs as _, 0),
            )
        }

        fn state_of(&self, index: usize) -> BufferState {
            self.queue.buffer(index).unwrap().state
        }

        fn programmed_addr(&self) -> Option<PhysAddr> {
            self.dss.last_applied(0).map(|i| i.paddr)
        }

        fn slot_addr(&self, index: usize) -> PhysAddr {
            self.tiler.slot(index).unwrap().luma_addr()
        }
    }

    #[test]
    fn single_buffer_stream_on() {
        let mut h = Harness::new(1);
        h.qbuf(0);
        h.streamon().unwrap();

        assert_eq!(h.frames.state(), PipelineState::Armed);
        assert_eq!(h.frames.cur_frm(), Some(0));
        assert_eq!(h.frames.next_frm(), Some(0));
        assert!(!h.frames.has_pending());
        assert_eq!(h.state_of(0), BufferState::Active);
        assert_eq!(h.programmed_addr(), Some(h.slot_addr(0)));
    }

    #[test]
    fn lone_buffer_never_completes() {
        let mut h = Harness::new(1);
        h.qbuf(0);
        h.streamon().unwrap();

        for t in 1..5 {
            assert!(!h.irq(t));
        }
        assert_eq!(h.state_of(0), BufferState::Active);
        assert_eq!(h.frames.stats().frames_done, 0);
    }

    #[test]
    fn multiple_buffers_stream_on() {
        let mut h = Harness::new(3);
        for i in 0..3 {
            h.qbuf(i);
        }
        h.streamon().unwrap();

        // Only the first buffer is handed to the hardware.
        assert_eq!(h.frames.cur_frm(), Some(0));
        assert_eq!(h.frames.next_frm(), Some(0));
        assert_eq!(h.frames.pending().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(h.dss.applied().len(), 1);
    }

    #[test]
    fn stream_on_needs_a_buffer() {
        let mut h = Harness::new(2);
        assert_eq!(h.streamon(), Err(PipelineError::NoBuffers));
        assert_eq!(h.frames.state(), PipelineState::Idle);
        assert!(h.dss.applied().is_empty());
    }

    #[test]
    fn interrupts_complete_frames_in_order() {
        let mut h = Harness::new(3);
        for i in 0..3 {
            h.qbuf(i);
        }
        h.streamon().unwrap();

        // First interrupt: nothing completes, buffer 1 is programmed.
        assert!(!h.irq(1));
        assert_eq!(h.frames.state(), PipelineState::Running);
        assert_eq!(h.frames.next_frm(), Some(1));
        assert_eq!(h.programmed_addr(), Some(h.slot_addr(1)));

        assert!(h.irq(2));
        assert_eq!(h.state_of(0), BufferState::Done);
        assert_eq!(h.frames.cur_frm(), Some(1));
        assert_eq!(h.frames.next_frm(), Some(2));

        assert!(h.irq(3));
        assert_eq!(h.state_of(1), BufferState::Done);
        let first = h.queue.buffer(0).unwrap();
        let second = h.queue.buffer(1).unwrap();
        assert!(second.timestamp >= first.timestamp);
        assert_eq!((first.sequence, second.sequence), (0, 1));

        // Nothing behind buffer 2: it stays in flight.
        assert!(!h.irq(4));
        assert_eq!(h.state_of(2), BufferState::Active);
        assert_eq!(h.frames.stats().frames_done, 2);
        assert_eq!(h.frames.stats().interrupts, 4);
    }

    #[test]
    fn qbuf_behind_active_frame_programs_immediately() {
        let mut h = Harness::new(2);
        h.qbuf(0);
        h.streamon().unwrap();
        assert_eq!(h.dss.applied().len(), 1);

        assert!(h.qbuf(1));
        assert_eq!(h.dss.applied().len(), 2);
        assert_eq!(h.programmed_addr(), Some(h.slot_addr(1)));
        assert_eq!(h.frames.cur_frm(), Some(0));
        assert_eq!(h.frames.next_frm(), Some(1));
        assert_eq!(h.state_of(1), BufferState::Active);

        assert!(!h.irq(1));
        assert!(h.irq(2));
        assert_eq!(h.state_of(0), BufferState::Done);
    }

    #[test]
    fn qbuf_behind_programmed_frame_waits() {
        let mut h = Harness::new(3);
        h.qbuf(0);
        h.streamon().unwrap();
        assert!(h.qbuf(1));
        // Buffer 1 already sits behind buffer 0.
        assert!(!h.qbuf(2));
        assert_eq!(h.frames.pending().collect::<Vec<_>>(), vec![2]);
        assert_eq!(h.state_of(2), BufferState::Queued);
    }

    #[test]
    fn restart_reproduces_armed_state() {
        let mut h = Harness::new(2);
        h.qbuf(0);
        h.qbuf(1);
        h.streamon().unwrap();
        h.irq(1);
        h.irq(2);
        h.streamoff();

        assert_eq!(h.frames.state(), PipelineState::Idle);
        assert_eq!(h.frames.cur_frm(), None);
        assert!(!h.frames.has_pending());
        // Late interrupts are ignored.
        assert!(!h.irq(3));

        h.qbuf(0);
        h.qbuf(1);
        h.streamon().unwrap();
        assert_eq!(h.frames.state(), PipelineState::Armed);
        assert_eq!(h.frames.cur_frm(), Some(0));
        assert_eq!(h.frames.next_frm(), Some(0));
        assert_eq!(h.frames.pending().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn programming_failures_are_counted() {
        let mut h = Harness::new(2);
        h.qbuf(0);
        h.qbuf(1);
        h.dss.fail_next_applies(1);
        h.streamon().unwrap();

        // Streaming goes on regardless.
        assert_eq!(h.frames.state(), PipelineState::Armed);
        assert_eq!(h.frames.stats().program_failures, 1);
        assert!(matches!(
            h.frames.stats().last_failure,
            Some(PlatformError::Rejected(_))
        ));

        h.irq(1);
        assert_eq!(h.frames.stats().programmed, 1);
        assert_eq!(h.programmed_addr(), Some(h.slot_addr(1)));
    }

    #[test]
    fn other_interrupts_are_ignored() {
        let mut h = Harness::new(2);
        h.qbuf(0);
        h.qbuf(1);
        h.streamon().unwrap();

        assert!(!h
            .frames
            .handle_irq(&mut h.queue, IrqMask::VSYNC, TimeVal::new(0, 0)));
        assert_eq!(h.frames.state(), PipelineState::Armed);
        assert_eq!(h.frames.stats().interrupts, 0);
    }
}
