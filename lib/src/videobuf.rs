//! Generic video buffer queue.
//!
//! This is the buffer state machine shared by V4L2 capture drivers: it owns
//! the buffer records, the list of buffers handed over by the application
//! (the "stream" list, in queueing order), and the streaming flag. Driver
//! specifics are plugged in through the four `QueueOps` callbacks.
//!
//! Buffer states follow the sequence `NeedsInit -> Prepared -> Queued ->
//! Active -> Done -> Idle`. `Queued` and `Active` are set by the driver;
//! `Done` (or `Error`) is what lets a buffer be dequeued.
//!
//! The queue does not block by itself: `try_dqbuf` reports `NotReady` and
//! the owner of the queue waits on its own condition variable.
use std::collections::VecDeque;

use log::{debug, trace};
use nix::errno::Errno;
use nix::sys::time::TimeVal;
use thiserror::Error;

use crate::format::round_up;
use crate::ioctl::BufferField;
use crate::memory::MemoryType;
use crate::QueueType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// Freshly allocated or released: size and addresses must be recomputed.
    NeedsInit,
    /// Validated by the driver, not handed to it yet.
    Prepared,
    /// Waiting in the driver's DMA queue.
    Queued,
    /// Being written by the hardware.
    Active,
    /// Filled and waiting to be dequeued.
    Done,
    /// Could not be filled.
    Error,
    /// Dequeued by the application.
    Idle,
}

/// Record of one buffer of the queue.
#[derive(Debug, Clone)]
pub struct VideoBuffer {
    pub index: usize,
    pub state: BufferState,
    pub memory: MemoryType,
    pub width: u32,
    pub height: u32,
    pub bytesperline: u32,
    /// Bytes of image data.
    pub size: u32,
    pub field: BufferField,
    /// Length of the buffer memory.
    pub bsize: u32,
    /// Offset to pass to `mmap()` for MMAP buffers.
    pub boff: u32,
    /// Application address for USERPTR buffers.
    pub baddr: u64,
    pub timestamp: Option<TimeVal>,
    pub sequence: u32,
    pub map_count: usize,
}

impl VideoBuffer {
    fn new(index: usize, memory: MemoryType, bsize: u32) -> Self {
        VideoBuffer {
            index,
            state: BufferState::NeedsInit,
            memory,
            width: 0,
            height: 0,
            bytesperline: 0,
            size: 0,
            field: BufferField::None,
            bsize,
            boff: index as u32 * bsize,
            baddr: 0,
            timestamp: None,
            sequence: 0,
            map_count: 0,
        }
    }

    /// Buffer is owned by the driver until it completes.
    pub fn is_busy(&self) -> bool {
        matches!(self.state, BufferState::Queued | BufferState::Active)
    }
}

/// Driver callbacks invoked by the queue.
pub trait QueueOps {
    /// Called on buffer allocation. `count` is the number of buffers wanted
    /// and is updated with the number that can actually be provided; `size`
    /// receives the per-buffer size.
    fn setup(&mut self, memory: MemoryType, count: &mut u32, size: &mut u32) -> Result<(), Errno>;
    /// Validate a buffer about to be queued and move it to `Prepared`.
    fn prepare(&mut self, buf: &mut VideoBuffer, field: BufferField) -> Result<(), Errno>;
    /// Hand a prepared buffer to the driver. Runs with the interrupt lock held.
    fn queue(&mut self, buf: &mut VideoBuffer);
    /// Return a buffer to `NeedsInit`.
    fn release(&mut self, buf: &mut VideoBuffer);
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VbError {
    #[error("queue is streaming")]
    Streaming,
    #[error("queue is not streaming")]
    NotStreaming,
    #[error("buffers are still mapped")]
    Mapped,
    #[error("no buffer with index {0}")]
    InvalidIndex(usize),
    #[error("memory type {0:?} does not match the allocated buffers")]
    MemoryMismatch(MemoryType),
    #[error("buffer {0} is already queued")]
    AlreadyQueued(usize),
    #[error("no buffer ready to dequeue")]
    NotReady,
    #[error("buffer {0} completed with an error")]
    BufferError(usize),
    #[error("driver callback failed: {0}")]
    Driver(Errno),
}

impl From<VbError> for Errno {
    fn from(err: VbError) -> Self {
        match err {
            VbError::Streaming | VbError::Mapped => Errno::EBUSY,
            VbError::NotReady => Errno::EAGAIN,
            VbError::BufferError(_) => Errno::EIO,
            VbError::Driver(e) => e,
            _ => Errno::EINVAL,
        }
    }
}

pub struct VideoBufQueue {
    type_: QueueType,
    field: BufferField,
    page_size: u32,
    max_buffers: usize,
    memory: Option<MemoryType>,
    bufs: Vec<VideoBuffer>,
    stream: VecDeque<usize>,
    streaming: bool,
}

impl VideoBufQueue {
    pub fn new(type_: QueueType, field: BufferField, page_size: u32, max_buffers: usize) -> Self {
        VideoBufQueue {
            type_,
            field,
            page_size,
            max_buffers,
            memory: None,
            bufs: Vec::new(),
            stream: VecDeque::new(),
            streaming: false,
        }
    }

    pub fn queue_type(&self) -> QueueType {
        self.type_
    }

    pub fn memory(&self) -> Option<MemoryType> {
        self.memory
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn num_buffers(&self) -> usize {
        self.bufs.len()
    }

    pub fn buffer(&self, index: usize) -> Option<&VideoBuffer> {
        self.bufs.get(index)
    }

    pub fn buffer_mut(&mut self, index: usize) -> Option<&mut VideoBuffer> {
        self.bufs.get_mut(index)
    }

    pub fn buffers(&self) -> &[VideoBuffer] {
        &self.bufs
    }

    /// Indices of the buffers queued by the application and not dequeued
    /// yet, in queueing order.
    pub fn stream(&self) -> impl Iterator<Item = usize> + '_ {
        self.stream.iter().copied()
    }

    pub fn is_mapped(&self) -> bool {
        self.bufs.iter().any(|b| b.map_count > 0)
    }

    /// Allocate `count` buffers of memory type `memory`, replacing the
    /// current ones. A count of zero only frees the buffers.
    pub fn reqbufs<O: QueueOps>(
        &mut self,
        ops: &mut O,
        memory: MemoryType,
        count: u32,
    ) -> Result<u32, VbError> {
        if self.streaming {
            return Err(VbError::Streaming);
        }
        self.free(ops)?;
        if count == 0 {
            return Ok(0);
        }

        let mut count = count.min(self.max_buffers as u32);
        let mut size = 0;
        ops.setup(memory, &mut count, &mut size)
            .map_err(VbError::Driver)?;
        let size = round_up(size, self.page_size);

        self.bufs = (0..count as usize)
            .map(|i| VideoBuffer::new(i, memory, size))
            .collect();
        self.memory = Some(memory);
        debug!(
            "{} queue: {} {:?} buffers of {} bytes",
            self.type_, count, memory, size
        );

        Ok(count)
    }

    /// Release all buffers. Fails if any of them is still mapped.
    pub fn free<O: QueueOps>(&mut self, ops: &mut O) -> Result<(), VbError> {
        if self.streaming {
            return Err(VbError::Streaming);
        }
        if self.is_mapped() {
            return Err(VbError::Mapped);
        }

        for buf in self.bufs.iter_mut() {
            ops.release(buf);
        }
        self.bufs.clear();
        self.stream.clear();
        self.memory = None;

        Ok(())
    }

    /// Queue buffer `index`. `userptr` is the application address and length
    /// of a USERPTR buffer.
    pub fn qbuf<O: QueueOps>(
        &mut self,
        ops: &mut O,
        index: usize,
        memory: MemoryType,
        userptr: Option<(u64, u32)>,
    ) -> Result<(), VbError> {
        if self.memory != Some(memory) {
            return Err(VbError::MemoryMismatch(memory));
        }
        let field = self.field;
        let buf = self
            .bufs
            .get_mut(index)
            .ok_or(VbError::InvalidIndex(index))?;
        match buf.state {
            BufferState::NeedsInit | BufferState::Idle => (),
            _ => return Err(VbError::AlreadyQueued(index)),
        }

        if let (MemoryType::UserPtr, Some((addr, length))) = (memory, userptr) {
            if buf.baddr != addr && buf.state != BufferState::NeedsInit {
                ops.release(buf);
            }
            buf.baddr = addr;
            buf.bsize = length;
        }

        ops.prepare(buf, field).map_err(VbError::Driver)?;
        self.stream.push_back(index);
        if self.streaming {
            ops.queue(buf);
        }
        trace!("{} queue: queued buffer {}", self.type_, index);

        Ok(())
    }

    /// Start streaming: every prepared buffer is handed to the driver.
    pub fn streamon<O: QueueOps>(&mut self, ops: &mut O) -> Result<(), VbError> {
        if self.streaming {
            return Err(VbError::Streaming);
        }
        self.streaming = true;
        for &index in self.stream.iter() {
            let buf = &mut self.bufs[index];
            if buf.state == BufferState::Prepared {
                ops.queue(buf);
            }
        }

        Ok(())
    }

    pub fn streamoff<O: QueueOps>(&mut self, ops: &mut O) -> Result<(), VbError> {
        if !self.streaming {
            return Err(VbError::NotStreaming);
        }
        self.cancel(ops);

        Ok(())
    }

    /// Stop streaming, flag every buffer owned by the driver as failed and
    /// release all buffers. The caller must wake any waiter afterwards.
    pub fn cancel<O: QueueOps>(&mut self, ops: &mut O) {
        self.streaming = false;
        for buf in self.bufs.iter_mut() {
            if buf.is_busy() {
                buf.state = BufferState::Error;
            }
        }
        for buf in self.bufs.iter_mut() {
            ops.release(buf);
        }
        self.stream.clear();
    }

    /// Dequeue the oldest queued buffer if it has completed.
    ///
    /// Returns `NotReady` if the buffer is still in flight or nothing is
    /// queued, and `BufferError` (with the buffer dequeued nonetheless) if
    /// the buffer completed with an error.
    pub fn try_dqbuf(&mut self) -> Result<usize, VbError> {
        if !self.streaming {
            return Err(VbError::NotStreaming);
        }
        let index = *self.stream.front().ok_or(VbError::NotReady)?;
        let buf = &mut self.bufs[index];
        let result = match buf.state {
            BufferState::Done => Ok(index),
            BufferState::Error => Err(VbError::BufferError(index)),
            _ => return Err(VbError::NotReady),
        };

        buf.state = BufferState::Idle;
        self.stream.pop_front();
        trace!("{} queue: dequeued buffer {}", self.type_, index);

        result
    }

    /// Index of the MMAP buffer starting at `offset`.
    pub fn find_by_offset(&self, offset: u32) -> Option<usize> {
        if self.memory != Some(MemoryType::MMAP) {
            return None;
        }
        self.bufs.iter().position(|b| b.boff == offset)
    }
}
