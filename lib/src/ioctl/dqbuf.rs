//! `VIDIOC_DQBUF`.
use log::trace;
use nix::errno::Errno;
use nix::sys::time::TimeVal;
use thiserror::Error;

use crate::device::WbFile;
use crate::ioctl::{BufferField, BufferFlags};
use crate::videobuf::{VbError, VideoBuffer};
use crate::QueueType;

/// Information for a dequeued buffer.
#[derive(Debug, Clone)]
pub struct DQBuffer {
    pub index: usize,
    pub flags: BufferFlags,
    pub field: BufferField,
    pub bytesused: u32,
    pub timestamp: TimeVal,
    pub sequence: u32,
}

impl From<&VideoBuffer> for DQBuffer {
    fn from(buf: &VideoBuffer) -> Self {
        DQBuffer {
            index: buf.index,
            flags: BufferFlags::of(buf),
            field: buf.field,
            bytesused: buf.size,
            timestamp: buf.timestamp.unwrap_or_else(|| TimeVal::new(0, 0)),
            sequence: buf.sequence,
        }
    }
}

#[derive(Debug, Error)]
pub enum DQBufError {
    #[error("invalid buffer type requested: {0}")]
    InvalidBufferType(QueueType),
    #[error("queue is not streaming")]
    NotStreaming,
    #[error("buffer with index {0} could not be filled")]
    CorruptedBuffer(usize),
    #[error("no buffer ready for dequeue")]
    NotReady,
}

impl From<DQBufError> for Errno {
    fn from(err: DQBufError) -> Self {
        match err {
            DQBufError::InvalidBufferType(_) | DQBufError::NotStreaming => Errno::EINVAL,
            DQBufError::CorruptedBuffer(_) => Errno::EIO,
            DQBufError::NotReady => Errno::EAGAIN,
        }
    }
}

/// Dequeue the oldest queued buffer once it is filled.
///
/// Blocks until then, unless the file was opened with `O_NONBLOCK`. A
/// blocked call fails with `NotStreaming` if the queue is stopped meanwhile.
pub fn dqbuf(file: &WbFile, queue: QueueType) -> Result<DQBuffer, DQBufError> {
    if queue != QueueType::VideoCapture {
        return Err(DQBufError::InvalidBufferType(queue));
    }

    let shared = file.shared();
    let mut irq = shared.irq.lock().unwrap();
    loop {
        match irq.queue.try_dqbuf() {
            Ok(index) => {
                let buf = irq
                    .queue
                    .buffer(index)
                    .map(DQBuffer::from)
                    .ok_or(DQBufError::NotStreaming)?;
                trace!("omap_wb{}: dequeued buffer {}", shared.index, index);
                return Ok(buf);
            }
            Err(VbError::NotReady) if !file.is_nonblocking() => {
                irq = shared.done.wait(irq).unwrap();
            }
            Err(VbError::NotReady) => return Err(DQBufError::NotReady),
            Err(VbError::BufferError(index)) => return Err(DQBufError::CorruptedBuffer(index)),
            Err(_) => return Err(DQBufError::NotStreaming),
        }
    }
}
