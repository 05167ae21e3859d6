//! `VIDIOC_REQBUFS`.
use log::debug;
use nix::errno::Errno;
use thiserror::Error;

use crate::device::WbFile;
use crate::memory::MemoryType;
use crate::videobuf::VbError;
use crate::QueueType;

#[derive(Debug, Error)]
pub enum ReqbufsError {
    #[error("invalid buffer ({0}) or memory type ({1:?}) requested")]
    InvalidBufferType(QueueType, MemoryType),
    #[error("queue is streaming")]
    Streaming,
    #[error("buffers are still mapped")]
    Mapped,
    #[error("not enough memory for a single buffer")]
    NoMemory,
    #[error("ioctl error: {0}")]
    IoctlError(Errno),
}

impl From<ReqbufsError> for Errno {
    fn from(err: ReqbufsError) -> Self {
        match err {
            ReqbufsError::InvalidBufferType(_, _) => Errno::EINVAL,
            ReqbufsError::Streaming | ReqbufsError::Mapped => Errno::EBUSY,
            ReqbufsError::NoMemory => Errno::ENOMEM,
            ReqbufsError::IoctlError(e) => e,
        }
    }
}

impl From<VbError> for ReqbufsError {
    fn from(err: VbError) -> Self {
        match err {
            VbError::Streaming => ReqbufsError::Streaming,
            VbError::Mapped => ReqbufsError::Mapped,
            VbError::Driver(Errno::ENOMEM) => ReqbufsError::NoMemory,
            e => ReqbufsError::IoctlError(e.into()),
        }
    }
}

/// Allocate `count` buffers of memory type `memory`, replacing the current
/// ones. Returns the number of buffers obtained, which can be lower than
/// requested. A count of zero frees all buffers and fails if any of them is
/// still mapped.
pub fn reqbufs(
    file: &WbFile,
    queue: QueueType,
    memory: MemoryType,
    count: u32,
) -> Result<u32, ReqbufsError> {
    if queue != QueueType::VideoCapture || !memory.is_supported() {
        return Err(ReqbufsError::InvalidBufferType(queue, memory));
    }

    let shared = file.shared();
    let mut state = shared.lock_state();
    if state.mmap_count > 0 {
        return Err(ReqbufsError::Mapped);
    }

    let obtained = shared.with_queue(&mut state, |vbq, ops| vbq.reqbufs(ops, memory, count))?;
    if obtained == 0 {
        state.tiler.free_all();
    }
    debug!(
        "omap_wb{}: {} of {} {:?} buffers",
        shared.index, obtained, count, memory
    );

    Ok(obtained)
}
