//! `VIDIOC_QBUF`.
use log::trace;
use nix::errno::Errno;
use thiserror::Error;

use crate::device::WbFile;
use crate::memory::MemoryType;
use crate::videobuf::VbError;
use crate::QueueType;

/// Buffer handed to `qbuf`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QBuffer {
    pub index: usize,
    pub memory: MemoryType,
    /// Address and length of the application memory, for USERPTR buffers.
    pub userptr: Option<(u64, u32)>,
}

impl QBuffer {
    pub fn mmap(index: usize) -> Self {
        QBuffer {
            index,
            memory: MemoryType::MMAP,
            userptr: None,
        }
    }

    pub fn userptr(index: usize, addr: u64, length: u32) -> Self {
        QBuffer {
            index,
            memory: MemoryType::UserPtr,
            userptr: Some((addr, length)),
        }
    }
}

#[derive(Debug, Error)]
pub enum QBufError {
    #[error("invalid buffer type requested: {0}")]
    InvalidBufferType(QueueType),
    #[error("no buffer with index {0}")]
    InvalidIndex(usize),
    #[error("memory type {0:?} does not match the allocated buffers")]
    MemoryMismatch(MemoryType),
    #[error("buffer {0} is already queued")]
    AlreadyQueued(usize),
    #[error("ioctl error: {0}")]
    IoctlError(Errno),
}

impl From<VbError> for QBufError {
    fn from(err: VbError) -> Self {
        match err {
            VbError::InvalidIndex(i) => QBufError::InvalidIndex(i),
            VbError::MemoryMismatch(m) => QBufError::MemoryMismatch(m),
            VbError::AlreadyQueued(i) => QBufError::AlreadyQueued(i),
            e => QBufError::IoctlError(e.into()),
        }
    }
}

impl From<QBufError> for Errno {
    fn from(err: QBufError) -> Self {
        match err {
            QBufError::InvalidBufferType(_)
            | QBufError::InvalidIndex(_)
            | QBufError::MemoryMismatch(_)
            | QBufError::AlreadyQueued(_) => Errno::EINVAL,
            QBufError::IoctlError(e) => e,
        }
    }
}

/// Queue a buffer for capture.
///
/// If the hardware is writing a frame and nothing is programmed behind it,
/// the buffer is programmed immediately so capture continues without a gap.
pub fn qbuf(file: &WbFile, queue: QueueType, buffer: QBuffer) -> Result<(), QBufError> {
    if queue != QueueType::VideoCapture {
        return Err(QBufError::InvalidBufferType(queue));
    }

    let shared = file.shared();
    let mut state = shared.lock_state();
    shared.with_queue(&mut state, |vbq, ops| -> Result<(), QBufError> {
        let was_empty = !ops.frames.has_pending();
        vbq.qbuf(ops, buffer.index, buffer.memory, buffer.userptr)?;
        if ops.frames.qbuf_kick(vbq, was_empty) {
            trace!("omap_wb{}: buffer {} programmed on queue", shared.index, buffer.index);
        }

        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ioctl::tests::TestBench;
    use crate::ioctl::{reqbufs, streamon};
    use crate::pipeline::PipelineState;
    use crate::platform::PhysAddr;

    #[test]
    fn qbuf_before_reqbufs() {
        let bench = TestBench::new();
        let file = bench.open();

        let err = qbuf(&file, QueueType::VideoCapture, QBuffer::mmap(0)).unwrap_err();
        assert!(matches!(err, QBufError::MemoryMismatch(MemoryType::MMAP)));
        assert_eq!(Errno::from(err), Errno::EINVAL);
    }

    #[test]
    fn invalid_buffers() {
        let bench = TestBench::new();
        let file = bench.configured(2);

        assert!(matches!(
            qbuf(&file, QueueType::VideoCapture, QBuffer::mmap(2)),
            Err(QBufError::InvalidIndex(2))
        ));
        assert!(matches!(
            qbuf(&file, QueueType::VideoOverlay, QBuffer::mmap(0)),
            Err(QBufError::InvalidBufferType(_))
        ));
        assert!(matches!(
            qbuf(&file, QueueType::VideoCapture, QBuffer::userptr(0, 0x1000, 4096)),
            Err(QBufError::MemoryMismatch(MemoryType::UserPtr))
        ));

        qbuf(&file, QueueType::VideoCapture, QBuffer::mmap(0)).unwrap();
        assert!(matches!(
            qbuf(&file, QueueType::VideoCapture, QBuffer::mmap(0)),
            Err(QBufError::AlreadyQueued(0))
        ));
    }

    #[test]
    fn second_buffer_programmed_immediately() {
        let bench = TestBench::new();
        let file = bench.configured(2);
        qbuf(&file, QueueType::VideoCapture, QBuffer::mmap(0)).unwrap();
        streamon(&file, QueueType::VideoCapture).unwrap();
        assert_eq!(bench.dss.applied().len(), 1);

        qbuf(&file, QueueType::VideoCapture, QBuffer::mmap(1)).unwrap();
        // No interrupt happened in between.
        assert_eq!(file.device().pipeline_stats().interrupts, 0);
        assert_eq!(bench.dss.applied().len(), 2);
        let first = bench.dss.applied()[0].1.paddr;
        let second = bench.dss.applied()[1].1.paddr;
        assert_ne!(first, second);
        assert_eq!(file.device().pipeline_state(), PipelineState::Armed);
    }

    #[test]
    fn userptr_buffers() {
        let bench = TestBench::new();
        let file = bench.configured(1);
        let size = 4096 * 120;
        let phys: PhysAddr = 0x7000_0000;
        bench.tiler.map_user_buffer(0x4000_0000, phys, size);
        reqbufs(&file, QueueType::VideoCapture, MemoryType::UserPtr, 1).unwrap();

        assert!(matches!(
            qbuf(&file, QueueType::VideoCapture, QBuffer::userptr(0, 0x4000_0000, 4096)),
            Err(QBufError::IoctlError(Errno::EINVAL))
        ));
        assert!(matches!(
            qbuf(&file, QueueType::VideoCapture, QBuffer::userptr(0, 0x5000_0000, size)),
            Err(QBufError::IoctlError(Errno::EFAULT))
        ));

        qbuf(&file, QueueType::VideoCapture, QBuffer::userptr(0, 0x4000_0000, size)).unwrap();
        streamon(&file, QueueType::VideoCapture).unwrap();
        assert_eq!(bench.dss.last_applied(0).map(|i| i.paddr), Some(phys));
    }
}
