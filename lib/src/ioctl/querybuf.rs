//! `VIDIOC_QUERYBUF`.
use nix::errno::Errno;
use nix::sys::time::TimeVal;
use thiserror::Error;

use crate::device::WbFile;
use crate::ioctl::{BufferField, BufferFlags};
use crate::memory::MemoryType;
use crate::videobuf::VideoBuffer;
use crate::QueueType;

/// Contains all the information that makes sense when using `querybuf`.
#[derive(Debug, Clone)]
pub struct QueryBuffer {
    pub index: usize,
    pub memory: MemoryType,
    pub flags: BufferFlags,
    pub field: BufferField,
    /// Offset to pass to `mmap()` for MMAP buffers.
    pub offset: u32,
    /// Application address for USERPTR buffers.
    pub userptr: u64,
    pub length: u32,
    pub bytesused: u32,
    pub timestamp: Option<TimeVal>,
    pub sequence: u32,
}

impl From<&VideoBuffer> for QueryBuffer {
    fn from(buf: &VideoBuffer) -> Self {
        QueryBuffer {
            index: buf.index,
            memory: buf.memory,
            flags: BufferFlags::of(buf),
            field: buf.field,
            offset: buf.boff,
            userptr: buf.baddr,
            length: buf.bsize,
            bytesused: buf.size,
            timestamp: buf.timestamp,
            sequence: buf.sequence,
        }
    }
}

#[derive(Debug, Error)]
pub enum QueryBufError {
    #[error("invalid buffer type requested: {0}")]
    InvalidBufferType(QueueType),
    #[error("no buffer with index {0}")]
    InvalidIndex(usize),
}

impl From<QueryBufError> for Errno {
    fn from(err: QueryBufError) -> Self {
        match err {
            QueryBufError::InvalidBufferType(_) => Errno::EINVAL,
            QueryBufError::InvalidIndex(_) => Errno::EINVAL,
        }
    }
}

pub fn querybuf(
    file: &WbFile,
    queue: QueueType,
    index: usize,
) -> Result<QueryBuffer, QueryBufError> {
    if queue != QueueType::VideoCapture {
        return Err(QueryBufError::InvalidBufferType(queue));
    }

    let irq = file.shared().irq.lock().unwrap();
    irq.queue
        .buffer(index)
        .map(QueryBuffer::from)
        .ok_or(QueryBufError::InvalidIndex(index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ioctl::tests::TestBench;
    use crate::ioctl::{qbuf, QBuffer};

    #[test]
    fn mmap_offsets() {
        let bench = TestBench::new();
        let file = bench.configured(3);

        let bufs: Vec<_> = (0..3)
            .map(|i| querybuf(&file, QueueType::VideoCapture, i).unwrap())
            .collect();
        // RGB32 160x120: one page per line.
        assert_eq!(bufs[0].length, 4096 * 120);
        assert_eq!(bufs[2].offset, 2 * 4096 * 120);
        assert_eq!(bufs[1].memory, MemoryType::MMAP);
        assert_eq!(bufs[1].flags, BufferFlags::TIMESTAMP_MONOTONIC);

        assert!(matches!(
            querybuf(&file, QueueType::VideoCapture, 3),
            Err(QueryBufError::InvalidIndex(3))
        ));
        assert!(matches!(
            querybuf(&file, QueueType::VideoOverlay, 0),
            Err(QueryBufError::InvalidBufferType(_))
        ));
    }

    #[test]
    fn queued_flag() {
        let bench = TestBench::new();
        let file = bench.configured(2);
        qbuf(&file, QueueType::VideoCapture, QBuffer::mmap(1)).unwrap();

        let buf = querybuf(&file, QueueType::VideoCapture, 1).unwrap();
        assert!(buf.flags.contains(BufferFlags::QUEUED));
        assert_eq!(buf.bytesused, 4096 * 120);
        assert_eq!(buf.field, BufferField::None);
    }
}
