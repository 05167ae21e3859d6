//! Kinds of backing memory a write-back buffer can use.
//!
//! `MMAP` buffers are allocated by the driver from the TILER and mapped into
//! the application with `mmap()`. `USERPTR` buffers are provided by the
//! application; their address must resolve to TILER memory so the hardware
//! can write into it. `OVERLAY` is accepted by the V4L2 API but has no
//! meaning for write-back and is rejected by the driver.
use enumn::N;

use crate::uapi;

/// All the V4L2 memory types a buffer request can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, N)]
#[repr(u32)]
pub enum MemoryType {
    MMAP = uapi::V4L2_MEMORY_MMAP,
    UserPtr = uapi::V4L2_MEMORY_USERPTR,
    Overlay = uapi::V4L2_MEMORY_OVERLAY,
}

impl MemoryType {
    /// Whether write-back buffers can be backed by this kind of memory.
    pub fn is_supported(&self) -> bool {
        matches!(self, MemoryType::MMAP | MemoryType::UserPtr)
    }
}
