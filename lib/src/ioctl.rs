//! The V4L2 ioctls handled by the write-back device.
//!
//! Each ioctl is a function taking the open file it is issued on and the
//! relevant input as parameters, rather than the raw input/output structure
//! user-space passes. The function validates its input, drives the device
//! and returns a safe representation of the result.
//!
//! Every ioctl has its own error type. This helps telling apart situations
//! that are not errors from the point of view of the caller: for instance,
//! `VIDIOC_DQBUF` on a non-blocking file returns `NotReady` if no buffer has
//! completed yet. All error types can be converted into the `Errno` a kernel
//! ioctl handler would return through their `Into<Errno>` implementation,
//! and into the negative integer itself through `IntoErrno`.
//!
//! Lock order is always the device state first, then the interrupt state.
//! The only path that blocks, `dqbuf`, holds the interrupt state alone.

mod dqbuf;
mod g_fmt;
mod mmap;
mod qbuf;
mod querybuf;
mod querycap;
mod reqbufs;
mod streamon;
mod wb;

pub use dqbuf::*;
pub use g_fmt::*;
pub use mmap::*;
pub use qbuf::*;
pub use querybuf::*;
pub use querycap::*;
pub use reqbufs::*;
pub use streamon::*;
pub use wb::*;

use bitflags::bitflags;
use enumn::N;
use nix::errno::Errno;

use crate::uapi;
use crate::videobuf::{BufferState, VideoBuffer};

/// Extension trait for allowing easy conversion of ioctl errors into the
/// value an ioctl handler returns.
pub trait IntoErrno {
    fn into_errno(self) -> i32;
}

impl<T> IntoErrno for T
where
    T: Into<Errno>,
{
    fn into_errno(self) -> i32 {
        -(self.into() as i32)
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    /// `flags` member of `struct v4l2_buffer`.
    pub struct BufferFlags: u32 {
        const MAPPED = uapi::V4L2_BUF_FLAG_MAPPED;
        const QUEUED = uapi::V4L2_BUF_FLAG_QUEUED;
        const DONE = uapi::V4L2_BUF_FLAG_DONE;
        const ERROR = uapi::V4L2_BUF_FLAG_ERROR;
        const TIMESTAMP_MONOTONIC = uapi::V4L2_BUF_FLAG_TIMESTAMP_MONOTONIC;
    }
}

impl BufferFlags {
    /// Flags reported to user-space for `buf`.
    pub(crate) fn of(buf: &VideoBuffer) -> Self {
        let mut flags = BufferFlags::TIMESTAMP_MONOTONIC;
        if buf.map_count > 0 {
            flags |= BufferFlags::MAPPED;
        }
        match buf.state {
            BufferState::Prepared | BufferState::Queued | BufferState::Active => {
                flags |= BufferFlags::QUEUED
            }
            BufferState::Done => flags |= BufferFlags::DONE,
            BufferState::Error => flags |= BufferFlags::DONE | BufferFlags::ERROR,
            BufferState::NeedsInit | BufferState::Idle => (),
        }
        flags
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, N)]
#[repr(u32)]
pub enum BufferField {
    #[default]
    Any = uapi::V4L2_FIELD_ANY,
    None = uapi::V4L2_FIELD_NONE,
    Top = uapi::V4L2_FIELD_TOP,
    Bottom = uapi::V4L2_FIELD_BOTTOM,
    Interlaced = uapi::V4L2_FIELD_INTERLACED,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::negotiate;
    use crate::memory::MemoryType;
    use crate::platform::sim::{SimDss, SimTiler};
    use crate::platform::Platform;
    use crate::{Format, PixelFormat, QueueType, WbConfig, WbDriver, WbFile};
    use nix::fcntl::OFlag;
    use std::sync::Arc;

    pub(super) struct TestBench {
        pub dss: Arc<SimDss>,
        pub tiler: Arc<SimTiler>,
        pub driver: WbDriver,
    }

    impl TestBench {
        pub fn new() -> Self {
            let dss = Arc::new(SimDss::default());
            let tiler = Arc::new(SimTiler::new());
            let driver = WbDriver::probe(
                Platform::new(dss.clone(), tiler.clone()),
                WbConfig::default(),
            )
            .unwrap();

            TestBench { dss, tiler, driver }
        }

        pub fn open(&self) -> WbFile {
            self.driver.device(0).unwrap().open(OFlag::O_RDWR)
        }

        pub fn open_nonblocking(&self) -> WbFile {
            self.driver
                .device(0)
                .unwrap()
                .open(OFlag::O_RDWR | OFlag::O_NONBLOCK)
        }

        /// RGB32 160x120 capture with `count` MMAP buffers.
        pub fn configured(&self, count: u32) -> WbFile {
            let file = self.open_nonblocking();
            s_fmt(&file, Format::from((PixelFormat::RGB32, (160, 120)))).unwrap();
            assert_eq!(
                reqbufs(&file, QueueType::VideoCapture, MemoryType::MMAP, count).unwrap(),
                count
            );
            file
        }
    }

    #[test]
    fn into_errno() {
        assert_eq!(Errno::EBUSY.into_errno(), -16);
        assert_eq!(
            ReqbufsError::Streaming.into_errno(),
            -(Errno::EBUSY as i32)
        );
    }

    #[test]
    fn flags_follow_buffer_state() {
        let fmt = negotiate(&Format::from((PixelFormat::RGB565, (64, 64))), 4096).unwrap();
        let mut buf = VideoBuffer {
            index: 0,
            state: BufferState::Active,
            memory: MemoryType::MMAP,
            width: fmt.width,
            height: fmt.height,
            bytesperline: fmt.bytesperline,
            size: fmt.sizeimage,
            field: BufferField::None,
            bsize: fmt.sizeimage,
            boff: 0,
            baddr: 0,
            timestamp: None,
            sequence: 0,
            map_count: 1,
        };

        assert_eq!(
            BufferFlags::of(&buf),
            BufferFlags::MAPPED | BufferFlags::QUEUED | BufferFlags::TIMESTAMP_MONOTONIC
        );
        buf.state = BufferState::Error;
        buf.map_count = 0;
        assert_eq!(
            BufferFlags::of(&buf),
            BufferFlags::DONE | BufferFlags::ERROR | BufferFlags::TIMESTAMP_MONOTONIC
        );
    }
}
