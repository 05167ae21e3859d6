//! Userspace ABI of the write-back device: the subset of `videodev2.h` values
//! the driver handles, and the vendor write-back ioctl extension.
#![allow(non_camel_case_types)]

use std::mem::size_of;

use nix::sys::ioctl::ioctl_num_type;

pub const V4L2_BUF_TYPE_VIDEO_CAPTURE: u32 = 1;
pub const V4L2_BUF_TYPE_VIDEO_OVERLAY: u32 = 3;

pub const V4L2_MEMORY_MMAP: u32 = 1;
pub const V4L2_MEMORY_USERPTR: u32 = 2;
pub const V4L2_MEMORY_OVERLAY: u32 = 3;

pub const V4L2_FIELD_ANY: u32 = 0;
pub const V4L2_FIELD_NONE: u32 = 1;
pub const V4L2_FIELD_TOP: u32 = 2;
pub const V4L2_FIELD_BOTTOM: u32 = 3;
pub const V4L2_FIELD_INTERLACED: u32 = 4;

pub const V4L2_BUF_FLAG_MAPPED: u32 = 0x0000_0001;
pub const V4L2_BUF_FLAG_QUEUED: u32 = 0x0000_0002;
pub const V4L2_BUF_FLAG_DONE: u32 = 0x0000_0004;
pub const V4L2_BUF_FLAG_ERROR: u32 = 0x0000_0040;
pub const V4L2_BUF_FLAG_TIMESTAMP_MONOTONIC: u32 = 0x0000_2000;

pub const V4L2_CAP_VIDEO_CAPTURE: u32 = 0x0000_0001;
pub const V4L2_CAP_VIDEO_OVERLAY: u32 = 0x0000_0004;
pub const V4L2_CAP_STREAMING: u32 = 0x0400_0000;

/// Maximum number of buffers a V4L2 queue can hold.
pub const VIDEO_MAX_FRAME: u32 = 32;

pub const BASE_VIDIOC_PRIVATE: u8 = 192;

/// Argument of the `VIDIOC_CUSTOM_S_WB` and `VIDIOC_CUSTOM_G_WB` ioctls.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct v4l2_writeback_ioctl_data {
    pub enabled: i32,
    pub source: i32,
    pub capturemode: i32,
    pub source_type: i32,
}

pub const VIDIOC_CUSTOM_S_WB: ioctl_num_type = nix::request_code_write!(
    b'V',
    BASE_VIDIOC_PRIVATE + 12,
    size_of::<v4l2_writeback_ioctl_data>()
);

pub const VIDIOC_CUSTOM_G_WB: ioctl_num_type = nix::request_code_read!(
    b'V',
    BASE_VIDIOC_PRIVATE + 13,
    size_of::<v4l2_writeback_ioctl_data>()
);
