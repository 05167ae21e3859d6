//! Driver model for the OMAP display subsystem (DSS) write-back pipeline,
//! exposed as a V4L2 capture device.
//!
//! The write-back (WB) hardware captures the composed output of an overlay
//! manager, or of a single overlay pipeline, into memory buffers. This crate
//! implements the driver side of that device in layers:
//!
//! * The `platform` module is the seam with the hardware: the DSS
//!   overlay-manager API, the TILER allocator and interrupt registration are
//!   consumed through traits. `platform::sim` provides a software
//!   implementation of them.
//!
//! * `format`, `tiler`, `videobuf`, `queue_ops` and `pipeline` hold the
//!   driver logic proper: format negotiation, TILER buffer bookkeeping, the
//!   generic buffer queue with its four driver callbacks, and the
//!   interrupt-driven frame state machine.
//!
//! * The `ioctl` module is the user-facing surface: one function per V4L2
//!   ioctl, each validating its arguments and returning its own error type.
//!   All error types convert to the `Errno` a kernel handler would return.
//!
//! * The `device` module ties everything together: probing one `WbDevice`
//!   per write-back resource, opening file handles and tearing down on
//!   release.
pub mod config;
pub mod device;
pub mod format;
pub mod ioctl;
pub mod memory;
pub mod pipeline;
pub mod platform;
pub mod queue_ops;
pub mod tiler;
pub mod uapi;
pub mod videobuf;

use std::fmt;
use std::fmt::{Debug, Display};

use enumn::N;

pub use config::WbConfig;
pub use device::{WbDevice, WbDriver, WbFile};

/// Queue types handled by the write-back device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, N)]
#[repr(u32)]
pub enum QueueType {
    VideoCapture = uapi::V4L2_BUF_TYPE_VIDEO_CAPTURE,
    VideoOverlay = uapi::V4L2_BUF_TYPE_VIDEO_OVERLAY,
}

impl Display for QueueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(self, f)
    }
}

/// A Fourcc pixel format, used to pass formats to V4L2. It can be converted
/// back and forth from a 32-bit integer, or a 4-bytes string.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct PixelFormat(u32);

impl PixelFormat {
    pub const RGB565: PixelFormat = PixelFormat::from_fourcc(b"RGBP");
    pub const RGB24: PixelFormat = PixelFormat::from_fourcc(b"RGB3");
    pub const RGB32: PixelFormat = PixelFormat::from_fourcc(b"RGB4");
    pub const ARGB32: PixelFormat = PixelFormat::from_fourcc(b"BA24");
    pub const YUYV: PixelFormat = PixelFormat::from_fourcc(b"YUYV");
    pub const UYVY: PixelFormat = PixelFormat::from_fourcc(b"UYVY");
    pub const NV12: PixelFormat = PixelFormat::from_fourcc(b"NV12");

    pub const fn from_u32(v: u32) -> Self {
        Self(v)
    }

    pub const fn to_u32(self) -> u32 {
        self.0
    }

    pub const fn from_fourcc(n: &[u8; 4]) -> Self {
        Self(n[0] as u32 | (n[1] as u32) << 8 | (n[2] as u32) << 16 | (n[3] as u32) << 24)
    }

    pub const fn to_fourcc(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }
}

/// Converts a Fourcc in 32-bit integer format (like the ones passed in V4L2
/// structures) into the matching pixel format.
///
/// # Examples
///
/// ```
/// # use omap_wb::PixelFormat;
/// // Fourcc representation of NV12.
/// let nv12 = u32::from_le(0x3231564e);
/// let f = PixelFormat::from(nv12);
/// assert_eq!(f, PixelFormat::NV12);
/// ```
impl From<u32> for PixelFormat {
    fn from(i: u32) -> Self {
        Self::from_u32(i)
    }
}

impl From<PixelFormat> for u32 {
    fn from(format: PixelFormat) -> Self {
        format.to_u32()
    }
}

/// Simple way to convert a string litteral (e.g. b"NV12") into a pixel
/// format.
///
/// # Examples
///
/// ```
/// # use omap_wb::PixelFormat;
/// let f = PixelFormat::from(b"UYVY");
/// assert_eq!(f, PixelFormat::UYVY);
/// assert_eq!(&<[u8; 4]>::from(f), b"UYVY");
/// ```
impl From<&[u8; 4]> for PixelFormat {
    fn from(n: &[u8; 4]) -> Self {
        Self::from_fourcc(n)
    }
}

impl From<PixelFormat> for [u8; 4] {
    fn from(format: PixelFormat) -> Self {
        format.to_fourcc()
    }
}

/// Produces a debug string for this PixelFormat, including its hexadecimal
/// and string representation.
///
/// # Examples
///
/// ```
/// # use omap_wb::PixelFormat;
/// assert_eq!(format!("{:?}", PixelFormat::NV12), "0x3231564e (NV12)");
/// ```
impl fmt::Debug for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_fmt(format_args!("0x{:08x} ({})", self.0, self))
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let fourcc = self
            .0
            .to_le_bytes()
            .iter()
            .map(|&x| x as char)
            .collect::<String>();
        f.write_str(fourcc.as_str())
    }
}

/// Description of a single plane in a format.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct PlaneLayout {
    /// Useful size of the plane ; the backing memory must be at least that large.
    pub sizeimage: u32,
    /// Bytes per line of data.
    pub bytesperline: u32,
}

/// Capture format of the write-back device. The device only uses the
/// single-planar API, so at most one plane layout is reported: for NV12 it
/// covers both the luma and the chroma plane.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct Format {
    /// Width of the image in pixels.
    pub width: u32,
    /// Height of the image in pixels.
    pub height: u32,
    /// Format each pixel is encoded in.
    pub pixelformat: PixelFormat,
    /// Layout of the plane. Empty in format requests, filled by negotiation.
    pub plane_fmt: Vec<PlaneLayout>,
}

/// Quickly build a format request from a pixel format and resolution.
///
/// # Examples
///
/// ```
/// # use omap_wb::Format;
/// let f = Format::from((b"RGB4", (160, 120)));
/// assert_eq!(f.width, 160);
/// assert_eq!(f.height, 120);
/// assert_eq!(f.pixelformat.to_string(), "RGB4");
/// assert_eq!(f.plane_fmt.len(), 0);
/// ```
impl<T: Into<PixelFormat>> From<(T, (usize, usize))> for Format {
    fn from((pixel_format, (width, height)): (T, (usize, usize))) -> Self {
        Format {
            width: width as u32,
            height: height as u32,
            pixelformat: pixel_format.into(),
            ..Default::default()
        }
    }
}

/// A rectangle, used for the write-back window (equivalent of `v4l2_rect`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(left: i32, top: i32, width: u32, height: u32) -> Rect {
        Rect {
            left,
            top,
            width,
            height,
        }
    }
}

impl Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}), {}x{}",
            self.left, self.top, self.width, self.height
        )
    }
}
