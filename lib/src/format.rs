//! Capture format negotiation.
//!
//! A requested format is turned into something the write-back hardware can
//! produce: the size is clamped to the supported range, the pixel format is
//! mapped to a DSS color mode, and the line length is padded to a whole
//! number of pages so every line can be remapped to user space on its own.
use thiserror::Error;

use crate::platform::TilerFormat;
use crate::{Format, PixelFormat, PlaneLayout, Rect};

pub const WB_MIN_WIDTH: u32 = 2;
pub const WB_MIN_HEIGHT: u32 = 2;
pub const WB_MAX_WIDTH: u32 = 2048;
pub const WB_MAX_HEIGHT: u32 = 2048;

/// Output color modes of the write-back pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ColorMode {
    #[default]
    Rgb16,
    Rgb24Packed,
    Argb32,
    Yuv2,
    Uyvy,
    Nv12,
}

impl ColorMode {
    pub fn from_pixelformat(pixelformat: PixelFormat) -> Option<Self> {
        match pixelformat {
            PixelFormat::RGB565 => Some(ColorMode::Rgb16),
            PixelFormat::RGB24 => Some(ColorMode::Rgb24Packed),
            PixelFormat::RGB32 | PixelFormat::ARGB32 => Some(ColorMode::Argb32),
            PixelFormat::YUYV => Some(ColorMode::Yuv2),
            PixelFormat::UYVY => Some(ColorMode::Uyvy),
            PixelFormat::NV12 => Some(ColorMode::Nv12),
            _ => None,
        }
    }

    /// Bytes per pixel. For NV12 this is the luma plane only.
    pub fn bpp(&self) -> u32 {
        match self {
            ColorMode::Nv12 => 1,
            ColorMode::Rgb16 | ColorMode::Yuv2 | ColorMode::Uyvy => 2,
            ColorMode::Rgb24Packed => 3,
            ColorMode::Argb32 => 4,
        }
    }

    /// Whether pixels come in horizontal pairs sharing chroma samples.
    pub fn is_yuv(&self) -> bool {
        matches!(self, ColorMode::Yuv2 | ColorMode::Uyvy | ColorMode::Nv12)
    }

    pub fn tiler_format(&self) -> TilerFormat {
        TilerFormat::for_bpp(self.bpp())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FormatError {
    #[error("pixel format {0} is not supported by write-back")]
    UnsupportedPixelFormat(PixelFormat),
}

/// A format the hardware has agreed to, with the values derived from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedFormat {
    pub width: u32,
    pub height: u32,
    pub pixelformat: PixelFormat,
    pub color_mode: ColorMode,
    pub bpp: u32,
    /// Line length, padded to the page size.
    pub bytesperline: u32,
    /// Total image size, including the chroma plane for NV12.
    pub sizeimage: u32,
}

impl NegotiatedFormat {
    /// Size of the luma (or only) plane.
    pub fn luma_size(&self) -> u32 {
        self.bytesperline * self.height
    }

    /// Size of the chroma plane, zero unless the format is NV12.
    pub fn chroma_size(&self) -> u32 {
        match self.color_mode {
            ColorMode::Nv12 => self.bytesperline * (self.height / 2),
            _ => 0,
        }
    }

    pub fn to_format(&self) -> Format {
        Format {
            width: self.width,
            height: self.height,
            pixelformat: self.pixelformat,
            plane_fmt: vec![PlaneLayout {
                sizeimage: self.sizeimage,
                bytesperline: self.bytesperline,
            }],
        }
    }
}

/// Adjust `requested` to what the write-back hardware supports.
///
/// Unknown pixel formats are rejected rather than replaced by a default.
pub fn negotiate(requested: &Format, page_size: u32) -> Result<NegotiatedFormat, FormatError> {
    let color_mode = ColorMode::from_pixelformat(requested.pixelformat)
        .ok_or(FormatError::UnsupportedPixelFormat(requested.pixelformat))?;

    let mut width = requested.width.clamp(WB_MIN_WIDTH, WB_MAX_WIDTH);
    let mut height = requested.height.clamp(WB_MIN_HEIGHT, WB_MAX_HEIGHT);
    if color_mode.is_yuv() {
        width &= !1;
    }
    if color_mode == ColorMode::Nv12 {
        height &= !1;
    }

    let bpp = color_mode.bpp();
    let bytesperline = round_up(width * bpp, page_size);
    let luma_size = bytesperline * height;
    let sizeimage = match color_mode {
        ColorMode::Nv12 => luma_size + luma_size / 2,
        _ => luma_size,
    };

    Ok(NegotiatedFormat {
        width,
        height,
        pixelformat: requested.pixelformat,
        color_mode,
        bpp,
        bytesperline,
        sizeimage,
    })
}

/// Window of `width` x `height` centered in the reference display. Images
/// larger than the display are anchored at the origin.
pub fn center_window(width: u32, height: u32, reference: (u32, u32)) -> Rect {
    let (ref_width, ref_height) = reference;
    let left = (ref_width.saturating_sub(width) / 2) & !1;
    let top = ref_height.saturating_sub(height) / 2;

    Rect::new(left as i32, top as i32, width, height)
}

/// Clamp a window so it stays within the reference display.
pub fn clamp_window(window: Rect, reference: (u32, u32)) -> Rect {
    let (ref_width, ref_height) = reference;
    let left = window.left.clamp(0, ref_width as i32 - WB_MIN_WIDTH as i32);
    let top = window.top.clamp(0, ref_height as i32 - WB_MIN_HEIGHT as i32);
    let width = window
        .width
        .clamp(WB_MIN_WIDTH, ref_width - left as u32);
    let height = window
        .height
        .clamp(WB_MIN_HEIGHT, ref_height - top as u32);

    Rect::new(left, top, width, height)
}

pub(crate) fn round_up(value: u32, align: u32) -> u32 {
    value.div_ceil(align) * align
}
