//! Driver-wide settings, the equivalent of the module parameters.
use crate::uapi::VIDEO_MAX_FRAME;
use crate::{Format, PixelFormat};

/// Settings applied to every write-back device created at probe time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WbConfig {
    /// Size of the display the write-back window is centered in.
    pub reference_width: u32,
    pub reference_height: u32,
    /// Upper bound on the number of buffers `REQBUFS` can obtain.
    pub max_buffers: u32,
    /// Granularity lines are padded to, and `mmap` works with.
    pub page_size: u32,
    /// Format the capture queue starts with.
    pub default_format: Format,
}

impl Default for WbConfig {
    fn default() -> Self {
        WbConfig {
            reference_width: 1920,
            reference_height: 1080,
            max_buffers: VIDEO_MAX_FRAME,
            page_size: 4096,
            default_format: Format::from((PixelFormat::RGB565, (640, 480))),
        }
    }
}

impl WbConfig {
    /// Buffer count actually usable, never above the V4L2 limit.
    pub fn max_buffers(&self) -> usize {
        self.max_buffers.clamp(1, VIDEO_MAX_FRAME) as usize
    }
}
