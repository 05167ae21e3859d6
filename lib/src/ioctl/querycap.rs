//! `VIDIOC_QUERYCAP`.
use std::fmt;

use bitflags::bitflags;

use crate::device::WbFile;
use crate::uapi;

bitflags! {
    /// Capability flags reported by `VIDIOC_QUERYCAP`.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Capabilities: u32 {
        const VIDEO_CAPTURE = uapi::V4L2_CAP_VIDEO_CAPTURE;
        const VIDEO_OVERLAY = uapi::V4L2_CAP_VIDEO_OVERLAY;
        const STREAMING = uapi::V4L2_CAP_STREAMING;
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Safe variant of `struct v4l2_capability`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capability {
    pub driver: String,
    pub card: String,
    pub bus_info: String,
    pub version: u32,
    pub capabilities: Capabilities,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Driver: {}", self.driver)?;
        writeln!(f, "Card: {}", self.card)?;
        writeln!(f, "Bus info: {}", self.bus_info)?;
        writeln!(
            f,
            "Version: {}.{}.{}",
            (self.version >> 16) & 0xff,
            (self.version >> 8) & 0xff,
            self.version & 0xff
        )?;
        write!(f, "Capabilities: {}", self.capabilities)
    }
}

const DRIVER_NAME: &str = "omap_wb";
const DRIVER_VERSION: u32 = 0x0000_0001;

pub fn querycap(file: &WbFile) -> Capability {
    Capability {
        driver: DRIVER_NAME.into(),
        card: DRIVER_NAME.into(),
        bus_info: format!("platform:{}", file.device().name()),
        version: DRIVER_VERSION,
        capabilities: Capabilities::VIDEO_CAPTURE
            | Capabilities::VIDEO_OVERLAY
            | Capabilities::STREAMING,
    }
}
