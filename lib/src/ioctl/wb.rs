//! `VIDIOC_CUSTOM_(S|G)_WB`: selection of what feeds the write-back pipeline.
use log::debug;
use nix::errno::Errno;
use nix::sys::ioctl::ioctl_num_type;
use thiserror::Error;

use crate::device::WbFile;
use crate::platform::{WbCaptureMode, WbSource, WbSourceType};
use crate::uapi::{self, v4l2_writeback_ioctl_data};

/// Vendor write-back settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WbSettings {
    /// Stored and reported back only. Write-back is enabled by `streamon`
    /// and disabled by `streamoff`.
    pub enabled: bool,
    pub source: WbSource,
    pub capture_mode: WbCaptureMode,
    pub source_type: WbSourceType,
}

impl TryFrom<v4l2_writeback_ioctl_data> for WbSettings {
    type Error = WbError;

    fn try_from(data: v4l2_writeback_ioctl_data) -> Result<Self, Self::Error> {
        let decode = |v: i32| u32::try_from(v).ok();
        Ok(WbSettings {
            enabled: data.enabled != 0,
            source: decode(data.source)
                .and_then(WbSource::n)
                .ok_or(WbError::InvalidSource(data.source))?,
            capture_mode: decode(data.capturemode)
                .and_then(WbCaptureMode::n)
                .ok_or(WbError::InvalidCaptureMode(data.capturemode))?,
            source_type: decode(data.source_type)
                .and_then(WbSourceType::n)
                .ok_or(WbError::InvalidSourceType(data.source_type))?,
        })
    }
}

impl From<WbSettings> for v4l2_writeback_ioctl_data {
    fn from(settings: WbSettings) -> Self {
        v4l2_writeback_ioctl_data {
            enabled: settings.enabled as i32,
            source: settings.source as i32,
            capturemode: settings.capture_mode as i32,
            source_type: settings.source_type as i32,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WbError {
    #[error("invalid write-back source {0}")]
    InvalidSource(i32),
    #[error("invalid capture mode {0}")]
    InvalidCaptureMode(i32),
    #[error("invalid source type {0}")]
    InvalidSourceType(i32),
    #[error("{0:?} is not a source of type {1:?}")]
    SourceTypeMismatch(WbSource, WbSourceType),
    #[error("{0:?} does not exist on this display subsystem")]
    NoSuchSource(WbSource),
    #[error("unknown ioctl request 0x{0:x}")]
    UnknownRequest(u64),
}

impl From<WbError> for Errno {
    fn from(err: WbError) -> Self {
        match err {
            WbError::UnknownRequest(_) => Errno::ENOTTY,
            _ => Errno::EINVAL,
        }
    }
}

/// Set the write-back source and capture mode. When streaming, the new
/// settings apply from the next programmed frame.
pub fn s_wb(file: &WbFile, settings: WbSettings) -> Result<WbSettings, WbError> {
    let shared = file.shared();
    if settings.source.source_type() != settings.source_type {
        return Err(WbError::SourceTypeMismatch(
            settings.source,
            settings.source_type,
        ));
    }
    let available = match settings.source_type {
        WbSourceType::Manager => shared.platform.dss.num_managers(),
        WbSourceType::Overlay => shared.platform.dss.num_overlays(),
    };
    if settings.source.id() >= available {
        return Err(WbError::NoSuchSource(settings.source));
    }

    let mut state = shared.lock_state();
    state.settings = settings;
    let program = state.program();
    {
        let mut irq = shared.irq.lock().unwrap();
        if irq.frames.is_streaming() {
            irq.frames.set_program(program);
        }
    }
    debug!(
        "omap_wb{}: source {:?}, capture mode {:?}",
        shared.index, settings.source, settings.capture_mode
    );

    Ok(settings)
}

pub fn g_wb(file: &WbFile) -> WbSettings {
    file.shared().lock_state().settings
}

/// Handle one of the vendor write-back ioctls on its raw argument.
pub fn custom_ioctl(
    file: &WbFile,
    request: ioctl_num_type,
    data: &mut v4l2_writeback_ioctl_data,
) -> Result<(), WbError> {
    match request {
        uapi::VIDIOC_CUSTOM_S_WB => {
            let settings = s_wb(file, WbSettings::try_from(*data)?)?;
            *data = settings.into();
        }
        uapi::VIDIOC_CUSTOM_G_WB => *data = g_wb(file).into(),
        _ => return Err(WbError::UnknownRequest(request as u64)),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ioctl::tests::TestBench;
    use crate::ioctl::{qbuf, streamoff, streamon, QBuffer};
    use crate::platform::DisplaySubsystem;
    use crate::QueueType;

    #[test]
    fn default_settings() {
        let bench = TestBench::new();
        let file = bench.open();

        let settings = g_wb(&file);
        assert!(!settings.enabled);
        assert_eq!(settings.source, WbSource::Lcd1Manager);
        assert_eq!(settings.source_type, WbSourceType::Manager);
        assert_eq!(settings.capture_mode, WbCaptureMode::All);
    }

    #[test]
    fn source_validation() {
        let bench = TestBench::new();
        let file = bench.open();

        let mismatch = WbSettings {
            source: WbSource::Overlay2,
            ..Default::default()
        };
        assert!(matches!(
            s_wb(&file, mismatch),
            Err(WbError::SourceTypeMismatch(..))
        ));

        let overlay = WbSettings {
            enabled: true,
            source: WbSource::Overlay3,
            source_type: WbSourceType::Overlay,
            capture_mode: WbCaptureMode::OneOfTwo,
        };
        assert_eq!(s_wb(&file, overlay), Ok(overlay));
        assert_eq!(g_wb(&file), overlay);
    }

    #[test]
    fn raw_ioctls() {
        let bench = TestBench::new();
        let file = bench.open();

        let mut data = v4l2_writeback_ioctl_data {
            enabled: 1,
            source: WbSource::TvManager as i32,
            capturemode: WbCaptureMode::OneOfFour as i32,
            source_type: WbSourceType::Manager as i32,
        };
        custom_ioctl(&file, uapi::VIDIOC_CUSTOM_S_WB, &mut data).unwrap();

        let mut read = v4l2_writeback_ioctl_data::default();
        custom_ioctl(&file, uapi::VIDIOC_CUSTOM_G_WB, &mut read).unwrap();
        assert_eq!(read, data);
        assert_eq!(g_wb(&file).capture_mode, WbCaptureMode::OneOfFour);

        let mut bogus = v4l2_writeback_ioctl_data {
            source: 42,
            ..data
        };
        let err = custom_ioctl(&file, uapi::VIDIOC_CUSTOM_S_WB, &mut bogus).unwrap_err();
        assert_eq!(err, WbError::InvalidSource(42));
        assert_eq!(Errno::from(err), Errno::EINVAL);
        bogus.source = 0;
        bogus.capturemode = -1;
        assert_eq!(
            custom_ioctl(&file, uapi::VIDIOC_CUSTOM_S_WB, &mut bogus),
            Err(WbError::InvalidCaptureMode(-1))
        );

        let err = custom_ioctl(&file, 0, &mut data).unwrap_err();
        assert_eq!(Errno::from(err), Errno::ENOTTY);
    }

    #[test]
    fn settings_follow_into_stream() {
        let bench = TestBench::new();
        let file = bench.configured(2);
        qbuf(&file, QueueType::VideoCapture, QBuffer::mmap(0)).unwrap();
        streamon(&file, QueueType::VideoCapture).unwrap();
        assert_eq!(
            bench.dss.last_applied(0).unwrap().source,
            WbSource::Lcd1Manager
        );

        s_wb(
            &file,
            WbSettings {
                enabled: true,
                source: WbSource::Lcd2Manager,
                source_type: WbSourceType::Manager,
                capture_mode: WbCaptureMode::All,
            },
        )
        .unwrap();
        // Picked up by the next programmed frame.
        qbuf(&file, QueueType::VideoCapture, QBuffer::mmap(1)).unwrap();
        assert_eq!(
            bench.dss.last_applied(0).unwrap().source,
            WbSource::Lcd2Manager
        );
    }

    #[test]
    fn enabled_flag_does_not_gate_streaming() {
        let bench = TestBench::new();
        let file = bench.configured(1);
        let disabled = WbSettings {
            enabled: false,
            ..Default::default()
        };
        s_wb(&file, disabled).unwrap();
        assert!(!g_wb(&file).enabled);

        qbuf(&file, QueueType::VideoCapture, QBuffer::mmap(0)).unwrap();
        streamon(&file, QueueType::VideoCapture).unwrap();
        assert!(bench.dss.last_applied(0).unwrap().enabled);

        streamoff(&file, QueueType::VideoCapture).unwrap();
        assert!(!bench.dss.get_wb_info(0).unwrap().enabled);
    }
}
