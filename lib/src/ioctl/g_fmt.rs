//! `VIDIOC_(G|S|TRY)_FMT` for the capture queue, and `VIDIOC_(G|S)_FMT` for
//! the overlay queue, which carries the write-back window.
use log::debug;
use nix::errno::Errno;
use thiserror::Error;

use crate::device::WbFile;
use crate::format::{center_window, clamp_window, negotiate, FormatError};
use crate::{Format, QueueType, Rect};

#[derive(Debug, Error)]
pub enum GFmtError {
    #[error("invalid buffer type requested: {0}")]
    InvalidBufferType(QueueType),
}

impl From<GFmtError> for Errno {
    fn from(err: GFmtError) -> Self {
        match err {
            GFmtError::InvalidBufferType(_) => Errno::EINVAL,
        }
    }
}

/// Current capture format.
pub fn g_fmt(file: &WbFile, queue: QueueType) -> Result<Format, GFmtError> {
    if queue != QueueType::VideoCapture {
        return Err(GFmtError::InvalidBufferType(queue));
    }

    Ok(file.shared().lock_state().format.to_format())
}

#[derive(Debug, Error)]
pub enum SFmtError {
    #[error("invalid format: {0}")]
    InvalidFormat(#[from] FormatError),
    #[error("invalid buffer type requested: {0}")]
    InvalidBufferType(QueueType),
    #[error("device currently busy")]
    DeviceBusy,
}

impl From<SFmtError> for Errno {
    fn from(err: SFmtError) -> Self {
        match err {
            SFmtError::InvalidFormat(_) => Errno::EINVAL,
            SFmtError::InvalidBufferType(_) => Errno::EINVAL,
            SFmtError::DeviceBusy => Errno::EBUSY,
        }
    }
}

/// Set the capture format. The result is what the hardware will actually
/// produce. The write-back window is re-centered on the reference display.
///
/// Refused while streaming. Buffers of the previous format are freed, as
/// `REQBUFS(0)` would, so the format is refused as well while any of them
/// is mapped.
pub fn s_fmt(file: &WbFile, format: Format) -> Result<Format, SFmtError> {
    let shared = file.shared();
    let mut state = shared.lock_state();
    if shared.is_streaming() || state.mmap_count > 0 {
        return Err(SFmtError::DeviceBusy);
    }

    let negotiated = negotiate(&format, shared.config.page_size)?;
    shared
        .with_queue(&mut state, |vbq, ops| vbq.free(ops))
        .map_err(|_| SFmtError::DeviceBusy)?;
    state.tiler.free_all();

    state.window = center_window(
        negotiated.width,
        negotiated.height,
        (
            shared.config.reference_width,
            shared.config.reference_height,
        ),
    );
    debug!(
        "omap_wb{}: format {} {}x{}, window {}",
        shared.index, negotiated.pixelformat, negotiated.width, negotiated.height, state.window
    );
    state.format = negotiated;

    Ok(state.format.to_format())
}

#[derive(Debug, Error)]
pub enum TryFmtError {
    #[error("invalid format: {0}")]
    InvalidFormat(#[from] FormatError),
}

impl From<TryFmtError> for Errno {
    fn from(err: TryFmtError) -> Self {
        match err {
            TryFmtError::InvalidFormat(_) => Errno::EINVAL,
        }
    }
}

/// Format `s_fmt` would set for `format`, without applying it.
pub fn try_fmt(file: &WbFile, format: &Format) -> Result<Format, TryFmtError> {
    Ok(negotiate(format, file.shared().config.page_size)?.to_format())
}

/// Current write-back window.
pub fn g_fmt_overlay(file: &WbFile) -> Rect {
    file.shared().lock_state().window
}

/// Set the write-back window, clamped to the reference display. Refused
/// while streaming.
pub fn s_fmt_overlay(file: &WbFile, window: Rect) -> Result<Rect, SFmtError> {
    let shared = file.shared();
    let mut state = shared.lock_state();
    if shared.is_streaming() {
        return Err(SFmtError::DeviceBusy);
    }

    state.window = clamp_window(
        window,
        (
            shared.config.reference_width,
            shared.config.reference_height,
        ),
    );

    Ok(state.window)
}
