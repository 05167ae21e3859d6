//! `VIDIOC_STREAM(ON|OFF)`.
use log::{debug, error};
use nix::errno::Errno;
use thiserror::Error;

use crate::device::WbFile;
use crate::pipeline::PipelineError;
use crate::platform::{IrqMask, PlatformError};
use crate::videobuf::VbError;
use crate::QueueType;

#[derive(Debug, Error)]
pub enum StreamOnError {
    #[error("queue type ({0}) not supported")]
    InvalidQueue(QueueType),
    #[error("queue is already streaming")]
    AlreadyStreaming,
    #[error("no buffer queued")]
    NoBuffers,
    #[error("platform error: {0}")]
    Platform(#[from] PlatformError),
}

impl From<StreamOnError> for Errno {
    fn from(err: StreamOnError) -> Self {
        match err {
            StreamOnError::InvalidQueue(_) => Errno::EINVAL,
            StreamOnError::AlreadyStreaming => Errno::EBUSY,
            StreamOnError::NoBuffers => Errno::EIO,
            StreamOnError::Platform(e) => e.into(),
        }
    }
}

impl From<PipelineError> for StreamOnError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Streaming => StreamOnError::AlreadyStreaming,
            PipelineError::NoBuffers => StreamOnError::NoBuffers,
        }
    }
}

/// Start capturing.
///
/// At least one buffer must have been queued. The first one is programmed
/// into the hardware; the others wait for the following frame interrupts.
pub fn streamon(file: &WbFile, queue: QueueType) -> Result<(), StreamOnError> {
    if queue != QueueType::VideoCapture {
        return Err(StreamOnError::InvalidQueue(queue));
    }

    let shared = file.shared();
    let mut state = shared.lock_state();
    {
        let irq = shared.irq.lock().unwrap();
        if irq.queue.is_streaming() {
            return Err(StreamOnError::AlreadyStreaming);
        }
        if irq.queue.stream().next().is_none() {
            return Err(StreamOnError::NoBuffers);
        }
    }

    let handle = shared
        .platform
        .dss
        .register_isr(file.device().irq_handler(), IrqMask::FRAME_DONE_WB)?;
    let program = state.program();

    let result = shared.with_queue(&mut state, |vbq, ops| -> Result<(), StreamOnError> {
        vbq.streamon(ops).map_err(|_| StreamOnError::AlreadyStreaming)?;
        if let Err(e) = ops.frames.stream_on(vbq, program) {
            vbq.cancel(ops);
            return Err(e.into());
        }

        Ok(())
    });

    match result {
        Ok(()) => {
            state.isr = Some(handle);
            debug!(
                "omap_wb{}: stream on, {}x{} from {:?}",
                shared.index, program.width, program.height, program.source
            );
            Ok(())
        }
        Err(e) => {
            if let Err(e) = shared.platform.dss.unregister_isr(handle) {
                error!("omap_wb{}: cannot unregister ISR: {}", shared.index, e);
            }
            Err(e)
        }
    }
}

#[derive(Debug, Error)]
pub enum StreamOffError {
    #[error("queue type ({0}) not supported")]
    InvalidQueue(QueueType),
    #[error("queue is not streaming")]
    NotStreaming,
}

impl From<StreamOffError> for Errno {
    fn from(err: StreamOffError) -> Self {
        match err {
            StreamOffError::InvalidQueue(_) | StreamOffError::NotStreaming => Errno::EINVAL,
        }
    }
}

/// Stop capturing. Every buffer still queued is returned to the application
/// side and must be queued again before the next `streamon`.
pub fn streamoff(file: &WbFile, queue: QueueType) -> Result<(), StreamOffError> {
    if queue != QueueType::VideoCapture {
        return Err(StreamOffError::InvalidQueue(queue));
    }

    let shared = file.shared();
    let mut state = shared.lock_state();
    if !shared.is_streaming() {
        return Err(StreamOffError::NotStreaming);
    }
    match shared.stop_streaming(&mut state) {
        Ok(()) | Err(VbError::NotStreaming) => (),
        Err(e) => error!("omap_wb{}: stream off: {}", shared.index, e),
    }
    debug!("omap_wb{}: stream off", shared.index);

    Ok(())
}
