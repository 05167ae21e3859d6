//! Write-back devices and the driver that probes them.
//!
//! A `WbDevice` exists for every write-back resource of the display
//! subsystem, from `WbDriver::probe` to `WbDriver::remove`. Applications
//! work on it through `WbFile` handles returned by `WbDevice::open`, which
//! is what the functions of the `ioctl` module take.
//!
//! Device state is split in two. `WbState` is protected by the device mutex
//! and holds the configuration and the TILER memory. `IrqState` holds what
//! the interrupt handler shares with `qbuf`: the buffer queue and the frame
//! pipeline. It is only ever locked for short, non-blocking sections.
use std::fmt::{self, Debug};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};

use anyhow::{bail, Context};
use log::{debug, error, info, warn};
use nix::fcntl::OFlag;

use crate::config::WbConfig;
use crate::format::{center_window, negotiate, NegotiatedFormat};
use crate::ioctl::{BufferField, WbSettings};
use crate::pipeline::{now, FramePipeline, PipelineState, PipelineStats, WbProgram};
use crate::platform::{IrqHandler, IrqMask, IsrHandle, Platform};
use crate::queue_ops::WbQueueOps;
use crate::tiler::TilerBuffers;
use crate::videobuf::{VbError, VideoBufQueue};
use crate::{QueueType, Rect};

/// Configuration and resources, protected by the device mutex.
pub(crate) struct WbState {
    pub format: NegotiatedFormat,
    pub window: Rect,
    pub settings: WbSettings,
    pub tiler: TilerBuffers,
    pub isr: Option<IsrHandle>,
    pub open_count: usize,
    pub mmap_count: usize,
}

impl WbState {
    /// Settings programmed into the hardware for every frame.
    pub fn program(&self) -> WbProgram {
        WbProgram {
            source: self.settings.source,
            source_type: self.settings.source_type,
            capture_mode: self.settings.capture_mode,
            color_mode: self.format.color_mode,
            width: self.window.width,
            height: self.window.height,
            out_width: self.format.width,
            out_height: self.format.height,
        }
    }
}

/// State shared with the interrupt handler.
pub(crate) struct IrqState {
    pub queue: VideoBufQueue,
    pub frames: FramePipeline,
}

pub(crate) struct WbShared {
    pub index: usize,
    pub platform: Platform,
    pub config: WbConfig,
    pub state: Mutex<WbState>,
    pub irq: Mutex<IrqState>,
    /// Signaled whenever a buffer completes or the queue is cancelled.
    pub done: Condvar,
}

impl WbShared {
    pub fn lock_state(&self) -> MutexGuard<'_, WbState> {
        self.state.lock().unwrap()
    }

    /// Run `f` on the buffer queue with the callbacks bound to `state`.
    /// Takes the interrupt lock, so `state` must come from `lock_state`.
    pub fn with_queue<R>(
        &self,
        state: &mut WbState,
        f: impl FnOnce(&mut VideoBufQueue, &mut WbQueueOps<'_>) -> R,
    ) -> R {
        let mut irq = self.irq.lock().unwrap();
        let IrqState { queue, frames } = &mut *irq;
        let mut ops = WbQueueOps {
            format: &state.format,
            tiler: &mut state.tiler,
            frames,
        };
        f(queue, &mut ops)
    }

    pub fn is_streaming(&self) -> bool {
        self.irq.lock().unwrap().queue.is_streaming()
    }

    /// Stop the pipeline and cancel the queue, waking up any waiter.
    pub fn stop_streaming(&self, state: &mut WbState) -> Result<(), VbError> {
        let result = self.with_queue(state, |queue, ops| {
            ops.frames.stream_off();
            queue.streamoff(ops)
        });
        self.done.notify_all();

        if let Some(handle) = state.isr.take() {
            if let Err(e) = self.platform.dss.unregister_isr(handle) {
                error!("omap_wb{}: cannot unregister ISR: {}", self.index, e);
            }
        }
        if let Err(e) = self.platform.dss.wb_flush(self.index) {
            error!("omap_wb{}: cannot flush write-back: {}", self.index, e);
        }

        result
    }

    /// Stop streaming and free every buffer. Buffers still mapped are left
    /// to be freed when the device goes away.
    fn teardown(&self, state: &mut WbState) {
        if self.is_streaming() {
            if let Err(e) = self.stop_streaming(state) {
                warn!("omap_wb{}: stream off failed: {}", self.index, e);
            }
        }
        match self.with_queue(state, |queue, ops| queue.free(ops)) {
            Ok(()) => state.tiler.free_all(),
            Err(e) => warn!("omap_wb{}: cannot free buffers: {}", self.index, e),
        }
    }

    /// Drop one reference to the device, tearing it down with the last one.
    pub fn put(&self) {
        let mut state = self.lock_state();
        state.open_count = state.open_count.saturating_sub(1);
        if state.open_count == 0 {
            debug!("omap_wb{}: last user gone", self.index);
            self.teardown(&mut state);
        }
    }
}

/// Interrupt handler registered while streaming.
struct WbIrq {
    shared: Weak<WbShared>,
}

impl IrqHandler for WbIrq {
    fn handle_irq(&self, status: IrqMask) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let mut irq = shared.irq.lock().unwrap();
        let IrqState { queue, frames } = &mut *irq;
        if frames.handle_irq(queue, status, now()) {
            shared.done.notify_all();
        }
    }
}

/// A write-back device.
#[derive(Clone)]
pub struct WbDevice {
    shared: Arc<WbShared>,
}

impl Debug for WbDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WbDevice")
            .field("index", &self.shared.index)
            .field("pipeline", &self.pipeline_state())
            .finish()
    }
}

impl WbDevice {
    fn new(index: usize, platform: Platform, config: WbConfig) -> anyhow::Result<Self> {
        let format = negotiate(&config.default_format, config.page_size)
            .context("invalid default format")?;
        let window = center_window(
            format.width,
            format.height,
            (config.reference_width, config.reference_height),
        );
        let max_buffers = config.max_buffers();

        let state = WbState {
            format,
            window,
            settings: Default::default(),
            tiler: TilerBuffers::new(platform.tiler.clone(), max_buffers),
            isr: None,
            open_count: 0,
            mmap_count: 0,
        };
        let irq = IrqState {
            queue: VideoBufQueue::new(
                QueueType::VideoCapture,
                BufferField::None,
                config.page_size,
                max_buffers,
            ),
            frames: FramePipeline::new(index, platform.dss.clone()),
        };

        Ok(WbDevice {
            shared: Arc::new(WbShared {
                index,
                platform,
                config,
                state: Mutex::new(state),
                irq: Mutex::new(irq),
                done: Condvar::new(),
            }),
        })
    }

    pub fn index(&self) -> usize {
        self.shared.index
    }

    pub fn name(&self) -> String {
        format!("omap_wb{}", self.shared.index)
    }

    /// Open a new handle on the device. `O_NONBLOCK` makes `dqbuf` return
    /// instead of waiting for a buffer.
    pub fn open(&self, flags: OFlag) -> WbFile {
        let open_count = {
            let mut state = self.shared.lock_state();
            state.open_count += 1;
            state.open_count
        };
        debug!("{}: opened ({} users)", self.name(), open_count);

        WbFile {
            device: self.clone(),
            nonblocking: flags.contains(OFlag::O_NONBLOCK),
        }
    }

    pub fn open_count(&self) -> usize {
        self.shared.lock_state().open_count
    }

    pub fn mmap_count(&self) -> usize {
        self.shared.lock_state().mmap_count
    }

    pub fn pipeline_state(&self) -> PipelineState {
        self.shared.irq.lock().unwrap().frames.state()
    }

    pub fn pipeline_stats(&self) -> PipelineStats {
        self.shared.irq.lock().unwrap().frames.stats().clone()
    }

    pub(crate) fn shared(&self) -> &Arc<WbShared> {
        &self.shared
    }

    pub(crate) fn irq_handler(&self) -> Arc<dyn IrqHandler> {
        Arc::new(WbIrq {
            shared: Arc::downgrade(&self.shared),
        })
    }
}

/// An open handle on a write-back device. Dropping it releases the device,
/// which is torn down when its last user goes away.
pub struct WbFile {
    device: WbDevice,
    nonblocking: bool,
}

impl Debug for WbFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WbFile")
            .field("device", &self.device.index())
            .field("nonblocking", &self.nonblocking)
            .finish()
    }
}

impl WbFile {
    pub fn device(&self) -> &WbDevice {
        &self.device
    }

    pub fn is_nonblocking(&self) -> bool {
        self.nonblocking
    }

    pub(crate) fn shared(&self) -> &Arc<WbShared> {
        self.device.shared()
    }
}

impl Drop for WbFile {
    fn drop(&mut self) {
        self.device.shared.put();
    }
}

/// The write-back driver, bound to a display subsystem.
pub struct WbDriver {
    devices: Vec<WbDevice>,
}

impl WbDriver {
    /// Create one device per write-back resource of the display subsystem.
    pub fn probe(platform: Platform, config: WbConfig) -> anyhow::Result<Self> {
        let num_wb = platform.dss.num_wb();
        if num_wb == 0 {
            bail!("the display subsystem has no write-back resource");
        }

        let devices = (0..num_wb)
            .map(|i| {
                WbDevice::new(i, platform.clone(), config.clone())
                    .with_context(|| format!("failed to create write-back device {}", i))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        for device in &devices {
            info!("{}: registered", device.name());
        }

        Ok(WbDriver { devices })
    }

    pub fn devices(&self) -> &[WbDevice] {
        &self.devices
    }

    pub fn device(&self, index: usize) -> Option<&WbDevice> {
        self.devices.get(index)
    }

    /// Stop every device and release its memory.
    pub fn remove(self) {
        for device in self.devices {
            let shared = device.shared();
            let mut state = shared.lock_state();
            if state.open_count > 0 {
                warn!("{}: removed with {} users", device.name(), state.open_count);
            }
            shared.teardown(&mut state);
            info!("{}: unregistered", device.name());
        }
    }
}
