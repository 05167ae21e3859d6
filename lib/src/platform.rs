//! Hardware collaborators of the write-back driver.
//!
//! The driver never touches registers itself: it fills a `WbInfo` and asks
//! the display subsystem to apply it, obtains its memory from the TILER, and
//! is called back through an `IrqHandler` when the hardware signals a
//! completed frame. These traits capture exactly that surface so the driver
//! logic can run against real hardware glue or against the software
//! implementation in `sim`.
pub mod sim;

use std::fmt::Debug;
use std::sync::Arc;

use bitflags::bitflags;
use enumn::N;
use nix::errno::Errno;
use thiserror::Error;

use crate::format::ColorMode;

/// 32-bit physical address, as seen by the DSS DMA engine.
pub type PhysAddr = u32;

/// TILER container a block is allocated from. Each container has its own
/// element size and line stride.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TilerFormat {
    Bit8,
    Bit16,
    Bit32,
}

impl TilerFormat {
    /// Container holding pixels of `bpp` bytes. 24-bit pixels live in the
    /// 32-bit container.
    pub fn for_bpp(bpp: u32) -> Self {
        match bpp {
            1 => TilerFormat::Bit8,
            2 => TilerFormat::Bit16,
            _ => TilerFormat::Bit32,
        }
    }

    pub fn element_size(&self) -> u32 {
        match self {
            TilerFormat::Bit8 => 1,
            TilerFormat::Bit16 => 2,
            TilerFormat::Bit32 => 4,
        }
    }
}

/// A region handed out by the TILER.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TilerBlock {
    pub addr: PhysAddr,
    pub fmt: TilerFormat,
    /// Width in container elements.
    pub width: u32,
    /// Number of lines.
    pub height: u32,
}

impl TilerBlock {
    pub const PAGE_SIZE: u32 = 4096;

    /// Distance in bytes between the start of two consecutive lines.
    pub fn stride(&self) -> u32 {
        match self.fmt {
            TilerFormat::Bit8 => 16 * 1024,
            TilerFormat::Bit16 | TilerFormat::Bit32 => 32 * 1024,
        }
    }

    /// Bytes of the address space covered by the block.
    pub fn span(&self) -> u32 {
        self.stride() * self.height
    }
}

/// TILER memory allocator.
pub trait Tiler: Send + Sync {
    /// Allocate up to `count` blocks of `width` x `height` elements. Fewer
    /// blocks than requested may be returned if memory runs short; an error
    /// means nothing was allocated.
    fn alloc_packed(
        &self,
        fmt: TilerFormat,
        width: u32,
        height: u32,
        count: usize,
    ) -> Result<Vec<TilerBlock>, PlatformError>;

    /// Allocate up to `count` NV12 buffers of `width` x `height` pixels. Each
    /// buffer is a pair of an 8-bit luma block and a 16-bit chroma block with
    /// half the lines.
    fn alloc_packed_nv12(
        &self,
        width: u32,
        height: u32,
        count: usize,
    ) -> Result<Vec<(TilerBlock, TilerBlock)>, PlatformError>;

    fn free(&self, block: &TilerBlock) -> Result<(), PlatformError>;

    /// Resolve an application virtual address to the TILER physical address
    /// backing it, if any.
    fn virt_to_phys(&self, user_addr: u64) -> Option<PhysAddr>;
}

/// What feeds the write-back pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, N)]
#[repr(u32)]
pub enum WbSource {
    #[default]
    Lcd1Manager = 0,
    Lcd2Manager = 1,
    TvManager = 2,
    Overlay0 = 3,
    Overlay1 = 4,
    Overlay2 = 5,
    Overlay3 = 6,
}

impl WbSource {
    /// The source type this source belongs to.
    pub fn source_type(&self) -> WbSourceType {
        match self {
            WbSource::Lcd1Manager | WbSource::Lcd2Manager | WbSource::TvManager => {
                WbSourceType::Manager
            }
            _ => WbSourceType::Overlay,
        }
    }

    /// Index of the manager or overlay within its kind.
    pub fn id(&self) -> usize {
        match self {
            WbSource::Lcd1Manager | WbSource::Overlay0 => 0,
            WbSource::Lcd2Manager | WbSource::Overlay1 => 1,
            WbSource::TvManager | WbSource::Overlay2 => 2,
            WbSource::Overlay3 => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, N)]
#[repr(u32)]
pub enum WbSourceType {
    Overlay = 0,
    #[default]
    Manager = 1,
}

/// Frame decimation applied by the write-back pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, N)]
#[repr(u32)]
pub enum WbCaptureMode {
    #[default]
    All = 0,
    One = 1,
    OneOfTwo = 2,
    OneOfThree = 3,
    OneOfFour = 4,
    OneOfFive = 5,
    OneOfSix = 6,
    OneOfSeven = 7,
}

/// Write-back register set, as exchanged with the display subsystem.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WbInfo {
    pub enabled: bool,
    pub info_dirty: bool,
    pub source: WbSource,
    pub source_type: WbSourceType,
    pub capture_mode: WbCaptureMode,
    pub color_mode: ColorMode,
    /// Size of the region read from the source.
    pub width: u32,
    pub height: u32,
    /// Size of the image written to memory.
    pub out_width: u32,
    pub out_height: u32,
    pub paddr: PhysAddr,
    pub p_uv_addr: PhysAddr,
}

bitflags! {
    /// DISPC interrupt status bits.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct IrqMask: u32 {
        const FRAME_DONE = 1 << 0;
        const VSYNC = 1 << 1;
        const EVSYNC_EVEN = 1 << 2;
        const EVSYNC_ODD = 1 << 3;
        const FRAME_DONE_WB = 1 << 23;
        const WB_BUFFER_OVERFLOW = 1 << 25;
        const WB_INCOMPLETE = 1 << 26;
    }
}

/// Receiver of display interrupts. Called in interrupt context: it must not
/// block on anything but the short critical sections of the frame pipeline.
pub trait IrqHandler: Send + Sync {
    fn handle_irq(&self, status: IrqMask);
}

/// Registration token returned by `DisplaySubsystem::register_isr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IsrHandle(pub u32);

/// Overlay-manager side of the display subsystem.
pub trait DisplaySubsystem: Send + Sync {
    /// Number of write-back resources the platform advertises.
    fn num_wb(&self) -> usize;
    fn num_managers(&self) -> usize;
    fn num_overlays(&self) -> usize;

    fn get_wb_info(&self, wb: usize) -> Result<WbInfo, PlatformError>;
    fn set_wb_info(&self, wb: usize, info: &WbInfo) -> Result<(), PlatformError>;
    /// Commit the write-back settings to the hardware shadow registers.
    fn wb_apply(&self, wb: usize) -> Result<(), PlatformError>;
    /// Drop any write-back transfer still in flight.
    fn wb_flush(&self, wb: usize) -> Result<(), PlatformError>;

    fn register_isr(
        &self,
        handler: Arc<dyn IrqHandler>,
        mask: IrqMask,
    ) -> Result<IsrHandle, PlatformError>;
    fn unregister_isr(&self, handle: IsrHandle) -> Result<(), PlatformError>;
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlatformError {
    #[error("no write-back resource with index {0}")]
    NoSuchWriteback(usize),
    #[error("out of TILER memory")]
    NoMemory,
    #[error("no TILER block at 0x{0:08x}")]
    InvalidBlock(PhysAddr),
    #[error("write-back configuration rejected: {0}")]
    Rejected(String),
    #[error("no ISR registered as {0:?}")]
    UnknownIsr(IsrHandle),
}

impl From<PlatformError> for Errno {
    fn from(err: PlatformError) -> Self {
        match err {
            PlatformError::NoSuchWriteback(_) => Errno::ENODEV,
            PlatformError::NoMemory => Errno::ENOMEM,
            PlatformError::InvalidBlock(_) => Errno::EINVAL,
            PlatformError::Rejected(_) => Errno::EIO,
            PlatformError::UnknownIsr(_) => Errno::EINVAL,
        }
    }
}

/// The collaborators a write-back device is bound to.
#[derive(Clone)]
pub struct Platform {
    pub dss: Arc<dyn DisplaySubsystem>,
    pub tiler: Arc<dyn Tiler>,
}

impl Debug for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Platform")
            .field("num_wb", &self.dss.num_wb())
            .finish()
    }
}

impl Platform {
    pub fn new(dss: Arc<dyn DisplaySubsystem>, tiler: Arc<dyn Tiler>) -> Self {
        Platform { dss, tiler }
    }
}
