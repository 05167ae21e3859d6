//! Software display subsystem and TILER.
//!
//! `SimDss` records every write-back configuration applied to it and lets the
//! caller raise interrupts by hand, which makes the frame pipeline fully
//! deterministic. `SimTiler` hands out blocks from a synthetic physical
//! address range and keeps track of what is still allocated.
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use log::{debug, trace};

use super::*;

/// First physical address handed out by `SimTiler`.
pub const SIM_TILER_BASE: PhysAddr = 0x6000_0000;

#[derive(Default)]
struct SimTilerInner {
    next_addr: PhysAddr,
    live: BTreeMap<PhysAddr, TilerBlock>,
    block_limit: Option<usize>,
    user_mappings: BTreeMap<u64, (PhysAddr, u32)>,
    frees: usize,
}

impl SimTilerInner {
    fn can_allocate(&self, n: usize) -> bool {
        match self.block_limit {
            Some(limit) => self.live.len() + n <= limit,
            None => true,
        }
    }

    fn allocate(&mut self, fmt: TilerFormat, width: u32, height: u32) -> TilerBlock {
        let block = TilerBlock {
            addr: self.next_addr,
            fmt,
            width,
            height,
        };
        // Leave a guard page between blocks.
        self.next_addr += block.span() + TilerBlock::PAGE_SIZE;
        self.live.insert(block.addr, block);
        block
    }
}

/// Bump allocator standing in for the TILER.
pub struct SimTiler {
    inner: Mutex<SimTilerInner>,
}

impl Default for SimTiler {
    fn default() -> Self {
        Self::new()
    }
}

impl SimTiler {
    pub fn new() -> Self {
        SimTiler {
            inner: Mutex::new(SimTilerInner {
                next_addr: SIM_TILER_BASE,
                ..Default::default()
            }),
        }
    }

    /// Cap the number of blocks that can be live at the same time. NV12
    /// buffers count for two blocks.
    pub fn limit_blocks(&self, limit: Option<usize>) {
        self.inner.lock().unwrap().block_limit = limit;
    }

    /// Number of blocks currently allocated.
    pub fn live_blocks(&self) -> usize {
        self.inner.lock().unwrap().live.len()
    }

    /// Number of successful `free` calls so far.
    pub fn frees(&self) -> usize {
        self.inner.lock().unwrap().frees
    }

    /// Declare that `len` bytes of application memory starting at
    /// `user_addr` are backed by TILER memory at `phys`.
    pub fn map_user_buffer(&self, user_addr: u64, phys: PhysAddr, len: u32) {
        self.inner
            .lock()
            .unwrap()
            .user_mappings
            .insert(user_addr, (phys, len));
    }
}

impl Tiler for SimTiler {
    fn alloc_packed(
        &self,
        fmt: TilerFormat,
        width: u32,
        height: u32,
        count: usize,
    ) -> Result<Vec<TilerBlock>, PlatformError> {
        let mut inner = self.inner.lock().unwrap();
        let mut blocks = Vec::with_capacity(count);
        while blocks.len() < count && inner.can_allocate(1) {
            blocks.push(inner.allocate(fmt, width, height));
        }

        trace!(
            "TILER: {} of {} {:?} blocks of {}x{}",
            blocks.len(),
            count,
            fmt,
            width,
            height
        );
        if blocks.is_empty() && count > 0 {
            return Err(PlatformError::NoMemory);
        }

        Ok(blocks)
    }

    fn alloc_packed_nv12(
        &self,
        width: u32,
        height: u32,
        count: usize,
    ) -> Result<Vec<(TilerBlock, TilerBlock)>, PlatformError> {
        let mut inner = self.inner.lock().unwrap();
        let mut pairs = Vec::with_capacity(count);
        while pairs.len() < count && inner.can_allocate(2) {
            let y = inner.allocate(TilerFormat::Bit8, width, height);
            let uv = inner.allocate(TilerFormat::Bit16, width / 2, height / 2);
            pairs.push((y, uv));
        }

        trace!(
            "TILER: {} of {} NV12 buffers of {}x{}",
            pairs.len(),
            count,
            width,
            height
        );
        if pairs.is_empty() && count > 0 {
            return Err(PlatformError::NoMemory);
        }

        Ok(pairs)
    }

    fn free(&self, block: &TilerBlock) -> Result<(), PlatformError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.live.remove(&block.addr) {
            Some(_) => {
                inner.frees += 1;
                Ok(())
            }
            None => Err(PlatformError::InvalidBlock(block.addr)),
        }
    }

    fn virt_to_phys(&self, user_addr: u64) -> Option<PhysAddr> {
        let inner = self.inner.lock().unwrap();
        let (start, (phys, len)) = inner.user_mappings.range(..=user_addr).next_back()?;
        let offset = user_addr - start;
        if offset < *len as u64 {
            Some(phys + offset as u32)
        } else {
            None
        }
    }
}

struct SimDssInner {
    wb_info: Vec<WbInfo>,
    applied: Vec<(usize, WbInfo)>,
    flushes: Vec<usize>,
    handlers: BTreeMap<IsrHandle, (Arc<dyn IrqHandler>, IrqMask)>,
    next_handle: u32,
    failing_applies: usize,
}

/// Display subsystem whose interrupts are raised by the caller.
pub struct SimDss {
    num_wb: usize,
    num_managers: usize,
    num_overlays: usize,
    inner: Mutex<SimDssInner>,
}

impl Default for SimDss {
    /// OMAP4 layout: one write-back, three managers, four overlays.
    fn default() -> Self {
        Self::new(1)
    }
}

impl SimDss {
    pub fn new(num_wb: usize) -> Self {
        SimDss {
            num_wb,
            num_managers: 3,
            num_overlays: 4,
            inner: Mutex::new(SimDssInner {
                wb_info: vec![Default::default(); num_wb],
                applied: Vec::new(),
                flushes: Vec::new(),
                handlers: BTreeMap::new(),
                next_handle: 0,
                failing_applies: 0,
            }),
        }
    }

    /// Deliver an interrupt to every handler whose mask intersects `status`.
    /// Handlers run on the calling thread, without any DSS lock held.
    pub fn raise_irq(&self, status: IrqMask) {
        let handlers: Vec<Arc<dyn IrqHandler>> = self
            .inner
            .lock()
            .unwrap()
            .handlers
            .values()
            .filter(|(_, mask)| mask.intersects(status))
            .map(|(handler, _)| Arc::clone(handler))
            .collect();

        for handler in handlers {
            handler.handle_irq(status);
        }
    }

    /// Signal the end of a write-back frame.
    pub fn frame_done(&self) {
        self.raise_irq(IrqMask::FRAME_DONE_WB);
    }

    /// Make the next `n` calls to `wb_apply` fail.
    pub fn fail_next_applies(&self, n: usize) {
        self.inner.lock().unwrap().failing_applies = n;
    }

    /// Every configuration successfully applied so far, in order.
    pub fn applied(&self) -> Vec<(usize, WbInfo)> {
        self.inner.lock().unwrap().applied.clone()
    }

    pub fn last_applied(&self, wb: usize) -> Option<WbInfo> {
        self.inner
            .lock()
            .unwrap()
            .applied
            .iter()
            .rev()
            .find(|(i, _)| *i == wb)
            .map(|(_, info)| *info)
    }

    pub fn flushes(&self, wb: usize) -> usize {
        self.inner
            .lock()
            .unwrap()
            .flushes
            .iter()
            .filter(|&&i| i == wb)
            .count()
    }

    pub fn registered_isrs(&self) -> usize {
        self.inner.lock().unwrap().handlers.len()
    }

    fn check_wb(&self, wb: usize) -> Result<(), PlatformError> {
        if wb < self.num_wb {
            Ok(())
        } else {
            Err(PlatformError::NoSuchWriteback(wb))
        }
    }
}

impl DisplaySubsystem for SimDss {
    fn num_wb(&self) -> usize {
        self.num_wb
    }

    fn num_managers(&self) -> usize {
        self.num_managers
    }

    fn num_overlays(&self) -> usize {
        self.num_overlays
    }

    fn get_wb_info(&self, wb: usize) -> Result<WbInfo, PlatformError> {
        self.check_wb(wb)?;
        Ok(self.inner.lock().unwrap().wb_info[wb])
    }

    fn set_wb_info(&self, wb: usize, info: &WbInfo) -> Result<(), PlatformError> {
        self.check_wb(wb)?;
        self.inner.lock().unwrap().wb_info[wb] = *info;
        Ok(())
    }

    fn wb_apply(&self, wb: usize) -> Result<(), PlatformError> {
        self.check_wb(wb)?;
        let mut inner = self.inner.lock().unwrap();
        if inner.failing_applies > 0 {
            inner.failing_applies -= 1;
            return Err(PlatformError::Rejected("simulated apply failure".into()));
        }

        let mut info = inner.wb_info[wb];
        info.info_dirty = false;
        inner.wb_info[wb] = info;
        inner.applied.push((wb, info));
        trace!("DSS: applied wb{} at 0x{:08x}", wb, info.paddr);

        Ok(())
    }

    fn wb_flush(&self, wb: usize) -> Result<(), PlatformError> {
        self.check_wb(wb)?;
        let mut inner = self.inner.lock().unwrap();
        inner.wb_info[wb].enabled = false;
        inner.flushes.push(wb);
        Ok(())
    }

    fn register_isr(
        &self,
        handler: Arc<dyn IrqHandler>,
        mask: IrqMask,
    ) -> Result<IsrHandle, PlatformError> {
        let mut inner = self.inner.lock().unwrap();
        let handle = IsrHandle(inner.next_handle);
        inner.next_handle += 1;
        inner.handlers.insert(handle, (handler, mask));
        debug!("DSS: registered ISR {:?} for {:?}", handle, mask);

        Ok(handle)
    }

    fn unregister_isr(&self, handle: IsrHandle) -> Result<(), PlatformError> {
        match self.inner.lock().unwrap().handlers.remove(&handle) {
            Some(_) => Ok(()),
            None => Err(PlatformError::UnknownIsr(handle)),
        }
    }
}
