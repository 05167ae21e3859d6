//! Bookkeeping of the TILER memory backing MMAP buffers.
//!
//! Slots are indexed like the buffers of the queue. A populated slot holds
//! blocks this adapter allocated and therefore has to free; nothing else is
//! ever passed to `Tiler::free`.
use std::fmt::Debug;
use std::sync::Arc;

use log::{debug, error, warn};

use crate::format::{round_up, ColorMode, NegotiatedFormat};
use crate::platform::{PhysAddr, PlatformError, Tiler, TilerBlock};

/// TILER memory of one buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TilerSlot {
    pub luma: TilerBlock,
    /// Chroma plane, for NV12 only.
    pub chroma: Option<TilerBlock>,
}

impl TilerSlot {
    pub fn luma_addr(&self) -> PhysAddr {
        self.luma.addr
    }

    pub fn chroma_addr(&self) -> Option<PhysAddr> {
        self.chroma.map(|b| b.addr)
    }
}

pub struct TilerBuffers {
    tiler: Arc<dyn Tiler>,
    slots: Vec<Option<TilerSlot>>,
    allocated: usize,
}

impl Debug for TilerBuffers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TilerBuffers")
            .field("allocated", &self.allocated)
            .field("slots", &self.slots)
            .finish()
    }
}

impl TilerBuffers {
    pub fn new(tiler: Arc<dyn Tiler>, max_buffers: usize) -> Self {
        TilerBuffers {
            tiler,
            slots: vec![None; max_buffers],
            allocated: 0,
        }
    }

    /// Allocate memory for up to `count` buffers of format `fmt`, replacing
    /// any previous allocation. Returns the number of buffers obtained, which
    /// can be lower than `count` if the TILER runs short.
    pub fn allocate(
        &mut self,
        fmt: &NegotiatedFormat,
        count: usize,
    ) -> Result<usize, PlatformError> {
        self.free_all();

        let count = count.min(self.slots.len());
        if count == 0 {
            return Ok(0);
        }

        let obtained: Vec<TilerSlot> = match fmt.color_mode {
            ColorMode::Nv12 => self
                .tiler
                .alloc_packed_nv12(round_up(fmt.width, 128), fmt.height, count)?
                .into_iter()
                .map(|(luma, chroma)| TilerSlot {
                    luma,
                    chroma: Some(chroma),
                })
                .collect(),
            color_mode => {
                let tiler_fmt = color_mode.tiler_format();
                let line = fmt.width * fmt.bpp;
                let width = line.div_ceil(tiler_fmt.element_size());
                self.tiler
                    .alloc_packed(tiler_fmt, width, fmt.height, count)?
                    .into_iter()
                    .map(|luma| TilerSlot { luma, chroma: None })
                    .collect()
            }
        };

        // Never trust the allocator to respect `count`.
        let mut obtained = obtained.into_iter();
        for slot in self.slots.iter_mut().take(count) {
            match obtained.next() {
                Some(s) => {
                    *slot = Some(s);
                    self.allocated += 1;
                }
                None => break,
            }
        }
        for extra in obtained {
            self.release_slot(extra);
        }

        if self.allocated == 0 {
            return Err(PlatformError::NoMemory);
        }
        if self.allocated < count {
            warn!(
                "TILER shortfall: {} buffers requested, {} obtained",
                count, self.allocated
            );
        }
        debug!(
            "Allocated {} TILER buffers of {}x{} {:?}",
            self.allocated, fmt.width, fmt.height, fmt.color_mode
        );

        Ok(self.allocated)
    }

    /// Free every block this adapter allocated.
    pub fn free_all(&mut self) {
        for i in 0..self.slots.len() {
            if let Some(slot) = self.slots[i].take() {
                self.release_slot(slot);
            }
        }
        self.allocated = 0;
    }

    fn release_slot(&self, slot: TilerSlot) {
        for block in std::iter::once(slot.luma).chain(slot.chroma) {
            if let Err(e) = self.tiler.free(&block) {
                error!("Failed to free TILER block 0x{:08x}: {}", block.addr, e);
            }
        }
    }

    pub fn slot(&self, index: usize) -> Option<&TilerSlot> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    pub fn allocated(&self) -> usize {
        self.allocated
    }

    pub fn tiler(&self) -> &dyn Tiler {
        self.tiler.as_ref()
    }
}

impl Drop for TilerBuffers {
    fn drop(&mut self) {
        self.free_all();
    }
}
