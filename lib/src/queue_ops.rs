//! The write-back implementation of the buffer queue callbacks.
use log::{debug, warn};
use nix::errno::Errno;

use crate::format::{ColorMode, NegotiatedFormat};
use crate::ioctl::BufferField;
use crate::memory::MemoryType;
use crate::pipeline::{DmaAddr, FramePipeline};
use crate::tiler::TilerBuffers;
use crate::videobuf::{BufferState, QueueOps, VideoBuffer};

/// Borrows the pieces of device state the callbacks work on. Built for the
/// duration of a single queue operation, with both device locks held.
pub struct WbQueueOps<'a> {
    pub format: &'a NegotiatedFormat,
    pub tiler: &'a mut TilerBuffers,
    pub frames: &'a mut FramePipeline,
}

impl<'a> WbQueueOps<'a> {
    fn userptr_addr(&self, buf: &VideoBuffer) -> Result<DmaAddr, Errno> {
        if buf.baddr == 0 {
            return Err(Errno::EINVAL);
        }
        if buf.bsize != 0 && buf.bsize < self.format.sizeimage {
            warn!(
                "USERPTR buffer {} too small: {} < {}",
                buf.index, buf.bsize, self.format.sizeimage
            );
            return Err(Errno::EINVAL);
        }

        let tiler = self.tiler.tiler();
        let luma = tiler.virt_to_phys(buf.baddr).ok_or(Errno::EFAULT)?;
        let chroma = match self.format.color_mode {
            ColorMode::Nv12 => {
                let uv = buf.baddr + self.format.luma_size() as u64;
                Some(tiler.virt_to_phys(uv).ok_or(Errno::EFAULT)?)
            }
            _ => None,
        };

        Ok(DmaAddr { luma, chroma })
    }
}

impl<'a> QueueOps for WbQueueOps<'a> {
    fn setup(&mut self, memory: MemoryType, count: &mut u32, size: &mut u32) -> Result<(), Errno> {
        if !memory.is_supported() {
            return Err(Errno::EINVAL);
        }

        *size = self.format.sizeimage;
        self.frames.clear_dma_addrs();

        match memory {
            MemoryType::MMAP => {
                let obtained = self.tiler.allocate(self.format, *count as usize)?;
                *count = obtained as u32;
            }
            // The application brings its own memory.
            _ => self.tiler.free_all(),
        }
        debug!("setup: {} buffers of {} bytes", count, size);

        Ok(())
    }

    fn prepare(&mut self, buf: &mut VideoBuffer, field: BufferField) -> Result<(), Errno> {
        if buf.state == BufferState::NeedsInit {
            buf.width = self.format.width;
            buf.height = self.format.height;
            buf.bytesperline = self.format.bytesperline;
            buf.size = self.format.sizeimage;
            buf.field = field;
        }

        let addr = match buf.memory {
            MemoryType::MMAP => {
                let slot = self.tiler.slot(buf.index).ok_or(Errno::EINVAL)?;
                DmaAddr {
                    luma: slot.luma_addr(),
                    chroma: slot.chroma_addr(),
                }
            }
            MemoryType::UserPtr => self.userptr_addr(buf)?,
            MemoryType::Overlay => return Err(Errno::EINVAL),
        };

        self.frames.set_dma_addr(buf.index, addr);
        buf.state = BufferState::Prepared;

        Ok(())
    }

    fn queue(&mut self, buf: &mut VideoBuffer) {
        self.frames.enqueue(buf);
    }

    fn release(&mut self, buf: &mut VideoBuffer) {
        buf.state = BufferState::NeedsInit;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::format::negotiate;
    use crate::memory::MemoryType::MMAP;
    use crate::platform::sim::{SimDss, SimTiler};
    use crate::{Format, PixelFormat};

    struct Fixture {
        sim_tiler: Arc<SimTiler>,
        format: NegotiatedFormat,
        tiler: TilerBuffers,
        frames: FramePipeline,
    }

    impl Fixture {
        fn new(pixelformat: PixelFormat, width: usize, height: usize) -> Self {
            let sim_tiler = Arc::new(SimTiler::new());
            Fixture {
                tiler: TilerBuffers::new(sim_tiler.clone(), 32),
                sim_tiler,
                format: negotiate(&Format::from((pixelformat, (width, height))), 4096).unwrap(),
                frames: FramePipeline::new(0, Arc::new(SimDss::default())),
            }
        }

        fn ops(&mut self) -> WbQueueOps<'_> {
            WbQueueOps {
                format: &self.format,
                tiler: &mut self.tiler,
                frames: &mut self.frames,
            }
        }
    }

    fn buffer(index: usize, memory: MemoryType) -> VideoBuffer {
        VideoBuffer {
            index,
            state: BufferState::NeedsInit,
            memory,
            width: 0,
            height: 0,
            bytesperline: 0,
            size: 0,
            field: BufferField::Any,
            bsize: 0,
            boff: 0,
            baddr: 0,
            timestamp: None,
            sequence: 0,
            map_count: 0,
        }
    }

    #[test]
    fn setup_allocates_tiler_memory() {
        let mut f = Fixture::new(PixelFormat::NV12, 640, 480);
        let (mut count, mut size) = (4, 0);
        f.ops().setup(MMAP, &mut count, &mut size).unwrap();

        assert_eq!(count, 4);
        // 640 bytes per line padded to a page, 1.5 planes.
        assert_eq!(size, 4096 * 480 * 3 / 2);
        assert_eq!(f.sim_tiler.live_blocks(), 8);
    }

    #[test]
    fn setup_reports_shortfall() {
        let mut f = Fixture::new(PixelFormat::RGB565, 320, 240);
        f.sim_tiler.limit_blocks(Some(2));
        let (mut count, mut size) = (5, 0);
        f.ops().setup(MMAP, &mut count, &mut size).unwrap();
        assert_eq!(count, 2);

        f.sim_tiler.limit_blocks(Some(0));
        assert_eq!(
            f.ops().setup(MMAP, &mut count, &mut size),
            Err(Errno::ENOMEM)
        );
        assert_eq!(
            f.ops().setup(MemoryType::Overlay, &mut count, &mut size),
            Err(Errno::EINVAL)
        );
    }

    #[test]
    fn prepare_mmap_buffer() {
        let mut f = Fixture::new(PixelFormat::NV12, 320, 240);
        let (mut count, mut size) = (2, 0);
        f.ops().setup(MMAP, &mut count, &mut size).unwrap();

        let mut buf = buffer(1, MMAP);
        f.ops().prepare(&mut buf, BufferField::None).unwrap();
        assert_eq!(buf.state, BufferState::Prepared);
        assert_eq!((buf.width, buf.height), (320, 240));
        assert_eq!(buf.size, f.format.sizeimage);
        assert_eq!(buf.field, BufferField::None);

        let slot = *f.tiler.slot(1).unwrap();
        assert_eq!(
            f.frames.dma_addr(1),
            Some(DmaAddr {
                luma: slot.luma_addr(),
                chroma: slot.chroma_addr(),
            })
        );

        // Buffers without TILER memory cannot be prepared.
        let mut buf = buffer(5, MMAP);
        assert_eq!(
            f.ops().prepare(&mut buf, BufferField::None),
            Err(Errno::EINVAL)
        );
    }

    #[test]
    fn prepare_userptr_buffer() {
        let mut f = Fixture::new(PixelFormat::NV12, 320, 240);
        let luma_size = f.format.luma_size();
        f.sim_tiler
            .map_user_buffer(0x4000_0000, 0x7000_0000, f.format.sizeimage);
        let (mut count, mut size) = (1, 0);
        f.ops()
            .setup(MemoryType::UserPtr, &mut count, &mut size)
            .unwrap();
        assert_eq!(f.sim_tiler.live_blocks(), 0);

        let mut buf = buffer(0, MemoryType::UserPtr);
        assert_eq!(
            f.ops().prepare(&mut buf, BufferField::None),
            Err(Errno::EINVAL)
        );

        buf.baddr = 0x4000_0000;
        f.ops().prepare(&mut buf, BufferField::None).unwrap();
        assert_eq!(
            f.frames.dma_addr(0),
            Some(DmaAddr {
                luma: 0x7000_0000,
                chroma: Some(0x7000_0000 + luma_size),
            })
        );

        // Not backed by TILER memory.
        buf.baddr = 0x5000_0000;
        assert_eq!(
            f.ops().prepare(&mut buf, BufferField::None),
            Err(Errno::EFAULT)
        );
    }

    #[test]
    fn release_resets_state() {
        let mut f = Fixture::new(PixelFormat::RGB565, 64, 64);
        let mut buf = buffer(0, MMAP);
        buf.state = BufferState::Done;
        f.ops().release(&mut buf);
        assert_eq!(buf.state, BufferState::NeedsInit);
    }
}
