//! `mmap()` of MMAP buffers.
//!
//! TILER lines are laid out with the stride of their container, which is
//! larger than the line itself. A buffer is therefore mapped line by line:
//! line `j` of the buffer appears at `j * bytesperline` in the mapping and
//! comes from `block.addr + j * stride` in physical memory. The chroma plane
//! of NV12 buffers follows the luma plane in the mapping, with half as many
//! lines.
use log::debug;
use nix::errno::Errno;
use thiserror::Error;

use crate::device::{WbDevice, WbFile};
use crate::memory::MemoryType;
use crate::platform::{PhysAddr, TilerBlock};

/// A contiguous piece of a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PfnRange {
    /// Offset within the mapping.
    pub user_offset: u32,
    pub phys: PhysAddr,
    pub len: u32,
}

impl PfnRange {
    fn phys_end(&self) -> u64 {
        self.phys as u64 + self.len as u64
    }

    pub fn overlaps(&self, other: &PfnRange) -> bool {
        (self.phys as u64) < other.phys_end() && (other.phys as u64) < self.phys_end()
    }
}

/// A buffer mapped into the application.
///
/// The mapping keeps the device open. Dropping it is the equivalent of
/// `munmap()`.
pub struct VmaMapping {
    device: WbDevice,
    index: usize,
    length: u32,
    ranges: Vec<PfnRange>,
}

impl VmaMapping {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn len(&self) -> u32 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn ranges(&self) -> &[PfnRange] {
        &self.ranges
    }

    /// Physical address backing `offset` within the mapping.
    pub fn phys_addr(&self, offset: u32) -> Option<PhysAddr> {
        self.ranges
            .iter()
            .find(|r| offset >= r.user_offset && offset - r.user_offset < r.len)
            .map(|r| r.phys + (offset - r.user_offset))
    }
}

impl std::fmt::Debug for VmaMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmaMapping")
            .field("device", &self.device.index())
            .field("index", &self.index)
            .field("length", &self.length)
            .field("ranges", &self.ranges.len())
            .finish()
    }
}

impl Drop for VmaMapping {
    fn drop(&mut self) {
        let shared = self.device.shared();
        {
            let mut state = shared.lock_state();
            state.mmap_count = state.mmap_count.saturating_sub(1);
            let mut irq = shared.irq.lock().unwrap();
            if let Some(buf) = irq.queue.buffer_mut(self.index) {
                buf.map_count = buf.map_count.saturating_sub(1);
            }
        }
        debug!("omap_wb{}: buffer {} unmapped", shared.index, self.index);
        shared.put();
    }
}

#[derive(Debug, Error)]
pub enum MmapError {
    #[error("no MMAP buffer at offset 0x{0:x}")]
    InvalidOffset(u32),
    #[error("invalid mapping length {0}")]
    InvalidLength(u32),
    #[error("buffer {0} has no memory")]
    NoMemory(usize),
}

impl From<MmapError> for Errno {
    fn from(err: MmapError) -> Self {
        match err {
            MmapError::InvalidOffset(_) | MmapError::InvalidLength(_) => Errno::EINVAL,
            MmapError::NoMemory(_) => Errno::ENOMEM,
        }
    }
}

/// Push the ranges mapping `rows` lines of `block`, starting at `start` in
/// the mapping, and stopping at `limit`.
fn map_rows(
    ranges: &mut Vec<PfnRange>,
    block: &TilerBlock,
    rows: u32,
    bytesperline: u32,
    start: u32,
    limit: u32,
) {
    for j in 0..rows {
        let user_offset = start + j * bytesperline;
        if user_offset >= limit {
            break;
        }
        ranges.push(PfnRange {
            user_offset,
            phys: block.addr + j * block.stride(),
            len: bytesperline.min(limit - user_offset),
        });
    }
}

/// Map the buffer whose `offset` was reported by `querybuf`.
pub fn mmap(file: &WbFile, offset: u32, length: u32) -> Result<VmaMapping, MmapError> {
    let shared = file.shared();
    let mut state = shared.lock_state();

    let (index, ranges) = {
        let mut irq = shared.irq.lock().unwrap();
        let index = irq
            .queue
            .find_by_offset(offset)
            .ok_or(MmapError::InvalidOffset(offset))?;
        let buf = irq
            .queue
            .buffer_mut(index)
            .ok_or(MmapError::InvalidOffset(offset))?;
        if buf.memory != MemoryType::MMAP {
            return Err(MmapError::InvalidOffset(offset));
        }
        if length == 0 || length > buf.bsize {
            return Err(MmapError::InvalidLength(length));
        }
        let slot = state.tiler.slot(index).ok_or(MmapError::NoMemory(index))?;

        let bytesperline = state.format.bytesperline;
        let mut ranges = Vec::new();
        map_rows(
            &mut ranges,
            &slot.luma,
            state.format.height,
            bytesperline,
            0,
            length,
        );
        if let Some(chroma) = &slot.chroma {
            map_rows(
                &mut ranges,
                chroma,
                state.format.height / 2,
                bytesperline,
                state.format.luma_size(),
                length,
            );
        }
        buf.map_count += 1;

        (index, ranges)
    };
    state.mmap_count += 1;
    // The mapping holds the device open until it goes away.
    state.open_count += 1;
    debug!(
        "omap_wb{}: buffer {} mapped, {} ranges",
        shared.index,
        index,
        ranges.len()
    );

    Ok(VmaMapping {
        device: file.device().clone(),
        index,
        length,
        ranges,
    })
}

#[cfg(test)]
mod tests {
    use nix::fcntl::OFlag;

    use super::*;
    use crate::ioctl::tests::TestBench;
    use crate::ioctl::{querybuf, reqbufs, s_fmt, BufferFlags};
    use crate::{Format, PixelFormat, QueueType};

    #[test]
    fn rgb32_lines_follow_container_stride() {
        let bench = TestBench::new();
        let file = bench.configured(2);
        let buf = querybuf(&file, QueueType::VideoCapture, 1).unwrap();

        let mapping = mmap(&file, buf.offset, buf.length).unwrap();
        assert_eq!(mapping.index(), 1);
        assert_eq!(mapping.ranges().len(), 120);
        let first = mapping.ranges()[0];
        let second = mapping.ranges()[1];
        assert_eq!(second.user_offset - first.user_offset, 4096);
        assert_eq!(second.phys - first.phys, 32 * 1024);
        assert_eq!(mapping.phys_addr(4096 + 8), Some(second.phys + 8));

        let buf = querybuf(&file, QueueType::VideoCapture, 1).unwrap();
        assert!(buf.flags.contains(BufferFlags::MAPPED));
    }

    #[test]
    fn nv12_chroma_does_not_overlap_luma() {
        let bench = TestBench::new();
        let file = bench.open_nonblocking();
        let fmt = s_fmt(&file, Format::from((PixelFormat::NV12, (320, 240)))).unwrap();
        reqbufs(&file, QueueType::VideoCapture, MemoryType::MMAP, 1).unwrap();
        let buf = querybuf(&file, QueueType::VideoCapture, 0).unwrap();

        let mapping = mmap(&file, buf.offset, buf.length).unwrap();
        let luma_size = fmt.plane_fmt[0].bytesperline * 240;
        let (luma, chroma): (Vec<&PfnRange>, Vec<&PfnRange>) = mapping
            .ranges()
            .iter()
            .partition(|r| r.user_offset < luma_size);
        assert_eq!(luma.len(), 240);
        assert_eq!(chroma.len(), 120);
        assert_eq!(chroma[0].user_offset, luma_size);
        for c in &chroma {
            assert!(luma.iter().all(|l| !l.overlaps(c)));
        }
    }

    #[test]
    fn invalid_requests() {
        let bench = TestBench::new();
        let file = bench.configured(2);
        let buf = querybuf(&file, QueueType::VideoCapture, 0).unwrap();

        let err = mmap(&file, buf.offset + 1, buf.length).unwrap_err();
        assert!(matches!(err, MmapError::InvalidOffset(_)));
        assert_eq!(Errno::from(err), Errno::EINVAL);
        assert!(matches!(
            mmap(&file, buf.offset, buf.length + 1),
            Err(MmapError::InvalidLength(_))
        ));
        assert!(matches!(
            mmap(&file, buf.offset, 0),
            Err(MmapError::InvalidLength(0))
        ));
        assert_eq!(file.device().mmap_count(), 0);
    }

    #[test]
    fn partial_mapping() {
        let bench = TestBench::new();
        let file = bench.configured(1);
        let buf = querybuf(&file, QueueType::VideoCapture, 0).unwrap();

        let mapping = mmap(&file, buf.offset, 4096 * 2 + 100).unwrap();
        assert_eq!(mapping.ranges().len(), 3);
        assert_eq!(mapping.ranges()[2].len, 100);
        assert_eq!(mapping.phys_addr(4096 * 2 + 100), None);
    }

    #[test]
    fn mapping_keeps_device_open() {
        let bench = TestBench::new();
        let device = bench.driver.device(0).unwrap().clone();
        let file = device.open(OFlag::O_RDWR);
        reqbufs(&file, QueueType::VideoCapture, MemoryType::MMAP, 2).unwrap();
        let buf = querybuf(&file, QueueType::VideoCapture, 0).unwrap();
        let mapping = mmap(&file, buf.offset, buf.length).unwrap();

        drop(file);
        assert_eq!(device.open_count(), 1);
        assert_eq!(bench.tiler.live_blocks(), 2);

        drop(mapping);
        assert_eq!(device.open_count(), 0);
        assert_eq!(device.mmap_count(), 0);
        assert_eq!(bench.tiler.live_blocks(), 0);
    }
}
