//! Device-visible memory for rings, records and the memptrs block
//!
//! `DeviceMemory` is the built-in `DmaAllocator`: it backs each buffer
//! with page-aligned anonymous memory and hands out device addresses from
//! a bump range with a guard page between buffers. It remembers every live
//! buffer so the simulated command processor can turn an iova back into
//! memory.

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;

        fn new_backing(len: usize) -> Result<Arc<dyn DmaBacking>, MemoryError> {
            Ok(Arc::new(unix::MmapBacking::new(len)?))
        }
    } else {
        fn new_backing(len: usize) -> Result<Arc<dyn DmaBacking>, MemoryError> {
            Ok(Arc::new(gpuring_core::traits::HeapBacking::new(len)))
        }
    }
}

use std::sync::{Arc, Mutex, Weak};

use gpuring_core::constants::GPU_PAGE_SIZE;
use gpuring_core::traits::DmaBacking;
use gpuring_core::{dev_dbg, DmaAllocator, DmaBuffer, GpuResult, MemoryError};

/// Device addresses stop here (48-bit GPU VA)
const IOVA_LIMIT: u64 = 1 << 48;

struct Region {
    iova: u64,
    len: usize,
    name: &'static str,
    backing: Weak<dyn DmaBacking>,
}

struct Inner {
    next_iova: u64,
    regions: Vec<Region>,
}

/// Bump-allocated device memory with an iova registry
pub struct DeviceMemory {
    name: String,
    inner: Mutex<Inner>,
}

impl DeviceMemory {
    pub fn new(name: impl Into<String>, iova_base: u64) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(Inner { next_iova: iova_base, regions: Vec::new() }),
        }
    }

    /// Buffers still alive
    pub fn live_buffers(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.regions.iter().filter(|r| r.backing.strong_count() > 0).count()
    }
}

#[inline]
fn page_align(len: usize) -> Option<usize> {
    len.checked_add(GPU_PAGE_SIZE - 1).map(|l| l & !(GPU_PAGE_SIZE - 1))
}

impl DmaAllocator for DeviceMemory {
    fn alloc(&self, len: usize, name: &'static str) -> GpuResult<DmaBuffer> {
        if len == 0 {
            return Err(MemoryError::ZeroLength.into());
        }
        let len = page_align(len).ok_or(MemoryError::AllocationFailed)?;

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let iova = inner.next_iova;
        let end = iova
            .checked_add(len as u64 + GPU_PAGE_SIZE as u64)
            .filter(|&end| end <= IOVA_LIMIT)
            .ok_or(MemoryError::IovaExhausted)?;

        let backing = new_backing(len)?;
        inner.regions.retain(|r| r.backing.strong_count() > 0);
        inner.regions.push(Region { iova, len, name, backing: Arc::downgrade(&backing) });
        inner.next_iova = end;

        dev_dbg!(&self.name, "dma {} at {:#x}, {} bytes", name, iova, len);
        Ok(DmaBuffer::new(backing, iova, name))
    }

    fn resolve(&self, iova: u64) -> Option<DmaBuffer> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .regions
            .iter()
            .find(|r| iova >= r.iova && iova < r.iova + r.len as u64)
            .and_then(|r| r.backing.upgrade().map(|b| DmaBuffer::new(b, r.iova, r.name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_is_page_aligned_and_zeroed() {
        let mem = DeviceMemory::new("test", 0x1_0000_0000);
        let a = mem.alloc(100, "a").unwrap();
        let b = mem.alloc(GPU_PAGE_SIZE, "b").unwrap();

        assert_eq!(a.iova(), 0x1_0000_0000);
        assert_eq!(a.len_bytes(), GPU_PAGE_SIZE);
        assert_eq!(a.iova() % GPU_PAGE_SIZE as u64, 0);
        // guard page between buffers
        assert_eq!(b.iova(), a.iova() + 2 * GPU_PAGE_SIZE as u64);
        assert_eq!(a.read_u64(64), 0);
    }

    #[test]
    fn test_zero_length_rejected() {
        let mem = DeviceMemory::new("test", 0x1000);
        assert!(matches!(
            mem.alloc(0, "z"),
            Err(gpuring_core::GpuError::MemoryError(MemoryError::ZeroLength))
        ));
    }

    #[test]
    fn test_resolve_shares_memory() {
        let mem = DeviceMemory::new("test", 0x1_0000_0000);
        let buf = mem.alloc(8192, "ring").unwrap();
        buf.write_u32(4100, 0xdead_beef);

        let found = mem.resolve(buf.iova() + 4100).unwrap();
        assert_eq!(found.iova(), buf.iova());
        assert_eq!(found.name(), "ring");
        assert_eq!(found.read_u32(4100), 0xdead_beef);

        assert!(mem.resolve(buf.iova() + 8192).is_none());
    }

    #[test]
    fn test_dropped_buffers_are_forgotten() {
        let mem = DeviceMemory::new("test", 0x1_0000_0000);
        let buf = mem.alloc(64, "tmp").unwrap();
        let iova = buf.iova();
        assert_eq!(mem.live_buffers(), 1);
        drop(buf);
        assert!(mem.resolve(iova).is_none());
        assert_eq!(mem.live_buffers(), 0);
    }

    #[test]
    fn test_iova_exhaustion() {
        let mem = DeviceMemory::new("test", IOVA_LIMIT - GPU_PAGE_SIZE as u64);
        assert!(matches!(
            mem.alloc(64, "late"),
            Err(gpuring_core::GpuError::MemoryError(MemoryError::IovaExhausted))
        ));
    }
}
