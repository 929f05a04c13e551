//! Unix DMA backing using anonymous mmap

use core::ffi::c_void;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::atomic::AtomicU32;

use nix::sys::mman::{mmap_anonymous, munmap, MapFlags, ProtFlags};

use gpuring_core::traits::DmaBacking;
use gpuring_core::MemoryError;

/// Page-aligned, zero-filled private mapping
pub struct MmapBacking {
    ptr: NonNull<c_void>,
    len: usize,
}

impl MmapBacking {
    pub fn new(len: usize) -> Result<Self, MemoryError> {
        let size = NonZeroUsize::new(len).ok_or(MemoryError::ZeroLength)?;
        // Safety: fresh anonymous mapping, not aliased by anything else
        let ptr = unsafe {
            mmap_anonymous(
                None,
                size,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE,
            )
        }
        .map_err(|_| MemoryError::AllocationFailed)?;
        Ok(Self { ptr, len })
    }
}

impl DmaBacking for MmapBacking {
    fn words(&self) -> &[AtomicU32] {
        // Safety: the mapping is page aligned, `len` bytes long and lives
        // until drop; AtomicU32 has the layout of u32
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr() as *const AtomicU32, self.len / 4) }
    }
}

impl Drop for MmapBacking {
    fn drop(&mut self) {
        // Safety: we own the mapping
        unsafe {
            let _ = munmap(self.ptr, self.len);
        }
    }
}

// Safety: the mapping is only accessed through atomics
unsafe impl Send for MmapBacking {}
unsafe impl Sync for MmapBacking {}
