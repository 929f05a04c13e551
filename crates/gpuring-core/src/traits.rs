//! Collaborator traits
//!
//! These traits define the interface between the platform-agnostic core
//! and whatever provides registers, DMA memory and page tables: a real
//! MMIO window, or the simulator in `gpuring-runtime`.

use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::error::GpuResult;
use crate::id::ContextId;

/// Raw access to the command processor's register window
///
/// Offsets are in dwords. 64-bit accesses are two 32-bit accesses,
/// low half first.
pub trait RegisterBus: Send + Sync {
    fn read32(&self, reg: u32) -> u32;

    fn write32(&self, reg: u32, val: u32);

    fn read64(&self, reg: u32) -> u64 {
        let lo = self.read32(reg) as u64;
        let hi = self.read32(reg + 1) as u64;
        (hi << 32) | lo
    }

    fn write64(&self, reg: u32, val: u64) {
        self.write32(reg, val as u32);
        self.write32(reg + 1, (val >> 32) as u32);
    }

    /// Read-modify-write helper
    fn rmw(&self, reg: u32, mask: u32, or: u32) {
        let val = self.read32(reg);
        self.write32(reg, (val & !mask) | or);
    }
}

/// Storage behind a `DmaBuffer`
///
/// Exposed as a slice of atomics: the device (or simulator) writes into
/// the same memory concurrently with CPU readers.
pub trait DmaBacking: Send + Sync {
    fn words(&self) -> &[AtomicU32];
}

/// Zeroed heap storage; used where no device-visible mapping is needed
pub struct HeapBacking {
    words: Box<[AtomicU32]>,
}

impl HeapBacking {
    pub fn new(len_bytes: usize) -> Self {
        let n = len_bytes.div_ceil(4);
        let words: Vec<AtomicU32> = (0..n).map(|_| AtomicU32::new(0)).collect();
        Self { words: words.into_boxed_slice() }
    }
}

impl DmaBacking for HeapBacking {
    fn words(&self) -> &[AtomicU32] {
        &self.words
    }
}

/// A buffer with a CPU mapping and a stable device-visible address
///
/// Cloning shares the same memory.
#[derive(Clone)]
pub struct DmaBuffer {
    backing: Arc<dyn DmaBacking>,
    iova: u64,
    name: &'static str,
}

impl DmaBuffer {
    pub fn new(backing: Arc<dyn DmaBacking>, iova: u64, name: &'static str) -> Self {
        Self { backing, iova, name }
    }

    #[inline]
    pub fn iova(&self) -> u64 {
        self.iova
    }

    /// Device address of byte offset `off`
    #[inline]
    pub fn iova_at(&self, off: usize) -> u64 {
        self.iova + off as u64
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    pub fn len_bytes(&self) -> usize {
        self.backing.words().len() * 4
    }

    #[inline]
    pub fn len_dwords(&self) -> usize {
        self.backing.words().len()
    }

    /// True if `[iova, iova + len)` lies inside this buffer
    pub fn contains(&self, iova: u64, len: u64) -> bool {
        iova >= self.iova
            && iova
                .checked_add(len)
                .is_some_and(|end| end <= self.iova + self.len_bytes() as u64)
    }

    /// Atomic view of the dword at dword index `idx`
    #[inline]
    pub fn word(&self, idx: usize) -> &AtomicU32 {
        &self.backing.words()[idx]
    }

    #[inline]
    pub fn read_u32(&self, off: usize) -> u32 {
        debug_assert!(off % 4 == 0);
        self.word(off / 4).load(Ordering::Acquire)
    }

    #[inline]
    pub fn write_u32(&self, off: usize, val: u32) {
        debug_assert!(off % 4 == 0);
        self.word(off / 4).store(val, Ordering::Release);
    }

    pub fn read_u64(&self, off: usize) -> u64 {
        let lo = self.read_u32(off) as u64;
        let hi = self.read_u32(off + 4) as u64;
        (hi << 32) | lo
    }

    pub fn write_u64(&self, off: usize, val: u64) {
        self.write_u32(off, val as u32);
        self.write_u32(off + 4, (val >> 32) as u32);
    }

    /// Store `val` at dword index `idx` without ordering; callers publish
    /// with a release store afterwards
    #[inline]
    pub fn store_dword(&self, idx: usize, val: u32) {
        self.word(idx).store(val, Ordering::Relaxed);
    }

    #[inline]
    pub fn load_dword(&self, idx: usize) -> u32 {
        self.word(idx).load(Ordering::Acquire)
    }

    pub fn zero(&self) {
        for w in self.backing.words() {
            w.store(0, Ordering::Relaxed);
        }
        core::sync::atomic::fence(Ordering::Release);
    }
}

impl fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaBuffer")
            .field("name", &self.name)
            .field("iova", &format_args!("{:#x}", self.iova))
            .field("len", &self.len_bytes())
            .finish()
    }
}

/// Provider of device-visible memory
pub trait DmaAllocator: Send + Sync {
    /// Allocate `len` zeroed bytes, rounded up to the GPU page size
    fn alloc(&self, len: usize, name: &'static str) -> GpuResult<DmaBuffer>;

    /// Find the buffer backing `iova`, if this allocator handed it out
    fn resolve(&self, iova: u64) -> Option<DmaBuffer>;
}

/// Page tables of one context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTableBinding {
    pub ttbr0: u64,
    pub asid: u32,
}

/// Source of page-table bindings, owned outside the ring controller
pub trait PageTableProvider: Send + Sync {
    /// Binding for `ctx`, or `None` if the context has no address space
    fn binding(&self, ctx: ContextId) -> Option<PageTableBinding>;

    /// True if `[iova, iova + len)` is mapped in `ctx`'s address space
    fn is_mapped(&self, ctx: ContextId, iova: u64, len: u64) -> bool;
}

/// What a command buffer is for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdKind {
    /// Regular command buffer
    Buffer,
    /// IB target; executed like `Buffer`
    IbTarget,
    /// Context restore; skipped if the ring already runs this context
    CtxRestore,
}

/// A command buffer descriptor handed to `submit`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmdBuffer {
    pub iova: u64,
    pub size_dwords: u32,
    pub kind: CmdKind,
}

impl CmdBuffer {
    pub const fn new(iova: u64, size_dwords: u32) -> Self {
        Self { iova, size_dwords, kind: CmdKind::Buffer }
    }

    pub const fn with_kind(mut self, kind: CmdKind) -> Self {
        self.kind = kind;
        self
    }

    #[inline]
    pub const fn len_bytes(&self) -> u64 {
        self.size_dwords as u64 * 4
    }
}

/// One CP protected register range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtectRange {
    pub base: u32,
    pub count: u32,
    pub read_protect: bool,
}

impl ProtectRange {
    pub const fn new(base: u32, count: u32) -> Self {
        Self { base, count, read_protect: false }
    }

    pub const fn no_read(base: u32, count: u32) -> Self {
        Self { base, count, read_protect: true }
    }

    /// Encoding of a `CP_PROTECT_REG[n]` entry
    pub const fn encode(&self) -> u32 {
        let rd = if self.read_protect { 1 << 31 } else { 0 };
        (self.base & 0x3ffff) | ((self.count.saturating_sub(1) & 0x1fff) << 18) | rd
    }
}

/// Per-generation hardware description, selected once at device creation
pub trait GpuVariant: Send + Sync {
    fn name(&self) -> &'static str;

    /// Hardware clock-gating `(register, value)` table
    fn hwcg(&self) -> &[(u32, u32)];

    /// Protected register ranges
    fn protect(&self) -> &[ProtectRange];

    /// UBWC `(register, value)` configuration
    fn ubwc(&self) -> &[(u32, u32)];

    /// Registers the CP restores on power-up
    fn pwrup_reglist(&self) -> &[u32];

    /// Load the zap shader through the secure world
    ///
    /// Called at most once per device lifetime that succeeds; the device
    /// remembers success and skips the call on later restarts.
    fn load_zap_shader(&self) -> GpuResult<()>;
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;

    pub fn heap_buffer(len: usize, iova: u64) -> DmaBuffer {
        DmaBuffer::new(Arc::new(HeapBacking::new(len)), iova, "test")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::tests_support::heap_buffer;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct MapBus(Mutex<HashMap<u32, u32>>);

    impl RegisterBus for MapBus {
        fn read32(&self, reg: u32) -> u32 {
            *self.0.lock().unwrap().get(&reg).unwrap_or(&0)
        }
        fn write32(&self, reg: u32, val: u32) {
            self.0.lock().unwrap().insert(reg, val);
        }
    }

    #[test]
    fn test_register_bus_64bit_halves() {
        let bus = MapBus(Mutex::new(HashMap::new()));
        bus.write64(0x10, 0x1234_5678_9abc_def0);
        assert_eq!(bus.read32(0x10), 0x9abc_def0);
        assert_eq!(bus.read32(0x11), 0x1234_5678);
        assert_eq!(bus.read64(0x10), 0x1234_5678_9abc_def0);

        bus.rmw(0x10, 0xff, 0x01);
        assert_eq!(bus.read32(0x10), 0x9abc_de01);
    }

    #[test]
    fn test_dma_buffer_accessors() {
        let buf = heap_buffer(64, 0x1000);
        assert_eq!(buf.len_bytes(), 64);
        buf.write_u64(8, 0xaaaa_bbbb_cccc_dddd);
        assert_eq!(buf.read_u32(8), 0xcccc_dddd);
        assert_eq!(buf.read_u64(8), 0xaaaa_bbbb_cccc_dddd);
        assert!(buf.contains(0x1000, 64));
        assert!(!buf.contains(0x1000, 65));
        assert!(!buf.contains(0xfff, 4));
        buf.zero();
        assert_eq!(buf.read_u64(8), 0);
    }

    #[test]
    fn test_protect_range_encode() {
        let r = ProtectRange::no_read(0x500, 2);
        assert_eq!(r.encode(), 0x500 | (1 << 18) | (1 << 31));
    }
}
