//! Layouts of the memory blocks shared with the command processor
//!
//! All three blocks live in DMA memory and are accessed through
//! `DmaBuffer` word accessors, never through Rust references to a
//! `repr(C)` struct: the hardware writes the preemption record behind
//! the CPU's back during a context switch.
//!
//! ```text
//! PreemptionRecord (per ring)           SmmuContextInfo (per ring)
//! 0x00 magic                            0x00 magic
//! 0x04 info                             0x04 _pad
//! 0x08 errors                           0x08 ttbr0 (u64)
//! 0x0c data                             0x10 asid
//! 0x10 cntl                             0x14 context_idr
//! 0x14 rptr                             0x18 context_bank
//! 0x18 wptr
//! 0x1c _pad                             MemPtrs (device), per ring at ring * 0x20
//! 0x20 rptr_addr (u64)                  0x00 rptr (shadow read pointer)
//! 0x28 rbase (u64)                      0x04 bv_rptr
//! 0x30 counter (u64)                    0x08 fence (shadow, retire source)
//! 0x38 bv_rptr_addr (u64)               0x0c public fence slot
//! 0x40 hardware save area ...           0x10 ttbr0 (u64) of the executing context
//!                                       0x18 asid
//!                                       0x40 + ring * 8: preemption counter
//! ```

use crate::constants::{PREEMPT_RECORD_MAGIC, SMMU_INFO_MAGIC};
use crate::id::{FenceSeqno, RingId};
use crate::traits::{DmaBuffer, PageTableBinding};

mod off {
    pub const MAGIC: usize = 0x00;
    pub const INFO: usize = 0x04;
    pub const ERRORS: usize = 0x08;
    pub const DATA: usize = 0x0c;
    pub const CNTL: usize = 0x10;
    pub const RPTR: usize = 0x14;
    pub const WPTR: usize = 0x18;
    pub const RPTR_ADDR: usize = 0x20;
    pub const RBASE: usize = 0x28;
    pub const COUNTER: usize = 0x30;
    pub const BV_RPTR_ADDR: usize = 0x38;

    pub const SMMU_MAGIC: usize = 0x00;
    pub const SMMU_TTBR0: usize = 0x08;
    pub const SMMU_ASID: usize = 0x10;
    pub const SMMU_CONTEXT_IDR: usize = 0x14;
    pub const SMMU_CONTEXT_BANK: usize = 0x18;

    pub const MEMPTR_RING_STRIDE: usize = 0x20;
    pub const MEMPTR_RPTR: usize = 0x00;
    pub const MEMPTR_BV_RPTR: usize = 0x04;
    pub const MEMPTR_FENCE: usize = 0x08;
    pub const MEMPTR_PUBLIC_FENCE: usize = 0x0c;
    pub const MEMPTR_TTBR0: usize = 0x10;
    pub const MEMPTR_ASID: usize = 0x18;
    pub const MEMPTR_COUNTERS: usize = 0x40;
}

/// Size of the fixed header of a preemption record
pub const PREEMPT_RECORD_HEADER: usize = 0x40;

/// Size of an SMMU context info block
pub const SMMU_INFO_SIZE: usize = 0x20;

/// Size of the device memptrs block
pub const MEMPTRS_SIZE: usize = 0x60;

/// Static fields written into a record whenever it is (re)initialised
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecordInit {
    pub cntl: u32,
    pub rbase: u64,
    pub rptr_addr: u64,
    pub counter: u64,
    pub bv_rptr_addr: u64,
}

/// Everything a record holds, read back from memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecordSnapshot {
    pub magic: u32,
    pub info: u32,
    pub errors: u32,
    pub data: u32,
    pub cntl: u32,
    pub rptr: u32,
    pub wptr: u32,
    pub rptr_addr: u64,
    pub rbase: u64,
    pub counter: u64,
    pub bv_rptr_addr: u64,
}

/// Per-ring preemption record
#[derive(Clone)]
pub struct PreemptionRecord {
    buf: DmaBuffer,
}

impl PreemptionRecord {
    pub fn new(buf: DmaBuffer) -> Self {
        debug_assert!(buf.len_bytes() >= PREEMPT_RECORD_HEADER);
        Self { buf }
    }

    /// Zero the whole block (save area included) and stamp the header
    pub fn init(&self, init: &RecordInit) {
        self.buf.zero();
        self.buf.write_u32(off::MAGIC, PREEMPT_RECORD_MAGIC);
        self.buf.write_u32(off::CNTL, init.cntl);
        self.buf.write_u64(off::RPTR_ADDR, init.rptr_addr);
        self.buf.write_u64(off::RBASE, init.rbase);
        self.buf.write_u64(off::COUNTER, init.counter);
        self.buf.write_u64(off::BV_RPTR_ADDR, init.bv_rptr_addr);
    }

    #[inline]
    pub fn is_stamped(&self) -> bool {
        self.buf.read_u32(off::MAGIC) == PREEMPT_RECORD_MAGIC
    }

    /// Publish the wptr the CP restores when it switches this ring in
    #[inline]
    pub fn set_wptr(&self, wptr: u32) {
        self.buf.write_u32(off::WPTR, wptr);
    }

    #[inline]
    pub fn wptr(&self) -> u32 {
        self.buf.read_u32(off::WPTR)
    }

    /// What the command processor writes when it saves this ring
    pub fn hw_save(&self, rptr: u32, wptr: u32, info: u32) {
        self.buf.write_u32(off::RPTR, rptr);
        self.buf.write_u32(off::WPTR, wptr);
        self.buf.write_u32(off::INFO, info);
    }

    pub fn snapshot(&self) -> RecordSnapshot {
        RecordSnapshot {
            magic: self.buf.read_u32(off::MAGIC),
            info: self.buf.read_u32(off::INFO),
            errors: self.buf.read_u32(off::ERRORS),
            data: self.buf.read_u32(off::DATA),
            cntl: self.buf.read_u32(off::CNTL),
            rptr: self.buf.read_u32(off::RPTR),
            wptr: self.buf.read_u32(off::WPTR),
            rptr_addr: self.buf.read_u64(off::RPTR_ADDR),
            rbase: self.buf.read_u64(off::RBASE),
            counter: self.buf.read_u64(off::COUNTER),
            bv_rptr_addr: self.buf.read_u64(off::BV_RPTR_ADDR),
        }
    }

    #[inline]
    pub fn iova(&self) -> u64 {
        self.buf.iova()
    }

    #[inline]
    pub fn buffer(&self) -> &DmaBuffer {
        &self.buf
    }
}

/// Per-ring SMMU context info, read by the CP on switch-in
#[derive(Clone)]
pub struct SmmuContextInfo {
    buf: DmaBuffer,
}

impl SmmuContextInfo {
    pub fn new(buf: DmaBuffer) -> Self {
        debug_assert!(buf.len_bytes() >= SMMU_INFO_SIZE);
        Self { buf }
    }

    pub fn init(&self) {
        self.buf.zero();
        self.buf.write_u32(off::SMMU_MAGIC, SMMU_INFO_MAGIC);
    }

    #[inline]
    pub fn is_stamped(&self) -> bool {
        self.buf.read_u32(off::SMMU_MAGIC) == SMMU_INFO_MAGIC
    }

    /// Record the page tables of the context resuming on this ring
    pub fn set_context(&self, binding: &PageTableBinding) {
        self.buf.write_u64(off::SMMU_TTBR0, binding.ttbr0);
        self.buf.write_u32(off::SMMU_ASID, binding.asid);
        self.buf.write_u32(off::SMMU_CONTEXT_IDR, 0);
        self.buf.write_u32(off::SMMU_CONTEXT_BANK, 0);
    }

    #[inline]
    pub fn ttbr0(&self) -> u64 {
        self.buf.read_u64(off::SMMU_TTBR0)
    }

    #[inline]
    pub fn asid(&self) -> u32 {
        self.buf.read_u32(off::SMMU_ASID)
    }

    #[inline]
    pub fn iova(&self) -> u64 {
        self.buf.iova()
    }
}

/// Device-wide block of shadow pointers written by the command processor
#[derive(Clone)]
pub struct MemPtrs {
    buf: DmaBuffer,
}

impl MemPtrs {
    pub fn new(buf: DmaBuffer) -> Self {
        debug_assert!(buf.len_bytes() >= MEMPTRS_SIZE);
        Self { buf }
    }

    #[inline]
    fn ring_off(ring: RingId, field: usize) -> usize {
        ring.as_usize() * off::MEMPTR_RING_STRIDE + field
    }

    /// Shadow read pointer, in dwords
    #[inline]
    pub fn rptr(&self, ring: RingId) -> u32 {
        self.buf.read_u32(Self::ring_off(ring, off::MEMPTR_RPTR))
    }

    #[inline]
    pub fn set_rptr(&self, ring: RingId, rptr: u32) {
        self.buf.write_u32(Self::ring_off(ring, off::MEMPTR_RPTR), rptr)
    }

    /// Shadow completion timestamp, the source of retirement
    #[inline]
    pub fn fence(&self, ring: RingId) -> FenceSeqno {
        FenceSeqno::new(self.buf.read_u32(Self::ring_off(ring, off::MEMPTR_FENCE)))
    }

    #[inline]
    pub fn public_fence(&self, ring: RingId) -> FenceSeqno {
        FenceSeqno::new(self.buf.read_u32(Self::ring_off(ring, off::MEMPTR_PUBLIC_FENCE)))
    }

    /// Force both fence slots, used when re-seeding after a reset
    pub fn seed_fence(&self, ring: RingId, seqno: FenceSeqno) {
        self.buf.write_u32(Self::ring_off(ring, off::MEMPTR_FENCE), seqno.raw());
        self.buf.write_u32(Self::ring_off(ring, off::MEMPTR_PUBLIC_FENCE), seqno.raw());
    }

    /// Page tables the CP last switched this ring to, if it ran any
    pub fn binding(&self, ring: RingId) -> Option<PageTableBinding> {
        let ttbr0 = self.buf.read_u64(Self::ring_off(ring, off::MEMPTR_TTBR0));
        if ttbr0 == 0 {
            return None;
        }
        let asid = self.buf.read_u32(Self::ring_off(ring, off::MEMPTR_ASID));
        Some(PageTableBinding { ttbr0, asid })
    }

    pub fn reset_ring(&self, ring: RingId) {
        self.set_rptr(ring, 0);
        self.buf.write_u32(Self::ring_off(ring, off::MEMPTR_BV_RPTR), 0);
        self.buf.write_u64(Self::ring_off(ring, off::MEMPTR_TTBR0), 0);
        self.buf.write_u32(Self::ring_off(ring, off::MEMPTR_ASID), 0);
    }

    #[inline]
    pub fn rptr_iova(&self, ring: RingId) -> u64 {
        self.buf.iova_at(Self::ring_off(ring, off::MEMPTR_RPTR))
    }

    #[inline]
    pub fn bv_rptr_iova(&self, ring: RingId) -> u64 {
        self.buf.iova_at(Self::ring_off(ring, off::MEMPTR_BV_RPTR))
    }

    #[inline]
    pub fn fence_iova(&self, ring: RingId) -> u64 {
        self.buf.iova_at(Self::ring_off(ring, off::MEMPTR_FENCE))
    }

    #[inline]
    pub fn public_fence_iova(&self, ring: RingId) -> u64 {
        self.buf.iova_at(Self::ring_off(ring, off::MEMPTR_PUBLIC_FENCE))
    }

    /// Start of the `ttbr0, asid` triple the page-table switch writes
    #[inline]
    pub fn ttbr0_iova(&self, ring: RingId) -> u64 {
        self.buf.iova_at(Self::ring_off(ring, off::MEMPTR_TTBR0))
    }

    #[inline]
    pub fn counter_iova(&self, ring: RingId) -> u64 {
        self.buf.iova_at(off::MEMPTR_COUNTERS + ring.as_usize() * 8)
    }

    #[inline]
    pub fn buffer(&self) -> &DmaBuffer {
        &self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::tests_support::heap_buffer;

    fn sample_init() -> RecordInit {
        RecordInit {
            cntl: 0x0800_0000 | 13,
            rbase: 0x1_0000_0000,
            rptr_addr: 0x2_0000_0000,
            counter: 0x2_0000_0020,
            bv_rptr_addr: 0x2_0000_0004,
        }
    }

    #[test]
    fn test_record_init_stamps_magic() {
        let rec = PreemptionRecord::new(heap_buffer(PREEMPT_RECORD_HEADER + 256, 0x4000));
        assert!(!rec.is_stamped());
        rec.init(&sample_init());
        assert!(rec.is_stamped());
        let snap = rec.snapshot();
        assert_eq!(snap.rbase, 0x1_0000_0000);
        assert_eq!(snap.wptr, 0);
        assert_eq!(snap.rptr, 0);
    }

    #[test]
    fn test_record_save_restore_roundtrip() {
        let rec = PreemptionRecord::new(heap_buffer(PREEMPT_RECORD_HEADER, 0x4000));
        rec.init(&sample_init());

        rec.hw_save(40, 96, 1);
        let saved = rec.snapshot();
        assert_eq!((saved.rptr, saved.wptr), (40, 96));
        assert_eq!(saved.rbase, 0x1_0000_0000);

        // Re-init is idempotent with respect to the static fields and
        // wipes whatever the hardware saved.
        rec.init(&sample_init());
        let fresh = rec.snapshot();
        assert_eq!(fresh.rptr, 0);
        assert_eq!(fresh.wptr, 0);
        assert_eq!(fresh.rbase, saved.rbase);
        assert_eq!(fresh.rptr_addr, saved.rptr_addr);
        rec.init(&sample_init());
        assert_eq!(rec.snapshot(), fresh);
    }

    #[test]
    fn test_smmu_info_set_context() {
        let info = SmmuContextInfo::new(heap_buffer(SMMU_INFO_SIZE, 0x8000));
        info.init();
        assert!(info.is_stamped());
        info.set_context(&PageTableBinding { ttbr0: 0xdead_b000, asid: 7 });
        assert_eq!(info.ttbr0(), 0xdead_b000);
        assert_eq!(info.asid(), 7);
        assert!(info.is_stamped());
    }

    #[test]
    fn test_memptrs_layout() {
        let mp = MemPtrs::new(heap_buffer(MEMPTRS_SIZE, 0x9000));
        assert_eq!(mp.rptr_iova(RingId::LOW), 0x9000);
        assert_eq!(mp.fence_iova(RingId::HIGH), 0x9000 + 0x28);
        assert_eq!(mp.ttbr0_iova(RingId::HIGH), 0x9000 + 0x30);
        mp.seed_fence(RingId::HIGH, FenceSeqno::new(3));
        assert_eq!(mp.fence(RingId::HIGH).raw(), 3);
        assert_eq!(mp.fence(RingId::LOW).raw(), 0);
        assert!(mp.binding(RingId::LOW).is_none());
    }
}
