//! One hardware ring
//!
//! A ring is a power-of-two circular buffer of dwords in DMA memory. The
//! CPU writes at `next`; whole submissions are published by moving `cur`
//! up to `next`; the command processor reads up to the wptr it was given
//! and reports its progress through the shadow rptr in memptrs.
//!
//! ```text
//!   rptr (hw, shadow)        cur (published)        next (encoding)
//!        |                        |                      |
//!  ------[==== executing / queued ====][== appended ==]------
//! ```
//!
//! `cur` and `next` live behind the ring's `Ring`-class spinlock. The
//! rptr is only ever read.

use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use gpuring_core::packet::PacketStream;
use gpuring_core::record::{MemPtrs, PreemptionRecord, SmmuContextInfo};
use gpuring_core::spinlock::OrderedGuard;
use gpuring_core::{
    dev_warn, ContextId, DmaBuffer, GpuError, GpuResult, LockClass, Opcode, OrderedSpinLock,
    PageTableBinding, RingId,
};

/// Write-side state of a ring, guarded by the ring lock
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingCursor {
    /// Where the next dword is encoded
    pub next: u32,
    /// Published write pointer
    pub cur: u32,
    /// `cur` moved while another ring owned the CP; not yet in `CP_RB_WPTR`
    pub dirty: bool,
    /// Page tables of the most recent submission on this ring
    pub binding: Option<PageTableBinding>,
    /// The last appended packet is a yield
    pub tail_yield: bool,
    /// Dwords of controller-appended yields after the last submission
    pub idle_tail: u32,
}

/// Encoder-side state, serialised by the submit mutex
#[derive(Debug, Default)]
pub struct SubmitState {
    /// Context whose page tables the ring runs at its tail
    pub last_ctx: Option<ContextId>,
}

/// Span of ring dwords written by one append
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingSpan {
    pub start: u32,
    pub end: u32,
}

/// Point-in-time view for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingSnapshot {
    pub id: RingId,
    pub rptr: u32,
    pub cur: u32,
    pub next: u32,
    pub dirty: bool,
    pub free: u32,
}

pub struct Ring {
    id: RingId,
    dev: String,
    buf: DmaBuffer,
    size_dwords: u32,
    cursor: OrderedSpinLock<RingCursor>,
    submit: Mutex<SubmitState>,
    record: PreemptionRecord,
    smmu: SmmuContextInfo,
    user_record: DmaBuffer,
    memptrs: MemPtrs,
    yields: AtomicU64,
}

impl Ring {
    pub fn new(
        dev: &str,
        id: RingId,
        buf: DmaBuffer,
        size_dwords: u32,
        record: PreemptionRecord,
        smmu: SmmuContextInfo,
        user_record: DmaBuffer,
        memptrs: MemPtrs,
    ) -> Self {
        debug_assert!(size_dwords.is_power_of_two());
        debug_assert!(buf.len_dwords() >= size_dwords as usize);
        Self {
            id,
            dev: dev.to_string(),
            buf,
            size_dwords,
            cursor: OrderedSpinLock::new(LockClass::Ring, RingCursor::default()),
            submit: Mutex::new(SubmitState::default()),
            record,
            smmu,
            user_record,
            memptrs,
            yields: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn id(&self) -> RingId {
        self.id
    }

    #[inline]
    pub fn iova(&self) -> u64 {
        self.buf.iova()
    }

    #[inline]
    pub fn size_dwords(&self) -> u32 {
        self.size_dwords
    }

    #[inline]
    pub fn buffer(&self) -> &DmaBuffer {
        &self.buf
    }

    #[inline]
    pub fn record(&self) -> &PreemptionRecord {
        &self.record
    }

    #[inline]
    pub fn smmu(&self) -> &SmmuContextInfo {
        &self.smmu
    }

    #[inline]
    pub fn user_record(&self) -> &DmaBuffer {
        &self.user_record
    }

    #[inline]
    pub fn memptrs(&self) -> &MemPtrs {
        &self.memptrs
    }

    /// Yield packets appended by switch-complete handling
    pub fn yields_appended(&self) -> u64 {
        self.yields.load(Ordering::Relaxed)
    }

    #[inline]
    fn mask(&self) -> u32 {
        self.size_dwords - 1
    }

    /// Hardware read pointer, from the memptrs shadow
    #[inline]
    pub fn rptr(&self) -> u32 {
        self.memptrs.rptr(self.id) & self.mask()
    }

    pub(crate) fn lock(&self) -> OrderedGuard<'_, RingCursor> {
        self.cursor.lock()
    }

    pub(crate) fn submit_state(&self) -> MutexGuard<'_, SubmitState> {
        self.submit.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Copy of the cursor
    pub fn cursor(&self) -> RingCursor {
        *self.lock()
    }

    /// Free dwords; one slot stays empty so `next == rptr` means empty
    pub(crate) fn free_locked(&self, c: &RingCursor) -> u32 {
        let used = c.next.wrapping_sub(self.rptr()) & self.mask();
        self.mask() - used
    }

    pub fn free_dwords(&self) -> u32 {
        let c = self.lock();
        self.free_locked(&c)
    }

    fn write_locked(&self, c: &mut RingCursor, words: &[u32]) {
        for &w in words {
            self.buf.store_dword(c.next as usize, w);
            c.next = (c.next + 1) & self.mask();
        }
        fence(Ordering::Release);
    }

    /// Write one packet at `next`
    ///
    /// Only a debug assertion guards the free space here; callers that
    /// can overrun check the whole submission first.
    pub fn append(&self, opcode: Opcode, operands: &[u32]) -> RingSpan {
        let mut stream = PacketStream::with_capacity(operands.len() + 1);
        stream.pkt7(opcode, operands);
        let mut c = self.lock();
        debug_assert!(stream.len() as u32 <= self.free_locked(&c));
        let start = c.next;
        self.write_locked(&mut c, stream.as_slice());
        c.idle_tail = 0;
        c.tail_yield = opcode == Opcode::ContextSwitchYield;
        RingSpan { start, end: c.next }
    }

    /// Copy an encoded stream into the ring, all or nothing
    ///
    /// `binding` names the page tables the stream leaves the ring running.
    pub fn append_stream(
        &self,
        stream: &PacketStream,
        binding: Option<PageTableBinding>,
    ) -> GpuResult<RingSpan> {
        let mut c = self.lock();
        self.append_locked(&mut c, stream, binding)
    }

    pub(crate) fn append_locked(
        &self,
        c: &mut RingCursor,
        stream: &PacketStream,
        binding: Option<PageTableBinding>,
    ) -> GpuResult<RingSpan> {
        let needed = stream.len() as u32;
        let free = self.free_locked(c);
        if needed > free {
            return Err(GpuError::RingFull { ring: self.id, needed, free });
        }
        let start = c.next;
        self.write_locked(c, stream.as_slice());
        if let Some(b) = binding {
            c.binding = Some(b);
        }
        c.idle_tail = 0;
        c.tail_yield = matches!(stream.iter().last(), Some(Ok((Opcode::ContextSwitchYield, _))));
        Ok(RingSpan { start, end: c.next })
    }

    /// Append one yield packet and publish it
    ///
    /// Called on the ring the CP just switched away from. Returns false if
    /// the ring has no room left for it.
    pub(crate) fn append_yield_locked(&self, c: &mut RingCursor) -> bool {
        let mut stream = PacketStream::with_capacity(5);
        stream.yield_point();
        let idle_tail = c.idle_tail;
        if self.append_locked(c, &stream, None).is_err() {
            dev_warn!(&self.dev, "{}: no room for yield packet", self.id);
            return false;
        }
        c.idle_tail = idle_tail + stream.len() as u32;
        c.cur = c.next;
        c.dirty = true;
        self.yields.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Submitted work published but not yet consumed by the CP
    ///
    /// Trailing yields appended by the controller do not count.
    pub(crate) fn has_pending_locked(&self, c: &RingCursor) -> bool {
        let unconsumed = c.cur.wrapping_sub(self.rptr()) & self.mask();
        unconsumed > c.idle_tail
    }

    pub fn has_pending(&self) -> bool {
        let c = self.lock();
        self.has_pending_locked(&c)
    }

    /// Page tables the CP must restore when this ring is switched in
    pub(crate) fn resume_binding_locked(&self, c: &RingCursor) -> Option<PageTableBinding> {
        self.memptrs.binding(self.id).or(c.binding)
    }

    /// Forget all state; used by hardware init
    pub fn reset(&self) {
        let mut c = self.lock();
        *c = RingCursor::default();
        self.buf.zero();
        self.memptrs.reset_ring(self.id);
        drop(c);
        *self.submit_state() = SubmitState::default();
    }

    pub fn snapshot(&self) -> RingSnapshot {
        let c = self.lock();
        RingSnapshot {
            id: self.id,
            rptr: self.rptr(),
            cur: c.cur,
            next: c.next,
            dirty: c.dirty,
            free: self.free_locked(&c),
        }
    }

    /// Ring dwords in `[start, end)`, following the wrap
    pub fn read_span(&self, span: RingSpan) -> Vec<u32> {
        let len = span.end.wrapping_sub(span.start) & self.mask();
        (0..len)
            .map(|i| self.buf.load_dword(((span.start + i) & self.mask()) as usize))
            .collect()
    }
}

impl std::fmt::Debug for Ring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ring")
            .field("id", &self.id)
            .field("iova", &format_args!("{:#x}", self.iova()))
            .field("size_dwords", &self.size_dwords)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::memory::DeviceMemory;
    use gpuring_core::record::MEMPTRS_SIZE;
    use gpuring_core::DmaAllocator;

    pub(crate) fn test_ring(id: RingId, size_dwords: u32) -> Ring {
        let mem = DeviceMemory::new("test", 0x1_0000_0000);
        let memptrs = MemPtrs::new(mem.alloc(MEMPTRS_SIZE, "memptrs").unwrap());
        Ring::new(
            "test",
            id,
            mem.alloc(size_dwords as usize * 4, "ring").unwrap(),
            size_dwords,
            PreemptionRecord::new(mem.alloc(0x1000, "record").unwrap()),
            SmmuContextInfo::new(mem.alloc(0x1000, "smmu").unwrap()),
            mem.alloc(0x1000, "user").unwrap(),
            memptrs,
        )
    }

    fn nops(n: usize) -> PacketStream {
        let mut s = PacketStream::new();
        for _ in 0..n {
            s.pkt7(Opcode::Nop, &[0, 0, 0]);
        }
        s
    }

    #[test]
    fn test_append_advances_next_only() {
        let ring = test_ring(RingId::LOW, 1024);
        let span = ring.append_stream(&nops(2), None).unwrap();
        assert_eq!(span, RingSpan { start: 0, end: 8 });

        let c = ring.cursor();
        assert_eq!(c.next, 8);
        assert_eq!(c.cur, 0);
        assert!(!c.tail_yield);
        assert_eq!(ring.read_span(span).len(), 8);
    }

    #[test]
    fn test_append_single_packet() {
        let ring = test_ring(RingId::LOW, 256);
        let span = ring.append(Opcode::WaitForIdle, &[]);
        assert_eq!(span, RingSpan { start: 0, end: 1 });
        let span = ring.append(Opcode::ContextSwitchYield, &[0, 0, 0, 0]);
        assert_eq!(span, RingSpan { start: 1, end: 6 });

        let c = ring.cursor();
        assert!(c.tail_yield);
        assert_eq!(c.cur, 0);
        let words = ring.read_span(span);
        let hdr = gpuring_core::PacketHeader::decode(words[0]).unwrap();
        assert_eq!(hdr.opcode, Opcode::ContextSwitchYield as u8);
        assert_eq!(hdr.count, 4);
    }

    #[test]
    fn test_free_dwords() {
        let ring = test_ring(RingId::LOW, 1024);
        assert_eq!(ring.free_dwords(), 1023);
        ring.append_stream(&nops(10), None).unwrap();
        assert_eq!(ring.free_dwords(), 1023 - 40);

        ring.memptrs().set_rptr(RingId::LOW, 40);
        assert_eq!(ring.free_dwords(), 1023);
    }

    #[test]
    fn test_full_ring_rejects_without_writing() {
        let ring = test_ring(RingId::HIGH, 256);
        ring.append_stream(&nops(60), None).unwrap();
        let before = ring.cursor();

        let err = ring.append_stream(&nops(4), None).unwrap_err();
        assert_eq!(err, GpuError::RingFull { ring: RingId::HIGH, needed: 16, free: 15 });
        assert_eq!(ring.cursor(), before);
    }

    #[test]
    fn test_wraparound() {
        let ring = test_ring(RingId::LOW, 256);
        ring.append_stream(&nops(60), None).unwrap();
        ring.memptrs().set_rptr(RingId::LOW, 240);

        let span = ring.append_stream(&nops(8), None).unwrap();
        assert_eq!(span.start, 240);
        assert_eq!(span.end, (240 + 32) & 255);
        let words = ring.read_span(span);
        let mut expect = PacketStream::new();
        expect.extend(&nops(8));
        assert_eq!(words, expect.as_slice());
    }

    #[test]
    fn test_yield_publishes_and_marks_dirty() {
        let ring = test_ring(RingId::LOW, 256);
        {
            let mut c = ring.lock();
            assert!(ring.append_yield_locked(&mut c));
            assert_eq!(c.cur, 5);
            assert!(c.dirty);
            assert!(c.tail_yield);
        }
        // a lone trailing yield is not work
        assert!(!ring.has_pending());
        assert_eq!(ring.yields_appended(), 1);
    }

    #[test]
    fn test_pending_tracks_submissions() {
        let ring = test_ring(RingId::HIGH, 256);
        let span = ring.append_stream(&nops(2), None).unwrap();
        assert!(!ring.has_pending(), "appended but unpublished");
        {
            let mut c = ring.lock();
            c.cur = c.next;
            assert!(ring.append_yield_locked(&mut c));
        }
        assert!(ring.has_pending());

        // CP consumed the submission but not the trailing yield
        ring.memptrs().set_rptr(RingId::HIGH, span.end);
        assert!(!ring.has_pending());
    }

    #[test]
    fn test_resume_binding_prefers_memptrs() {
        let ring = test_ring(RingId::HIGH, 256);
        let appended = PageTableBinding { ttbr0: 0x8000, asid: 2 };
        let mut stream = nops(1);
        stream.yield_point();
        ring.append_stream(&stream, Some(appended)).unwrap();

        let c = ring.cursor();
        assert!(c.tail_yield);
        assert_eq!(ring.resume_binding_locked(&c), Some(appended));

        ring.memptrs().buffer().write_u64(0x20 + 0x10, 0x4000);
        ring.memptrs().buffer().write_u32(0x20 + 0x18, 1);
        assert_eq!(
            ring.resume_binding_locked(&c),
            Some(PageTableBinding { ttbr0: 0x4000, asid: 1 })
        );
    }

    #[test]
    fn test_reset() {
        let ring = test_ring(RingId::LOW, 256);
        ring.append_stream(&nops(3), None).unwrap();
        ring.submit_state().last_ctx = Some(ContextId::new(3));
        ring.reset();
        assert_eq!(ring.cursor(), RingCursor::default());
        assert!(ring.submit_state().last_ctx.is_none());
        assert_eq!(ring.buffer().load_dword(0), 0);
    }
}
