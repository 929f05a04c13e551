//! Submission path: validate, encode, append, flush
//!
//! A submission is validated and fully encoded into a `PacketStream`
//! before anything is written, so a rejected call leaves the ring, its
//! last-context binding and the fence timeline exactly as they were.

use std::sync::Arc;
use std::time::Instant;

use gpuring_core::packet::{hi32, lo32, marker, EventKind, THREAD_BOTH, THREAD_SYNC};
use gpuring_core::record::MemPtrs;
use gpuring_core::{
    dev_trace, CmdBuffer, CmdKind, ContextId, Fence, FenceSeqno, GpuError, GpuResult, Opcode,
    PacketStream, PageTableBinding, PageTableProvider, RingId,
};

use crate::fence::{FenceTracker, SubmissionRecord};
use crate::preempt::PreemptionController;
use crate::ring::Ring;

/// Worst-case encoded size of a submission carrying `max_cmds` buffers
///
/// Covers the context-switch preamble, one IB packet per buffer and the
/// fence epilogue.
pub const fn max_submission_dwords(max_cmds: usize) -> usize {
    32usize.saturating_add(max_cmds.saturating_mul(4))
}

/// Encode one submission
///
/// `switch_to` carries the context's page tables when the ring last ran a
/// different context.
pub fn encode_submission(
    ring: RingId,
    memptrs: &MemPtrs,
    switch_to: Option<&PageTableBinding>,
    cmds: &[CmdBuffer],
    seqno: FenceSeqno,
) -> PacketStream {
    let mut s = PacketStream::with_capacity(max_submission_dwords(cmds.len()));

    if let Some(pt) = switch_to {
        s.pkt7(
            Opcode::SmmuTableUpdate,
            &[lo32(pt.ttbr0), (hi32(pt.ttbr0) & 0xffff) | (pt.asid << 16), 0, 0],
        );
        s.mem_write_n(memptrs.ttbr0_iova(ring), &[lo32(pt.ttbr0), hi32(pt.ttbr0), pt.asid]);
        s.pkt7(Opcode::WaitForMe, &[]);
    }

    s.pkt7(Opcode::SetMarker, &[marker::RM6_CMD_START]);
    s.pkt7(Opcode::ThreadControl, &[THREAD_BOTH | THREAD_SYNC]);

    for cmd in cmds {
        if cmd.kind == CmdKind::CtxRestore && switch_to.is_none() {
            continue;
        }
        s.pkt7(Opcode::IndirectBuffer, &[lo32(cmd.iova), hi32(cmd.iova), cmd.size_dwords]);
    }

    s.event_write(EventKind::CacheInvalidate);

    s.mem_write(memptrs.public_fence_iova(ring), seqno.raw());
    s.event_write_ts(EventKind::CacheCleanTs, memptrs.fence_iova(ring), seqno.raw(), true);

    s.yield_point();
    s
}

pub struct SubmissionQueue {
    dev: String,
    rings: [Arc<Ring>; 2],
    memptrs: MemPtrs,
    pagetables: Arc<dyn PageTableProvider>,
    preempt: Arc<PreemptionController>,
    fences: Arc<FenceTracker>,
    max_cmds: usize,
}

impl SubmissionQueue {
    pub fn new(
        dev: &str,
        rings: [Arc<Ring>; 2],
        memptrs: MemPtrs,
        pagetables: Arc<dyn PageTableProvider>,
        preempt: Arc<PreemptionController>,
        fences: Arc<FenceTracker>,
        max_cmds: usize,
    ) -> Self {
        Self {
            dev: dev.to_string(),
            rings,
            memptrs,
            pagetables,
            preempt,
            fences,
            max_cmds,
        }
    }

    fn validate(&self, ctx: ContextId, cmds: &[CmdBuffer]) -> GpuResult<()> {
        if cmds.is_empty() {
            return Err(GpuError::EmptySubmission);
        }
        if cmds.len() > self.max_cmds {
            return Err(GpuError::TooManyCommands { count: cmds.len(), budget: self.max_cmds });
        }
        for cmd in cmds {
            if cmd.size_dwords == 0 || !self.pagetables.is_mapped(ctx, cmd.iova, cmd.len_bytes()) {
                return Err(GpuError::UnmappedBuffer {
                    ctx,
                    iova: cmd.iova,
                    size_dwords: cmd.size_dwords,
                });
            }
        }
        Ok(())
    }

    /// Queue `cmds` for `ctx` on ring `ring_idx`
    pub fn submit(&self, ctx: ContextId, ring_idx: u32, cmds: &[CmdBuffer]) -> GpuResult<Fence> {
        let ring_id = RingId::from_index(ring_idx).ok_or(GpuError::InvalidRing(ring_idx))?;
        self.validate(ctx, cmds)?;
        let binding = self.pagetables.binding(ctx).ok_or(GpuError::NoPageTable(ctx))?;
        let ring = &self.rings[ring_id.as_usize()];

        let fence = {
            let mut st = ring.submit_state();
            let switch_to = (st.last_ctx != Some(ctx)).then_some(&binding);
            let seqno = self.fences.next_seqno(ring_id);
            let stream = encode_submission(ring_id, &self.memptrs, switch_to, cmds, seqno);

            let fence = Fence::new(ring_id, seqno);
            {
                // commit under the cursor lock: the CP cannot see (and
                // retire) the packets before the seqno is issued
                let mut c = ring.lock();
                let span = ring.append_locked(&mut c, &stream, Some(binding))?;
                self.fences.commit(SubmissionRecord {
                    fence,
                    ctx,
                    binding,
                    cmds: cmds.to_vec(),
                    span,
                    queued_at: Instant::now(),
                });
            }
            st.last_ctx = Some(ctx);
            dev_trace!(&self.dev, "submit {} {} cmds -> {}", ctx, cmds.len(), fence);
            fence
        };

        self.preempt.flush(ring);
        Ok(fence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag::Diagnostics;
    use crate::memory::DeviceMemory;
    use crate::preempt::PreemptOptions;
    use crate::ring::tests::test_ring;
    use gpuring_core::record::MEMPTRS_SIZE;
    use gpuring_core::{DmaAllocator, RegisterBus};
    use std::time::Duration;

    fn heap_memptrs() -> MemPtrs {
        let mem = DeviceMemory::new("test", 0x2_0000_0000);
        MemPtrs::new(mem.alloc(MEMPTRS_SIZE, "memptrs").unwrap())
    }

    struct NullBus;

    impl RegisterBus for NullBus {
        fn read32(&self, _reg: u32) -> u32 {
            0
        }
        fn write32(&self, _reg: u32, _val: u32) {}
    }

    /// Context 1 maps `[0x10_0000, 0x20_0000)`; context 2 has no page tables
    struct OneContext;

    impl PageTableProvider for OneContext {
        fn binding(&self, ctx: ContextId) -> Option<PageTableBinding> {
            (ctx == ContextId::new(1)).then_some(PageTableBinding { ttbr0: 0x8000_0000, asid: 1 })
        }
        fn is_mapped(&self, _ctx: ContextId, iova: u64, len: u64) -> bool {
            iova >= 0x10_0000 && iova + len <= 0x20_0000
        }
    }

    fn queue(ring_dwords: u32) -> (SubmissionQueue, [Arc<Ring>; 2], Arc<FenceTracker>) {
        let rings = [
            Arc::new(test_ring(RingId::LOW, ring_dwords)),
            Arc::new(test_ring(RingId::HIGH, ring_dwords)),
        ];
        let opts = PreemptOptions {
            uses_gmem: true,
            skip_save_restore: false,
            rearm_low_priority: true,
            timeout: Duration::from_millis(10),
        };
        let preempt = Arc::new(PreemptionController::new(
            "test",
            Arc::new(NullBus),
            rings.clone(),
            opts,
            Arc::new(Diagnostics::new("test", 4)),
        ));
        let fences = Arc::new(FenceTracker::new("test", Duration::from_millis(1)));
        let q = SubmissionQueue::new(
            "test",
            rings.clone(),
            heap_memptrs(),
            Arc::new(OneContext),
            preempt,
            fences.clone(),
            4,
        );
        (q, rings, fences)
    }

    fn decode(s: &PacketStream) -> Vec<Opcode> {
        s.iter().map(|p| p.unwrap().0).collect()
    }

    #[test]
    fn test_worst_case_size_is_exact() {
        let memptrs = heap_memptrs();
        let pt = PageTableBinding { ttbr0: 0x1_2345_6000, asid: 3 };
        for n in [1, 4, 32] {
            let cmds = vec![CmdBuffer::new(0x10_0000, 16); n];
            let s = encode_submission(RingId::LOW, &memptrs, Some(&pt), &cmds, FenceSeqno::new(1));
            assert_eq!(s.len(), max_submission_dwords(n));
        }
    }

    #[test]
    fn test_encoding_order_with_context_switch() {
        let memptrs = heap_memptrs();
        let pt = PageTableBinding { ttbr0: 0x1_2345_6000, asid: 3 };
        let cmds = [
            CmdBuffer::new(0x10_0000, 16).with_kind(CmdKind::CtxRestore),
            CmdBuffer::new(0x20_0000, 64),
        ];
        let s = encode_submission(RingId::HIGH, &memptrs, Some(&pt), &cmds, FenceSeqno::new(9));

        assert_eq!(
            decode(&s),
            [
                Opcode::SmmuTableUpdate,
                Opcode::MemWrite,
                Opcode::WaitForMe,
                Opcode::SetMarker,
                Opcode::ThreadControl,
                Opcode::IndirectBuffer,
                Opcode::IndirectBuffer,
                Opcode::EventWrite,
                Opcode::MemWrite,
                Opcode::EventWrite,
                Opcode::ContextSwitchYield,
            ]
        );

        let pkts: Vec<_> = s.iter().map(|p| p.unwrap()).collect();
        assert_eq!(pkts[0].1, &[0x2345_6000, 0x1 | (3 << 16), 0, 0]);
        assert_eq!(pkts[6].1, &[0x20_0000, 0, 64]);
        // public slot first, then the retire source with irq
        assert_eq!(pkts[8].1[0], lo32(memptrs.public_fence_iova(RingId::HIGH)));
        assert_eq!(pkts[8].1[2], 9);
        assert_eq!(pkts[9].1[1], lo32(memptrs.fence_iova(RingId::HIGH)));
        assert_eq!(pkts[9].1[3], 9);
        assert_ne!(pkts[9].1[0] & gpuring_core::packet::EVENT_IRQ, 0);
    }

    #[test]
    fn test_same_context_skips_switch_and_restore() {
        let memptrs = heap_memptrs();
        let cmds = [
            CmdBuffer::new(0x10_0000, 16).with_kind(CmdKind::CtxRestore),
            CmdBuffer::new(0x20_0000, 64).with_kind(CmdKind::IbTarget),
        ];
        let s = encode_submission(RingId::LOW, &memptrs, None, &cmds, FenceSeqno::new(1));
        let ops = decode(&s);
        assert_eq!(ops[0], Opcode::SetMarker);
        assert_eq!(ops.iter().filter(|&&o| o == Opcode::IndirectBuffer).count(), 1);
        assert_eq!(ops.last(), Some(&Opcode::ContextSwitchYield));
        assert_eq!(ops.iter().filter(|&&o| o == Opcode::ContextSwitchYield).count(), 1);
    }

    #[test]
    fn test_validation_order() {
        let (q, _, _) = queue(1024);
        let ctx = ContextId::new(1);
        let ok = CmdBuffer::new(0x10_0000, 16);

        assert!(matches!(q.submit(ctx, 2, &[ok]), Err(GpuError::InvalidRing(2))));
        assert!(matches!(q.submit(ctx, 0, &[]), Err(GpuError::EmptySubmission)));
        assert!(matches!(
            q.submit(ctx, 0, &[ok; 5]),
            Err(GpuError::TooManyCommands { count: 5, budget: 4 })
        ));
        assert!(matches!(
            q.submit(ctx, 0, &[ok, CmdBuffer::new(0x10_0000, 0)]),
            Err(GpuError::UnmappedBuffer { size_dwords: 0, .. })
        ));
        assert!(matches!(
            q.submit(ctx, 0, &[CmdBuffer::new(0x1f_fff0, 16)]),
            Err(GpuError::UnmappedBuffer { iova: 0x1f_fff0, .. })
        ));
        // mapped check comes before the page-table check
        assert!(matches!(q.submit(ContextId::new(2), 0, &[ok]), Err(GpuError::NoPageTable(_))));
    }

    #[test]
    fn test_submit_assigns_increasing_fences() {
        let (q, rings, fences) = queue(1024);
        let ctx = ContextId::new(1);
        let cmd = [CmdBuffer::new(0x10_0000, 16)];

        let a = q.submit(ctx, 0, &cmd).unwrap();
        let b = q.submit(ctx, 0, &cmd).unwrap();
        let h = q.submit(ctx, 1, &cmd).unwrap();
        assert_eq!(a.seqno.raw() + 1, b.seqno.raw());
        assert_eq!(h.seqno.raw(), 1);
        assert_eq!(fences.inflight(RingId::LOW), 2);
        assert_eq!(rings[0].submit_state().last_ctx, Some(ctx));
        assert!(rings[0].has_pending());
    }

    #[test]
    fn test_ring_full_leaves_no_trace() {
        let (q, rings, fences) = queue(256);
        let ctx = ContextId::new(1);
        let cmds = [CmdBuffer::new(0x10_0000, 16); 4];

        let mut last = None;
        loop {
            match q.submit(ctx, 0, &cmds) {
                Ok(f) => last = Some(f),
                Err(GpuError::RingFull { .. }) => break,
                Err(e) => panic!("unexpected {e:?}"),
            }
        }
        let before = rings[0].cursor();
        let issued = fences.issued(RingId::LOW);
        assert!(matches!(q.submit(ctx, 0, &cmds), Err(GpuError::RingFull { .. })));
        assert_eq!(rings[0].cursor(), before);
        assert_eq!(fences.issued(RingId::LOW), issued);
        assert_eq!(last.map(|f| f.seqno), Some(issued));
    }
}
