//! Simulated hardware
//!
//! `SimGpu` is a register file plus a small command-processor model: it
//! walks the current ring from rptr to wptr, performs `CP_MEM_WRITE` and
//! timestamped `CP_EVENT_WRITE` into DMA memory, and honours context
//! switch requests at yield packets (or at once on an empty ring) by
//! saving and restoring rings through their preemption records.
//! `run()` returns right after a switch so the switch-complete interrupt
//! is handled before the incoming ring executes anything.
//!
//! Nothing runs on its own. Tests and demos call `run()` and then hand
//! `take_irq()` to the device, the way an interrupt line would.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use gpuring_core::packet::{PacketHeader, EVENT_IRQ, EVENT_TIMESTAMP};
use gpuring_core::record::{PreemptionRecord, SmmuContextInfo};
use gpuring_core::{
    ContextId, DmaAllocator, DmaBuffer, IrqStatus, Opcode, PageTableBinding,
    PageTableProvider, RegisterBus, SwitchCntl,
};

use crate::regs;

/// Register writes kept for inspection
const WRITE_LOG_LEN: usize = 4096;

/// Upper bound on packets executed per `run()`
const RUN_BUDGET: usize = 1 << 16;

struct RingCtx {
    buf: DmaBuffer,
    size: u32,
    rptr: u32,
    wptr: u32,
    rptr_shadow: Option<(DmaBuffer, usize)>,
}

impl RingCtx {
    fn mask(&self) -> u32 {
        self.size - 1
    }

    fn word(&self, idx: u32) -> u32 {
        self.buf.load_dword((idx & self.mask()) as usize)
    }

    fn publish_rptr(&self) {
        if let Some((buf, off)) = &self.rptr_shadow {
            buf.write_u32(*off, self.rptr);
        }
    }
}

#[derive(Default)]
struct SimState {
    regs: HashMap<u32, u32>,
    writes: VecDeque<(u32, u32)>,
    ctx: Option<RingCtx>,
    record: Option<PreemptionRecord>,
    switch_pending: bool,
    hold_switch: bool,
    irq: IrqStatus,
    stuck: bool,
    faulted: bool,
    ttbr0: u64,
    ibs: u64,
    switches: u64,
}

/// Counters exposed for assertions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimStats {
    pub ibs_executed: u64,
    pub switches: u64,
    pub faulted: bool,
}

pub struct SimGpu {
    alloc: Arc<dyn DmaAllocator>,
    state: Mutex<SimState>,
}

impl SimGpu {
    pub fn new(alloc: Arc<dyn DmaAllocator>) -> Self {
        Self { alloc, state: Mutex::new(SimState::default()) }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Execute until the current ring is drained or the CP faults
    pub fn run(&self) {
        let mut st = self.state();
        self.run_locked(&mut st);
    }

    /// Take and clear the pending interrupt bits
    pub fn take_irq(&self) -> IrqStatus {
        std::mem::replace(&mut self.state().irq, IrqStatus::empty())
    }

    /// Raise interrupt bits as if the hardware had
    pub fn inject_irq(&self, bits: IrqStatus) {
        self.state().irq |= bits;
    }

    /// Report busy forever and stop executing
    pub fn set_stuck(&self, stuck: bool) {
        self.state().stuck = stuck;
    }

    /// Leave requested switches pending, as a hung CP would
    pub fn hold_switches(&self, hold: bool) {
        self.state().hold_switch = hold;
    }

    /// Page-table base the CP currently translates with
    pub fn ttbr0(&self) -> u64 {
        self.state().ttbr0
    }

    pub fn stats(&self) -> SimStats {
        let st = self.state();
        SimStats { ibs_executed: st.ibs, switches: st.switches, faulted: st.faulted }
    }

    /// Every value written to `reg`, oldest first
    pub fn writes_to(&self, reg: u32) -> Vec<u32> {
        self.state().writes.iter().filter(|w| w.0 == reg).map(|w| w.1).collect()
    }

    /// All logged writes, oldest first
    pub fn write_log(&self) -> Vec<(u32, u32)> {
        self.state().writes.iter().copied().collect()
    }

    fn reg(st: &SimState, reg: u32) -> u32 {
        st.regs.get(&reg).copied().unwrap_or(0)
    }

    fn reg64(st: &SimState, reg: u32) -> u64 {
        (Self::reg(st, reg + 1) as u64) << 32 | Self::reg(st, reg) as u64
    }

    /// Buffer and byte offset backing `iova`
    fn locate(&self, iova: u64) -> Option<(DmaBuffer, usize)> {
        let buf = self.alloc.resolve(iova)?;
        let off = (iova - buf.iova()) as usize;
        Some((buf, off))
    }

    fn write_mem(&self, st: &mut SimState, iova: u64, values: &[u32]) {
        match self.locate(iova) {
            Some((buf, off)) if off + values.len() * 4 <= buf.len_bytes() => {
                for (i, v) in values.iter().enumerate() {
                    buf.write_u32(off + i * 4, *v);
                }
            }
            _ => self.fault(st, iova as u32),
        }
    }

    fn fault(&self, st: &mut SimState, info: u32) {
        st.faulted = true;
        st.regs.insert(regs::CP_HW_FAULT, info);
        st.irq |= IrqStatus::CP_HW_ERROR;
    }

    fn load_ring0(&self, st: &mut SimState) {
        let base = Self::reg64(st, regs::CP_RB_BASE);
        let cntl = Self::reg(st, regs::CP_RB_CNTL);
        let rptr_addr = Self::reg64(st, regs::CP_RB_RPTR_ADDR);
        let Some(buf) = self.alloc.resolve(base) else {
            self.fault(st, base as u32);
            return;
        };
        let ctx = RingCtx {
            buf,
            size: ring_size(cntl),
            rptr: 0,
            wptr: Self::reg(st, regs::CP_RB_WPTR),
            rptr_shadow: self.locate(rptr_addr),
        };
        ctx.publish_rptr();
        st.ctx = Some(ctx);
    }

    fn soft_reset(st: &mut SimState) {
        let writes = std::mem::take(&mut st.writes);
        let hold = st.hold_switch;
        let stuck = st.stuck;
        *st = SimState { writes, hold_switch: hold, stuck, ..SimState::default() };
    }

    fn run_locked(&self, st: &mut SimState) {
        if st.stuck {
            return;
        }
        for _ in 0..RUN_BUDGET {
            if st.faulted {
                return;
            }
            let Some(ctx) = st.ctx.as_ref() else {
                return;
            };
            if ctx.rptr == ctx.wptr {
                if st.switch_pending && !st.hold_switch {
                    self.switch_locked(st);
                }
                return;
            }
            let switches = st.switches;
            self.step(st);
            if st.switches != switches {
                // switch-complete is delivered before the new ring runs
                return;
            }
        }
    }

    /// Execute one packet of the current ring
    fn step(&self, st: &mut SimState) {
        let Some(ctx) = st.ctx.as_mut() else {
            return;
        };
        let head = ctx.word(ctx.rptr);
        let Some(hdr) = PacketHeader::decode(head) else {
            let rptr = ctx.rptr;
            self.fault(st, rptr);
            return;
        };
        let avail = ctx.wptr.wrapping_sub(ctx.rptr) & ctx.mask();
        if hdr.len_dwords() > avail {
            // the driver only ever publishes whole packets
            let rptr = ctx.rptr;
            self.fault(st, rptr);
            return;
        }
        let operands: Vec<u32> = (1..=hdr.count).map(|i| ctx.word(ctx.rptr + i)).collect();
        ctx.rptr = (ctx.rptr + hdr.len_dwords()) & ctx.mask();
        ctx.publish_rptr();

        match Opcode::from_u8(hdr.opcode) {
            Some(Opcode::MemWrite) if operands.len() >= 3 => {
                let iova = join(operands[0], operands[1]);
                self.write_mem(st, iova, &operands[2..]);
            }
            Some(Opcode::EventWrite) if operands.len() >= 4 && operands[0] & EVENT_TIMESTAMP != 0 => {
                let iova = join(operands[1], operands[2]);
                self.write_mem(st, iova, &operands[3..4]);
                if operands[0] & EVENT_IRQ != 0 {
                    st.irq |= IrqStatus::CP_CACHE_FLUSH_TS;
                }
            }
            Some(Opcode::IndirectBuffer) => st.ibs += 1,
            Some(Opcode::SmmuTableUpdate) if operands.len() >= 2 => {
                st.ttbr0 = join(operands[0], operands[1] & 0xffff);
            }
            Some(Opcode::SetPseudoReg) => {
                for op in operands.chunks_exact(3) {
                    if op[0] == gpuring_core::packet::PseudoReg::NonSecureSaveAddr as u32 {
                        st.record = self.alloc.resolve(join(op[1], op[2])).map(PreemptionRecord::new);
                    }
                }
            }
            Some(Opcode::ContextSwitchYield) => {
                if st.switch_pending && !st.hold_switch {
                    self.switch_locked(st);
                }
            }
            Some(_) => {}
            None => {
                let rptr = ctx_rptr(st);
                self.fault(st, rptr);
            }
        }
    }

    /// Save the current ring into its record and restore the requested one
    fn switch_locked(&self, st: &mut SimState) {
        let target = Self::reg64(st, regs::CP_CONTEXT_SWITCH_PRIV_NON_SECURE_RESTORE_ADDR);
        let Some(incoming) = self.alloc.resolve(target).map(PreemptionRecord::new) else {
            self.fault(st, target as u32);
            return;
        };
        if !incoming.is_stamped() {
            self.fault(st, target as u32);
            return;
        }

        if let (Some(ctx), Some(rec)) = (&st.ctx, &st.record) {
            rec.hw_save(ctx.rptr, ctx.wptr, 0);
        }

        let snap = incoming.snapshot();
        let Some(buf) = self.alloc.resolve(snap.rbase) else {
            self.fault(st, snap.rbase as u32);
            return;
        };
        let ctx = RingCtx {
            buf,
            size: ring_size(snap.cntl),
            rptr: snap.rptr,
            wptr: snap.wptr,
            rptr_shadow: self.locate(snap.rptr_addr),
        };
        ctx.publish_rptr();
        st.ctx = Some(ctx);
        st.record = Some(incoming);

        let smmu_iova = Self::reg64(st, regs::CP_CONTEXT_SWITCH_SMMU_INFO);
        if let Some(info) = self.alloc.resolve(smmu_iova).map(SmmuContextInfo::new) {
            if info.is_stamped() && info.ttbr0() != 0 {
                st.ttbr0 = info.ttbr0();
            }
        }

        let cntl = Self::reg(st, regs::CP_CONTEXT_SWITCH_CNTL) & !SwitchCntl::BUSY.bits();
        st.regs.insert(regs::CP_CONTEXT_SWITCH_CNTL, cntl);
        st.regs.insert(regs::CP_CONTEXT_SWITCH_LEVEL_STATUS, SwitchCntl::from_bits_retain(cntl).level());
        st.switch_pending = false;
        st.switches += 1;
        st.irq |= IrqStatus::CP_SW;
    }
}

fn ctx_rptr(st: &SimState) -> u32 {
    st.ctx.as_ref().map_or(0, |c| c.rptr)
}

#[inline]
fn join(lo: u32, hi: u32) -> u64 {
    (hi as u64) << 32 | lo as u64
}

/// Ring size in dwords from a `CP_RB_CNTL` value
fn ring_size(cntl: u32) -> u32 {
    2 << (cntl & 0x3f)
}

impl RegisterBus for SimGpu {
    fn read32(&self, reg: u32) -> u32 {
        let mut st = self.state();
        match reg {
            regs::RBBM_STATUS => {
                self.run_locked(&mut st);
                if st.stuck {
                    regs::RBBM_STATUS_GPU_BUSY
                } else {
                    0
                }
            }
            regs::CP_RB_RPTR => ctx_rptr(&st),
            regs::RBBM_INT_0_STATUS => st.irq.bits(),
            _ => Self::reg(&st, reg),
        }
    }

    fn write32(&self, reg: u32, val: u32) {
        let mut st = self.state();
        if st.writes.len() == WRITE_LOG_LEN {
            st.writes.pop_front();
        }
        st.writes.push_back((reg, val));
        st.regs.insert(reg, val);

        match reg {
            regs::RBBM_SW_RESET_CMD if val & 1 != 0 => Self::soft_reset(&mut st),
            regs::CP_SQE_CNTL if val & regs::CP_SQE_CNTL_START != 0 => self.load_ring0(&mut st),
            regs::CP_RB_WPTR => {
                if let Some(ctx) = st.ctx.as_mut() {
                    ctx.wptr = val & ctx.mask();
                }
            }
            regs::CP_CONTEXT_SWITCH_CNTL if val & SwitchCntl::BUSY.bits() != 0 => {
                st.switch_pending = true;
            }
            regs::RBBM_INT_CLEAR_CMD => st.irq &= !IrqStatus::from_bits_retain(val),
            _ => {}
        }
    }
}

/// Fixed context table for tests and demos
#[derive(Default)]
pub struct StaticPageTables {
    contexts: HashMap<ContextId, PageTableBinding>,
    mapped: HashMap<ContextId, Vec<(u64, u64)>>,
    revoked: Mutex<HashSet<ContextId>>,
}

impl StaticPageTables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Give `ctx` an address space
    pub fn with_context(mut self, ctx: ContextId, binding: PageTableBinding) -> Self {
        self.contexts.insert(ctx, binding);
        self
    }

    /// Map `[iova, iova + len)` for `ctx`
    pub fn with_mapping(mut self, ctx: ContextId, iova: u64, len: u64) -> Self {
        self.mapped.entry(ctx).or_default().push((iova, len));
        self
    }

    /// Drop `ctx`'s address space at runtime
    pub fn revoke(&self, ctx: ContextId) {
        self.revoked.lock().unwrap_or_else(|e| e.into_inner()).insert(ctx);
    }
}

impl PageTableProvider for StaticPageTables {
    fn binding(&self, ctx: ContextId) -> Option<PageTableBinding> {
        if self.revoked.lock().unwrap_or_else(|e| e.into_inner()).contains(&ctx) {
            return None;
        }
        self.contexts.get(&ctx).copied()
    }

    fn is_mapped(&self, ctx: ContextId, iova: u64, len: u64) -> bool {
        let Some(end) = iova.checked_add(len) else {
            return false;
        };
        self.mapped
            .get(&ctx)
            .is_some_and(|ranges| ranges.iter().any(|&(base, n)| iova >= base && end <= base + n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::DeviceMemory;
    use gpuring_core::PacketStream;

    fn sim_with_ring(dwords: u32) -> (Arc<SimGpu>, DmaBuffer, DmaBuffer) {
        let mem = Arc::new(DeviceMemory::new("sim", 0x1_0000_0000));
        let ring = mem.alloc(dwords as usize * 4, "ring").unwrap();
        let scratch = mem.alloc(64, "scratch").unwrap();
        let sim = Arc::new(SimGpu::new(mem));
        sim.write32(regs::CP_RB_CNTL, regs::rb_cntl(dwords));
        sim.write64(regs::CP_RB_BASE, ring.iova());
        sim.write64(regs::CP_RB_RPTR_ADDR, scratch.iova());
        sim.write32(regs::CP_SQE_CNTL, regs::CP_SQE_CNTL_START);
        (sim, ring, scratch)
    }

    fn load(ring: &DmaBuffer, at: u32, s: &PacketStream) -> u32 {
        for (i, w) in s.as_slice().iter().enumerate() {
            ring.store_dword(at as usize + i, *w);
        }
        at + s.len() as u32
    }

    #[test]
    fn test_executes_mem_and_event_writes() {
        let (sim, ring, scratch) = sim_with_ring(256);
        let mut s = PacketStream::new();
        s.mem_write(scratch.iova_at(8), 7)
            .event_write_ts(gpuring_core::packet::EventKind::CacheCleanTs, scratch.iova_at(12), 9, true);
        let end = load(&ring, 0, &s);
        sim.write32(regs::CP_RB_WPTR, end);
        sim.run();

        assert_eq!(scratch.read_u32(8), 7);
        assert_eq!(scratch.read_u32(12), 9);
        // rptr shadow at offset 0 of the rptr address
        assert_eq!(scratch.read_u32(0), end);
        assert_eq!(sim.take_irq(), IrqStatus::CP_CACHE_FLUSH_TS);
        assert!(sim.take_irq().is_empty());
    }

    #[test]
    fn test_bad_header_faults() {
        let (sim, ring, _) = sim_with_ring(256);
        ring.store_dword(0, 0xdead_beef);
        sim.write32(regs::CP_RB_WPTR, 1);
        sim.run();
        assert!(sim.stats().faulted);
        assert!(sim.take_irq().contains(IrqStatus::CP_HW_ERROR));
    }

    #[test]
    fn test_stuck_reports_busy() {
        let (sim, _, _) = sim_with_ring(256);
        assert_eq!(sim.read32(regs::RBBM_STATUS), 0);
        sim.set_stuck(true);
        assert_ne!(sim.read32(regs::RBBM_STATUS) & regs::RBBM_STATUS_GPU_BUSY, 0);
    }

    #[test]
    fn test_int_clear() {
        let (sim, _, _) = sim_with_ring(256);
        sim.inject_irq(IrqStatus::CP_SW | IrqStatus::HANG_DETECT);
        sim.write32(regs::RBBM_INT_CLEAR_CMD, IrqStatus::CP_SW.bits());
        assert_eq!(sim.take_irq(), IrqStatus::HANG_DETECT);
    }

    #[test]
    fn test_static_page_tables() {
        let ctx = ContextId::new(4);
        let pt = StaticPageTables::new()
            .with_context(ctx, PageTableBinding { ttbr0: 0x4000, asid: 4 })
            .with_mapping(ctx, 0x10_0000, 0x1000);
        assert!(pt.is_mapped(ctx, 0x10_0000, 0x1000));
        assert!(!pt.is_mapped(ctx, 0x10_0800, 0x1000));
        assert!(!pt.is_mapped(ContextId::new(5), 0x10_0000, 4));
        assert!(pt.binding(ctx).is_some());
        pt.revoke(ctx);
        assert!(pt.binding(ctx).is_none());
    }
}
