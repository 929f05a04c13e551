//! Hardware (re)initialisation
//!
//! Runs on first bring-up and again on every recovery. Each run leaves
//! both rings empty, every preemption record freshly stamped and the
//! preemption state machine in `Idle(LOW)`.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gpuring_core::record::{MemPtrs, RecordInit};
use gpuring_core::{
    dev_dbg, dev_info, DmaBuffer, GpuError, GpuResult, GpuVariant, IrqStatus, Opcode,
    PacketStream, RegisterBus, RingId,
};

use crate::preempt::PreemptionController;
use crate::regs;
use crate::ring::Ring;

/// `CP_ME_INIT` operands: which of the following fields are present,
/// then the fields themselves
const ME_INIT_MASK: u32 = (1 << 0) | (1 << 1) | (1 << 3) | (1 << 5) | (1 << 6);
const ME_INIT_MULTI_CONTEXT: u32 = 0x0000_0003;
const ME_INIT_ERROR_DETECT: u32 = 0x0000_0002;
const ME_INIT_UCODE_WORKAROUND: u32 = 0x0000_0000;

/// SQE microcode
#[derive(Clone)]
pub struct Firmware {
    words: Arc<[u32]>,
}

impl Firmware {
    pub fn from_words(words: Vec<u32>) -> GpuResult<Self> {
        if words.is_empty() {
            return Err(GpuError::BadFirmware("empty sqe image"));
        }
        Ok(Self { words: words.into() })
    }

    #[inline]
    pub fn words(&self) -> &[u32] {
        &self.words
    }

    #[inline]
    pub fn len_bytes(&self) -> usize {
        self.words.len() * 4
    }
}

impl std::fmt::Debug for Firmware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Firmware").field("dwords", &self.words.len()).finish()
    }
}

/// Idle-wait budget
#[derive(Debug, Clone, Copy)]
pub struct IdleParams {
    pub retries: u32,
    pub poll: Duration,
}

/// Buffers the sequencer programs into the CP
pub struct InitBuffers {
    pub sqe: DmaBuffer,
    pub pwrup: DmaBuffer,
}

pub struct HardwareInitSequencer {
    dev: String,
    bus: Arc<dyn RegisterBus>,
    variant: Arc<dyn GpuVariant>,
    rings: [Arc<Ring>; 2],
    memptrs: MemPtrs,
    preempt: Arc<PreemptionController>,
    bufs: InitBuffers,
    idle: IdleParams,
    zap_loaded: AtomicBool,
    runs: AtomicU32,
}

impl HardwareInitSequencer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dev: &str,
        bus: Arc<dyn RegisterBus>,
        variant: Arc<dyn GpuVariant>,
        rings: [Arc<Ring>; 2],
        memptrs: MemPtrs,
        preempt: Arc<PreemptionController>,
        firmware: &Firmware,
        bufs: InitBuffers,
        idle: IdleParams,
    ) -> Self {
        for (i, w) in firmware.words().iter().enumerate() {
            bufs.sqe.store_dword(i, *w);
        }
        Self {
            dev: dev.to_string(),
            bus,
            variant,
            rings,
            memptrs,
            preempt,
            bufs,
            idle,
            zap_loaded: AtomicBool::new(false),
            runs: AtomicU32::new(0),
        }
    }

    /// True once the zap shader has been loaded on this device
    pub fn zap_loaded(&self) -> bool {
        self.zap_loaded.load(Ordering::Acquire)
    }

    /// Completed and attempted runs so far
    pub fn runs(&self) -> u32 {
        self.runs.load(Ordering::Relaxed)
    }

    fn ring(&self, id: RingId) -> &Ring {
        &self.rings[id.as_usize()]
    }

    /// Bring the CP from reset to `Idle(LOW)` with preemption armed
    pub fn run(&self) -> GpuResult<()> {
        self.runs.fetch_add(1, Ordering::Relaxed);
        dev_dbg!(&self.dev, "hw init ({})", self.variant.name());

        self.soft_reset();
        self.bus.write32(regs::RBBM_INT_0_MASK, 0);

        for &(reg, val) in self.variant.hwcg() {
            self.bus.write32(reg, val);
        }
        for &(reg, val) in self.variant.ubwc() {
            self.bus.write32(reg, val);
        }
        self.program_protect();
        self.program_pwrup_reglist();
        self.bus.write64(regs::CP_SQE_INSTR_BASE, self.bufs.sqe.iova());

        for id in RingId::iter() {
            self.init_ring(id);
        }
        self.program_ring0();
        self.preempt.reset();

        self.bus.write32(regs::RBBM_INT_0_MASK, IrqStatus::MASK.bits());
        self.bus.write32(regs::CP_SQE_CNTL, regs::CP_SQE_CNTL_START);

        self.emit(
            Opcode::MeInit,
            &[
                ME_INIT_MASK,
                ME_INIT_MULTI_CONTEXT,
                ME_INIT_ERROR_DETECT,
                ME_INIT_UCODE_WORKAROUND,
                0,
                0,
            ],
        );
        self.wait_idle("cp init")?;

        if !self.zap_loaded() {
            self.variant.load_zap_shader()?;
            self.zap_loaded.store(true, Ordering::Release);
            dev_info!(&self.dev, "zap shader loaded");
        }
        self.emit(Opcode::SetSecureMode, &[0]);

        let start = self.preempt.start_packets();
        self.submit_internal(&start)?;
        self.wait_idle("preempt start")?;

        dev_info!(&self.dev, "hw init done ({})", self.variant.name());
        Ok(())
    }

    fn soft_reset(&self) {
        self.bus.write32(regs::RBBM_SW_RESET_CMD, 1);
        // read back so the reset is posted before it is released
        let _ = self.bus.read32(regs::RBBM_SW_RESET_CMD);
        self.bus.write32(regs::RBBM_SW_RESET_CMD, 0);
    }

    fn program_protect(&self) {
        let ranges = self.variant.protect();
        debug_assert!(ranges.len() <= regs::CP_PROTECT_REG_COUNT as usize);
        self.bus.write32(regs::CP_PROTECT_CNTL, regs::CP_PROTECT_CNTL_ENABLE);
        for n in 0..regs::CP_PROTECT_REG_COUNT {
            let val = ranges.get(n as usize).map_or(0, |r| r.encode());
            self.bus.write32(regs::cp_protect_reg(n), val);
        }
    }

    fn program_pwrup_reglist(&self) {
        let list = self.variant.pwrup_reglist();
        self.bufs.pwrup.zero();
        // header: entry count, then (register, value) pairs
        self.bufs.pwrup.store_dword(0, list.len() as u32);
        for (i, &reg) in list.iter().enumerate() {
            self.bufs.pwrup.store_dword(1 + i * 2, reg);
            self.bufs.pwrup.store_dword(2 + i * 2, self.bus.read32(reg));
        }
        std::sync::atomic::fence(Ordering::Release);
        self.bus.write64(regs::CP_PWRUP_REGLIST_ADDR, self.bufs.pwrup.iova());
    }

    fn init_ring(&self, id: RingId) {
        let ring = self.ring(id);
        ring.reset();
        ring.record().init(&RecordInit {
            cntl: regs::rb_cntl(ring.size_dwords()),
            rbase: ring.iova(),
            rptr_addr: self.memptrs.rptr_iova(id),
            counter: self.memptrs.counter_iova(id),
            bv_rptr_addr: self.memptrs.bv_rptr_iova(id),
        });
        ring.smmu().init();
    }

    fn program_ring0(&self) {
        let ring = self.ring(RingId::LOW);
        self.bus.write32(regs::CP_RB_CNTL, regs::rb_cntl(ring.size_dwords()));
        self.bus.write64(regs::CP_RB_BASE, ring.iova());
        self.bus.write64(regs::CP_RB_RPTR_ADDR, self.memptrs.rptr_iova(RingId::LOW));
        self.bus.write64(regs::CP_BV_RB_RPTR_ADDR, self.memptrs.bv_rptr_iova(RingId::LOW));
        self.bus.write32(regs::CP_RB_WPTR, 0);
    }

    /// One packet on a freshly reset ring 0, published at once
    fn emit(&self, opcode: Opcode, operands: &[u32]) {
        let ring = self.ring(RingId::LOW);
        ring.append(opcode, operands);
        self.preempt.flush(ring);
    }

    fn submit_internal(&self, stream: &PacketStream) -> GpuResult<()> {
        let ring = self.ring(RingId::LOW);
        ring.append_stream(stream, None)?;
        self.preempt.flush(ring);
        Ok(())
    }

    /// Poll until the GPU is idle and ring 0 has consumed everything
    fn wait_idle(&self, what: &'static str) -> GpuResult<()> {
        let ring = self.ring(RingId::LOW);
        for attempt in 0..self.idle.retries {
            let busy = self.bus.read32(regs::RBBM_STATUS) & regs::RBBM_STATUS_GPU_BUSY != 0;
            if !busy && ring.rptr() == ring.cursor().cur {
                return Ok(());
            }
            if attempt + 1 < self.idle.retries {
                std::thread::sleep(self.idle.poll);
            }
        }
        Err(GpuError::IdleTimeout { what, retries: self.idle.retries })
    }
}
