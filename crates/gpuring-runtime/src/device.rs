//! The device object
//!
//! `GpuDevice` owns every ring, the preemption controller, the fence
//! tracker and the init sequencer, and is the only thing an embedder
//! talks to. Collaborators (registers, DMA memory, page tables, the
//! variant tables) are handed in fully formed at construction.
//!
//! A reader/writer gate separates normal operation from (re)init:
//! submissions hold it shared, `init` and `recover` hold it exclusively,
//! and the interrupt path only ever tries it so it can never block
//! behind a reset.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, TryLockError};
use std::time::{Duration, Instant};

use gpuring_core::record::{MemPtrs, PreemptionRecord, SmmuContextInfo, MEMPTRS_SIZE, SMMU_INFO_SIZE};
use gpuring_core::{
    dev_dbg, dev_err, dev_info, dev_warn, CancelToken, CmdBuffer, ContextId, DmaAllocator, Fence,
    FenceSeqno, GpuError, GpuResult, GpuVariant, IrqStatus, PageTableProvider, PreemptState,
    RegisterBus, RingId, WaitStatus,
};

use crate::config::DeviceConfig;
use crate::diag::{DiagKind, DiagnosticReport, Diagnostics};
use crate::fence::FenceTracker;
use crate::init::{Firmware, HardwareInitSequencer, IdleParams, InitBuffers};
use crate::preempt::{PreemptCounters, PreemptOptions, PreemptionController};
use crate::regs;
use crate::ring::{Ring, RingSnapshot};
use crate::submit::SubmissionQueue;

/// Everything the device needs from the outside world
pub struct Collaborators {
    pub bus: Arc<dyn RegisterBus>,
    pub alloc: Arc<dyn DmaAllocator>,
    pub pagetables: Arc<dyn PageTableProvider>,
    pub variant: Arc<dyn GpuVariant>,
    pub firmware: Firmware,
}

pub struct GpuDevice {
    cfg: DeviceConfig,
    bus: Arc<dyn RegisterBus>,
    rings: [Arc<Ring>; 2],
    memptrs: MemPtrs,
    preempt: Arc<PreemptionController>,
    fences: Arc<FenceTracker>,
    queue: SubmissionQueue,
    init: HardwareInitSequencer,
    diag: Arc<Diagnostics>,
    gate: RwLock<()>,
    initialized: AtomicBool,
    cancel: CancelToken,
    recoveries: AtomicU64,
}

impl GpuDevice {
    /// Validate `cfg` and allocate every ring and record
    ///
    /// The hardware is not touched until `init`.
    pub fn new(collab: Collaborators, cfg: DeviceConfig) -> GpuResult<Self> {
        cfg.validate()?;
        let name = cfg.name.as_str();
        let alloc = &collab.alloc;

        let memptrs = MemPtrs::new(alloc.alloc(MEMPTRS_SIZE, "memptrs")?);
        let mut rings = Vec::with_capacity(2);
        for id in RingId::iter() {
            let ring = Ring::new(
                name,
                id,
                alloc.alloc(cfg.ring_dwords as usize * 4, "ring")?,
                cfg.ring_dwords,
                PreemptionRecord::new(alloc.alloc(cfg.preempt_record_size, "preempt record")?),
                SmmuContextInfo::new(alloc.alloc(SMMU_INFO_SIZE, "smmu info")?),
                alloc.alloc(cfg.user_record_size, "user record")?,
                memptrs.clone(),
            );
            rings.push(Arc::new(ring));
        }
        let rings: [Arc<Ring>; 2] = [rings[0].clone(), rings[1].clone()];

        let diag = Arc::new(Diagnostics::new(name, cfg.diag_capacity));
        let preempt = Arc::new(PreemptionController::new(
            name,
            collab.bus.clone(),
            rings.clone(),
            PreemptOptions::from_config(&cfg),
            diag.clone(),
        ));
        let fences = Arc::new(FenceTracker::new(name, cfg.wait_slice));
        let queue = SubmissionQueue::new(
            name,
            rings.clone(),
            memptrs.clone(),
            collab.pagetables.clone(),
            preempt.clone(),
            fences.clone(),
            cfg.max_cmds_per_submit,
        );

        let pwrup_len = (1 + 2 * collab.variant.pwrup_reglist().len()) * 4;
        let bufs = InitBuffers {
            sqe: alloc.alloc(collab.firmware.len_bytes(), "sqe")?,
            pwrup: alloc.alloc(pwrup_len, "pwrup reglist")?,
        };
        let init = HardwareInitSequencer::new(
            name,
            collab.bus.clone(),
            collab.variant.clone(),
            rings.clone(),
            memptrs.clone(),
            preempt.clone(),
            &collab.firmware,
            bufs,
            IdleParams { retries: cfg.idle_retries, poll: cfg.idle_poll_interval },
        );

        dev_info!(
            name,
            "{}: 2 rings of {} dwords, max {} cmds per submit",
            collab.variant.name(),
            cfg.ring_dwords,
            cfg.max_cmds_per_submit
        );

        Ok(Self {
            cfg,
            bus: collab.bus,
            rings,
            memptrs,
            preempt,
            fences,
            queue,
            init,
            diag,
            gate: RwLock::new(()),
            initialized: AtomicBool::new(false),
            cancel: CancelToken::new(),
            recoveries: AtomicU64::new(0),
        })
    }

    fn gate_read(&self) -> RwLockReadGuard<'_, ()> {
        self.gate.read().unwrap_or_else(|e| e.into_inner())
    }

    fn gate_write(&self) -> RwLockWriteGuard<'_, ()> {
        self.gate.write().unwrap_or_else(|e| e.into_inner())
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.cfg.name
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.cfg
    }

    /// First hardware bring-up
    pub fn init(&self) -> GpuResult<()> {
        let _gate = self.gate_write();
        match self.init_locked() {
            Ok(()) => {
                self.initialized.store(true, Ordering::Release);
                Ok(())
            }
            Err(e) => {
                self.report_init_failure(&e);
                Err(e)
            }
        }
    }

    fn init_locked(&self) -> GpuResult<()> {
        // the CP continues from whatever the fence slots hold
        for id in RingId::iter() {
            self.memptrs.seed_fence(id, self.fences.retired(id));
        }
        self.init.run()
    }

    fn report_init_failure(&self, e: &GpuError) {
        self.diag.report(
            DiagnosticReport::new(DiagKind::InitFailure, self.preempt.state(), e.to_string())
                .regs(self.dump_regs()),
        );
    }

    /// Reset after a hang, fault or protocol desync
    ///
    /// Every outstanding fence on both rings becomes `Lost`. Hardware init
    /// is retried up to `init_retries` times; the last error is returned if
    /// none succeeds and the device stays flagged for recovery.
    pub fn recover(&self) -> GpuResult<()> {
        let _gate = self.gate_write();

        let inflight: Vec<_> = RingId::iter().map(|id| self.fences.inflight(id)).collect();
        self.diag.report(
            DiagnosticReport::new(
                DiagKind::RecoveryDump,
                self.preempt.state(),
                format!("{} low / {} high submissions in flight", inflight[0], inflight[1]),
            )
            .regs(self.dump_regs())
            .rings(self.snapshots()),
        );

        for id in RingId::iter() {
            let lost = self.fences.mark_lost(id);
            if let (Some(first), Some(last)) = (lost.first(), lost.last()) {
                dev_warn!(
                    self.name(),
                    "ring {}: fences {}..={} lost ({} submissions)",
                    id,
                    first.fence.seqno,
                    last.fence.seqno,
                    lost.len()
                );
            }
        }

        let mut last_err = GpuError::NotInitialized;
        for attempt in 0..self.cfg.init_retries {
            if attempt > 0 {
                std::thread::sleep(self.cfg.recovery_backoff * attempt);
            }
            match self.init_locked() {
                Ok(()) => {
                    self.diag.clear_recovery();
                    self.initialized.store(true, Ordering::Release);
                    let n = self.recoveries.fetch_add(1, Ordering::Relaxed) + 1;
                    dev_info!(self.name(), "recovered (attempt {}, recovery #{})", attempt + 1, n);
                    return Ok(());
                }
                Err(e) => {
                    dev_err!(self.name(), "recovery attempt {} failed: {}", attempt + 1, e);
                    self.report_init_failure(&e);
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    /// Queue `cmds` for `ctx` on ring `ring`; returns the fence that
    /// signals their completion
    pub fn submit(&self, ctx: ContextId, ring: u32, cmds: &[CmdBuffer]) -> GpuResult<Fence> {
        let _gate = self.gate_read();
        if !self.initialized.load(Ordering::Acquire) {
            return Err(GpuError::NotInitialized);
        }
        if self.diag.needs_recovery() {
            return Err(GpuError::DeviceLost);
        }
        self.queue.submit(ctx, ring, cmds)
    }

    /// Wait on `fence`; released early only by device shutdown
    pub fn wait(&self, fence: Fence, timeout: Option<Duration>) -> WaitStatus {
        self.fences.wait(fence, timeout, &self.cancel)
    }

    /// Wait on `fence` until `cancel` fires
    ///
    /// Use a token from `cancel_token()` to also be released by shutdown.
    pub fn wait_cancellable(
        &self,
        fence: Fence,
        timeout: Option<Duration>,
        cancel: &CancelToken,
    ) -> WaitStatus {
        self.fences.wait(fence, timeout, cancel)
    }

    /// A token that is cancelled when the device shuts down
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.child()
    }

    /// Release every waiter; the hardware is left as it is
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.fences.wake_all();
    }

    pub fn is_signaled(&self, fence: Fence) -> bool {
        self.fences.is_signaled(fence)
    }

    /// Service an interrupt; returns the bits that were handled
    ///
    /// Never fails. Anomalies are reported through the diagnostics queue.
    pub fn on_interrupt(&self, status: IrqStatus) -> IrqStatus {
        let serviced = status & IrqStatus::MASK;
        self.bus.write32(regs::RBBM_INT_CLEAR_CMD, serviced.bits());

        let _gate = match self.gate.try_read() {
            Ok(g) => g,
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
            Err(TryLockError::WouldBlock) => {
                dev_dbg!(self.name(), "irq {:#x} during reset, ignored", serviced.bits());
                return serviced;
            }
        };
        if !self.initialized.load(Ordering::Acquire) {
            return serviced;
        }

        if serviced.is_fatal() {
            self.diag.report(
                DiagnosticReport::new(
                    DiagKind::HardwareFault,
                    self.preempt.state(),
                    format!("fatal irq bits {:#x}", (serviced & IrqStatus::FATAL).bits()),
                )
                .irq(serviced)
                .regs(self.dump_regs())
                .rings(self.snapshots()),
            );
        }

        if serviced.contains(IrqStatus::CP_SW) {
            self.preempt.complete_switch();
        }
        if serviced.intersects(IrqStatus::CP_SW | IrqStatus::CP_CACHE_FLUSH_TS) {
            self.retire();
        }
        if !self.diag.needs_recovery() {
            self.preempt.trigger();
        }
        serviced
    }

    /// Move both rings' retired seqnos up to the shadow fence slots
    fn retire(&self) {
        for id in RingId::iter() {
            self.fences.retire_up_to(id, self.memptrs.fence(id));
        }
    }

    /// Report a context switch that is overdue; true while one is
    pub fn check_timeouts(&self) -> bool {
        self.preempt.check_timeout(Instant::now())
    }

    pub fn needs_recovery(&self) -> bool {
        self.diag.needs_recovery()
    }

    /// Take every queued diagnostic report, oldest first
    pub fn take_diagnostics(&self) -> Vec<DiagnosticReport> {
        self.diag.drain()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn preempt_state(&self) -> PreemptState {
        self.preempt.state()
    }

    pub fn preempt_counters(&self) -> PreemptCounters {
        self.preempt.counters()
    }

    pub fn recoveries(&self) -> u64 {
        self.recoveries.load(Ordering::Relaxed)
    }

    pub fn zap_loaded(&self) -> bool {
        self.init.zap_loaded()
    }

    pub fn retired(&self, ring: RingId) -> FenceSeqno {
        self.fences.retired(ring)
    }

    pub fn issued(&self, ring: RingId) -> FenceSeqno {
        self.fences.issued(ring)
    }

    /// Public fence slot of `ring`, as last written by the CP
    pub fn public_fence(&self, ring: RingId) -> FenceSeqno {
        self.memptrs.public_fence(ring)
    }

    pub fn inflight(&self, ring: RingId) -> usize {
        self.fences.inflight(ring)
    }

    pub fn ring(&self, id: RingId) -> &Ring {
        &self.rings[id.as_usize()]
    }

    pub fn snapshots(&self) -> Vec<RingSnapshot> {
        self.rings.iter().map(|r| r.snapshot()).collect()
    }

    fn dump_regs(&self) -> Vec<(&'static str, u32)> {
        regs::DUMP_REGS.iter().map(|&(name, reg)| (name, self.bus.read32(reg))).collect()
    }
}

impl Drop for GpuDevice {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for GpuDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuDevice")
            .field("name", &self.cfg.name)
            .field("initialized", &self.is_initialized())
            .field("state", &self.preempt.state())
            .finish()
    }
}
