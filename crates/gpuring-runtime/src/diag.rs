//! Diagnostics channel
//!
//! Anomalies found in interrupt context cannot be returned to anyone, so
//! they are logged, queued here as reports, and, when the device cannot
//! continue, turned into a recovery request. The queue is bounded: when it
//! is full the oldest report is dropped.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use crossbeam_queue::ArrayQueue;

use gpuring_core::{dev_err, dev_warn, IrqStatus, PreemptState, RingId};

use crate::ring::RingSnapshot;

/// What went wrong
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagKind {
    /// Interrupt or register state contradicts the preemption state
    ProtocolDesync,
    /// A context switch did not complete in time
    PreemptTimeout,
    /// Fatal interrupt bits (hang, bus or protection fault)
    HardwareFault,
    /// State captured before a reset
    RecoveryDump,
    /// Hardware bring-up failed
    InitFailure,
}

impl DiagKind {
    /// Whether this kind of report requires a reset
    pub fn needs_recovery(&self) -> bool {
        matches!(
            self,
            DiagKind::ProtocolDesync | DiagKind::PreemptTimeout | DiagKind::HardwareFault
        )
    }
}

/// One anomaly, with enough state to debug it after the fact
#[derive(Debug, Clone)]
pub struct DiagnosticReport {
    pub kind: DiagKind,
    pub ring: Option<RingId>,
    pub state: PreemptState,
    pub irq: IrqStatus,
    pub detail: String,
    pub regs: Vec<(&'static str, u32)>,
    pub rings: Vec<RingSnapshot>,
    pub at: Instant,
}

impl DiagnosticReport {
    pub fn new(kind: DiagKind, state: PreemptState, detail: impl Into<String>) -> Self {
        Self {
            kind,
            ring: None,
            state,
            irq: IrqStatus::empty(),
            detail: detail.into(),
            regs: Vec::new(),
            rings: Vec::new(),
            at: Instant::now(),
        }
    }

    pub fn ring(mut self, ring: RingId) -> Self {
        self.ring = Some(ring);
        self
    }

    pub fn irq(mut self, irq: IrqStatus) -> Self {
        self.irq = irq;
        self
    }

    pub fn regs(mut self, regs: Vec<(&'static str, u32)>) -> Self {
        self.regs = regs;
        self
    }

    pub fn rings(mut self, rings: Vec<RingSnapshot>) -> Self {
        self.rings = rings;
        self
    }
}

pub struct Diagnostics {
    dev: String,
    queue: ArrayQueue<DiagnosticReport>,
    needs_recovery: AtomicBool,
    reported: AtomicU64,
    dropped: AtomicU64,
}

impl Diagnostics {
    pub fn new(dev: &str, capacity: usize) -> Self {
        Self {
            dev: dev.to_string(),
            queue: ArrayQueue::new(capacity.max(1)),
            needs_recovery: AtomicBool::new(false),
            reported: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Log and queue a report; flags recovery for fatal kinds
    pub fn report(&self, report: DiagnosticReport) {
        if report.kind.needs_recovery() {
            dev_err!(
                &self.dev,
                "{:?} in {}: {} (irq {:#x})",
                report.kind,
                report.state,
                report.detail,
                report.irq.bits()
            );
            self.needs_recovery.store(true, Ordering::Release);
        } else {
            dev_warn!(&self.dev, "{:?} in {}: {}", report.kind, report.state, report.detail);
        }
        self.reported.fetch_add(1, Ordering::Relaxed);
        if self.queue.force_push(report).is_some() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn needs_recovery(&self) -> bool {
        self.needs_recovery.load(Ordering::Acquire)
    }

    pub(crate) fn clear_recovery(&self) {
        self.needs_recovery.store(false, Ordering::Release);
    }

    /// Take every queued report, oldest first
    pub fn drain(&self) -> Vec<DiagnosticReport> {
        let mut out = Vec::with_capacity(self.queue.len());
        while let Some(r) = self.queue.pop() {
            out.push(r);
        }
        out
    }

    pub fn reported(&self) -> u64 {
        self.reported.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desync(detail: &str) -> DiagnosticReport {
        DiagnosticReport::new(DiagKind::ProtocolDesync, PreemptState::INITIAL, detail)
    }

    #[test]
    fn test_desync_requests_recovery() {
        let diag = Diagnostics::new("test", 4);
        diag.report(desync("stray switch irq").irq(IrqStatus::CP_SW));
        assert!(diag.needs_recovery());

        let reports = diag.drain();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].irq, IrqStatus::CP_SW);
        assert!(diag.drain().is_empty());
    }

    #[test]
    fn test_fault_requests_recovery() {
        let diag = Diagnostics::new("test", 4);
        let state = PreemptState::Switching { from: RingId::LOW, to: RingId::HIGH };
        diag.report(DiagnosticReport::new(DiagKind::PreemptTimeout, state, "no switch").ring(RingId::HIGH));
        assert!(diag.needs_recovery());
        diag.clear_recovery();
        assert!(!diag.needs_recovery());
    }

    #[test]
    fn test_dump_does_not_request_recovery() {
        let diag = Diagnostics::new("test", 4);
        diag.report(DiagnosticReport::new(DiagKind::RecoveryDump, PreemptState::INITIAL, "dump"));
        assert!(!diag.needs_recovery());
    }

    #[test]
    fn test_oldest_report_dropped_when_full() {
        let diag = Diagnostics::new("test", 2);
        diag.report(desync("a"));
        diag.report(desync("b"));
        diag.report(desync("c"));

        assert_eq!(diag.reported(), 3);
        assert_eq!(diag.dropped(), 1);
        let details: Vec<_> = diag.drain().into_iter().map(|r| r.detail).collect();
        assert_eq!(details, ["b", "c"]);
    }
}
