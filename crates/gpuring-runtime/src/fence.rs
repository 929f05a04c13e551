//! Per-ring fence timelines
//!
//! Each ring hands out seqnos `1, 2, 3, ...` (wrapping) and the CP writes
//! the seqno of each finished submission to the ring's shadow fence. The
//! interrupt path feeds that value to `retire_up_to`, which only ever moves
//! forward, so stale or repeated reads are harmless.
//!
//! A device reset declares every issued-but-unretired seqno lost; waiters
//! on those fences get `WaitStatus::Lost` instead of hanging.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use gpuring_core::{
    dev_dbg, CancelToken, CmdBuffer, ContextId, Fence, FenceSeqno, PageTableBinding, RingId,
    WaitStatus,
};

use crate::parking::{new_parking, FenceParking};
use crate::ring::RingSpan;

/// One accepted submission, kept until its fence retires
#[derive(Debug, Clone)]
pub struct SubmissionRecord {
    pub fence: Fence,
    pub ctx: ContextId,
    pub binding: PageTableBinding,
    pub cmds: Vec<CmdBuffer>,
    pub span: RingSpan,
    pub queued_at: Instant,
}

struct Timeline {
    retired: AtomicU32,
    issued: AtomicU32,
    /// Inclusive `(first, last)` seqno ranges discarded by resets
    lost: Mutex<VecDeque<(FenceSeqno, FenceSeqno)>>,
    inflight: Mutex<VecDeque<SubmissionRecord>>,
    parking: Box<dyn FenceParking>,
}

impl Timeline {
    fn new() -> Self {
        Self {
            retired: AtomicU32::new(0),
            issued: AtomicU32::new(0),
            lost: Mutex::new(VecDeque::new()),
            inflight: Mutex::new(VecDeque::new()),
            parking: new_parking(),
        }
    }

    fn lost(&self) -> MutexGuard<'_, VecDeque<(FenceSeqno, FenceSeqno)>> {
        self.lost.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn inflight(&self) -> MutexGuard<'_, VecDeque<SubmissionRecord>> {
        self.inflight.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record `first..=last` as lost, extending the newest range when it
    /// ends right before `first`
    ///
    /// Ranges that fell more than half the seqno space behind `last` can
    /// no longer be told apart from future seqnos and are dropped.
    fn push_lost(&self, first: FenceSeqno, last: FenceSeqno) {
        let mut lost = self.lost();
        match lost.back_mut() {
            Some(back) if back.1.next() == first => back.1 = last,
            _ => lost.push_back((first, last)),
        }
        while lost.front().is_some_and(|&(oldest, _)| last.delta(oldest) < 0) {
            lost.pop_front();
        }
    }

    fn is_lost(&self, seqno: FenceSeqno) -> bool {
        self.lost()
            .iter()
            .any(|&(first, last)| seqno.delta(first) >= 0 && last.delta(seqno) >= 0)
    }
}

pub struct FenceTracker {
    dev: String,
    timelines: [Timeline; 2],
    wait_slice: Duration,
}

impl FenceTracker {
    pub fn new(dev: &str, wait_slice: Duration) -> Self {
        Self {
            dev: dev.to_string(),
            timelines: [Timeline::new(), Timeline::new()],
            wait_slice,
        }
    }

    #[inline]
    fn timeline(&self, ring: RingId) -> &Timeline {
        &self.timelines[ring.as_usize()]
    }

    /// Highest seqno handed out on `ring`
    pub fn issued(&self, ring: RingId) -> FenceSeqno {
        FenceSeqno::new(self.timeline(ring).issued.load(Ordering::Acquire))
    }

    /// Highest seqno retired (or declared lost) on `ring`
    pub fn retired(&self, ring: RingId) -> FenceSeqno {
        FenceSeqno::new(self.timeline(ring).retired.load(Ordering::Acquire))
    }

    /// Seqno the next submission on `ring` will carry
    ///
    /// Only meaningful while holding that ring's submit lock.
    pub(crate) fn next_seqno(&self, ring: RingId) -> FenceSeqno {
        self.issued(ring).next()
    }

    /// Account for an accepted submission
    pub(crate) fn commit(&self, record: SubmissionRecord) {
        let t = self.timeline(record.fence.ring);
        debug_assert_eq!(record.fence.seqno, self.issued(record.fence.ring).next());
        t.issued.store(record.fence.seqno.raw(), Ordering::Release);
        t.inflight().push_back(record);
    }

    /// Advance `ring`'s retired seqno to `value` if that moves it forward
    ///
    /// Returns true if anything retired. Values beyond the last issued
    /// seqno are clamped.
    pub fn retire_up_to(&self, ring: RingId, value: FenceSeqno) -> bool {
        let t = self.timeline(ring);
        let issued = self.issued(ring);
        let value = if value.delta(issued) > 0 {
            dev_dbg!(&self.dev, "{}: fence {} beyond issued {}", ring, value, issued);
            issued
        } else {
            value
        };

        let mut cur = t.retired.load(Ordering::Acquire);
        loop {
            if value.delta(FenceSeqno::new(cur)) <= 0 {
                return false;
            }
            match t.retired.compare_exchange_weak(cur, value.raw(), Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }

        {
            let mut inflight = t.inflight();
            while inflight.front().is_some_and(|r| r.fence.seqno.reached_by(value)) {
                inflight.pop_front();
            }
        }
        t.parking.wake_all();
        true
    }

    /// True once `fence` retired normally
    pub fn is_signaled(&self, fence: Fence) -> bool {
        fence.seqno.reached_by(self.retired(fence.ring)) && !self.timeline(fence.ring).is_lost(fence.seqno)
    }

    pub fn is_lost(&self, fence: Fence) -> bool {
        self.timeline(fence.ring).is_lost(fence.seqno)
    }

    /// Block until `fence` retires, is lost, `cancel` fires or `timeout`
    /// elapses (`None` waits forever)
    pub fn wait(&self, fence: Fence, timeout: Option<Duration>, cancel: &CancelToken) -> WaitStatus {
        let t = self.timeline(fence.ring);
        // a deadline past what `Instant` can represent means no deadline
        let deadline = timeout.and_then(|d| Instant::now().checked_add(d));

        loop {
            let gen = t.parking.generation();

            // lost ranges are published before `retired` moves over them
            if fence.seqno.reached_by(self.retired(fence.ring)) {
                return if t.is_lost(fence.seqno) { WaitStatus::Lost } else { WaitStatus::Signaled };
            }
            if cancel.is_cancelled() {
                return WaitStatus::Cancelled;
            }

            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return WaitStatus::TimedOut;
                    }
                    (deadline - now).min(self.wait_slice)
                }
                None => self.wait_slice,
            };
            t.parking.park(gen, Some(slice));
        }
    }

    /// Declare every unretired seqno on `ring` lost and release waiters
    ///
    /// Returns the submissions that will never complete.
    pub fn mark_lost(&self, ring: RingId) -> Vec<SubmissionRecord> {
        let t = self.timeline(ring);
        let issued = self.issued(ring);
        let retired = self.retired(ring);

        if issued != retired {
            t.push_lost(retired.next(), issued);
        }
        t.retired.store(issued.raw(), Ordering::Release);

        let dropped: Vec<_> = t.inflight().drain(..).collect();
        t.parking.wake_all();
        dropped
    }

    /// Wake every waiter on both rings so they re-check cancellation
    pub fn wake_all(&self) {
        for t in &self.timelines {
            t.parking.wake_all();
        }
    }

    pub fn inflight(&self, ring: RingId) -> usize {
        self.timeline(ring).inflight().len()
    }

    /// Oldest outstanding submission on `ring`
    pub fn oldest_inflight(&self, ring: RingId) -> Option<(Fence, Instant)> {
        self.timeline(ring).inflight().front().map(|r| (r.fence, r.queued_at))
    }

    #[cfg(test)]
    pub(crate) fn seed(&self, ring: RingId, seqno: FenceSeqno) {
        let t = self.timeline(ring);
        t.issued.store(seqno.raw(), Ordering::Release);
        t.retired.store(seqno.raw(), Ordering::Release);
    }
}
