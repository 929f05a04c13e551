//! Ring, context and fence identifiers

use core::fmt;

/// Identifier of one of the two hardware rings
///
/// Ring 0 is the default, low-priority ring. Ring 1 is high priority.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct RingId(u8);

impl RingId {
    /// Default / low-priority ring
    pub const LOW: RingId = RingId(0);

    /// High-priority ring
    pub const HIGH: RingId = RingId(1);

    /// Number of rings
    pub const COUNT: usize = 2;

    /// Validate a raw ring index coming from a submitter
    #[inline]
    pub const fn from_index(idx: u32) -> Option<RingId> {
        match idx {
            0 => Some(RingId::LOW),
            1 => Some(RingId::HIGH),
            _ => None,
        }
    }

    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0 as u32
    }

    /// The other ring
    #[inline]
    pub const fn other(self) -> RingId {
        RingId(self.0 ^ 1)
    }

    #[inline]
    pub const fn is_high(self) -> bool {
        self.0 == 1
    }

    /// Preemption level programmed into the context-switch control register
    #[inline]
    pub const fn preempt_level(self) -> u32 {
        self.0 as u32
    }

    /// Both rings, low priority first
    pub fn iter() -> impl Iterator<Item = RingId> {
        [RingId::LOW, RingId::HIGH].into_iter()
    }
}

impl fmt::Debug for RingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RingId({})", self.0)
    }
}

impl fmt::Display for RingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rb{}", self.0)
    }
}

/// Submitter context handle (one address space)
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ContextId(u32);

impl ContextId {
    /// Kernel context; used for driver-internal packets
    pub const KERNEL: ContextId = ContextId(0);

    #[inline]
    pub const fn new(id: u32) -> Self {
        ContextId(id)
    }

    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContextId({})", self.0)
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx{}", self.0)
    }
}

/// A per-ring 32-bit completion timestamp
///
/// Values wrap and have no `Ord`; compare with `delta` or `reached_by`,
/// where a seqno just after the wrap counts as newer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct FenceSeqno(u32);

impl FenceSeqno {
    pub const ZERO: FenceSeqno = FenceSeqno(0);

    #[inline]
    pub const fn new(raw: u32) -> Self {
        FenceSeqno(raw)
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// The seqno that follows this one
    #[inline]
    pub const fn next(self) -> FenceSeqno {
        FenceSeqno(self.0.wrapping_add(1))
    }

    /// Signed distance `self - other`
    #[inline]
    pub const fn delta(self, other: FenceSeqno) -> i32 {
        self.0.wrapping_sub(other.0) as i32
    }

    /// True if `self` has been reached once the counter reads `current`
    #[inline]
    pub const fn reached_by(self, current: FenceSeqno) -> bool {
        current.delta(self) >= 0
    }
}

impl fmt::Debug for FenceSeqno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl fmt::Display for FenceSeqno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle returned by `submit`; names a seqno on a specific ring
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Fence {
    pub ring: RingId,
    pub seqno: FenceSeqno,
}

impl Fence {
    #[inline]
    pub const fn new(ring: RingId, seqno: FenceSeqno) -> Self {
        Fence { ring, seqno }
    }
}

impl fmt::Display for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ring, self.seqno)
    }
}
