//! Preemption state and fence wait status

use core::fmt;
use crate::id::RingId;

/// State of the two-ring preemption state machine
///
/// Only one switch may be in flight. The value lives behind the global
/// preemption lock; it is never read or written without it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreemptState {
    /// `active` ring owns the command processor, nothing in flight
    Idle { active: RingId },

    /// A context switch from `from` to `to` was requested and the
    /// switch-complete interrupt has not arrived yet
    Switching { from: RingId, to: RingId },
}

impl PreemptState {
    /// State after (re)initialisation
    pub const INITIAL: PreemptState = PreemptState::Idle { active: RingId::LOW };

    #[inline]
    pub const fn is_switching(&self) -> bool {
        matches!(self, PreemptState::Switching { .. })
    }

    /// Ring the command processor is executing (or leaving, while switching)
    #[inline]
    pub const fn current(&self) -> RingId {
        match self {
            PreemptState::Idle { active } => *active,
            PreemptState::Switching { from, .. } => *from,
        }
    }

    /// Compact encoding for diagnostics: bit 7 = switching, bits 0..1 = rings
    pub const fn encode(&self) -> u8 {
        match self {
            PreemptState::Idle { active } => active.as_u32() as u8,
            PreemptState::Switching { from, to } => {
                0x80 | ((to.as_u32() as u8) << 1) | from.as_u32() as u8
            }
        }
    }
}

impl Default for PreemptState {
    fn default() -> Self {
        PreemptState::INITIAL
    }
}

impl fmt::Display for PreemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PreemptState::Idle { active } => write!(f, "IDLE({})", active.as_u32()),
            PreemptState::Switching { from, to } => {
                write!(f, "SWITCHING({},{})", from.as_u32(), to.as_u32())
            }
        }
    }
}

/// Result of waiting on a fence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WaitStatus {
    /// The fence retired
    Signaled = 0,

    /// Timeout elapsed before the fence retired
    TimedOut = 1,

    /// The caller's cancel token fired; the GPU work is unaffected
    Cancelled = 2,

    /// The work was discarded by a device reset and will never retire
    Lost = 3,
}

impl WaitStatus {
    #[inline]
    pub const fn is_signaled(&self) -> bool {
        matches!(self, WaitStatus::Signaled)
    }
}

impl fmt::Display for WaitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitStatus::Signaled => write!(f, "signaled"),
            WaitStatus::TimedOut => write!(f, "timed out"),
            WaitStatus::Cancelled => write!(f, "cancelled"),
            WaitStatus::Lost => write!(f, "lost"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_current() {
        let idle = PreemptState::Idle { active: RingId::HIGH };
        assert!(!idle.is_switching());
        assert_eq!(idle.current(), RingId::HIGH);

        let sw = PreemptState::Switching { from: RingId::LOW, to: RingId::HIGH };
        assert!(sw.is_switching());
        assert_eq!(sw.current(), RingId::LOW);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(PreemptState::INITIAL.to_string(), "IDLE(0)");
        let sw = PreemptState::Switching { from: RingId::LOW, to: RingId::HIGH };
        assert_eq!(sw.to_string(), "SWITCHING(0,1)");
        assert_eq!(sw.encode(), 0x82);
    }
}
