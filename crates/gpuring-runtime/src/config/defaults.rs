//! Library defaults for `DeviceConfig`

use gpuring_core::constants::{DEFAULT_RING_DWORDS, PREEMPT_RECORD_SIZE, PREEMPT_USER_RECORD_SIZE};

/// Device name used as the log prefix
pub const NAME: &str = "gpu0";

/// Ring size in dwords (power of two)
pub const RING_DWORDS: u32 = DEFAULT_RING_DWORDS;

/// Command buffers a single submission may carry
pub const MAX_CMDS_PER_SUBMIT: usize = 32;

/// Polls of the idle status before giving up
pub const IDLE_RETRIES: u32 = 2000;

/// Delay between idle polls
pub const IDLE_POLL_US: u64 = 10;

/// Hardware init attempts during recovery
pub const INIT_RETRIES: u32 = 3;

/// Delay between recovery init attempts
pub const RECOVERY_BACKOFF_MS: u64 = 5;

/// A context switch still pending after this long is reported as a hang
pub const PREEMPT_TIMEOUT_MS: u64 = 10_000;

/// Upper bound on a single park inside `wait`
pub const WAIT_SLICE_MS: u64 = 5;

/// Preemption record (save area included), per ring
pub const PREEMPT_RECORD_BYTES: usize = PREEMPT_RECORD_SIZE;

/// Non-privileged restore area, per ring
pub const USER_RECORD_BYTES: usize = PREEMPT_USER_RECORD_SIZE;

pub const USES_GMEM: bool = true;

pub const SKIP_SAVE_RESTORE: bool = false;

/// Request the switch back to ring 0 right after ring 1 settles
pub const REARM_LOW_PRIORITY: bool = true;

/// Reports held before the oldest is overwritten
pub const DIAG_CAPACITY: usize = 64;

/// First device address handed out by the built-in allocator
pub const IOVA_BASE: u64 = 0x1_0000_0000;
