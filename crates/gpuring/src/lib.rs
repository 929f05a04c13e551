//! # gpuring - two-ring GPU command processor controller
//!
//! A user-space model of the command-ring half of a GPU driver: two
//! hardware rings, preemption between them at yield packets, fence
//! completion tracking and full-reset hang recovery.
//!
//! ## Quick Start
//!
//! ```ignore
//! use gpuring::prelude::*;
//!
//! let dev = GpuDevice::new(collaborators, DeviceConfig::from_env())?;
//! dev.init()?;
//!
//! let fence = dev.submit(ctx, 1, &[CmdBuffer::new(iova, 64)])?;
//! // deliver interrupts with dev.on_interrupt(status) ...
//! assert_eq!(dev.wait(fence, None), WaitStatus::Signaled);
//! ```
//!
//! ## Architecture
//!
//! ```text
//!   submitters                            interrupt line
//!       |                                        |
//!       v                                        v
//!  +----------------+   flush/trigger   +-----------------------+
//!  | SubmissionQueue| ----------------> | PreemptionController  |
//!  |  (per ring)    |                   |  IDLE / SWITCHING     |
//!  +----------------+                   +-----------------------+
//!       |  append                              |  CP_RB_WPTR,
//!       v                                      v  CP_CONTEXT_SWITCH_*
//!  +---------------+  +---------------+   +-----------------+
//!  | Ring 0 (low)  |  | Ring 1 (high) |   |  RegisterBus    |
//!  +---------------+  +---------------+   +-----------------+
//!       \                 /
//!        memptrs fence slots  ---->  FenceTracker  ---->  wait()
//! ```

// Re-export core types
pub use gpuring_core::{
    CancelToken, CmdBuffer, CmdKind, ConfigError, ContextId, DmaAllocator, DmaBuffer, Fence,
    FenceSeqno, GpuError, GpuResult, GpuVariant, IrqStatus, MemoryError, PageTableBinding,
    PageTableProvider, PreemptState, ProtectRange, RegisterBus, RingId, WaitStatus,
};

// Re-export logging macros and controls
pub use gpuring_core::{dev_dbg, dev_err, dev_info, dev_trace, dev_warn};
pub use gpuring_core::log::{set_log_level, LogLevel};

// Re-export env utilities
pub use gpuring_core::env::{env_get, env_get_bool, env_get_str, env_get_u64};

// Re-export runtime types
pub use gpuring_runtime::{
    variant_for_chip, Collaborators, DeviceConfig, DeviceMemory, DiagKind, DiagnosticReport,
    Firmware, GpuDevice, PreemptCounters, RingSnapshot, A730, A740,
};

#[cfg(feature = "sim")]
pub use gpuring_runtime::sim;

pub use gpuring_core::packet;

/// Everything a typical embedder needs
pub mod prelude {
    pub use crate::{
        CancelToken, CmdBuffer, CmdKind, Collaborators, ContextId, DeviceConfig, Fence, Firmware,
        GpuDevice, GpuError, GpuResult, IrqStatus, PageTableBinding, RingId, WaitStatus,
    };
}
