//! # gpuring-core
//!
//! Core types and traits for the gpuring command-ring controller.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! All platform-specific implementations are in `gpuring-runtime`.
//!
//! ## Modules
//!
//! - `id` - Ring, context and fence identifiers
//! - `state` - Preemption state and wait status enums
//! - `packet` - Type-7 command-processor packet codec
//! - `record` - Preemption record / SMMU info / memptrs layouts
//! - `irq` - Interrupt status and context-switch control bits
//! - `cancel` - Cancellation token for fence waits
//! - `error` - Error types
//! - `spinlock` - Lock-class aware spinlock used for the preempt and ring locks
//! - `traits` - Collaborator traits (register bus, allocator, page tables, variant)
//! - `log` - Device-prefixed leveled logging macros
//! - `env` - Environment variable helpers

#![allow(dead_code)]

pub mod id;
pub mod state;
pub mod packet;
pub mod record;
pub mod irq;
pub mod cancel;
pub mod error;
pub mod spinlock;
pub mod traits;
pub mod log;
pub mod env;

// Re-exports for convenience
pub use id::{ContextId, Fence, FenceSeqno, RingId};
pub use state::{PreemptState, WaitStatus};
pub use packet::{Opcode, PacketHeader, PacketStream};
pub use irq::{IrqStatus, SwitchCntl};
pub use cancel::CancelToken;
pub use error::{ConfigError, GpuError, GpuResult, MemoryError};
pub use spinlock::{holds, LockClass, OrderedSpinLock};
pub use traits::{
    CmdBuffer, CmdKind, DmaAllocator, DmaBuffer, GpuVariant, PageTableBinding,
    PageTableProvider, ProtectRange, RegisterBus,
};

/// Layout and protocol constants
pub mod constants {
    /// Default ring size in dwords (32 KiB)
    pub const DEFAULT_RING_DWORDS: u32 = 8192;

    /// GPU page size used for every DMA allocation
    pub const GPU_PAGE_SIZE: usize = 4096;

    /// Magic stamped into every preemption record
    pub const PREEMPT_RECORD_MAGIC: u32 = 0xAE39_9D6E;

    /// Magic stamped into every SMMU context info block
    pub const SMMU_INFO_MAGIC: u32 = 0x2413_50D5;

    /// Size of the preemption record plus the hardware save area behind it
    pub const PREEMPT_RECORD_SIZE: usize = 2860 * 1024;

    /// Size reserved for the non-privileged restore area
    pub const PREEMPT_USER_RECORD_SIZE: usize = 192 * 1024;
}
