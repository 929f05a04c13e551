//! # gpuring-runtime
//!
//! Ring controller runtime for the gpuring workspace.
//!
//! This crate provides:
//! - Device configuration (defaults + `GPR_*` environment overrides)
//! - DMA memory (anonymous mmap on unix, heap elsewhere)
//! - Fence parking (futex on Linux, condvar elsewhere)
//! - The two command rings and the preemption state machine
//! - Submission encoding, fence tracking and hang recovery
//! - Hardware init and the built-in GPU variants
//! - A simulated command processor (`sim` feature)

#![allow(dead_code)]

pub mod config;
pub mod memory;
pub mod parking;
pub mod regs;
pub mod ring;
pub mod diag;
pub mod preempt;
pub mod fence;
pub mod submit;
pub mod init;
pub mod variant;
pub mod device;

#[cfg(any(test, feature = "sim"))]
pub mod sim;

// Re-exports
pub use config::DeviceConfig;
pub use memory::DeviceMemory;
pub use parking::{new_parking, FenceParking};
pub use ring::{Ring, RingCursor, RingSnapshot};
pub use diag::{DiagKind, DiagnosticReport, Diagnostics};
pub use preempt::{PreemptCounters, PreemptOptions, PreemptionController, SwitchOutcome};
pub use fence::{FenceTracker, SubmissionRecord};
pub use submit::{encode_submission, SubmissionQueue};
pub use init::{Firmware, HardwareInitSequencer};
pub use variant::{variant_for_chip, A730, A740};
pub use device::{Collaborators, GpuDevice};
