//! Error types for the ring controller

use core::fmt;
use crate::id::{ContextId, RingId};

/// Result type for controller operations
pub type GpuResult<T> = Result<T, GpuError>;

/// Errors returned synchronously by the controller
///
/// Anomalies detected in interrupt context are never returned as errors;
/// they are reported through the diagnostics channel instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GpuError {
    /// Ring index outside `0..2`
    InvalidRing(u32),

    /// `submit` called with no command buffers
    EmptySubmission,

    /// More command buffers than one submission may carry
    TooManyCommands { count: usize, budget: usize },

    /// A command buffer is empty or not mapped for the context
    UnmappedBuffer { ctx: ContextId, iova: u64, size_dwords: u32 },

    /// The context has no page-table binding
    NoPageTable(ContextId),

    /// Not enough free ring space for the encoded submission
    RingFull { ring: RingId, needed: u32, free: u32 },

    /// Hardware did not go idle within the bounded poll
    IdleTimeout { what: &'static str, retries: u32 },

    /// Zap shader load failed with the given status
    ZapShaderLoad(i32),

    /// Microcode image is missing or malformed
    BadFirmware(&'static str),

    /// Device not brought up yet
    NotInitialized,

    /// Device is marked for recovery; new work is refused
    DeviceLost,

    /// Memory allocation/mapping failed
    MemoryError(MemoryError),

    /// Rejected configuration
    ConfigError(ConfigError),
}

impl GpuError {
    /// Errors a hang-recovery loop may retry
    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(self, GpuError::IdleTimeout { .. } | GpuError::ZapShaderLoad(_))
    }
}

impl fmt::Display for GpuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpuError::InvalidRing(idx) => write!(f, "invalid ring index {}", idx),
            GpuError::EmptySubmission => write!(f, "submission has no command buffers"),
            GpuError::TooManyCommands { count, budget } => {
                write!(f, "{} command buffers exceed per-submit budget of {}", count, budget)
            }
            GpuError::UnmappedBuffer { ctx, iova, size_dwords } => write!(
                f,
                "command buffer {:#x}+{} dwords not mapped for {}",
                iova, size_dwords, ctx
            ),
            GpuError::NoPageTable(ctx) => write!(f, "{} has no page-table binding", ctx),
            GpuError::RingFull { ring, needed, free } => {
                write!(f, "{} full: need {} dwords, {} free", ring, needed, free)
            }
            GpuError::IdleTimeout { what, retries } => {
                write!(f, "timed out waiting for {} after {} polls", what, retries)
            }
            GpuError::ZapShaderLoad(status) => write!(f, "zap shader load failed: {}", status),
            GpuError::BadFirmware(why) => write!(f, "bad firmware: {}", why),
            GpuError::NotInitialized => write!(f, "device not initialized"),
            GpuError::DeviceLost => write!(f, "device lost, recovery pending"),
            GpuError::MemoryError(e) => write!(f, "memory error: {}", e),
            GpuError::ConfigError(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for GpuError {}

/// DMA memory errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// mmap failed
    AllocationFailed,

    /// Zero-length request
    ZeroLength,

    /// Device address space exhausted
    IovaExhausted,
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryError::AllocationFailed => write!(f, "DMA allocation failed"),
            MemoryError::ZeroLength => write!(f, "zero-length DMA allocation"),
            MemoryError::IovaExhausted => write!(f, "device address space exhausted"),
        }
    }
}

impl From<MemoryError> for GpuError {
    fn from(e: MemoryError) -> Self {
        GpuError::MemoryError(e)
    }
}

/// Configuration error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidValue(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidValue(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for GpuError {
    fn from(e: ConfigError) -> Self {
        GpuError::ConfigError(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = GpuError::TooManyCommands { count: 9, budget: 8 };
        assert_eq!(format!("{}", e), "9 command buffers exceed per-submit budget of 8");

        let e = GpuError::MemoryError(MemoryError::AllocationFailed);
        assert_eq!(format!("{}", e), "memory error: DMA allocation failed");

        let e = GpuError::RingFull { ring: RingId::HIGH, needed: 40, free: 12 };
        assert_eq!(format!("{}", e), "rb1 full: need 40 dwords, 12 free");
    }

    #[test]
    fn test_error_conversion() {
        let err: GpuError = ConfigError::InvalidValue("ring_dwords").into();
        assert!(matches!(err, GpuError::ConfigError(ConfigError::InvalidValue(_))));
        assert!(!err.is_transient());
        assert!(GpuError::IdleTimeout { what: "cp", retries: 3 }.is_transient());
    }
}
