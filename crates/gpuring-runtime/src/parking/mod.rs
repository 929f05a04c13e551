//! Parking for fence waiters
//!
//! Waiters sleep on a per-ring generation counter. The interrupt path
//! bumps the generation after retiring fences and wakes everyone; a waiter
//! that read the generation before checking its fence cannot miss the
//! wake, because the sleep only starts if the generation is unchanged.

use std::time::Duration;

/// Platform-specific sleep/wake primitive for fence waiters
pub trait FenceParking: Send + Sync {
    /// Current generation; read before checking the condition
    fn generation(&self) -> u32;

    /// Sleep until the generation moves past `seen` or `timeout` elapses
    ///
    /// Returns `true` if the generation changed. Callers re-check their
    /// condition regardless of the return value.
    fn park(&self, seen: u32, timeout: Option<Duration>) -> bool;

    /// Bump the generation and wake every parked waiter
    fn wake_all(&self);

    /// Number of currently parked waiters (hint, may be stale)
    fn parked_count(&self) -> usize;
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod futex_linux;
        pub use futex_linux::FutexParking as PlatformParking;
    } else {
        mod fallback;
        pub use fallback::FallbackParking as PlatformParking;
    }
}

/// Create a new platform-appropriate parking instance
pub fn new_parking() -> Box<dyn FenceParking> {
    Box::new(PlatformParking::new())
}
