//! Linux futex-based waiter parking
//!
//! The futex word is the generation counter itself. `FUTEX_WAIT` only
//! sleeps while the word still equals the generation the waiter saw, so a
//! wake between the check and the syscall turns into an immediate return.

use super::FenceParking;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

pub struct FutexParking {
    /// Futex word: generation, bumped on every wake
    futex: AtomicU32,

    /// Count of parked waiters
    parked: AtomicUsize,
}

impl FutexParking {
    pub fn new() -> Self {
        Self {
            futex: AtomicU32::new(0),
            parked: AtomicUsize::new(0),
        }
    }
}

impl Default for FutexParking {
    fn default() -> Self {
        Self::new()
    }
}

impl FenceParking for FutexParking {
    #[inline]
    fn generation(&self) -> u32 {
        self.futex.load(Ordering::Acquire)
    }

    fn park(&self, seen: u32, timeout: Option<Duration>) -> bool {
        self.parked.fetch_add(1, Ordering::SeqCst);

        if self.futex.load(Ordering::Acquire) != seen {
            self.parked.fetch_sub(1, Ordering::SeqCst);
            return true;
        }

        let timespec = timeout.map(|d| libc::timespec {
            tv_sec: d.as_secs() as libc::time_t,
            tv_nsec: d.subsec_nanos() as libc::c_long,
        });
        let timespec_ptr = match &timespec {
            Some(ts) => ts as *const libc::timespec,
            None => std::ptr::null(),
        };

        // FUTEX_WAIT: sleep while futex == seen
        // Safety: the futex word outlives the call
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                self.futex.as_ptr(),
                libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                seen,
                timespec_ptr,
                std::ptr::null::<u32>(),
                0u32,
            );
        }

        self.parked.fetch_sub(1, Ordering::SeqCst);

        // ETIMEDOUT, EAGAIN and EINTR all land here; the generation is
        // the only truth
        self.futex.load(Ordering::Acquire) != seen
    }

    fn wake_all(&self) {
        self.futex.fetch_add(1, Ordering::AcqRel);

        if self.parked.load(Ordering::SeqCst) == 0 {
            return;
        }

        // Safety: the futex word outlives the call
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                self.futex.as_ptr(),
                libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                i32::MAX,
                std::ptr::null::<libc::timespec>(),
                std::ptr::null::<u32>(),
                0u32,
            );
        }
    }

    fn parked_count(&self) -> usize {
        self.parked.load(Ordering::Relaxed)
    }
}
