//! Fallback parking using std::sync::Condvar
//!
//! Used on platforms without futex support.

use super::FenceParking;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

pub struct FallbackParking {
    /// Generation, guarded for the condvar
    mutex: Mutex<u32>,

    condvar: Condvar,

    parked: AtomicUsize,
}

impl FallbackParking {
    pub fn new() -> Self {
        Self {
            mutex: Mutex::new(0),
            condvar: Condvar::new(),
            parked: AtomicUsize::new(0),
        }
    }
}

impl Default for FallbackParking {
    fn default() -> Self {
        Self::new()
    }
}

impl FenceParking for FallbackParking {
    fn generation(&self) -> u32 {
        *self.mutex.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn park(&self, seen: u32, timeout: Option<Duration>) -> bool {
        self.parked.fetch_add(1, Ordering::SeqCst);
        let deadline = timeout.map(|t| Instant::now() + t);

        let mut guard = self.mutex.lock().unwrap_or_else(|e| e.into_inner());
        while *guard == seen {
            guard = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    self.condvar
                        .wait_timeout(guard, deadline - now)
                        .unwrap_or_else(|e| e.into_inner())
                        .0
                }
                None => self.condvar.wait(guard).unwrap_or_else(|e| e.into_inner()),
            };
        }
        let changed = *guard != seen;
        drop(guard);

        self.parked.fetch_sub(1, Ordering::SeqCst);
        changed
    }

    fn wake_all(&self) {
        {
            let mut guard = self.mutex.lock().unwrap_or_else(|e| e.into_inner());
            *guard = guard.wrapping_add(1);
        }
        self.condvar.notify_all();
    }

    fn parked_count(&self) -> usize {
        self.parked.load(Ordering::Relaxed)
    }
}
