//! Spinlock with a lock class, for the preempt and per-ring locks
//!
//! The interrupt path and submitters share two kinds of lock: the single
//! global preemption lock and one cursor lock per ring. The only legal
//! nesting is `Preempt` then `Ring`; in debug builds (or with the
//! `lock-order-checks` feature) every acquisition checks the classes the
//! current thread already holds and panics on an inversion.
//!
//! Critical sections are a handful of register and memory writes, so the
//! lock spins instead of sleeping, as it would with interrupts disabled.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// Rank of a lock; a thread may only acquire strictly increasing ranks
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LockClass {
    /// Global preemption state
    Preempt = 0,
    /// One ring's cursor
    Ring = 1,
}

impl LockClass {
    #[inline]
    const fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

#[cfg(any(debug_assertions, feature = "lock-order-checks"))]
mod order {
    use super::LockClass;
    use std::cell::Cell;

    thread_local! {
        static HELD: Cell<u8> = const { Cell::new(0) };
    }

    pub(super) fn acquire(class: LockClass) {
        HELD.with(|held| {
            let mask = held.get();
            // Any held class with rank >= ours is an inversion or a
            // same-class nesting.
            let forbidden = !(class.bit() - 1);
            if mask & forbidden != 0 {
                panic!(
                    "lock order violation: acquiring {:?} while holding mask {:#04b}",
                    class, mask
                );
            }
            held.set(mask | class.bit());
        });
    }

    pub(super) fn release(class: LockClass) {
        HELD.with(|held| held.set(held.get() & !class.bit()));
    }

    pub(super) fn held(class: LockClass) -> bool {
        HELD.with(|held| held.get() & class.bit() != 0)
    }
}

#[cfg(not(any(debug_assertions, feature = "lock-order-checks")))]
mod order {
    use super::LockClass;

    #[inline(always)]
    pub(super) fn acquire(_class: LockClass) {}

    #[inline(always)]
    pub(super) fn release(_class: LockClass) {}

    #[inline(always)]
    pub(super) fn held(_class: LockClass) -> bool {
        true
    }
}

/// A spinlock tagged with a `LockClass`
pub struct OrderedSpinLock<T> {
    class: LockClass,
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

// Safety: OrderedSpinLock provides exclusive access to T
unsafe impl<T: Send> Send for OrderedSpinLock<T> {}
unsafe impl<T: Send> Sync for OrderedSpinLock<T> {}

impl<T> OrderedSpinLock<T> {
    #[inline]
    pub const fn new(class: LockClass, value: T) -> Self {
        OrderedSpinLock {
            class,
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquire the lock, spinning until it's available
    pub fn lock(&self) -> OrderedGuard<'_, T> {
        order::acquire(self.class);
        loop {
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return OrderedGuard { lock: self };
            }

            let mut spins = 0u32;
            while self.locked.load(Ordering::Relaxed) {
                spins = spins.wrapping_add(1);
                for _ in 0..spins.min(64) {
                    core::hint::spin_loop();
                }
                if spins > 4096 {
                    std::thread::yield_now();
                }
            }
        }
    }
}

/// True if the current thread holds a lock of `class`
///
/// Always true when order checks are compiled out; only meaningful in
/// `debug_assert!`.
#[inline]
pub fn holds(class: LockClass) -> bool {
    order::held(class)
}

/// Guard that releases the lock when dropped
pub struct OrderedGuard<'a, T> {
    lock: &'a OrderedSpinLock<T>,
}

impl<'a, T> Deref for OrderedGuard<'a, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // Safety: We hold the lock
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> DerefMut for OrderedGuard<'a, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // Safety: We hold the lock
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T> Drop for OrderedGuard<'a, T> {
    #[inline]
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
        order::release(self.lock.class);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_preempt_then_ring_is_allowed() {
        let preempt = OrderedSpinLock::new(LockClass::Preempt, 0u32);
        let ring = OrderedSpinLock::new(LockClass::Ring, 0u32);
        let mut p = preempt.lock();
        let mut r = ring.lock();
        *p += 1;
        *r += 1;
        assert!(holds(LockClass::Preempt));
        drop(r);
        drop(p);
        assert_eq!(*preempt.lock(), 1);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "lock order violation")]
    fn test_ring_then_preempt_panics() {
        let preempt = OrderedSpinLock::new(LockClass::Preempt, ());
        let ring = OrderedSpinLock::new(LockClass::Ring, ());
        let _r = ring.lock();
        let _p = preempt.lock();
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "lock order violation")]
    fn test_two_ring_locks_panic() {
        let a = OrderedSpinLock::new(LockClass::Ring, ());
        let b = OrderedSpinLock::new(LockClass::Ring, ());
        let _a = a.lock();
        let _b = b.lock();
    }

    #[test]
    #[cfg(debug_assertions)]
    fn test_holds_follows_guard() {
        let lock = OrderedSpinLock::new(LockClass::Preempt, ());
        assert!(!holds(LockClass::Preempt));
        let guard = lock.lock();
        assert!(holds(LockClass::Preempt));
        assert!(!holds(LockClass::Ring));
        drop(guard);
        assert!(!holds(LockClass::Preempt));
    }

    #[test]
    fn test_concurrent_increments() {
        let lock = Arc::new(OrderedSpinLock::new(LockClass::Preempt, 0u32));
        let mut handles = vec![];

        for _ in 0..4 {
            let lock = Arc::clone(&lock);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    *lock.lock() += 1;
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(*lock.lock(), 4000);
    }
}
