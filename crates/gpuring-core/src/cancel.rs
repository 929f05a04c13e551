//! Cancellation token for fence waits
//!
//! Cancelling a token only releases the threads waiting with it. The GPU
//! work behind the fence keeps running; only a device reset discards it.
//! A device hands out children of its own token, so tearing the device
//! down releases every waiter at once.

use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared cancellation flag with optional parent
#[derive(Clone)]
pub struct CancelToken {
    inner: Option<Arc<Inner>>,
}

struct Inner {
    cancelled: AtomicBool,
    parent: Option<CancelToken>,
}

impl CancelToken {
    /// A fresh, independent token
    pub fn new() -> Self {
        Self {
            inner: Some(Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                parent: None,
            })),
        }
    }

    /// A token that can never be cancelled; does not allocate
    pub const fn never() -> Self {
        Self { inner: None }
    }

    /// A token that is cancelled when either it or `self` is
    pub fn child(&self) -> Self {
        Self {
            inner: Some(Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                parent: Some(self.clone()),
            })),
        }
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        let mut cur = self;
        while let Some(inner) = &cur.inner {
            if inner.cancelled.load(Ordering::Acquire) {
                return true;
            }
            match &inner.parent {
                Some(parent) => cur = parent,
                None => break,
            }
        }
        false
    }

    /// Request cancellation of this token and its children
    pub fn cancel(&self) {
        if let Some(inner) = &self.inner {
            inner.cancelled.store(true, Ordering::Release);
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_parent_cancels_child_not_reverse() {
        let device = CancelToken::new();
        let waiter = device.child();
        let nested = waiter.child();

        waiter.cancel();
        assert!(nested.is_cancelled());
        assert!(!device.is_cancelled());

        let other = device.child();
        device.cancel();
        assert!(other.is_cancelled());
    }

    #[test]
    fn test_never_token() {
        let token = CancelToken::never();
        token.cancel();
        assert!(!token.is_cancelled());
        assert!(!token.child().is_cancelled());
    }

    #[test]
    fn test_clone_shares_state() {
        let a = CancelToken::new();
        let b = a.clone();
        a.cancel();
        assert!(b.is_cancelled());
    }
}
