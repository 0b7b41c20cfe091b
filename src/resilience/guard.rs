//! Counted slot guard.
//!
//! A [`SlotGuard`] occupies one slot of a bounded counter and frees it when
//! dropped. Because the release happens in `Drop`, a slot is returned even when
//! the future holding it is cancelled (e.g. by the request deadline).

use std::sync::atomic::{AtomicU32, Ordering};

/// One occupied slot of a bounded in-flight counter.
#[derive(Debug)]
pub struct SlotGuard<'a> {
    counter: &'a AtomicU32,
}

impl<'a> SlotGuard<'a> {
    /// Try to occupy a slot. Returns `None` when `limit` slots are already taken.
    pub fn acquire(counter: &'a AtomicU32, limit: u32) -> Option<Self> {
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < limit).then_some(current + 1)
            })
            .ok()
            .map(|_| Self { counter })
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        // Never wraps: every decrement pairs with a successful acquire.
        let _ = self
            .counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_sub(1)
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_respects_limit() {
        let counter = AtomicU32::new(0);
        let first = SlotGuard::acquire(&counter, 2);
        let second = SlotGuard::acquire(&counter, 2);
        let third = SlotGuard::acquire(&counter, 2);

        assert!(first.is_some());
        assert!(second.is_some());
        assert!(third.is_none());
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_drop_releases_slot() {
        let counter = AtomicU32::new(0);
        {
            let _slot = SlotGuard::acquire(&counter, 1);
            assert!(SlotGuard::acquire(&counter, 1).is_none());
        }
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(SlotGuard::acquire(&counter, 1).is_some());
    }

    #[tokio::test]
    async fn test_cancelled_future_releases_slot() {
        let counter = AtomicU32::new(0);

        let pending = async {
            let _slot = SlotGuard::acquire(&counter, 1);
            std::future::pending::<()>().await;
        };
        let result = tokio::time::timeout(std::time::Duration::from_millis(10), pending).await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
