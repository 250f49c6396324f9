use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

type Callback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    callbacks: Mutex<Vec<Callback>>,
}

/// Cooperative cancellation flag checked at frame boundaries.
///
/// Clones share state. Cancelling is idempotent: callbacks run exactly once.
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Request cancellation. Returns `true` only for the call that flipped the flag.
    pub fn cancel(&self) -> bool {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return false;
        }
        let callbacks = std::mem::take(&mut *self.inner.callbacks.lock());
        for cb in callbacks {
            cb();
        }
        true
    }

    /// Run `cb` once cancellation is requested; immediately if it already was.
    pub fn on_cancelled(&self, cb: impl FnOnce() + Send + 'static) {
        let mut callbacks = self.inner.callbacks.lock();
        if self.is_cancelled() {
            drop(callbacks);
            cb();
            return;
        }
        callbacks.push(Box::new(cb));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn cancel_twice_equals_once() {
        let token = CancellationToken::new();
        let hits = Arc::new(AtomicU32::new(0));
        let h = hits.clone();
        token.on_cancelled(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert!(token.cancel());
        assert!(!token.cancel());
        assert!(token.is_cancelled());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn late_subscriber_runs_immediately() {
        let token = CancellationToken::new();
        token.clone().cancel();
        let hit = Arc::new(AtomicBool::new(false));
        let h = hit.clone();
        token.on_cancelled(move || h.store(true, Ordering::SeqCst));
        assert!(hit.load(Ordering::SeqCst));
    }
}
