/*!
 * Cancellation Context
 *
 * A cloneable, process-wide cancellation signal for thread-based servers.
 * Blocking waiters park on a condition variable; event loops that sleep in
 * `Poll::poll` register a callback (typically a `mio::Waker`) that fires
 * when the context is cancelled.
 */

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

type Callback = Box<dyn FnOnce() + Send>;

#[derive(Clone, Default)]
pub struct Context {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    lock: Mutex<Vec<Callback>>,
    cv: Condvar,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the context, waking every waiter. Idempotent.
    pub fn cancel(&self) {
        let callbacks = {
            let mut guard = self.inner.lock.lock();
            if self.inner.cancelled.swap(true, Ordering::AcqRel) {
                return;
            }
            self.inner.cv.notify_all();
            std::mem::take(&mut *guard)
        };
        for cb in callbacks {
            cb();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Block until the context is cancelled.
    pub fn wait(&self) {
        let mut guard = self.inner.lock.lock();
        while !self.is_cancelled() {
            self.inner.cv.wait(&mut guard);
        }
    }

    /// Block until cancelled or `timeout` elapses. Returns `true` if cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut guard = self.inner.lock.lock();
        if !self.is_cancelled() {
            self.inner.cv.wait_for(&mut guard, timeout);
        }
        self.is_cancelled()
    }

    /// Run `f` once when the context is cancelled, or now if it already is.
    pub fn on_cancel(&self, f: impl FnOnce() + Send + 'static) {
        {
            let mut guard = self.inner.lock.lock();
            if !self.is_cancelled() {
                guard.push(Box::new(f));
                return;
            }
        }
        f();
    }
}
