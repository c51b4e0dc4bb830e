//! Reusable completion counter.
//!
//! Incremented when work starts and decremented when it ends; [`Countdown::wait`]
//! resolves once the count drops to zero or below. Cancellation never shortens
//! the wait: [`Countdown::wait_or_cancel`] runs the cancellation hook and keeps
//! waiting for real completion.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

type CancelHook = Box<dyn FnOnce() + Send>;

#[derive(Clone)]
pub struct Countdown {
    inner: Arc<Inner>,
}

struct Inner {
    count: watch::Sender<i64>,
    on_cancel: Mutex<Option<CancelHook>>,
}

impl fmt::Debug for Countdown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Countdown")
            .field("count", &self.count())
            .finish()
    }
}

impl Default for Countdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Countdown {
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                count,
                on_cancel: Mutex::new(None),
            }),
        }
    }

    /// Countdown whose hook runs on the first cancellation that finds work outstanding.
    pub fn with_cancel_hook(hook: impl FnOnce() + Send + 'static) -> Self {
        let countdown = Self::new();
        *countdown.inner.on_cancel.lock() = Some(Box::new(hook));
        countdown
    }

    pub fn count(&self) -> i64 {
        *self.inner.count.borrow()
    }

    pub fn increment(&self) {
        self.inner.count.send_modify(|count| *count += 1);
    }

    pub fn decrement(&self) {
        self.inner.count.send_modify(|count| *count -= 1);
    }

    /// Increment now and decrement when the guard drops.
    pub fn enter(&self) -> CountdownGuard {
        self.increment();
        CountdownGuard {
            countdown: self.clone(),
        }
    }

    pub async fn wait(&self) {
        let mut rx = self.inner.count.subscribe();
        // The sender lives in `inner`, which we hold, so this cannot fail.
        let _ = rx.wait_for(|count| *count <= 0).await;
    }

    /// Request cancellation of the outstanding work. The hook runs at most
    /// once over the countdown's lifetime, and only while count > 0.
    pub fn cancel(&self) -> bool {
        if self.count() <= 0 {
            return false;
        }
        let hook = self.inner.on_cancel.lock().take();
        match hook {
            Some(hook) => {
                hook();
                true
            }
            None => false,
        }
    }

    /// Wait for completion. If `token` fires first, cancel and keep waiting.
    /// Returns whether cancellation was requested.
    pub async fn wait_or_cancel(&self, token: &CancellationToken) -> bool {
        tokio::select! {
            _ = self.wait() => return false,
            _ = token.cancelled() => {}
        }
        self.cancel();
        self.wait().await;
        true
    }
}

#[must_use = "dropping the guard decrements immediately"]
pub struct CountdownGuard {
    countdown: Countdown,
}

impl Drop for CountdownGuard {
    fn drop(&mut self) {
        self.countdown.decrement();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn wait_returns_immediately_at_zero() {
        let countdown = Countdown::new();
        countdown.wait().await;
        countdown.increment();
        countdown.decrement();
        countdown.decrement();
        assert_eq!(countdown.count(), -1);
        countdown.wait().await;
    }

    #[tokio::test]
    async fn pending_wait_resolves_after_matching_decrements() {
        let countdown = Countdown::new();
        for _ in 0..3 {
            countdown.increment();
        }
        let waiter = tokio::spawn({
            let countdown = countdown.clone();
            async move { countdown.wait().await }
        });
        tokio::task::yield_now().await;
        for _ in 0..2 {
            countdown.decrement();
        }
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        countdown.decrement();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait resolves")
            .expect("waiter task");
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_wait_runs_hook_once_and_still_blocks() {
        let hooks = Arc::new(AtomicUsize::new(0));
        let countdown = Countdown::with_cancel_hook({
            let hooks = hooks.clone();
            move || {
                hooks.fetch_add(1, Ordering::SeqCst);
            }
        });
        let work = countdown.enter();

        let token = CancellationToken::new();
        let waiter = tokio::spawn({
            let countdown = countdown.clone();
            let token = token.clone();
            async move { countdown.wait_or_cancel(&token).await }
        });
        token.cancel();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(hooks.load(Ordering::SeqCst), 1);
        assert!(!waiter.is_finished(), "cancel must not end the wait early");

        assert!(!countdown.cancel(), "hook already consumed");
        assert_eq!(hooks.load(Ordering::SeqCst), 1);

        let fresh = tokio::spawn({
            let countdown = countdown.clone();
            async move { countdown.wait().await }
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!fresh.is_finished());

        drop(work);
        assert!(waiter.await.expect("waiter"));
        fresh.await.expect("fresh waiter");
        assert_eq!(hooks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_without_outstanding_work_skips_hook() {
        let hooks = Arc::new(AtomicUsize::new(0));
        let countdown = Countdown::with_cancel_hook({
            let hooks = hooks.clone();
            move || {
                hooks.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert!(!countdown.cancel());
        let token = CancellationToken::new();
        token.cancel();
        countdown.wait_or_cancel(&token).await;
        assert_eq!(hooks.load(Ordering::SeqCst), 0);
    }
}
