//! Cancellable one-shot timer with "last schedule wins" semantics.
//!
//! Each `schedule` aborts the pending task (if any) and arms a new one, so a
//! burst of calls collapses into a single action fired after the quiet period
//! following the last call.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::debug;

pub struct DebounceTimer {
    delay: Duration,
    runtime: Handle,
    task: Mutex<Option<JoinHandle<()>>>,
    /// Bumped on every schedule/cancel; a woken task only fires if it still
    /// holds the latest ticket (abort is not instantaneous).
    ticket: Arc<AtomicU64>,
}

impl DebounceTimer {
    pub fn new(delay: Duration, runtime: Handle) -> Self {
        Self {
            delay,
            runtime,
            task: Mutex::new(None),
            ticket: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Cancel any pending action and schedule `action` after the quiet period.
    pub fn schedule<F, Fut>(&self, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut slot = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = slot.take() {
            previous.abort();
        }

        let my_ticket = self.ticket.fetch_add(1, Ordering::SeqCst) + 1;
        let ticket = Arc::clone(&self.ticket);
        let delay = self.delay;

        let handle = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if ticket.load(Ordering::SeqCst) != my_ticket {
                debug!("Debounce ticket {my_ticket} superseded");
                return;
            }
            // Detach: a later schedule must not abort an action already firing.
            tokio::spawn(action());
        });
        *slot = Some(handle);
    }

    /// Cancel the pending action, if any.
    pub fn cancel(&self) {
        self.ticket.fetch_add(1, Ordering::SeqCst);
        if let Some(handle) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
    }

    pub fn is_pending(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}

impl Drop for DebounceTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn burst_collapses_into_last_action() {
        let timer = DebounceTimer::new(Duration::from_millis(100), Handle::current());
        let fired = Arc::new(AtomicUsize::new(0));
        let last_value = Arc::new(AtomicUsize::new(0));

        for i in 1..=10 {
            let fired = Arc::clone(&fired);
            let last_value = Arc::clone(&last_value);
            timer.schedule(move || async move {
                fired.fetch_add(1, Ordering::SeqCst);
                last_value.store(i, Ordering::SeqCst);
            });
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(last_value.load(Ordering::SeqCst), 10);
        assert!(!timer.is_pending());
    }

    #[tokio::test]
    async fn cancel_prevents_firing() {
        let timer = DebounceTimer::new(Duration::from_millis(50), Handle::current());
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        timer.schedule(move || async move {
            f.fetch_add(1, Ordering::SeqCst);
        });
        assert!(timer.is_pending());
        timer.cancel();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
