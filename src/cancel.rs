//! Cooperative cancellation for the send loop.
//!
//! A [`CancelHandle`] is held by whoever may stop a run; any number of
//! [`CancelSignal`]s observe it. The loop only waits through
//! [`CancelSignal::sleep_or_cancel`] or polls [`CancelSignal::is_cancelled`],
//! so cancellation is seen at exactly those points. Dropping the handle
//! counts as cancellation.

use tokio::sync::watch;
use tokio::time::{self, Duration, Instant};

/// Creates a linked handle/signal pair.
pub fn cancellation() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelSignal { rx })
}

/// The stopping side.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Fires the signal. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// How a cancellable wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    Elapsed,
    Cancelled,
}

/// The observing side.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// Non-blocking check.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Resolves once cancellation is requested or the handle is dropped.
    pub async fn cancelled(&mut self) {
        // Err means the handle is gone, which is treated as a stop.
        let _ = self.rx.wait_for(|stopped| *stopped).await;
    }

    /// Sleeps for `duration` unless cancelled first.
    pub async fn sleep_or_cancel(&mut self, duration: Duration) -> Wake {
        self.sleep_until_or_cancel(Instant::now() + duration).await
    }

    /// Sleeps until `deadline` unless cancelled first.
    pub async fn sleep_until_or_cancel(&mut self, deadline: Instant) -> Wake {
        if self.is_cancelled() {
            return Wake::Cancelled;
        }
        tokio::select! {
            biased;
            _ = self.cancelled() => Wake::Cancelled,
            _ = time::sleep_until(deadline) => Wake::Elapsed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_near(actual: Duration, expected: Duration) {
        let diff = if actual > expected {
            actual - expected
        } else {
            expected - actual
        };
        assert!(diff <= Duration::from_millis(2), "{:?} vs {:?}", actual, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_elapses_without_cancel() {
        let (_handle, mut signal) = cancellation();
        let start = Instant::now();
        assert_eq!(
            signal.sleep_or_cancel(Duration::from_secs(3)).await,
            Wake::Elapsed
        );
        assert_near(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_sleep() {
        let (handle, mut signal) = cancellation();
        let start = Instant::now();
        tokio::spawn(async move {
            time::sleep(Duration::from_secs(1)).await;
            handle.cancel();
        });
        assert_eq!(
            signal.sleep_or_cancel(Duration::from_secs(10)).await,
            Wake::Cancelled
        );
        assert_near(start.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn already_cancelled_returns_immediately() {
        let (handle, mut signal) = cancellation();
        handle.cancel();
        assert!(signal.is_cancelled());
        assert_eq!(
            signal.sleep_or_cancel(Duration::from_secs(3600)).await,
            Wake::Cancelled
        );
    }

    #[tokio::test]
    async fn dropped_handle_counts_as_cancel() {
        let (handle, mut signal) = cancellation();
        drop(handle);
        assert!(signal.is_cancelled());
        signal.cancelled().await;
    }

    #[test]
    fn cancel_is_idempotent_and_shared() {
        let (handle, first) = cancellation();
        let second = first.clone();
        handle.cancel();
        handle.cancel();
        assert!(handle.is_cancelled());
        assert!(first.is_cancelled());
        assert!(second.is_cancelled());
    }
}
