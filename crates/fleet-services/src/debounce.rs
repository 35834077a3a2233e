//! Single-slot pending signal plus a delay-then-act loop.
//!
//! Any number of [`DebounceSignal::notify`] calls made while a signal is
//! already pending collapse into one. The loop waits `delay` after picking up
//! a signal to batch bursts, runs the action once, and re-arms itself if the
//! action asks for a retry.

use std::{future::Future, time::Duration};

use tokio::sync::mpsc;

use crate::StopReceiver;

/// Outcome of one debounced run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flush {
    Done,
    /// Re-signal and run again after another delay.
    Retry,
}

/// Sending side of a single-slot signal.
#[derive(Debug, Clone)]
pub struct DebounceSignal {
    tx: mpsc::Sender<()>,
}

impl DebounceSignal {
    /// Create a signal and the receiver that [`run_debounced`] drains.
    #[must_use]
    pub fn new() -> (Self, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(1);
        (Self { tx }, rx)
    }

    /// Mark work as pending. Never blocks.
    ///
    /// Returns `false` if a signal was already pending (or the loop is gone).
    pub fn notify(&self) -> bool {
        self.tx.try_send(()).is_ok()
    }
}

/// Drive `action` from `rx` until `stop` fires.
///
/// `retry` is the signal re-raised when `action` returns [`Flush::Retry`].
pub async fn run_debounced<F, Fut>(
    mut rx: mpsc::Receiver<()>,
    retry: DebounceSignal,
    delay: Duration,
    mut stop: StopReceiver,
    mut action: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Flush>,
{
    loop {
        tokio::select! {
            _ = stop.recv() => return,
            signal = rx.recv() => if signal.is_none() { return },
        }

        tokio::select! {
            _ = stop.recv() => return,
            () = tokio::time::sleep(delay) => {}
        }
        // Signals raised during the delay are served by this run.
        while rx.try_recv().is_ok() {}

        if action().await == Flush::Retry {
            retry.notify();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use tokio::sync::broadcast;

    use super::*;

    fn spawn_counter(
        delay: Duration,
        fail_first: usize,
    ) -> (DebounceSignal, Arc<AtomicUsize>, broadcast::Sender<()>) {
        let (signal, rx) = DebounceSignal::new();
        let (stop_tx, stop_rx) = broadcast::channel(1);
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        tokio::spawn(run_debounced(rx, signal.clone(), delay, stop_rx, move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < fail_first {
                    Flush::Retry
                } else {
                    Flush::Done
                }
            }
        }));
        (signal, runs, stop_tx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_collapses_into_one_run() {
        let (signal, runs, _stop) = spawn_counter(Duration::from_secs(1), 0);

        for _ in 0..10 {
            signal.notify();
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_rearms() {
        let (signal, runs, _stop) = spawn_counter(Duration::from_secs(1), 2);

        signal.notify();
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_pending_signal_collapses() {
        let (signal, mut rx) = DebounceSignal::new();
        assert!(signal.notify());
        assert!(!signal.notify());

        let mut recv = tokio_test::task::spawn(rx.recv());
        tokio_test::assert_ready_eq!(recv.poll(), Some(()));
        drop(recv);
        assert!(rx.try_recv().is_err());
        assert!(signal.notify());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_loop() {
        let (signal, runs, stop) = spawn_counter(Duration::from_secs(1), 0);

        signal.notify();
        stop.send(()).unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }
}
