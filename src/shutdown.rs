// SPDX-License-Identifier: Apache-2.0

//! Cooperative cancellation shared by the watcher, workers, tailers and
//! aggregator timers.
//!
//! Dropping the [`ShutdownSignal`] disconnects every [`Shutdown`] clone, so
//! a blocked `recv_timeout` wakes immediately instead of sleeping out its
//! interval.

use std::time::Duration;

use flume::{Receiver, RecvTimeoutError, Sender};

/// Owning half. Dropping it (or calling [`ShutdownSignal::shutdown`])
/// signals every observer.
pub(crate) struct ShutdownSignal {
    _tx: Sender<()>,
}

impl ShutdownSignal {
    pub(crate) fn shutdown(self) {}
}

/// Observer half, freely cloneable across threads.
#[derive(Clone)]
pub(crate) struct Shutdown {
    rx: Receiver<()>,
}

impl Shutdown {
    pub(crate) fn is_shutdown(&self) -> bool {
        self.rx.is_disconnected()
    }

    /// Sleep for `timeout`, waking early on shutdown. Returns true when the
    /// caller should stop.
    pub(crate) fn sleep(&self, timeout: Duration) -> bool {
        match self.rx.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => false,
            Err(RecvTimeoutError::Disconnected) => true,
            // No value is ever sent on this channel.
            Ok(()) => true,
        }
    }
}

pub(crate) fn shutdown_channel() -> (ShutdownSignal, Shutdown) {
    let (tx, rx) = flume::bounded(0);
    (ShutdownSignal { _tx: tx }, Shutdown { rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_not_shutdown_until_signal_dropped() {
        let (signal, shutdown) = shutdown_channel();
        assert!(!shutdown.is_shutdown());
        drop(signal);
        assert!(shutdown.is_shutdown());
    }

    #[test]
    fn test_sleep_runs_full_interval_without_signal() {
        let (_signal, shutdown) = shutdown_channel();
        let start = Instant::now();
        let stopped = shutdown.sleep(Duration::from_millis(50));
        assert!(!stopped);
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_sleep_wakes_early_on_shutdown() {
        let (signal, shutdown) = shutdown_channel();

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            signal.shutdown();
        });

        let start = Instant::now();
        let stopped = shutdown.sleep(Duration::from_secs(5));
        assert!(stopped);
        assert!(start.elapsed() < Duration::from_secs(1));
        handle.join().unwrap();
    }

    #[test]
    fn test_clones_observe_same_signal() {
        let (signal, shutdown) = shutdown_channel();
        let other = shutdown.clone();
        drop(signal);
        assert!(shutdown.is_shutdown());
        assert!(other.is_shutdown());
    }
}
