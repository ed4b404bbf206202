//! Background auto-expiration, DLQ retention cleanup, and periodic
//! compaction, run on `config.sweeper_interval_ms` (default 60s).
//!
//! Sweeper errors are logged and retried on the next tick; per §7 they
//! never crash the process.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use tracing::error;

use crate::queue::MessageQueue;

/// Owns the sweeper's background thread. Dropping it (or calling
/// [`Sweeper::stop`] explicitly) signals the thread to exit and joins it.
pub struct Sweeper {
    stop_tx: mpsc::Sender<()>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Sweeper {
    /// Spawns the sweeper thread for `queue`, ticking every
    /// `queue.config().sweeper_interval_ms`.
    pub fn spawn(queue: MessageQueue) -> Self {
        let interval = Duration::from_millis(queue.config().sweeper_interval_ms.max(1));
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let handle = thread::Builder::new()
            .name("broker-sweeper".into())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Ok(()) => break,
                    Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    Err(mpsc::RecvTimeoutError::Timeout) => {
                        if let Err(e) = queue.run_sweep() {
                            error!(error = %e, "sweeper tick failed, will retry next interval");
                        }
                    }
                }
            })
            .expect("failed to spawn sweeper thread");

        Self {
            stop_tx,
            handle: Some(handle),
        }
    }

    /// Signals the sweeper to stop and waits for it to exit.
    pub fn stop(mut self) {
        self.stop_inner();
    }

    fn stop_inner(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.stop_inner();
    }
}
