use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};

const CONCURRENT_INCREMENT_BUDGET_US: u64 = 500;

/// Handle to the background marker thread spawned in concurrent mode.
///
/// Runs `perform_marking_increment(500us)` in a loop while the collector's
/// phase is `MARKING`, stopping on request or once the phase advances.
/// Gray-stack access is serialized by the same mutex the mutator's write
/// barrier uses, so the only coordination this handle owns is start/stop
/// signaling.
pub struct MarkerHandle {
    stop_tx: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl MarkerHandle {
    /// Spawn the marker thread. `increment` performs one bounded marking
    /// increment and returns `true` if marking is now complete (gray stack
    /// empty); the thread stops once it sees `true` or a stop signal.
    pub fn spawn<F>(increment: F) -> MarkerHandle
    where
        F: Fn(u64) -> bool + Send + 'static,
    {
        let (stop_tx, stop_rx): (Sender<()>, Receiver<()>) = bounded(1);
        let thread = std::thread::Builder::new()
            .name("aerojs-gc-marker".to_string())
            .spawn(move || loop {
                if stop_rx.try_recv().is_ok() {
                    return;
                }
                if increment(CONCURRENT_INCREMENT_BUDGET_US) {
                    return;
                }
                std::thread::sleep(Duration::from_micros(50));
            })
            .expect("failed to spawn GC marker thread");

        MarkerHandle {
            stop_tx,
            thread: Some(thread),
        }
    }

    /// Signal the marker thread to stop and wait for it to exit.
    pub fn stop(mut self) {
        let _ = self.stop_tx.send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for MarkerHandle {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
