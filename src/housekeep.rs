//! Process-wide housekeeper.
//!
//! Long-lived components register periodic callbacks; each callback
//! returns the delay until its next run. The housekeeper is constructed
//! at node start and handed to the components that need it (no implicit
//! global), and stops all callbacks on shutdown.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

/// A registered callback: runs, then tells the housekeeper when to run
/// it next.
pub type HkCallback = Box<dyn FnMut() -> Duration + Send>;

pub struct Housekeeper {
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl Housekeeper {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Register `cb` to first run after `initial`; subsequent delays come
    /// from the callback's return value.
    pub fn register(&self, name: impl Into<String>, initial: Duration, mut cb: HkCallback) {
        let name = name.into();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            let mut delay = initial;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        debug!(task = %task_name, "housekeeping run");
                        delay = cb();
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            return;
                        }
                    }
                }
            }
        });
        self.handles.lock().push((name, handle));
    }

    /// Stop every registered callback.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let handles = {
            let mut guard = self.handles.lock();
            std::mem::take(&mut *guard)
        };
        for (name, handle) in handles {
            if handle.await.is_err() {
                debug!(task = %name, "housekeeping task aborted");
            }
        }
    }
}

impl Default for Housekeeper {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_callback_reschedules() {
        let hk = Housekeeper::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        hk.register(
            "counter",
            Duration::from_secs(1),
            Box::new(move || {
                count2.fetch_add(1, Ordering::SeqCst);
                Duration::from_secs(1)
            }),
        );

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
        hk.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_halts_callbacks() {
        let hk = Housekeeper::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        hk.register(
            "counter",
            Duration::from_secs(1),
            Box::new(move || {
                count2.fetch_add(1, Ordering::SeqCst);
                Duration::from_secs(1)
            }),
        );
        hk.stop().await;
        let before = count.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), before);
    }
}
