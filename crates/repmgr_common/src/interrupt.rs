//! Cooperative interruption for polling loops.
//!
//! Every bounded wait in the orchestrator sleeps through
//! [`InterruptSignal::sleep`], which returns early once SIGINT or SIGTERM
//! has been received. Steps already applied are left as they are; the
//! caller reports where it stopped.
//!
//! ```ignore
//! let signal = InterruptSignal::new();
//! signal.install_handlers();
//! while !done() {
//!     if signal.sleep(Duration::from_secs(1)).await {
//!         return Err(interrupted());
//!     }
//! }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::warn;

#[derive(Clone, Default)]
pub struct InterruptSignal {
    inner: Arc<InterruptInner>,
}

#[derive(Default)]
struct InterruptInner {
    flag: AtomicBool,
    notify: Notify,
}

impl InterruptSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark as interrupted and wake all sleepers.
    pub fn interrupt(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_interrupted(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Sleep for at most `duration`. Returns `true` if interrupted.
    pub async fn sleep(&self, duration: Duration) -> bool {
        if self.is_interrupted() {
            return true;
        }
        let notified = self.inner.notify.notified();
        tokio::select! {
            _ = notified => {}
            _ = tokio::time::sleep(duration) => {}
        }
        self.is_interrupted()
    }

    /// Spawn a task translating SIGINT/SIGTERM into [`interrupt`](Self::interrupt).
    /// Must be called from within a tokio runtime.
    pub fn install_handlers(&self) {
        let signal = self.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            warn!("interrupt received, stopping at the next check");
            signal.interrupt();
        });
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
