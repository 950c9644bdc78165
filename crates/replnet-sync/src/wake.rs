//! Cross-task wake channel used to interrupt the event loop's blocked
//! multiplexer.
//!
//! The only payload is "something changed, look again": signals coalesce, so
//! N signals produce at least one wake but not necessarily N.

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

#[derive(Debug, Default)]
pub(crate) struct WakeChannel {
    pending: AtomicBool,
    notify: Notify,
}

impl WakeChannel {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Interrupts a blocked `wait`, or makes the next `wait` return
    /// immediately if none is in progress.
    pub(crate) fn signal(&self) {
        self.pending.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    /// Parks until signaled. Consumes the pending flag; this is the "drain
    /// the payload" step, there is nothing else to read.
    ///
    /// Cancel-safe: an unconsumed signal survives as the pending flag plus
    /// the stored notify permit.
    pub(crate) async fn wait(&self) {
        loop {
            if self.pending.swap(false, Ordering::SeqCst) {
                return;
            }
            self.notify.notified().await;
        }
    }
}
