//! Monitor-style wait primitives shared by every blocking path in the crate.
//!
//! All waits follow the same discipline: the caller holds the shared mutex,
//! registers for the wakeup while still holding it, releases it across the
//! suspension, and re-acquires it before returning. Deadlines are absolute
//! and computed once per logical wait, so repeated short sleeps inside one
//! call cannot drift.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard, Notify};
use tokio::time::{self, Instant};

/// Computes the absolute deadline for a relative timeout.
///
/// `Duration::ZERO` means "wait indefinitely" and yields `None`.
pub fn deadline_after(timeout: Duration) -> Option<Instant> {
    if timeout.is_zero() {
        None
    } else {
        Some(Instant::now() + timeout)
    }
}

/// A broadcast condition: waking wakes every registered waiter, not just
/// one, because several waiters may become satisfiable at once.
#[derive(Debug, Default)]
pub struct Cond {
    notify: Arc<Notify>,
}

impl Cond {
    /// Allocates a fresh condition. Release is RAII.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wakes all waiters currently registered on this condition.
    pub fn broadcast(&self) {
        self.notify.notify_waiters();
    }

    pub(crate) fn handle(&self) -> Arc<Notify> {
        self.notify.clone()
    }
}

/// Releases `guard`, waits on `cond` until woken or until `deadline`, then
/// re-acquires the mutex. Returns the new guard and whether the deadline
/// elapsed.
///
/// The waiter is registered before the guard is dropped, so a wake issued by
/// a thread that held the mutex after us cannot be missed.
pub async fn wait_cond<'a, T>(
    mutex: &'a Mutex<T>,
    guard: MutexGuard<'a, T>,
    cond: &Notify,
    deadline: Option<Instant>,
) -> (MutexGuard<'a, T>, bool) {
    let notified = cond.notified();
    tokio::pin!(notified);
    notified.as_mut().enable();
    drop(guard);
    let timed_out = match deadline {
        Some(at) => time::timeout_at(at, notified).await.is_err(),
        None => {
            notified.await;
            false
        }
    };
    (mutex.lock().await, timed_out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_timeout_means_no_deadline() {
        assert!(deadline_after(Duration::ZERO).is_none());
    }

    #[test]
    fn test_nonzero_timeout_is_absolute() {
        let now = Instant::now();
        let deadline = deadline_after(Duration::from_secs(5)).unwrap();
        assert!(deadline >= now + Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_broadcast_wakes_waiter() {
        let mutex = Arc::new(Mutex::new(false));
        let cond = Arc::new(Cond::new());

        let waiter = {
            let mutex = Arc::clone(&mutex);
            let cond = Arc::clone(&cond);
            tokio::spawn(async move {
                let mut guard = mutex.lock().await;
                while !*guard {
                    let notify = cond.handle();
                    let (g, timed_out) = wait_cond(&mutex, guard, &notify, None).await;
                    assert!(!timed_out);
                    guard = g;
                }
            })
        };

        // Let the waiter park before signaling.
        tokio::task::yield_now().await;
        {
            let mut guard = mutex.lock().await;
            *guard = true;
            cond.broadcast();
        }
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_broadcast_wakes_all_waiters() {
        let mutex = Arc::new(Mutex::new(false));
        let cond = Arc::new(Cond::new());

        let mut waiters = Vec::new();
        for _ in 0..4 {
            let mutex = Arc::clone(&mutex);
            let cond = Arc::clone(&cond);
            waiters.push(tokio::spawn(async move {
                let mut guard = mutex.lock().await;
                while !*guard {
                    let notify = cond.handle();
                    let (g, _) = wait_cond(&mutex, guard, &notify, None).await;
                    guard = g;
                }
            }));
        }

        tokio::task::yield_now().await;
        {
            let mut guard = mutex.lock().await;
            *guard = true;
            cond.broadcast();
        }
        for w in waiters {
            w.await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out_when_never_signaled() {
        let mutex = Mutex::new(());
        let cond = Cond::new();
        let guard = mutex.lock().await;
        let deadline = deadline_after(Duration::from_millis(50));
        let notify = cond.handle();
        let (_guard, timed_out) = wait_cond(&mutex, guard, &notify, deadline).await;
        assert!(timed_out);
    }
}
