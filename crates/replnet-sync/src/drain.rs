//! Backpressure waits: parking producers until a congested outbound queue
//! has room.

use crate::connection::{ConnId, ConnState};
use crate::handle::Shared;
use crate::sync::{deadline_after, wait_cond};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::warn;

/// Result of a drain wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// The caller may produce. Either the queue dropped under the limit, or
    /// the deadline elapsed and the connection is now marked `Congested`:
    /// the timeout is a degraded-service signal, not an error, and callers
    /// inspect the connection state to tell the two apart.
    Ready,
    /// Shutdown in progress, or the connection died or was removed while the
    /// caller slept.
    Unavailable,
}

/// Parks the caller while `conn`'s outbound queue is at or over
/// `queue_limit`. One absolute deadline spans the whole call, however many
/// times the wait is re-entered.
pub(crate) async fn await_drain(
    mutex: &Mutex<Shared>,
    conn_id: ConnId,
    queue_limit: usize,
    timeout: Duration,
) -> DrainOutcome {
    let deadline = deadline_after(timeout);
    let mut shared = mutex.lock().await;
    loop {
        if shared.finished {
            return DrainOutcome::Unavailable;
        }
        let Some(conn) = shared.conns.get(conn_id) else {
            return DrainOutcome::Unavailable;
        };
        if conn.state == ConnState::Defunct {
            return DrainOutcome::Unavailable;
        }
        if conn.outq_len < queue_limit {
            return DrainOutcome::Ready;
        }

        let drain = conn.drain.clone();
        let (guard, timed_out) = wait_cond(mutex, shared, &drain, deadline).await;
        shared = guard;

        if timed_out {
            if shared.finished {
                return DrainOutcome::Unavailable;
            }
            let Some(conn) = shared.conns.get_mut(conn_id) else {
                return DrainOutcome::Unavailable;
            };
            if conn.state == ConnState::Defunct {
                return DrainOutcome::Unavailable;
            }
            if conn.outq_len < queue_limit {
                return DrainOutcome::Ready;
            }
            warn!(conn_id, outq_len = conn.outq_len, "outbound queue congested");
            conn.state = ConnState::Congested;
            return DrainOutcome::Ready;
        }
    }
}
