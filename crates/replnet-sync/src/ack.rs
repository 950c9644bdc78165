//! Acknowledgment waits: parking writers until an LSN becomes permanent.
//!
//! Two interchangeable strategies sit behind one registry type:
//!
//! - **Broadcast**: a single condition is broadcast on every ack-state
//!   change; every waiter wakes and re-evaluates its own predicate. O(waiters)
//!   work per ack, no bookkeeping. The re-evaluation cost is a known,
//!   deliberate tradeoff: quorum semantics live in the external predicate, so
//!   this layer cannot pre-filter who is satisfiable.
//! - **SlotTable**: an arena of waiter slots, each with its own wake handle,
//!   plus an explicit free list of indices. Waking scans only allocated slots
//!   and wakes exactly the ones whose LSN is now permanent.

use crate::handle::Shared;
use crate::hooks::Durability;
use crate::sync::{deadline_after, wait_cond, Cond};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

/// Log sequence number: monotonically increasing id of a durable log record.
pub type Lsn = u64;

/// Result of an acknowledgment wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The LSN became permanent before any deadline or shutdown.
    Acked,
    /// The deadline elapsed first.
    TimedOut,
    /// Shutdown was observed; returned regardless of the predicate state.
    Unavailable,
}

/// Selects the wait strategy behind the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckStrategy {
    /// One shared condition, broadcast on every change.
    #[default]
    Broadcast,
    /// Per-waiter slots with targeted wakes.
    SlotTable,
}

#[derive(Debug)]
pub(crate) struct AckSlot {
    /// Target LSN while occupied; `None` marks the slot free.
    lsn: Option<Lsn>,
    wake: Arc<Notify>,
}

/// Registry of parked acknowledgment waiters. All methods require the shared
/// mutex to be held.
#[derive(Debug)]
pub(crate) enum AckWaiters {
    Broadcast {
        cond: Cond,
    },
    SlotTable {
        slots: Vec<AckSlot>,
        free: Vec<usize>,
    },
}

/// A registered wait: the handle to park on, plus the slot to give back.
pub(crate) struct AckWait {
    pub(crate) notify: Arc<Notify>,
    slot: Option<usize>,
}

impl AckWaiters {
    pub(crate) fn new(strategy: AckStrategy) -> Self {
        match strategy {
            AckStrategy::Broadcast => AckWaiters::Broadcast { cond: Cond::new() },
            AckStrategy::SlotTable => AckWaiters::SlotTable {
                slots: Vec::new(),
                free: Vec::new(),
            },
        }
    }

    /// Registers a waiter for `lsn` and returns its wake handle.
    pub(crate) fn register(&mut self, lsn: Lsn) -> AckWait {
        match self {
            AckWaiters::Broadcast { cond } => AckWait {
                notify: cond.handle(),
                slot: None,
            },
            AckWaiters::SlotTable { slots, free } => {
                let idx = Self::allocate_slot(slots, free);
                slots[idx].lsn = Some(lsn);
                AckWait {
                    notify: slots[idx].wake.clone(),
                    slot: Some(idx),
                }
            }
        }
    }

    /// Releases a registration once the wait resolves.
    pub(crate) fn release(&mut self, wait: AckWait) {
        if let (AckWaiters::SlotTable { slots, free }, Some(idx)) = (self, wait.slot) {
            slots[idx].lsn = None;
            free.push(idx);
        }
    }

    /// Wakes every waiter whose LSN is now permanent. Broadcast wakes all
    /// waiters and lets them re-check; the slot table wakes only satisfied
    /// slots, scanning nothing past the allocated range.
    pub(crate) fn wake_satisfied(&self, is_permanent: &dyn Fn(Lsn) -> bool) {
        match self {
            AckWaiters::Broadcast { cond } => cond.broadcast(),
            AckWaiters::SlotTable { slots, .. } => {
                for slot in slots {
                    if let Some(lsn) = slot.lsn {
                        if is_permanent(lsn) {
                            slot.wake.notify_one();
                        }
                    }
                }
            }
        }
    }

    /// Shutdown path: wakes every waiter unconditionally.
    pub(crate) fn wake_all(&self) {
        match self {
            AckWaiters::Broadcast { cond } => cond.broadcast(),
            AckWaiters::SlotTable { slots, .. } => {
                for slot in slots {
                    if slot.lsn.is_some() {
                        slot.wake.notify_one();
                    }
                }
            }
        }
    }

    /// Pops the free list, or grows the arena with capacity doubling. Wake
    /// handles are created when a slot first comes into existence and reused
    /// for its whole lifetime.
    fn allocate_slot(slots: &mut Vec<AckSlot>, free: &mut Vec<usize>) -> usize {
        if let Some(idx) = free.pop() {
            return idx;
        }
        if slots.len() == slots.capacity() {
            slots.reserve_exact(slots.capacity().max(4));
        }
        slots.push(AckSlot {
            lsn: None,
            wake: Arc::new(Notify::new()),
        });
        slots.len() - 1
    }
}

/// Parks the caller until `lsn` is permanent, the deadline elapses, or
/// shutdown begins. `timeout == Duration::ZERO` waits indefinitely; the
/// deadline is computed once, at entry.
///
/// Shutdown observed on any wake wins over the predicate.
pub(crate) async fn await_ack(
    mutex: &Mutex<Shared>,
    durability: &dyn Durability,
    lsn: Lsn,
    timeout: Duration,
) -> AckOutcome {
    let deadline = deadline_after(timeout);
    let mut shared = mutex.lock().await;
    let wait = shared.acks.register(lsn);
    let outcome = loop {
        if shared.finished {
            break AckOutcome::Unavailable;
        }
        if durability.is_permanent(lsn) {
            break AckOutcome::Acked;
        }
        let notify = wait.notify.clone();
        let (guard, timed_out) = wait_cond(mutex, shared, &notify, deadline).await;
        shared = guard;
        if timed_out {
            if shared.finished {
                break AckOutcome::Unavailable;
            }
            // The ack may have landed right at the deadline.
            if durability.is_permanent(lsn) {
                break AckOutcome::Acked;
            }
            break AckOutcome::TimedOut;
        }
    };
    shared.acks.release(wait);
    outcome
}
