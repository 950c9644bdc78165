//! External collaborators consumed by the synchronization layer.
//!
//! The wire protocol, the durability/quorum policy, and retry scheduling all
//! live outside this crate. They plug in through these traits, supplied to
//! [`ReplicationHandle::init`](crate::handle::ReplicationHandle::init).

use crate::ack::Lsn;
use crate::connection::ConnId;
use crate::site::SiteId;
use bytes::Bytes;
use tokio::time::Instant;

/// Durability/quorum predicate: decides whether an LSN has been acknowledged
/// by enough replicas to count as permanent.
///
/// Called with the shared mutex held, on every wake of every acknowledgment
/// waiter. Implementations must not block or re-enter the handle.
pub trait Durability: Send + Sync {
    /// Returns true once `lsn` is permanent under the quorum policy.
    fn is_permanent(&self, lsn: Lsn) -> bool;
}

/// Wire-protocol collaborator.
pub trait Protocol: Send + Sync {
    /// Produces the version-proposal handshake payload sent on a freshly
    /// established outbound connection. The payload format is owned by the
    /// protocol layer; this crate only queues and transmits it.
    fn version_proposal(&self, site_id: SiteId) -> Bytes;

    /// Delivers raw inbound bytes from a peer connection. Framing and
    /// message decoding happen upstream.
    fn on_inbound(&self, conn_id: ConnId, payload: &[u8]);
}

/// Connection-retry timer collaborator, consulted once per event loop
/// iteration.
///
/// Both methods are called with the shared mutex held. Implementations must
/// not block or re-enter the handle.
pub trait RetryTimer: Send + Sync {
    /// The nearest pending retry deadline, or `None` to let the loop block
    /// indefinitely.
    fn next_deadline(&self) -> Option<Instant>;

    /// Invoked when the deadline elapses; returns the sites due for a fresh
    /// dial attempt.
    fn on_deadline(&self) -> Vec<SiteId>;
}

/// A retry timer that never fires. Useful when retry scheduling is driven
/// entirely by explicit [`dial`](crate::handle::ReplicationHandle::dial)
/// calls, and in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRetry;

impl RetryTimer for NoRetry {
    fn next_deadline(&self) -> Option<Instant> {
        None
    }

    fn on_deadline(&self) -> Vec<SiteId> {
        Vec::new()
    }
}
