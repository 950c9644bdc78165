//! Configuration for the replication synchronization layer.

use crate::ack::AckStrategy;
use std::time::Duration;

/// Tunables for one replication environment.
#[derive(Debug, Clone)]
pub struct ReplConfig {
    /// Address the listener binds to. The default uses an ephemeral port;
    /// production deployments set a fixed address.
    pub listen_addr: String,
    /// Default timeout for acknowledgment waits. `Duration::ZERO` means
    /// "wait indefinitely" and suppresses the deadline entirely.
    pub ack_timeout: Duration,
    /// Outbound queue length at or above which producers are expected to
    /// block in a drain wait. The limit is soft: enqueue itself never
    /// rejects, only the drain wait gates new production.
    pub queue_limit: usize,
    /// Size of the event loop's inbound read buffer in bytes.
    pub read_buf_size: usize,
    /// Which acknowledgment-wait strategy the registry uses.
    pub ack_strategy: AckStrategy,
}

impl Default for ReplConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:0".to_string(),
            ack_timeout: Duration::from_secs(1),
            queue_limit: 10,
            read_buf_size: 64 * 1024,
            ack_strategy: AckStrategy::Broadcast,
        }
    }
}
