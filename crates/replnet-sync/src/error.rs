//! Error types for the replication synchronization layer.

use thiserror::Error;

/// Errors surfaced by the synchronization layer.
///
/// Per-connection I/O failures never appear here: the event loop contains
/// them by marking the connection defunct. `Io` is reserved for failures of
/// the multiplexer itself (listener accept), which are fatal to the loop.
#[derive(Debug, Error)]
pub enum ReplError {
    /// Shutdown is in progress; the operation cannot start.
    #[error("replication manager shut down")]
    Shutdown,

    /// The target connection is no longer usable.
    #[error("connection unavailable")]
    Unavailable,

    /// No connection with this id exists in the registry.
    #[error("unknown connection: {conn_id}")]
    UnknownConnection {
        /// The connection id that failed to resolve.
        conn_id: u64,
    },

    /// No site with this id exists in the site table.
    #[error("unknown site: {site_id}")]
    UnknownSite {
        /// The site id that failed to resolve.
        site_id: u64,
    },

    /// The site has an empty address list, so it can never be dialed.
    #[error("site {site_id} has no addresses")]
    NoAddresses {
        /// The site id with no configured addresses.
        site_id: u64,
    },

    /// The event loop is already running (the listener was already taken).
    #[error("event loop already running")]
    LoopRunning,

    /// Fatal multiplexer-level I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Convenience result alias for this crate.
pub type Result<T> = std::result::Result<T, ReplError>;
