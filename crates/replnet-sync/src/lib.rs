#![warn(missing_docs)]

//! Replication network synchronization layer: peer connection registry with
//! retry/failover, a single event loop multiplexing all peer I/O and timers,
//! and blocking waits for log-record durability and outbound-queue drain.
//!
//! The wire protocol, election, and the durability/quorum policy are
//! external collaborators; see [`hooks`].

pub mod ack;
pub mod config;
pub mod connection;
pub mod drain;
pub mod error;
pub mod handle;
pub mod hooks;
pub mod site;
pub mod sync;

mod dialer;
mod event_loop;
mod registry;
mod wake;

pub use ack::{AckOutcome, AckStrategy, Lsn};
pub use config::ReplConfig;
pub use connection::{ConnId, ConnState};
pub use drain::DrainOutcome;
pub use error::{ReplError, Result};
pub use handle::{NetStats, ReplicationHandle};
pub use site::{SiteId, SiteStats};
