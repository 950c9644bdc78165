//! Process-wide replication handle: lifecycle and the caller-facing API.

use crate::ack::{self, AckOutcome, AckWaiters, Lsn};
use crate::config::ReplConfig;
use crate::connection::{ConnId, ConnState};
use crate::dialer;
use crate::drain::{self, DrainOutcome};
use crate::error::{ReplError, Result};
use crate::event_loop::EventLoop;
use crate::hooks::{Durability, Protocol, RetryTimer};
use crate::registry::ConnRegistry;
use crate::site::{SiteId, SiteStats, SiteTable};
use crate::wake::WakeChannel;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::info;

/// Aggregate connection counters for one environment.
#[derive(Debug, Clone, Default)]
pub struct NetStats {
    /// Inbound connections accepted.
    pub accepted: u64,
    /// Dial attempts that exhausted a site's whole address list.
    pub connect_failures: u64,
    /// Connections removed as defunct.
    pub dropped: u64,
    /// Payloads accepted into outbound queues.
    pub enqueued: u64,
}

/// Everything guarded by the one shared mutex.
pub(crate) struct Shared {
    pub(crate) conns: ConnRegistry,
    pub(crate) sites: SiteTable,
    pub(crate) acks: AckWaiters,
    pub(crate) stats: NetStats,
    pub(crate) finished: bool,
    /// Held here between `init` and `run_event_loop`, which takes it.
    pub(crate) listener: Option<TcpListener>,
}

impl Shared {
    pub(crate) fn new(cfg: &ReplConfig, listener: Option<TcpListener>) -> Self {
        Self {
            conns: ConnRegistry::new(),
            sites: SiteTable::new(),
            acks: AckWaiters::new(cfg.ack_strategy),
            stats: NetStats::default(),
            finished: false,
            listener,
        }
    }
}

/// One replication environment's synchronization layer.
///
/// Cheap to clone; all clones share the same state. Many tasks may call the
/// waiting and dialing methods concurrently, but exactly one task must run
/// [`run_event_loop`](Self::run_event_loop), and dropping the last handle is
/// only valid once that task has exited.
#[derive(Clone)]
pub struct ReplicationHandle {
    shared: Arc<Mutex<Shared>>,
    wake: Arc<WakeChannel>,
    cfg: ReplConfig,
    durability: Arc<dyn Durability>,
    protocol: Arc<dyn Protocol>,
    retry: Arc<dyn RetryTimer>,
    local_addr: SocketAddr,
}

impl ReplicationHandle {
    /// Binds the listener and allocates every synchronization sub-resource.
    /// All-or-nothing: if anything fails, everything already built is
    /// released before the error returns.
    pub async fn init(
        cfg: ReplConfig,
        durability: Arc<dyn Durability>,
        protocol: Arc<dyn Protocol>,
        retry: Arc<dyn RetryTimer>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(&cfg.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        let shared = Arc::new(Mutex::new(Shared::new(&cfg, Some(listener))));
        info!(%local_addr, "replication handle initialized");
        Ok(Self {
            shared,
            wake: Arc::new(WakeChannel::new()),
            cfg,
            durability,
            protocol,
            retry,
            local_addr,
        })
    }

    /// The address the listener actually bound (useful with an ephemeral
    /// port).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Registers a remote site with its ordered candidate address list.
    pub async fn add_site(&self, addrs: Vec<String>) -> SiteId {
        self.shared.lock().await.sites.add(addrs)
    }

    /// Schedules an outbound connection to `site_id`. The event loop tries
    /// each of the site's addresses once, in list order; progress is visible
    /// through [`connection_state`](Self::connection_state) and the site's
    /// failure counter.
    pub async fn dial(&self, site_id: SiteId) -> Result<ConnId> {
        let conn_id = {
            let mut shared = self.shared.lock().await;
            dialer::start_dial(&mut shared, site_id)?
        };
        self.wake.signal();
        Ok(conn_id)
    }

    /// Appends a payload to a connection's outbound queue.
    ///
    /// There is no hard cap: a `Congested` connection still accepts
    /// payloads, and the queue may transiently exceed the limit. Callers
    /// that want backpressure call [`await_drain`](Self::await_drain) first.
    pub async fn enqueue(&self, conn_id: ConnId, payload: Bytes) -> Result<()> {
        {
            let mut shared = self.shared.lock().await;
            if shared.finished {
                return Err(ReplError::Shutdown);
            }
            let conn = shared
                .conns
                .get_mut(conn_id)
                .ok_or(ReplError::UnknownConnection { conn_id })?;
            if conn.state == ConnState::Defunct {
                return Err(ReplError::Unavailable);
            }
            conn.push_outbound(payload);
            shared.stats.enqueued += 1;
        }
        self.wake.signal();
        Ok(())
    }

    /// Blocks until `lsn` is acknowledged as permanent, using the configured
    /// `ack_timeout` (`Duration::ZERO` waits indefinitely).
    pub async fn await_ack(&self, lsn: Lsn) -> AckOutcome {
        self.await_ack_with(lsn, self.cfg.ack_timeout).await
    }

    /// [`await_ack`](Self::await_ack) with an explicit timeout.
    pub async fn await_ack_with(&self, lsn: Lsn, timeout: Duration) -> AckOutcome {
        ack::await_ack(&self.shared, &*self.durability, lsn, timeout).await
    }

    /// Wakes acknowledgment waiters whose LSN the durability predicate now
    /// reports permanent. Call after delivering an acknowledgment to the
    /// quorum tracker.
    pub async fn wake_waiting_ackers(&self) {
        let shared = self.shared.lock().await;
        shared
            .acks
            .wake_satisfied(&|lsn| self.durability.is_permanent(lsn));
    }

    /// Blocks while `conn_id`'s outbound queue is at or over the configured
    /// limit. A timeout marks the connection `Congested` and still returns
    /// [`DrainOutcome::Ready`].
    pub async fn await_drain(&self, conn_id: ConnId, timeout: Duration) -> DrainOutcome {
        drain::await_drain(&self.shared, conn_id, self.cfg.queue_limit, timeout).await
    }

    /// Records that the protocol handshake on `conn_id` finished, which lets
    /// flow control pause reads on it.
    pub async fn handshake_complete(&self, conn_id: ConnId) -> Result<()> {
        self.set_conn_flag(conn_id, |c| c.handshake_done = true).await
    }

    /// Pauses or resumes read interest on `conn_id`. Takes effect only once
    /// the handshake is complete.
    pub async fn pause_reads(&self, conn_id: ConnId, paused: bool) -> Result<()> {
        self.set_conn_flag(conn_id, |c| c.read_paused = paused).await
    }

    async fn set_conn_flag(
        &self,
        conn_id: ConnId,
        apply: impl FnOnce(&mut crate::connection::Connection),
    ) -> Result<()> {
        {
            let mut shared = self.shared.lock().await;
            let conn = shared
                .conns
                .get_mut(conn_id)
                .ok_or(ReplError::UnknownConnection { conn_id })?;
            apply(conn);
        }
        self.wake.signal();
        Ok(())
    }

    /// Current state of a connection, or `None` once the sweep removed it.
    pub async fn connection_state(&self, conn_id: ConnId) -> Option<ConnState> {
        self.shared.lock().await.conns.get(conn_id).map(|c| c.state)
    }

    /// Number of registry entries, in any state.
    pub async fn connection_count(&self) -> usize {
        self.shared.lock().await.conns.len()
    }

    /// Snapshot of the aggregate counters.
    pub async fn stats(&self) -> NetStats {
        self.shared.lock().await.stats.clone()
    }

    /// Snapshot of one site's counters.
    pub async fn site_stats(&self, site_id: SiteId) -> Option<SiteStats> {
        self.shared
            .lock()
            .await
            .sites
            .get(site_id)
            .map(|s| s.stats.clone())
    }

    /// Runs the event loop until shutdown. Must be called exactly once, from
    /// its own task. Returns `Err` only for fatal multiplexer failures.
    pub async fn run_event_loop(&self) -> Result<()> {
        let listener = self
            .shared
            .lock()
            .await
            .listener
            .take()
            .ok_or(ReplError::LoopRunning)?;
        let event_loop = EventLoop {
            shared: Arc::clone(&self.shared),
            wake: Arc::clone(&self.wake),
            cfg: self.cfg.clone(),
            protocol: Arc::clone(&self.protocol),
            retry: Arc::clone(&self.retry),
        };
        event_loop.run(listener).await
    }

    /// Begins cooperative shutdown: sets the finished flag and wakes every
    /// parked waiter and the event loop. Blocked callers return
    /// `Unavailable` within one wake cycle; the loop exits on its next
    /// iteration.
    pub async fn close(&self) {
        {
            let mut shared = self.shared.lock().await;
            shared.finished = true;
            shared.acks.wake_all();
            for conn in shared.conns.iter() {
                conn.drain.notify_waiters();
            }
        }
        self.wake.signal();
        info!("replication handle closing");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::NoRetry;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct NeverPermanent;

    impl Durability for NeverPermanent {
        fn is_permanent(&self, _lsn: Lsn) -> bool {
            false
        }
    }

    struct HighWater(AtomicU64);

    impl Durability for HighWater {
        fn is_permanent(&self, lsn: Lsn) -> bool {
            self.0.load(Ordering::SeqCst) >= lsn
        }
    }

    struct NullProtocol;

    impl Protocol for NullProtocol {
        fn version_proposal(&self, _site_id: SiteId) -> Bytes {
            Bytes::new()
        }

        fn on_inbound(&self, _conn_id: ConnId, _payload: &[u8]) {}
    }

    async fn test_handle(durability: Arc<dyn Durability>) -> ReplicationHandle {
        ReplicationHandle::init(
            ReplConfig::default(),
            durability,
            Arc::new(NullProtocol),
            Arc::new(NoRetry),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_init_binds_ephemeral_port() {
        let handle = test_handle(Arc::new(NeverPermanent)).await;
        assert_ne!(handle.local_addr().port(), 0);
    }

    #[tokio::test]
    async fn test_init_bind_failure_is_all_or_nothing() {
        let cfg = ReplConfig {
            listen_addr: "not-a-listen-address".to_string(),
            ..ReplConfig::default()
        };
        let res = ReplicationHandle::init(
            cfg,
            Arc::new(NeverPermanent),
            Arc::new(NullProtocol),
            Arc::new(NoRetry),
        )
        .await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn test_enqueue_unknown_connection() {
        let handle = test_handle(Arc::new(NeverPermanent)).await;
        let res = handle.enqueue(7, Bytes::from_static(b"x")).await;
        assert!(matches!(
            res,
            Err(ReplError::UnknownConnection { conn_id: 7 })
        ));
    }

    #[tokio::test]
    async fn test_enqueue_after_close_is_shutdown() {
        let handle = test_handle(Arc::new(NeverPermanent)).await;
        handle.close().await;
        let res = handle.enqueue(1, Bytes::from_static(b"x")).await;
        assert!(matches!(res, Err(ReplError::Shutdown)));
    }

    #[tokio::test]
    async fn test_enqueue_into_congested_connection_succeeds() {
        let handle = test_handle(Arc::new(NeverPermanent)).await;
        let conn_id = {
            let mut shared = handle.shared.lock().await;
            let site = shared.sites.add(vec!["peer:1".into()]);
            let id = shared.conns.insert_outbound(site);
            let conn = shared.conns.get_mut(id).unwrap();
            conn.state = ConnState::Congested;
            id
        };
        for _ in 0..20 {
            handle.enqueue(conn_id, Bytes::from_static(b"x")).await.unwrap();
        }
        // Well past the limit of 10: the cap is soft.
        let shared = handle.shared.lock().await;
        assert_eq!(shared.conns.get(conn_id).unwrap().outq_len, 20);
    }

    #[tokio::test]
    async fn test_close_releases_parked_acker() {
        let handle = test_handle(Arc::new(NeverPermanent)).await;
        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.await_ack_with(9, Duration::ZERO).await })
        };
        tokio::task::yield_now().await;
        handle.close().await;
        assert_eq!(waiter.await.unwrap(), AckOutcome::Unavailable);
    }

    #[tokio::test]
    async fn test_ack_roundtrip_through_handle() {
        let dur = Arc::new(HighWater(AtomicU64::new(0)));
        let handle = test_handle(dur.clone()).await;
        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.await_ack_with(4, Duration::ZERO).await })
        };
        tokio::task::yield_now().await;

        dur.0.store(4, Ordering::SeqCst);
        handle.wake_waiting_ackers().await;
        assert_eq!(waiter.await.unwrap(), AckOutcome::Acked);
    }

    #[tokio::test]
    async fn test_handshake_and_pause_flags() {
        let handle = test_handle(Arc::new(NeverPermanent)).await;
        let conn_id = {
            let mut shared = handle.shared.lock().await;
            let site = shared.sites.add(vec!["peer:1".into()]);
            shared.conns.insert_outbound(site)
        };
        handle.handshake_complete(conn_id).await.unwrap();
        handle.pause_reads(conn_id, true).await.unwrap();
        let shared = handle.shared.lock().await;
        let conn = shared.conns.get(conn_id).unwrap();
        assert!(conn.handshake_done);
        assert!(conn.read_paused);
    }
}
