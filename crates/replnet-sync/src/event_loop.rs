//! The single-task dispatch loop.
//!
//! Exactly one task runs here per environment, and it is the only task that
//! performs socket I/O. Each iteration: sweep the registry and compute I/O
//! interest under the mutex, release the mutex, block once in the readiness
//! multiplexer, re-acquire, dispatch. Per-connection I/O errors are contained
//! as `Defunct` transitions; only multiplexer-level failures exit the loop.

use crate::config::ReplConfig;
use crate::connection::{ConnId, ConnState};
use crate::dialer;
use crate::error::Result;
use crate::handle::Shared;
use crate::hooks::{Protocol, RetryTimer};
use crate::wake::WakeChannel;
use futures::future;
use futures::stream::{FuturesUnordered, StreamExt};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{Interest, Ready};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

type ConnectFut = Pin<Box<dyn Future<Output = (ConnId, std::io::Result<TcpStream>)> + Send>>;

enum Wakeup {
    /// A peer socket matched its registered interest.
    Sock(ConnId, std::io::Result<Ready>),
    /// An in-flight connect attempt completed.
    Connect(ConnId, std::io::Result<TcpStream>),
    /// The listen socket has a pending inbound connection.
    Accept(std::io::Result<(TcpStream, std::net::SocketAddr)>),
    /// Another task interrupted the multiplexer.
    Woken,
    /// The retry timer deadline elapsed.
    Timer,
}

pub(crate) struct EventLoop {
    pub(crate) shared: Arc<Mutex<Shared>>,
    pub(crate) wake: Arc<WakeChannel>,
    pub(crate) cfg: ReplConfig,
    pub(crate) protocol: Arc<dyn Protocol>,
    pub(crate) retry: Arc<dyn RetryTimer>,
}

impl EventLoop {
    /// Runs until shutdown. Returns `Err` only for fatal multiplexer-level
    /// failures; the caller owns process-level shutdown from there.
    pub(crate) async fn run(self, listener: TcpListener) -> Result<()> {
        let mut connects: FuturesUnordered<ConnectFut> = FuturesUnordered::new();
        let mut read_buf = vec![0u8; self.cfg.read_buf_size];
        info!(addr = %listener.local_addr()?, "event loop started");

        loop {
            // Step 1: sweep, launch dials, compute interest.
            let (interests, deadline) = {
                let mut shared = self.shared.lock().await;
                if shared.finished {
                    break;
                }
                {
                    let Shared {
                        conns,
                        sites,
                        stats,
                        ..
                    } = &mut *shared;
                    conns.sweep_defunct(sites, stats);
                }
                self.launch_dials(&mut shared, &mut connects);
                let interests: Vec<(ConnId, Arc<TcpStream>, Interest)> = shared
                    .conns
                    .iter()
                    .filter_map(|c| Some((c.id, c.sock.clone()?, c.interest()?)))
                    .collect();
                // Step 2: nearest retry deadline, or block indefinitely.
                (interests, self.retry.next_deadline())
            };

            // Step 3: the one blocking point.
            let wakeup = tokio::select! {
                _ = self.wake.wait() => Wakeup::Woken,
                res = listener.accept() => Wakeup::Accept(res),
                Some((id, res)) = connects.next() => Wakeup::Connect(id, res),
                (id, res) = Self::next_ready(&interests) => Wakeup::Sock(id, res),
                _ = Self::sleep_until_opt(deadline) => Wakeup::Timer,
            };

            // Step 4: re-acquire and dispatch.
            let mut shared = self.shared.lock().await;
            if shared.finished {
                break;
            }
            match wakeup {
                Wakeup::Woken => {
                    // The payload was drained inside the wake channel; the
                    // next iteration recomputes interest from scratch.
                }
                Wakeup::Timer => {
                    for site_id in self.retry.on_deadline() {
                        if let Err(err) = dialer::start_dial(&mut shared, site_id) {
                            warn!(site_id, %err, "retry dial failed");
                        }
                    }
                }
                Wakeup::Connect(conn_id, result) => {
                    dialer::connect_finished(&mut shared, conn_id, result, &*self.protocol);
                }
                Wakeup::Accept(result) => {
                    let (stream, peer) = result?;
                    let conn_id = shared.conns.insert_inbound(Arc::new(stream));
                    shared.stats.accepted += 1;
                    info!(conn_id, %peer, "accepted inbound connection");
                }
                Wakeup::Sock(conn_id, result) => {
                    self.dispatch_socket(&mut shared, conn_id, result, &mut read_buf);
                }
            }
        }

        info!("event loop exited");
        Ok(())
    }

    /// Handles a readiness event for one connection. Errors never escape:
    /// they become a `Defunct` transition for that connection.
    fn dispatch_socket(
        &self,
        shared: &mut Shared,
        conn_id: ConnId,
        result: std::io::Result<Ready>,
        read_buf: &mut [u8],
    ) {
        let Some(conn) = shared.conns.get_mut(conn_id) else {
            return;
        };
        let ready = match result {
            Ok(ready) => ready,
            Err(err) => {
                warn!(conn_id, %err, "readiness poll failed");
                conn.mark_defunct();
                return;
            }
        };
        if ready.is_writable() {
            if let Err(err) = conn.flush(self.cfg.queue_limit) {
                warn!(conn_id, %err, "write failed");
                conn.mark_defunct();
            }
        }
        if ready.is_readable() && conn.state != ConnState::Defunct {
            let Some(sock) = conn.sock.clone() else {
                return;
            };
            match sock.try_read(read_buf) {
                Ok(0) => {
                    debug!(conn_id, "peer closed connection");
                    conn.mark_defunct();
                }
                Ok(n) => self.protocol.on_inbound(conn_id, &read_buf[..n]),
                Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(err) => {
                    warn!(conn_id, %err, "read failed");
                    conn.mark_defunct();
                }
            }
        }
    }

    /// Starts connect attempts for `Connecting` entries that are between
    /// candidate addresses.
    fn launch_dials(&self, shared: &mut Shared, connects: &mut FuturesUnordered<ConnectFut>) {
        let Shared {
            conns,
            sites,
            stats,
            ..
        } = shared;
        for conn in conns.iter_mut() {
            if conn.state != ConnState::Connecting || conn.dial_launched {
                continue;
            }
            let Some(site_id) = conn.site_id else {
                conn.mark_defunct();
                continue;
            };
            match sites.addr_at(site_id, conn.addr_idx) {
                Some(addr) => {
                    let addr = addr.to_string();
                    let conn_id = conn.id;
                    conn.dial_launched = true;
                    debug!(conn_id, site_id, %addr, "connect attempt started");
                    connects.push(Box::pin(async move {
                        (conn_id, TcpStream::connect(addr).await)
                    }));
                }
                None => {
                    // Registry entry raced ahead of the address list.
                    sites.record_connect_failure(site_id);
                    stats.connect_failures += 1;
                    conn.mark_defunct();
                }
            }
        }
    }

    /// Waits for the first connection matching its interest. Pends forever
    /// when there is nothing to watch.
    async fn next_ready(
        interests: &[(ConnId, Arc<TcpStream>, Interest)],
    ) -> (ConnId, std::io::Result<Ready>) {
        if interests.is_empty() {
            return future::pending().await;
        }
        let futs = interests.iter().map(|(id, sock, interest)| {
            let id = *id;
            let sock = Arc::clone(sock);
            let interest = *interest;
            Box::pin(async move { (id, sock.ready(interest).await) })
        });
        let ((id, res), _, _) = future::select_all(futs).await;
        (id, res)
    }

    async fn sleep_until_opt(deadline: Option<Instant>) {
        match deadline {
            Some(at) => tokio::time::sleep_until(at).await,
            None => future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_no_deadline_blocks_indefinitely() {
        let blocked =
            tokio::time::timeout(Duration::from_secs(60), EventLoop::sleep_until_opt(None)).await;
        assert!(blocked.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_interest_set_pends() {
        let blocked =
            tokio::time::timeout(Duration::from_secs(60), EventLoop::next_ready(&[])).await;
        assert!(blocked.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_fires() {
        let deadline = Some(Instant::now() + Duration::from_millis(5));
        EventLoop::sleep_until_opt(deadline).await;
    }
}
