//! One peer link: socket, state machine, and outbound queue.

use crate::site::SiteId;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::io::Interest;
use tokio::net::TcpStream;
use tokio::sync::Notify;

/// Identifies one connection in the registry.
pub type ConnId = u64;

/// Connection lifecycle states.
///
/// `Connecting -> Connected -> {Congested <-> Connected} -> Defunct`, with a
/// direct `Connecting -> Defunct` edge when every candidate address fails.
/// `Defunct` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Outbound dial in progress.
    Connecting,
    /// Link established, normal flow.
    Connected,
    /// A drain wait timed out on this connection. Only affects the producer
    /// side's willingness to enqueue; the event loop's I/O handling is
    /// unchanged, and a completed write that brings the queue back under the
    /// limit returns the connection to `Connected`.
    Congested,
    /// Dead; pending removal by the event loop's sweep.
    Defunct,
}

#[derive(Debug)]
pub(crate) struct OutBuf {
    data: Bytes,
    off: usize,
}

/// A peer connection. All fields are guarded by the shared mutex; the socket
/// is additionally touched lock-free by the event loop mid-I/O, which is safe
/// because no other task ever performs I/O on it.
#[derive(Debug)]
pub(crate) struct Connection {
    pub(crate) id: ConnId,
    /// `None` for inbound links until the protocol layer identifies them.
    pub(crate) site_id: Option<SiteId>,
    pub(crate) state: ConnState,
    pub(crate) sock: Option<Arc<TcpStream>>,
    outq: VecDeque<OutBuf>,
    pub(crate) outq_len: usize,
    /// Signaled whenever `outq_len` decreases or the connection dies.
    pub(crate) drain: Arc<Notify>,
    pub(crate) handshake_done: bool,
    pub(crate) read_paused: bool,
    /// Index of the candidate address the current dial attempt targets.
    pub(crate) addr_idx: usize,
    /// True while a connect future for `addr_idx` is in flight.
    pub(crate) dial_launched: bool,
}

impl Connection {
    pub(crate) fn outbound(id: ConnId, site_id: SiteId) -> Self {
        Self {
            id,
            site_id: Some(site_id),
            state: ConnState::Connecting,
            sock: None,
            outq: VecDeque::new(),
            outq_len: 0,
            drain: Arc::new(Notify::new()),
            handshake_done: false,
            read_paused: false,
            addr_idx: 0,
            dial_launched: false,
        }
    }

    pub(crate) fn inbound(id: ConnId, sock: Arc<TcpStream>) -> Self {
        Self {
            id,
            site_id: None,
            state: ConnState::Connected,
            sock: Some(sock),
            outq: VecDeque::new(),
            outq_len: 0,
            drain: Arc::new(Notify::new()),
            handshake_done: false,
            read_paused: false,
            addr_idx: 0,
            dial_launched: false,
        }
    }

    /// Appends a payload to the outbound queue. Insertion order is send
    /// order. There is no hard cap: a congested connection still accepts
    /// payloads, only the drain wait gates production.
    pub(crate) fn push_outbound(&mut self, data: Bytes) {
        self.outq.push_back(OutBuf { data, off: 0 });
        self.outq_len += 1;
    }

    /// Marks the connection dead and releases anyone parked in a drain wait.
    /// Idempotent; the state transition happens at most once.
    pub(crate) fn mark_defunct(&mut self) {
        if self.state != ConnState::Defunct {
            self.state = ConnState::Defunct;
            self.drain.notify_waiters();
        }
    }

    /// I/O interest for the next multiplexer wait, or `None` when the
    /// connection has no socket to watch.
    ///
    /// Write interest iff the outbound queue is non-empty; read interest
    /// unless flow control paused reads on a connection whose handshake has
    /// completed.
    pub(crate) fn interest(&self) -> Option<Interest> {
        if self.state == ConnState::Defunct || self.sock.is_none() {
            return None;
        }
        let mut interest: Option<Interest> = None;
        if self.outq_len > 0 {
            interest = Some(Interest::WRITABLE);
        }
        if !(self.read_paused && self.handshake_done) {
            interest = Some(match interest {
                Some(i) => i.add(Interest::READABLE),
                None => Interest::READABLE,
            });
        }
        interest
    }

    /// Writes queued buffers until the socket would block or the queue is
    /// empty, resuming partial writes where they left off. Every completed
    /// buffer decrements `outq_len` and signals the drain cond; dropping back
    /// under `queue_limit` clears `Congested`.
    ///
    /// Returns the number of buffers fully written. Only the event loop may
    /// call this.
    pub(crate) fn flush(&mut self, queue_limit: usize) -> std::io::Result<usize> {
        let Some(sock) = self.sock.clone() else {
            return Ok(0);
        };
        let mut completed = 0;
        while let Some(front) = self.outq.front_mut() {
            let chunk = &front.data[front.off..];
            if chunk.is_empty() {
                self.outq.pop_front();
                self.outq_len -= 1;
                self.drain.notify_waiters();
                completed += 1;
                continue;
            }
            match sock.try_write(chunk) {
                // Zero bytes accepted for a non-empty chunk: the write side
                // is gone, and the queue can never drain.
                Ok(0) => return Err(std::io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    front.off += n;
                    if front.off == front.data.len() {
                        self.outq.pop_front();
                        self.outq_len -= 1;
                        self.drain.notify_waiters();
                        completed += 1;
                    }
                }
                Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(err),
            }
        }
        if self.state == ConnState::Congested && self.outq_len < queue_limit {
            self.state = ConnState::Connected;
        }
        Ok(completed)
    }
}
