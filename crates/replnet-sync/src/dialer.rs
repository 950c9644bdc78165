//! Outbound dialing with ordered address-list fallback.
//!
//! `start_dial` only creates the `Connecting` registry entry; the event loop
//! owns the actual connect attempts, one per candidate address, in list
//! order. Each address is tried exactly once per dial.

use crate::connection::{ConnId, ConnState};
use crate::error::{ReplError, Result};
use crate::handle::Shared;
use crate::hooks::Protocol;
use crate::site::SiteId;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Creates a `Connecting` entry for `site_id`, starting from the first
/// candidate address. The event loop picks it up on its next iteration.
pub(crate) fn start_dial(shared: &mut Shared, site_id: SiteId) -> Result<ConnId> {
    if shared.finished {
        return Err(ReplError::Shutdown);
    }
    let site = shared
        .sites
        .get(site_id)
        .ok_or(ReplError::UnknownSite { site_id })?;
    if site.addrs.is_empty() {
        return Err(ReplError::NoAddresses { site_id });
    }
    let conn_id = shared.conns.insert_outbound(site_id);
    debug!(conn_id, site_id, "dial scheduled");
    Ok(conn_id)
}

/// Completes one connect attempt.
///
/// Success installs the socket, moves the connection to `Connected`, and
/// queues the protocol layer's version proposal. Failure with candidate
/// addresses remaining arms a fresh attempt against the next one, with no
/// other cleanup; failure with the list exhausted counts a connect failure
/// and marks the connection defunct for the sweep.
pub(crate) fn connect_finished(
    shared: &mut Shared,
    conn_id: ConnId,
    result: std::io::Result<TcpStream>,
    protocol: &dyn Protocol,
) {
    let Shared {
        conns,
        sites,
        stats,
        ..
    } = shared;
    let Some(conn) = conns.get_mut(conn_id) else {
        return;
    };
    if conn.state != ConnState::Connecting {
        return;
    }
    let Some(site_id) = conn.site_id else {
        conn.mark_defunct();
        return;
    };
    match result {
        Ok(stream) => {
            conn.sock = Some(Arc::new(stream));
            conn.state = ConnState::Connected;
            conn.push_outbound(protocol.version_proposal(site_id));
            info!(conn_id, site_id, "peer connection established");
        }
        Err(err) => {
            let next = conn.addr_idx + 1;
            if sites.addr_at(site_id, next).is_some() {
                debug!(conn_id, site_id, %err, "connect failed, trying next address");
                conn.addr_idx = next;
                conn.dial_launched = false;
            } else {
                warn!(conn_id, site_id, %err, "connect failed, address list exhausted");
                sites.record_connect_failure(site_id);
                stats.connect_failures += 1;
                conn.mark_defunct();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReplConfig;
    use bytes::Bytes;

    struct StubProtocol;

    impl Protocol for StubProtocol {
        fn version_proposal(&self, _site_id: SiteId) -> Bytes {
            Bytes::from_static(b"v1")
        }

        fn on_inbound(&self, _conn_id: ConnId, _payload: &[u8]) {}
    }

    fn refused() -> std::io::Error {
        std::io::Error::from(std::io::ErrorKind::ConnectionRefused)
    }

    #[test]
    fn test_start_dial_unknown_site() {
        let mut shared = Shared::new(&ReplConfig::default(), None);
        assert!(matches!(
            start_dial(&mut shared, 3),
            Err(ReplError::UnknownSite { site_id: 3 })
        ));
    }

    #[test]
    fn test_start_dial_empty_address_list() {
        let mut shared = Shared::new(&ReplConfig::default(), None);
        let site = shared.sites.add(Vec::new());
        assert!(matches!(
            start_dial(&mut shared, site),
            Err(ReplError::NoAddresses { .. })
        ));
    }

    #[test]
    fn test_start_dial_during_shutdown() {
        let mut shared = Shared::new(&ReplConfig::default(), None);
        let site = shared.sites.add(vec!["a:1".into()]);
        shared.finished = true;
        assert!(matches!(
            start_dial(&mut shared, site),
            Err(ReplError::Shutdown)
        ));
    }

    #[test]
    fn test_failure_advances_through_address_list_in_order() {
        let mut shared = Shared::new(&ReplConfig::default(), None);
        let site = shared.sites.add(vec!["a:1".into(), "b:2".into(), "c:3".into()]);
        let conn_id = start_dial(&mut shared, site).unwrap();

        connect_finished(&mut shared, conn_id, Err(refused()), &StubProtocol);
        {
            let conn = shared.conns.get(conn_id).unwrap();
            assert_eq!(conn.state, ConnState::Connecting);
            assert_eq!(conn.addr_idx, 1);
            assert!(!conn.dial_launched);
        }

        connect_finished(&mut shared, conn_id, Err(refused()), &StubProtocol);
        assert_eq!(shared.conns.get(conn_id).unwrap().addr_idx, 2);

        // Third failure exhausts the list: failure counted, connection dead.
        connect_finished(&mut shared, conn_id, Err(refused()), &StubProtocol);
        assert_eq!(shared.conns.get(conn_id).unwrap().state, ConnState::Defunct);
        assert_eq!(shared.sites.get(site).unwrap().stats.connect_failures, 1);
        assert_eq!(shared.stats.connect_failures, 1);
    }

    #[tokio::test]
    async fn test_success_installs_socket_and_queues_proposal() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();

        let mut shared = Shared::new(&ReplConfig::default(), None);
        let site = shared.sites.add(vec!["unused:0".into()]);
        let conn_id = start_dial(&mut shared, site).unwrap();

        connect_finished(&mut shared, conn_id, Ok(stream), &StubProtocol);
        let conn = shared.conns.get(conn_id).unwrap();
        assert_eq!(conn.state, ConnState::Connected);
        assert!(conn.sock.is_some());
        assert_eq!(conn.outq_len, 1);
    }

    #[test]
    fn test_late_completion_for_removed_connection_is_ignored() {
        let mut shared = Shared::new(&ReplConfig::default(), None);
        connect_finished(&mut shared, 42, Err(refused()), &StubProtocol);
    }
}
