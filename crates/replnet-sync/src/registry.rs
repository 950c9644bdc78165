//! Connection registry: id allocation, lookup, and the defunct sweep.
//!
//! Single-writer rule: any task may insert (dial, accept), but only the
//! event loop removes entries, via [`ConnRegistry::sweep_defunct`].

use crate::connection::{ConnId, ConnState, Connection};
use crate::handle::NetStats;
use crate::site::SiteTable;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::debug;

#[derive(Debug, Default)]
pub(crate) struct ConnRegistry {
    conns: HashMap<ConnId, Connection>,
    next_id: ConnId,
}

impl ConnRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert_outbound(&mut self, site_id: crate::site::SiteId) -> ConnId {
        let id = self.alloc_id();
        self.conns.insert(id, Connection::outbound(id, site_id));
        id
    }

    pub(crate) fn insert_inbound(&mut self, sock: Arc<TcpStream>) -> ConnId {
        let id = self.alloc_id();
        self.conns.insert(id, Connection::inbound(id, sock));
        id
    }

    fn alloc_id(&mut self) -> ConnId {
        self.next_id += 1;
        self.next_id
    }

    pub(crate) fn get(&self, id: ConnId) -> Option<&Connection> {
        self.conns.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.conns.get_mut(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.conns.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.conns.values()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.conns.values_mut()
    }

    /// Removes every defunct connection, releasing its socket exactly once
    /// and waking any producer still parked on its drain cond. Returns the
    /// number removed.
    pub(crate) fn sweep_defunct(&mut self, sites: &mut SiteTable, stats: &mut NetStats) -> usize {
        let dead: Vec<ConnId> = self
            .conns
            .iter()
            .filter(|(_, c)| c.state == ConnState::Defunct)
            .map(|(id, _)| *id)
            .collect();
        let removed = dead.len();
        for id in dead {
            if let Some(mut conn) = self.conns.remove(&id) {
                conn.sock = None;
                conn.drain.notify_waiters();
                if let Some(site_id) = conn.site_id {
                    sites.record_drop(site_id);
                }
                stats.dropped += 1;
                debug!(conn_id = id, "removed defunct connection");
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        let mut reg = ConnRegistry::new();
        let a = reg.insert_outbound(0);
        let b = reg.insert_outbound(0);
        assert_ne!(a, b);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_sweep_removes_only_defunct() {
        let mut reg = ConnRegistry::new();
        let mut sites = SiteTable::new();
        let site = sites.add(vec!["a:1".into()]);
        let mut stats = NetStats::default();

        let alive = reg.insert_outbound(site);
        let dead = reg.insert_outbound(site);
        reg.get_mut(dead).unwrap().mark_defunct();

        assert_eq!(reg.sweep_defunct(&mut sites, &mut stats), 1);
        assert!(reg.get(alive).is_some());
        assert!(reg.get(dead).is_none());
        assert_eq!(stats.dropped, 1);
        assert_eq!(sites.get(site).unwrap().stats.drops, 1);
    }

    #[test]
    fn test_sweep_is_exactly_once() {
        let mut reg = ConnRegistry::new();
        let mut sites = SiteTable::new();
        let site = sites.add(vec!["a:1".into()]);
        let mut stats = NetStats::default();

        let dead = reg.insert_outbound(site);
        reg.get_mut(dead).unwrap().mark_defunct();

        assert_eq!(reg.sweep_defunct(&mut sites, &mut stats), 1);
        assert_eq!(reg.sweep_defunct(&mut sites, &mut stats), 0);
        assert_eq!(stats.dropped, 1);
    }
}
