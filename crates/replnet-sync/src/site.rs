//! Per-site metadata: ordered candidate address lists and connection
//! statistics.

/// Identifies a remote replica site.
pub type SiteId = u64;

/// Connection statistics for one site.
#[derive(Debug, Clone, Default)]
pub struct SiteStats {
    /// Dial attempts that exhausted the whole address list.
    pub connect_failures: u64,
    /// Established connections later dropped as defunct.
    pub drops: u64,
}

/// One remote site: an ordered list of candidate addresses, tried in list
/// order on each dial, plus counters.
#[derive(Debug, Clone)]
pub struct Site {
    /// Candidate `host:port` addresses, in fallback order.
    pub addrs: Vec<String>,
    /// Per-site connection counters.
    pub stats: SiteStats,
}

#[derive(Debug, Default)]
pub(crate) struct SiteTable {
    sites: Vec<Site>,
}

impl SiteTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registers a site; the returned id is stable for the table's lifetime.
    pub(crate) fn add(&mut self, addrs: Vec<String>) -> SiteId {
        let id = self.sites.len() as SiteId;
        self.sites.push(Site {
            addrs,
            stats: SiteStats::default(),
        });
        id
    }

    pub(crate) fn get(&self, site_id: SiteId) -> Option<&Site> {
        self.sites.get(site_id as usize)
    }

    /// The candidate address at position `idx`, or `None` once the list is
    /// exhausted.
    pub(crate) fn addr_at(&self, site_id: SiteId, idx: usize) -> Option<&str> {
        self.get(site_id)
            .and_then(|s| s.addrs.get(idx))
            .map(String::as_str)
    }

    pub(crate) fn record_connect_failure(&mut self, site_id: SiteId) {
        if let Some(site) = self.sites.get_mut(site_id as usize) {
            site.stats.connect_failures += 1;
        }
    }

    pub(crate) fn record_drop(&mut self, site_id: SiteId) {
        if let Some(site) = self.sites.get_mut(site_id as usize) {
            site.stats.drops += 1;
        }
    }
}
