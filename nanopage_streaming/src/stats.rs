use std::ops::AddAssign;

/// Counters of a single update.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleStats {
    /// Page requests decoded from readback and explicit requests
    pub requests: u32,
    pub unique_requests: u32,
    pub stale_requests: u32,
    /// Requests for pages that were already registered
    pub hits: u32,
    pub selected: u32,
    pub installed: u32,
    pub evicted: u32,
    pub io_failures: u32,
    pub decompress_failures: u32,
    /// Requests or selections dropped because an update budget ran out
    pub budget_drops: u32,
    pub fixups_applied: u32,
    pub fixups_deferred: u32,
}

impl AddAssign for CycleStats {
    fn add_assign(&mut self, rhs: Self) {
        self.requests += rhs.requests;
        self.unique_requests += rhs.unique_requests;
        self.stale_requests += rhs.stale_requests;
        self.hits += rhs.hits;
        self.selected += rhs.selected;
        self.installed += rhs.installed;
        self.evicted += rhs.evicted;
        self.io_failures += rhs.io_failures;
        self.decompress_failures += rhs.decompress_failures;
        self.budget_drops += rhs.budget_drops;
        self.fixups_applied += rhs.fixups_applied;
        self.fixups_deferred += rhs.fixups_deferred;
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StreamingStats {
    /// Most recent update
    pub cycle: CycleStats,
    /// Every finished update, the current one excluded
    pub totals: CycleStats,
    pub cycles: u64,
    pub pending: u32,
    pub registered: u32,
    pub resources: u32,
}

impl StreamingStats {
    pub fn begin_cycle(&mut self) {
        self.totals += self.cycle;
        self.cycle = CycleStats::default();
        self.cycles += 1;
    }

    /// Running totals including the current update.
    pub fn lifetime(&self) -> CycleStats {
        let mut lifetime = self.totals;
        lifetime += self.cycle;
        lifetime
    }
}
