use std::sync::atomic::{AtomicU64, Ordering};

/// Outcome counters of one mediator.
#[derive(Debug, Default)]
pub struct MediatorStats {
    hits: AtomicU64,
    misses: AtomicU64,
    reincarnations: AtomicU64,
    stored: AtomicU64,
    oversized: AtomicU64,
    replication_failures: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub reincarnations: u64,
    pub stored: u64,
    pub oversized: u64,
    pub replication_failures: u64,
}

impl MediatorStats {
    pub(crate) fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn reincarnation(&self) {
        self.reincarnations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn stored(&self) {
        self.stored.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn oversized(&self) {
        self.oversized.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn replication_failure(&self) {
        self.replication_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            reincarnations: self.reincarnations.load(Ordering::Relaxed),
            stored: self.stored.load(Ordering::Relaxed),
            oversized: self.oversized.load(Ordering::Relaxed),
            replication_failures: self.replication_failures.load(Ordering::Relaxed),
        }
    }
}

impl StatsSnapshot {
    pub fn to_json(&self) -> String {
        format!(
            "{{\"hits\":{},\"misses\":{},\"reincarnations\":{},\"stored\":{},\"oversized\":{},\"replication_failures\":{},\"hit_ratio\":{:.4}}}",
            self.hits,
            self.misses,
            self.reincarnations,
            self.stored,
            self.oversized,
            self.replication_failures,
            self.hit_ratio()
        )
    }

    /// Hits over lookups, 0.0 before the first lookup.
    pub fn hit_ratio(&self) -> f64 {
        let lookups = self.hits + self.misses + self.reincarnations;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_ratio_counts_reincarnations_as_lookups() {
        let stats = MediatorStats::default();
        assert_eq!(stats.snapshot().hit_ratio(), 0.0);
        stats.hit();
        stats.miss();
        stats.reincarnation();
        stats.hit();
        let snap = stats.snapshot();
        assert_eq!(snap.hits, 2);
        assert_eq!(snap.hit_ratio(), 0.5);
    }

    #[test]
    fn snapshot_renders_as_json() {
        let stats = MediatorStats::default();
        stats.hit();
        stats.miss();
        stats.stored();
        assert_eq!(
            stats.snapshot().to_json(),
            "{\"hits\":1,\"misses\":1,\"reincarnations\":0,\"stored\":1,\"oversized\":0,\"replication_failures\":0,\"hit_ratio\":0.5000}"
        );
    }
}
