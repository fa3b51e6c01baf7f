//! Read-ahead cache telemetry.

use prometheus_client::metrics::counter::Counter;
use prometheus_client::registry::Registry;

/// Monotonic counters for the read-ahead cache.
///
/// Increments are relaxed atomic adds; the cache never reads these
/// under its lock. `Clone` shares the underlying counters, so a single
/// block can serve every vdev in the process.
#[derive(Debug, Clone, Default)]
pub struct ReadaheadStats {
    pub(crate) hits: Counter,
    pub(crate) misses: Counter,
    pub(crate) delegations: Counter,
}

impl ReadaheadStats {
    /// Register the counters under the `vdev_cache_stats` prefix.
    pub fn register(&self, registry: &mut Registry) {
        let sub = registry.sub_registry_with_prefix("vdev_cache_stats");
        sub.register(
            "hits",
            "Reads served synchronously from a resident cache line",
            self.hits.clone(),
        );
        sub.register(
            "misses",
            "Reads that allocated a cache line and issued a device fill",
            self.misses.clone(),
        );
        sub.register(
            "delegations",
            "Reads queued onto an already outstanding fill",
            self.delegations.clone(),
        );
    }

    /// Point-in-time copy of all three counters.
    #[must_use]
    pub fn snapshot(&self) -> ReadaheadCounters {
        ReadaheadCounters {
            hits: self.hits.get(),
            misses: self.misses.get(),
            delegations: self.delegations.get(),
        }
    }
}

/// Frozen view of [`ReadaheadStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadaheadCounters {
    pub hits: u64,
    pub misses: u64,
    pub delegations: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_share_on_clone() {
        let stats = ReadaheadStats::default();
        let alias = stats.clone();
        stats.hits.inc();
        alias.misses.inc();
        assert_eq!(
            stats.snapshot(),
            ReadaheadCounters {
                hits: 1,
                misses: 1,
                delegations: 0
            }
        );
    }

    #[test]
    fn registers_under_vdev_cache_prefix() {
        let mut registry = Registry::default();
        let stats = ReadaheadStats::default();
        stats.register(&mut registry);
        stats.delegations.inc();

        let mut out = String::new();
        prometheus_client::encoding::text::encode(&mut out, &registry).expect("encode");
        assert!(out.contains("vdev_cache_stats_hits_total"));
        assert!(out.contains("vdev_cache_stats_misses_total"));
        assert!(out.contains("vdev_cache_stats_delegations_total 1"));
    }
}
