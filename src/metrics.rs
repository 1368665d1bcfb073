//! Prometheus metrics
//!
//! Gauges over the caches, allocators and the session store.  The values
//! are sampled at scrape time from the live structures, so nothing on
//! the request path touches a counter.

use crate::instance::Instance;
use prometheus::{Encoder, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use tracing::warn;

pub struct RelayMetrics {
    registry: Registry,

    cache_entries: IntGaugeVec,
    cache_bytes: IntGaugeVec,
    cache_hits: IntGaugeVec,
    cache_misses: IntGaugeVec,

    allocator_brutto: IntGaugeVec,
    allocator_netto: IntGaugeVec,

    sessions: IntGauge,
}

impl RelayMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let cache_entries = IntGaugeVec::new(
            Opts::new("relay_cache_entries", "Number of cached items"),
            &["cache"],
        )
        .unwrap();
        let cache_bytes = IntGaugeVec::new(
            Opts::new("relay_cache_bytes", "Bytes charged against the cache budget"),
            &["cache"],
        )
        .unwrap();
        let cache_hits = IntGaugeVec::new(
            Opts::new("relay_cache_hits_total", "Cache lookup hits"),
            &["cache"],
        )
        .unwrap();
        let cache_misses = IntGaugeVec::new(
            Opts::new("relay_cache_misses_total", "Cache lookup misses"),
            &["cache"],
        )
        .unwrap();
        let allocator_brutto = IntGaugeVec::new(
            Opts::new("relay_allocator_brutto_bytes", "Mapped allocator bytes"),
            &["allocator"],
        )
        .unwrap();
        let allocator_netto = IntGaugeVec::new(
            Opts::new("relay_allocator_netto_bytes", "Live allocator bytes"),
            &["allocator"],
        )
        .unwrap();
        let sessions =
            IntGauge::new("relay_sessions", "Sessions currently in memory").unwrap();

        for collector in [
            &cache_entries,
            &cache_bytes,
            &cache_hits,
            &cache_misses,
            &allocator_brutto,
            &allocator_netto,
        ] {
            registry.register(Box::new(collector.clone())).unwrap();
        }
        registry.register(Box::new(sessions.clone())).unwrap();

        Self {
            registry,
            cache_entries,
            cache_bytes,
            cache_hits,
            cache_misses,
            allocator_brutto,
            allocator_netto,
            sessions,
        }
    }

    fn sample_cache(&self, name: &str, stats: crate::cache::CacheStats) {
        self.cache_entries
            .with_label_values(&[name])
            .set(stats.entries as i64);
        self.cache_bytes
            .with_label_values(&[name])
            .set(stats.bytes as i64);
        self.cache_hits
            .with_label_values(&[name])
            .set(stats.hits as i64);
        self.cache_misses
            .with_label_values(&[name])
            .set(stats.misses as i64);
    }

    /// Sample the instance and render the text exposition format
    pub fn render(&self, instance: &Instance) -> String {
        self.sample_cache("http", instance.http_cache.stats());
        self.sample_cache("filter", instance.filter_cache.stats());
        self.sample_cache("translate", instance.translate_cache.stats());
        if let Some(nfs) = &instance.nfs_cache {
            self.sample_cache("nfs", nfs.stats());
        }

        let slice_stats = instance.slice_pool.stats();
        self.allocator_brutto
            .with_label_values(&["slice_pool"])
            .set(slice_stats.brutto_size as i64);
        self.allocator_netto
            .with_label_values(&["slice_pool"])
            .set(slice_stats.netto_size as i64);
        self.allocator_brutto
            .with_label_values(&["rubber"])
            .set(instance.rubber.brutto_size() as i64);
        self.allocator_netto
            .with_label_values(&["rubber"])
            .set(instance.rubber.netto_size() as i64);

        self.sessions.set(instance.sessions.count() as i64);

        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            warn!("metrics encoding failed: {}", e);
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::new()
    }
}
