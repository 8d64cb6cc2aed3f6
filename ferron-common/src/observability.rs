//! Statistics surface (§6.2), shaped after `ferron_common::observability`'s
//! `Metric`/`MetricType`/`MetricValue` trio so a cache façade's counters can
//! be exported the same way the teacher exports request metrics, without
//! this crate depending on a concrete metrics backend (OTLP, log file, …).

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    Counter,
    Gauge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricValue {
    U64(u64),
}

#[derive(Debug, Clone)]
pub struct Metric {
    pub name: &'static str,
    pub kind: MetricType,
    pub value: MetricValue,
}

impl Metric {
    pub fn counter(name: &'static str, value: u64) -> Self {
        Self {
            name,
            kind: MetricType::Counter,
            value: MetricValue::U64(value),
        }
    }

    pub fn gauge(name: &'static str, value: u64) -> Self {
        Self {
            name,
            kind: MetricType::Gauge,
            value: MetricValue::U64(value),
        }
    }
}

/// Monotonic hit/miss/store/skip counters, common to all three cache
/// façades. Kept as plain atomics rather than behind a mutex: readers only
/// ever need an eventually-consistent snapshot for reporting.
#[derive(Debug, Default)]
pub struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
    skips: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub skips: u64,
}

impl CacheCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store(&self) {
        self.stores.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skip(&self) {
        self.skips.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stores: self.stores.load(Ordering::Relaxed),
            skips: self.skips.load(Ordering::Relaxed),
        }
    }

    pub fn as_metrics(&self) -> Vec<Metric> {
        let s = self.snapshot();
        vec![
            Metric::counter("cache_hits", s.hits),
            Metric::counter("cache_misses", s.misses),
            Metric::counter("cache_stores", s.stores),
            Metric::counter("cache_skips", s.skips),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recorded_events() {
        let counters = CacheCounters::new();
        counters.record_hit();
        counters.record_hit();
        counters.record_miss();
        counters.record_store();
        counters.record_skip();
        assert_eq!(
            counters.snapshot(),
            CacheStats {
                hits: 2,
                misses: 1,
                stores: 1,
                skips: 1,
            }
        );
    }
}
