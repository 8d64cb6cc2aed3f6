//! C4: the encoding cache (§4.6) — the simplest of the three façades.
//! Keyed by an opaque content fingerprint (e.g. a hash of the original
//! payload plus the transform applied to it, such as gzip), it holds
//! nothing but a rubber allocation: no status, no headers, no Vary, no
//! conditional requests, no tag index.
//!
//! Grounded in the same C1/C2/C3 stack as
//! [`ferron_http_cache::HttpCache`] and `ferron_filter_cache::FilterCache`,
//! stripped to the bare minimum those two add on top of the generic
//! cache: a single `get`/`put` pair.

use std::rc::Rc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use ferron_cache::Cache;
use ferron_common::istream::{tee, BytesSource, DynIstream};
use ferron_common::observability::{CacheCounters, CacheStats};
use ferron_common::ByteSize;
use ferron_rubber::{AllocatorStats, RubberAllocation, RubberHandle};

/// §6.1: `encoding_cache.default_expires` = 7 days.
pub const DEFAULT_EXPIRES: Duration = Duration::from_secs(7 * 24 * 60 * 60);
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_EXPIRE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EncodingCacheConfig {
    pub size: ByteSize,
    #[serde(with = "duration_secs")]
    pub store_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub default_expires: Duration,
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

impl Default for EncodingCacheConfig {
    fn default() -> Self {
        Self {
            size: ByteSize::bytes(64 * 1024 * 1024),
            store_timeout: DEFAULT_STORE_TIMEOUT,
            default_expires: DEFAULT_EXPIRES,
        }
    }
}

/// §4.6's `StringWithHash`: an opaque fingerprint of "the content +
/// transformation", carrying both the original text (for debuggability,
/// e.g. in logs) and its 64-bit hash (the actual cache key material, so
/// hashing never happens twice on the hot path).
#[derive(Debug, Clone)]
pub struct Fingerprint {
    text: String,
    hash: u64,
}

impl Fingerprint {
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        let hash = xxhash_rust::xxh3::xxh3_64(text.as_bytes());
        Self { text, hash }
    }

    fn cache_key(&self) -> String {
        format!("{:016x}:{}", self.hash, self.text)
    }
}

/// The cached object: a rubber allocation only (§3: "Cached object is a
/// rubber allocation only (no headers, no status)").
struct EncodingItem {
    body: RubberAllocation,
}

/// The encoding cache (C4/§4.6). `!Send`, same single-threaded-event-loop
/// model as the other two façades (§5).
pub struct EncodingCache {
    cache: Rc<Cache<String, EncodingItem>>,
    rubber: RubberHandle,
    config: EncodingCacheConfig,
    stats: Rc<CacheCounters>,
    stores: ferron_cache::InFlightStores,
}

impl EncodingCache {
    pub fn new(config: EncodingCacheConfig) -> anyhow::Result<Self> {
        let rubber = RubberHandle::new(config.size.as_u64())?;
        Ok(Self {
            cache: Rc::new(Cache::new(config.size.as_u64())),
            rubber,
            config,
            stats: Rc::new(CacheCounters::new()),
            stores: ferron_cache::InFlightStores::new(),
        })
    }

    /// Cancels every store still in flight (§4.8); also run by `Drop`.
    pub fn shutdown(&self) {
        self.stores.cancel_all();
    }

    pub fn spawn_expiry_task(&self) -> tokio::task::JoinHandle<()> {
        self.cache.clone().spawn_expiry_task(DEFAULT_EXPIRE_INTERVAL)
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }

    pub fn allocator_stats(&self) -> AllocatorStats {
        self.rubber.get_stats()
    }

    pub fn flush(&self) {
        self.cache.flush();
    }

    /// A readable istream over the cached payload, or `None` on a miss.
    /// The bytes are copied out of the rubber region eagerly rather than
    /// handing back a borrowed view, so the returned stream doesn't need
    /// to keep a lease alive across `.await` points in the caller.
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<DynIstream> {
        let now = Instant::now();
        let lease = self.cache.get(&fingerprint.cache_key(), now)?;
        self.stats.record_hit();
        let bytes = Bytes::copy_from_slice(&lease.value().body.read());
        Some(Box::new(BytesSource::new(bytes)))
    }

    /// Tees `source` into a rubber-sink (bounded by `max_size`, timed out
    /// at `store_timeout`) and returns the original stream unchanged, per
    /// §4.6: "on put, tees into a rubber-sink and returns the original
    /// stream." The caller is never blocked on the store completing.
    pub fn put(&self, fingerprint: Fingerprint, source: DynIstream, max_size: u64) -> DynIstream {
        self.stats.record_miss();
        let (client_branch, store_branch) = tee(source);
        let rubber = self.rubber.clone();
        let cache = self.cache.clone();
        let stats = self.stats.clone();
        let timeout = self.config.store_timeout;
        let expires_in = self.config.default_expires;
        let key = fingerprint.cache_key();

        self.stores.spawn(async move {
            let Ok(outcome) = tokio::time::timeout(
                timeout,
                ferron_cache::sink_into_rubber(Box::new(store_branch), &rubber, max_size),
            )
            .await
            else {
                stats.record_skip();
                return;
            };

            match outcome {
                ferron_cache::SinkOutcome::Done {
                    allocation: Some(allocation),
                    size,
                } => {
                    let now = Instant::now();
                    cache.put(key, EncodingItem { body: allocation }, size, now + expires_in, None, now);
                    stats.record_store();
                    tracing::debug!(size, "stored encoded payload in rubber cache");
                }
                ferron_cache::SinkOutcome::Done { allocation: None, .. } => {
                    // An empty encoded payload is never worth a cache slot.
                    stats.record_skip();
                }
                ferron_cache::SinkOutcome::TooLarge => {
                    stats.record_skip();
                    tracing::debug!(max_size, "encoded payload exceeded the cacheable size limit, not stored");
                }
                ferron_cache::SinkOutcome::OutOfMemory => {
                    stats.record_skip();
                    tracing::warn!("rubber allocator has no room left for a new encoding-cache entry");
                }
                ferron_cache::SinkOutcome::Error(e) => {
                    stats.record_skip();
                    tracing::debug!(error = %e, "encoding store branch failed before reaching eof");
                }
            }
        });

        Box::new(client_branch)
    }
}

impl Drop for EncodingCache {
    fn drop(&mut self) {
        self.stores.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> EncodingCacheConfig {
        EncodingCacheConfig {
            size: ByteSize::bytes(1024 * 1024),
            ..EncodingCacheConfig::default()
        }
    }

    async fn drain(mut body: DynIstream) -> Bytes {
        let mut buf = Vec::new();
        while let Some(chunk) = body.read().await.unwrap() {
            buf.extend_from_slice(&chunk);
        }
        Bytes::from(buf)
    }

    async fn wait_for_store(cache: &EncodingCache, want: u64) {
        for _ in 0..1000 {
            if cache.stats().stores >= want {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("background store did not complete in time");
    }

    #[tokio::test]
    async fn get_is_a_miss_before_any_put() {
        tokio::task::LocalSet::new()
            .run_until(async {
                let cache = EncodingCache::new(small_config()).unwrap();
                assert!(cache.get(&Fingerprint::new("gzip:abc")).is_none());
                assert_eq!(cache.stats().misses, 0);
            })
            .await;
    }

    #[tokio::test]
    async fn put_returns_the_original_stream_and_populates_the_cache_in_the_background() {
        tokio::task::LocalSet::new()
            .run_until(async {
                let cache = EncodingCache::new(small_config()).unwrap();
                let fp = Fingerprint::new("gzip:abc");
                let source: DynIstream = Box::new(BytesSource::new(Bytes::from_static(b"compressed-bytes")));

                let passthrough = cache.put(fp.clone(), source, 1024);
                assert_eq!(drain(passthrough).await, Bytes::from_static(b"compressed-bytes"));

                wait_for_store(&cache, 1).await;
                let hit = cache.get(&fp).unwrap();
                assert_eq!(drain(hit).await, Bytes::from_static(b"compressed-bytes"));
                assert_eq!(cache.stats().hits, 1);
            })
            .await;
    }

    #[tokio::test]
    async fn distinct_fingerprints_never_collide() {
        tokio::task::LocalSet::new()
            .run_until(async {
                let cache = EncodingCache::new(small_config()).unwrap();
                let a = Fingerprint::new("gzip:abc");
                let b = Fingerprint::new("br:abc");

                let source: DynIstream = Box::new(BytesSource::new(Bytes::from_static(b"gzip-bytes")));
                drain(cache.put(a.clone(), source, 1024)).await;
                wait_for_store(&cache, 1).await;

                assert!(cache.get(&b).is_none());
                assert_eq!(drain(cache.get(&a).unwrap()).await, Bytes::from_static(b"gzip-bytes"));
            })
            .await;
    }

    #[tokio::test]
    async fn payload_over_the_limit_is_not_stored() {
        tokio::task::LocalSet::new()
            .run_until(async {
                let cache = EncodingCache::new(small_config()).unwrap();
                let fp = Fingerprint::new("gzip:big");
                let source: DynIstream = Box::new(BytesSource::new(Bytes::from(vec![0u8; 2048])));

                drain(cache.put(fp.clone(), source, 16)).await;

                for _ in 0..50 {
                    if cache.stats().skips >= 1 {
                        break;
                    }
                    tokio::task::yield_now().await;
                }
                assert_eq!(cache.stats().stores, 0);
                assert!(cache.get(&fp).is_none());
            })
            .await;
    }

    #[tokio::test]
    async fn flush_is_idempotent() {
        tokio::task::LocalSet::new()
            .run_until(async {
                let cache = EncodingCache::new(small_config()).unwrap();
                let fp = Fingerprint::new("gzip:abc");
                let source: DynIstream = Box::new(BytesSource::new(Bytes::from_static(b"bytes")));
                drain(cache.put(fp.clone(), source, 1024)).await;
                wait_for_store(&cache, 1).await;

                cache.flush();
                cache.flush();
                assert!(cache.get(&fp).is_none());
            })
            .await;
    }
}
