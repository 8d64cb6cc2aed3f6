//! C4: the filter cache (§4.5) — cache for the body of deterministic
//! request→body filters (POST-style content transforms), keyed by
//! `(source_etag, user, address)` rather than by URI.
//!
//! Shares C1 (`ferron_rubber`), C2 (`ferron_cache::Cache`) and C3
//! (`ferron_cache::sink_into_rubber`) with [`ferron_http_cache::HttpCache`],
//! and is deliberately grounded on that crate's `lib.rs`: same tee-into-
//! rubber store path, same store timeout, same tag index, same `X-Cache`
//! stamping. What's dropped relative to the HTTP cache, per §4.5: no
//! conditional requests, no `Vary`, and the key scheme doesn't involve a
//! URI at all. What's added: the `eager_cache` content-hash header.

use std::rc::Rc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use ferron_cache::{Cache, SharedLease};
use ferron_common::istream::{tee, BytesSource, DynIstream, IstreamError};
use ferron_common::observability::{CacheCounters, CacheStats};
use ferron_common::resource::{ResourceAddress, ResourceLoader, StringMap};
use ferron_common::ByteSize;
use ferron_rubber::{AllocatorStats, RubberAllocation, RubberHandle};
use http::{HeaderValue, Method, StatusCode};

/// §6.1's hard-coded defaults, shared with the HTTP cache.
pub const DEFAULT_CACHEABLE_SIZE_LIMIT: u64 = 512 * 1024;
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_EXPIRE_INTERVAL: Duration = Duration::from_secs(60);

/// The generic `Cache`'s own retention backstop; the filter cache has no
/// HTTP-style freshness clock of its own (§4.5 names no expiry field), so
/// this is the only deadline a stored entry has.
const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// The header an `eager_cache`-configured filter cache stamps on a stored
/// response when upstream supplied no content-hash validator of its own.
pub const CONTENT_HASH_HEADER_NAME: &str = "x-content-hash";
pub const CACHE_HEADER_NAME: &str = "x-cache";

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct FilterCacheConfig {
    pub size: ByteSize,
    pub cacheable_size_limit: ByteSize,
    #[serde(with = "duration_secs")]
    pub store_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub ttl: Duration,
    /// §4.5 "Eager-cache flag": when set, a stored response that carries no
    /// content-hash header of its own gets one synthesized from the body.
    pub eager_cache: bool,
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

impl Default for FilterCacheConfig {
    fn default() -> Self {
        Self {
            size: ByteSize::bytes(64 * 1024 * 1024),
            cacheable_size_limit: ByteSize::bytes(DEFAULT_CACHEABLE_SIZE_LIMIT),
            store_timeout: DEFAULT_STORE_TIMEOUT,
            ttl: DEFAULT_TTL,
            eager_cache: false,
        }
    }
}

/// §3's `FilterCacheItem`: status + headers (the filter's own response
/// metadata) plus the body, held in a rubber allocation.
struct FilterCacheItem {
    status: StatusCode,
    headers: StringMap,
    body: Option<RubberAllocation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViaCache {
    Hit,
    Miss,
    Skip,
}

impl ViaCache {
    fn header_value(self) -> &'static str {
        match self {
            ViaCache::Hit => "HIT",
            ViaCache::Miss => "MISS",
            ViaCache::Skip => "SKIP",
        }
    }
}

pub struct ServedResponse {
    pub status: StatusCode,
    pub headers: StringMap,
    pub body: DynIstream,
}

impl ServedResponse {
    fn stamp(mut self, via: ViaCache) -> Self {
        self.headers
            .insert(CACHE_HEADER_NAME, HeaderValue::from_static(via.header_value()));
        self
    }
}

/// The filter cache (C4/§4.5). `!Send`, same single-threaded-event-loop
/// model as `HttpCache` (§5).
pub struct FilterCache {
    cache: Rc<Cache<String, FilterCacheItem>>,
    rubber: RubberHandle,
    config: FilterCacheConfig,
    loader: Rc<dyn ResourceLoader>,
    stats: Rc<CacheCounters>,
    stores: ferron_cache::InFlightStores,
}

impl FilterCache {
    pub fn new(config: FilterCacheConfig, loader: Rc<dyn ResourceLoader>) -> anyhow::Result<Self> {
        let rubber = RubberHandle::new(config.size.as_u64())?;
        Ok(Self {
            cache: Rc::new(Cache::new(config.size.as_u64())),
            rubber,
            config,
            loader,
            stats: Rc::new(CacheCounters::new()),
            stores: ferron_cache::InFlightStores::new(),
        })
    }

    /// Cancels every store still in flight (§4.8). Implied by `Drop`;
    /// exposed so a caller can shut a cache down without waiting for its
    /// last `Rc` to go away.
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

    pub fn flush_tag(&self, tag: &str) {
        self.cache.flush_tag(tag);
    }

    pub fn flush(&self) {
        self.cache.flush();
    }

    /// §4.5's key scheme: `source_etag | user | address_id`, `user`
    /// defaulting to empty. The address itself is folded in via its debug
    /// representation hashed to a fixed-width id — filter addresses don't
    /// carry the https/docroot discriminants `HttpCache` needs, since a
    /// filter transform has no virtual-host ambiguity of its own.
    fn cache_key(source_etag: &str, user: Option<&str>, address: &ResourceAddress) -> String {
        let address_id = xxhash_rust::xxh3::xxh3_64(format!("{address:?}").as_bytes());
        format!("{source_etag}|{}|{address_id:016x}", user.unwrap_or(""))
    }

    /// Runs the filter for `(source_etag, user, address)`, serving a
    /// cached body on a hit or invoking the filter (via `loader`, a POST
    /// with `body` as the request entity) on a miss.
    pub async fn handle(
        &self,
        source_etag: &str,
        user: Option<&str>,
        address: ResourceAddress,
        request_headers: StringMap,
        body: DynIstream,
    ) -> Result<ServedResponse, IstreamError> {
        let key = Self::cache_key(source_etag, user, &address);
        let now = Instant::now();

        if let Some(lease) = self.cache.get(&key, now) {
            self.stats.record_hit();
            return Ok(self.serve_hit(&lease));
        }

        self.stats.record_miss();
        let upstream = self
            .loader
            .send_request(Method::POST, &address, request_headers, Some(body))
            .await?;

        if !upstream.status.is_success() {
            self.stats.record_skip();
            return Ok(ServedResponse {
                status: upstream.status,
                headers: upstream.headers,
                body: upstream.body,
            }
            .stamp(ViaCache::Skip));
        }

        self.store_from_upstream(key, upstream.status, upstream.headers, upstream.body)
            .await
    }

    fn serve_hit(&self, lease: &SharedLease<String, FilterCacheItem>) -> ServedResponse {
        let item = lease.value();
        let body = item
            .body
            .as_ref()
            .map(|alloc| Bytes::copy_from_slice(&alloc.read()))
            .unwrap_or_default();
        ServedResponse {
            status: item.status,
            headers: item.headers.clone(),
            body: Box::new(BytesSource::new(body)),
        }
        .stamp(ViaCache::Hit)
    }

    async fn store_from_upstream(
        &self,
        key: String,
        status: StatusCode,
        headers: StringMap,
        body: DynIstream,
    ) -> Result<ServedResponse, IstreamError> {
        let (client_branch, store_branch) = tee(body);
        let rubber = self.rubber.clone();
        let limit = self.config.cacheable_size_limit.as_u64();
        let cache = self.cache.clone();
        let stats = self.stats.clone();
        let timeout = self.config.store_timeout;
        let ttl = self.config.ttl;
        let eager_cache = self.config.eager_cache;
        let mut headers_for_store = headers.clone();

        self.stores.spawn(async move {
            let Ok(outcome) = tokio::time::timeout(
                timeout,
                ferron_cache::sink_into_rubber(Box::new(store_branch), &rubber, limit),
            )
            .await
            else {
                stats.record_skip();
                return;
            };

            match outcome {
                ferron_cache::SinkOutcome::Done { allocation, size } => {
                    if eager_cache && !headers_for_store.contains_key(CONTENT_HASH_HEADER_NAME) {
                        let hash = allocation
                            .as_ref()
                            .map(|a| xxhash_rust::xxh3::xxh3_64(&a.read()))
                            .unwrap_or(0);
                        if let Ok(value) = HeaderValue::from_str(&format!("{hash:016x}")) {
                            headers_for_store.insert(CONTENT_HASH_HEADER_NAME, value);
                        }
                    }
                    let item = FilterCacheItem {
                        status,
                        headers: headers_for_store,
                        body: allocation,
                    };
                    let now = Instant::now();
                    cache.put(key, item, size, now + ttl, None, now);
                    stats.record_store();
                    tracing::debug!(size, "stored filtered body in rubber cache");
                }
                ferron_cache::SinkOutcome::TooLarge => {
                    stats.record_skip();
                    tracing::debug!(limit, "filtered body exceeded the cacheable size limit, not stored");
                }
                ferron_cache::SinkOutcome::OutOfMemory => {
                    stats.record_skip();
                    tracing::warn!("rubber allocator has no room left for a new filter-cache entry");
                }
                ferron_cache::SinkOutcome::Error(e) => {
                    stats.record_skip();
                    tracing::debug!(error = %e, "filter store branch failed before reaching eof");
                }
            }
        });

        Ok(ServedResponse {
            status,
            headers,
            body: Box::new(client_branch),
        }
        .stamp(ViaCache::Miss))
    }
}

impl Drop for FilterCache {
    fn drop(&mut self) {
        self.stores.cancel_all();
    }
}
