//! C4: the RFC-9111-style HTTP response cache. Orchestrates C1 (`ferron_rubber`),
//! C2 (`ferron_cache::Cache`) and C3 (`ferron_cache::sink_into_rubber`) behind
//! the request/response flow described in §4.4, using the pure C5 helpers
//! in [`rfc`] for every cacheability/freshness/conditional decision.
//!
//! One deliberate layering choice, not spelled out verbatim in §3/§4.2:
//! the generic `Cache`'s own `expires` deadline and the *HTTP* freshness
//! deadline are different things. §3's data model stores an HTTP expiry
//! timestamp *inside* `HttpCacheDocument` ("info: expiry timestamp, etag,
//! last_modified..."), separate from `CacheItem::expires`. If the two were
//! the same field, a stale-but-still-useful entry (the one revalidation
//! needs to read `ETag`/`Last-Modified` from) would already be gone by the
//! time `Cache::get_match` ran, since "on expiry, evict synchronously" is
//! unconditional there. So `Cache`'s own deadline is a generous retention
//! backstop (`GENERIC_SAFETY_TTL`), and `HttpCache` checks real HTTP
//! freshness itself, inside this module, by comparing
//! `HttpCacheDocument.expires` against the wall clock on every hit.

pub mod rfc;

use std::rc::Rc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use ferron_cache::{Cache, SharedLease};
use ferron_common::istream::{BytesSource, DynIstream, IstreamError};
use ferron_common::observability::{CacheCounters, CacheStats};
use ferron_common::resource::{ResourceAddress, ResourceLoader, StringMap, UpstreamResponse};
use ferron_common::{ByteSize, Clock};
use ferron_rubber::{AllocatorStats, RubberAllocation, RubberHandle};
use http::{HeaderValue, Method, StatusCode};
use rfc::HttpCacheResponseInfo;

/// A generous backstop TTL for the generic `Cache`'s own eviction clock,
/// independent of HTTP freshness (see the module doc comment).
const GENERIC_SAFETY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// §6.1's hard-coded defaults.
pub const DEFAULT_CACHEABLE_SIZE_LIMIT: u64 = 512 * 1024;
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_EXPIRE_INTERVAL: Duration = Duration::from_secs(60);

/// The `X-Cache` response header this façade stamps on every response it
/// touches (renamed from the teacher's `X-Ferron-Cache` to stay generic
/// across the three façades in this workspace).
pub const CACHE_HEADER_NAME: &str = "x-cache";

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct HttpCacheConfig {
    pub size: ByteSize,
    pub obey_no_cache: bool,
    pub cacheable_size_limit: ByteSize,
    #[serde(with = "duration_secs")]
    pub store_timeout: Duration,
    /// On a successful (2xx) response to an unsafe method, additionally
    /// flush this tag (§4.4's "auto_flush_cache mode"). `None` disables it.
    pub auto_flush_tag: Option<String>,
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

impl Default for HttpCacheConfig {
    fn default() -> Self {
        Self {
            size: ByteSize::bytes(64 * 1024 * 1024),
            obey_no_cache: true,
            cacheable_size_limit: ByteSize::bytes(DEFAULT_CACHEABLE_SIZE_LIMIT),
            store_timeout: DEFAULT_STORE_TIMEOUT,
            auto_flush_tag: None,
        }
    }
}

/// §3's `HttpCacheDocument`: the cached representation plus everything the
/// evaluator needs to judge freshness and conditional requests on a later
/// lookup.
struct HttpCacheDocument {
    status: StatusCode,
    response_headers: StringMap,
    etag: Option<String>,
    last_modified: Option<std::time::SystemTime>,
    vary: std::collections::BTreeMap<String, HeaderValue>,
    expires: std::time::SystemTime,
    body: Option<RubberAllocation>,
}

/// Which path served a response, surfaced both via the `X-Cache` header
/// and via `CacheCounters`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViaCache {
    Hit,
    Miss,
    Stale,
    Bypass,
}

impl ViaCache {
    fn header_value(self) -> &'static str {
        match self {
            ViaCache::Hit => "HIT",
            ViaCache::Miss => "MISS",
            ViaCache::Stale => "STALE",
            ViaCache::Bypass => "BYPASS",
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

    fn from_upstream(upstream: UpstreamResponse, via: ViaCache) -> Self {
        Self {
            status: upstream.status,
            headers: upstream.headers,
            body: upstream.body,
        }
        .stamp(via)
    }

    fn synthetic(status: StatusCode, headers: StringMap, via: ViaCache) -> Self {
        Self {
            status,
            headers,
            body: Box::new(BytesSource::new(Bytes::new())),
        }
        .stamp(via)
    }

    fn buffered(status: StatusCode, headers: StringMap, body: Bytes, via: ViaCache) -> Self {
        Self {
            status,
            headers,
            body: Box::new(BytesSource::new(body)),
        }
        .stamp(via)
    }
}

/// The RFC-9111-style HTTP response cache (C4). `!Send`: owns an `Rc`-keyed
/// `Cache`, matching §5's single-threaded event-loop model. A server using
/// this façade drives it from a `tokio::task::LocalSet`.
pub struct HttpCache {
    cache: Rc<Cache<String, HttpCacheDocument>>,
    rubber: RubberHandle,
    config: HttpCacheConfig,
    clock: Rc<dyn Clock>,
    loader: Rc<dyn ResourceLoader>,
    stats: Rc<CacheCounters>,
    stores: ferron_cache::InFlightStores,
}

impl HttpCache {
    pub fn new(config: HttpCacheConfig, clock: Rc<dyn Clock>, loader: Rc<dyn ResourceLoader>) -> anyhow::Result<Self> {
        let rubber = RubberHandle::new(config.size.as_u64())?;
        Ok(Self {
            cache: Rc::new(Cache::new(config.size.as_u64())),
            rubber,
            config,
            clock,
            loader,
            stats: Rc::new(CacheCounters::new()),
            stores: ferron_cache::InFlightStores::new(),
        })
    }

    /// Cancels every store still in flight (§4.8). Safe to call more than
    /// once, and implied by `Drop` — callers that want the cache gone
    /// immediately rather than waiting for its last `Rc` to drop can call
    /// this explicitly first.
    pub fn shutdown(&self) {
        self.stores.cancel_all();
    }

    /// Starts the periodic expiry sweep (§4.2). Must be called from inside
    /// a `tokio::task::LocalSet`.
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

    /// §4.4's key scheme: a string plus a 64-bit hash, the hash keeping the
    /// hot path (`hashlink`'s own hashing of the `String` key) cheap to
    /// compute while the literal text stays around for debuggability. The
    /// raw discriminant folds in the `https` flag and a docroot hash for
    /// the local-HTTP address variant, so disjoint virtual hosts sharing
    /// one upstream don't collide. `Pipe`/`Local` addresses, and raw
    /// discriminants over 8 KiB, bypass the cache entirely.
    fn cache_key(address: &ResourceAddress) -> Option<String> {
        if !address.is_cacheable_kind() {
            return None;
        }
        let raw = match address {
            ResourceAddress::Http { uri } => uri.clone(),
            ResourceAddress::LocalHttp {
                uri,
                https,
                docroot_hash,
            } => format!("{uri}#{https}:{docroot_hash:016x}"),
            ResourceAddress::Pipe { .. } | ResourceAddress::Local { .. } => unreachable!(),
        };
        if raw.len() > 8192 {
            return None;
        }
        let hash = xxhash_rust::xxh3::xxh3_64(raw.as_bytes());
        Some(format!("{hash:016x}:{raw}"))
    }

    pub async fn handle(
        &self,
        method: Method,
        address: ResourceAddress,
        request_headers: StringMap,
    ) -> Result<ServedResponse, IstreamError> {
        if rfc::request_invalidate(&method) {
            return self.handle_invalidating(method, address, request_headers).await;
        }

        let Some(key) = Self::cache_key(&address) else {
            self.stats.record_skip();
            return self.forward(method, &address, request_headers, ViaCache::Bypass).await;
        };

        let Some(request_info) = rfc::request_evaluate(&method, &request_headers, false, self.config.obey_no_cache)
        else {
            self.stats.record_skip();
            return self.forward(method, &address, request_headers, ViaCache::Bypass).await;
        };

        let wall_now = self.clock.wall_now();
        let steady_now = self.clock.steady_now();

        let hit = if request_info.no_cache {
            None
        } else {
            self.cache
                .get_match(&key, steady_now, |doc| rfc::vary_fits(&doc.vary, &request_headers))
        };

        if let Some(lease) = hit {
            let fresh = lease.value().expires > wall_now;
            if fresh {
                let response = self.serve_fresh(&lease, &request_info);
                self.stats.record_hit();
                return Ok(response);
            }
            return self.revalidate(key, lease, method, address, request_headers).await;
        }

        self.stats.record_miss();
        if request_info.only_if_cached {
            return Ok(ServedResponse::synthetic(
                StatusCode::GATEWAY_TIMEOUT,
                StringMap::new(),
                ViaCache::Miss,
            ));
        }

        self.fetch_and_store(key, method, address, request_headers).await
    }

    async fn handle_invalidating(
        &self,
        method: Method,
        address: ResourceAddress,
        request_headers: StringMap,
    ) -> Result<ServedResponse, IstreamError> {
        if let Some(key) = Self::cache_key(&address) {
            self.cache.remove(&key);
        }
        let upstream = self.loader.send_request(method, &address, request_headers, None).await?;
        let status = upstream.status;
        let response = ServedResponse::from_upstream(upstream, ViaCache::Miss);
        if status.is_success() {
            if let Some(tag) = &self.config.auto_flush_tag {
                self.cache.flush_tag(tag);
            }
        }
        Ok(response)
    }

    async fn forward(
        &self,
        method: Method,
        address: &ResourceAddress,
        request_headers: StringMap,
        via: ViaCache,
    ) -> Result<ServedResponse, IstreamError> {
        let upstream = self.loader.send_request(method, address, request_headers, None).await?;
        Ok(ServedResponse::from_upstream(upstream, via))
    }

    /// Conditional fast paths (§4.4), applied to a fresh hit.
    fn serve_fresh(
        &self,
        lease: &SharedLease<String, HttpCacheDocument>,
        request_info: &rfc::HttpCacheRequestInfo,
    ) -> ServedResponse {
        let doc = lease.value();
        match rfc::evaluate_conditional(request_info, doc.etag.as_deref(), doc.last_modified) {
            Some(rfc::ConditionalOutcome::NotModified) => {
                ServedResponse::synthetic(StatusCode::NOT_MODIFIED, doc.response_headers.clone(), ViaCache::Hit)
            }
            Some(rfc::ConditionalOutcome::PreconditionFailed) => {
                ServedResponse::synthetic(StatusCode::PRECONDITION_FAILED, StringMap::new(), ViaCache::Hit)
            }
            None => {
                let body = doc
                    .body
                    .as_ref()
                    .map(|alloc| Bytes::copy_from_slice(&alloc.read()))
                    .unwrap_or_default();
                ServedResponse::buffered(doc.status, doc.response_headers.clone(), body, ViaCache::Hit)
            }
        }
    }

    /// A stale-but-present hit: re-issue upstream with validators, per
    /// §4.4's "Revalidation". `lease` keeps the old document reachable for
    /// the duration even after it stops being the entry `Cache::get_match`
    /// would return.
    async fn revalidate(
        &self,
        key: String,
        lease: SharedLease<String, HttpCacheDocument>,
        method: Method,
        address: ResourceAddress,
        mut request_headers: StringMap,
    ) -> Result<ServedResponse, IstreamError> {
        {
            let doc = lease.value();
            if let Some(etag) = &doc.etag {
                if let Ok(value) = HeaderValue::from_str(etag) {
                    request_headers.insert(http::header::IF_NONE_MATCH, value);
                }
            }
            if let Some(last_modified) = doc.last_modified {
                if let Ok(value) = HeaderValue::from_str(&httpdate::fmt_http_date(last_modified)) {
                    request_headers.insert(http::header::IF_MODIFIED_SINCE, value);
                }
            }
        }

        let upstream = self.loader.send_request(method, &address, request_headers, None).await?;
        let wall_now = self.clock.wall_now();

        if upstream.status == StatusCode::NOT_MODIFIED {
            return Ok(self.refresh_from_not_modified(key, lease, &upstream, wall_now));
        }

        if upstream.status.is_success() {
            let new_etag = upstream
                .headers
                .get("etag")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            if rfc::prefer_cached(lease.value().etag.as_deref(), new_etag.as_deref()) {
                self.stats.record_hit();
                let doc = lease.value();
                let body = doc
                    .body
                    .as_ref()
                    .map(|alloc| Bytes::copy_from_slice(&alloc.read()))
                    .unwrap_or_default();
                return Ok(ServedResponse::buffered(doc.status, doc.response_headers.clone(), body, ViaCache::Stale));
            }
        }

        // Neither a 304 nor a matching-etag 2xx: the stored entity is gone
        // for good. Drop it and treat the upstream response as a fresh
        // store candidate.
        self.cache.remove(&key);
        self.stats.record_miss();
        self.store_from_upstream(key, upstream).await
    }

    /// Patches the stored headers/expiry from a 304's own headers, keeps
    /// the stored body, and re-links the refreshed document under the same
    /// key so future lookups see the new deadline.
    fn refresh_from_not_modified(
        &self,
        key: String,
        lease: SharedLease<String, HttpCacheDocument>,
        upstream: &UpstreamResponse,
        wall_now: std::time::SystemTime,
    ) -> ServedResponse {
        let info: Option<HttpCacheResponseInfo> = rfc::response_evaluate(StatusCode::OK, &upstream.headers, wall_now, |_| true);

        for name in ["cache-control", "expires", "date"] {
            if let Some(value) = upstream.headers.get(name) {
                lease
                    .value_mut()
                    .response_headers
                    .insert(http::HeaderName::from_static(name), value.clone());
            }
        }
        if let Some(value) = upstream.headers.get("etag") {
            if let Ok(value) = value.to_str() {
                lease.value_mut().etag = Some(value.to_string());
            }
        }

        let tag = lease.tag();
        let size = lease.size();
        let steady_now = self.clock.steady_now();
        let new_expires = info.map(|i| i.expires).unwrap_or(lease.value().expires);

        let (status, headers, etag, last_modified, vary, body) = {
            let mut doc = lease.value_mut();
            doc.expires = new_expires;
            (
                doc.status,
                doc.response_headers.clone(),
                doc.etag.clone(),
                doc.last_modified,
                doc.vary.clone(),
                doc.body.take(),
            )
        };

        let serve_body = body
            .as_ref()
            .map(|alloc| Bytes::copy_from_slice(&alloc.read()))
            .unwrap_or_default();

        self.cache.put(
            key,
            HttpCacheDocument {
                status,
                response_headers: headers.clone(),
                etag,
                last_modified,
                vary,
                expires: new_expires,
                body,
            },
            size,
            steady_now + GENERIC_SAFETY_TTL,
            tag,
            steady_now,
        );

        self.stats.record_hit();
        ServedResponse::buffered(status, headers, serve_body, ViaCache::Stale)
    }

    async fn fetch_and_store(
        &self,
        key: String,
        method: Method,
        address: ResourceAddress,
        request_headers: StringMap,
    ) -> Result<ServedResponse, IstreamError> {
        let upstream = self.loader.send_request(method, &address, request_headers, None).await?;
        self.store_from_upstream(key, upstream).await
    }

    /// Tees the body: one branch goes straight to the client, the other is
    /// drained into a rubber allocation (bounded, timed out) and `Put` into
    /// the cache once it completes, per §4.3/§4.4. The client is never
    /// delayed by the store — this returns as soon as the tee is wired up.
    async fn store_from_upstream(&self, key: String, upstream: UpstreamResponse) -> Result<ServedResponse, IstreamError> {
        let wall_now = self.clock.wall_now();
        let Some(info) = rfc::response_evaluate(upstream.status, &upstream.headers, wall_now, |_| false) else {
            self.stats.record_skip();
            return Ok(ServedResponse::from_upstream(upstream, ViaCache::Miss));
        };

        let recorded_vary = rfc::copy_vary(&upstream.headers, &info.vary);
        let UpstreamResponse { status, headers, body } = upstream;

        let (client_branch, store_branch) = ferron_common::istream::tee(body);
        let rubber = self.rubber.clone();
        let limit = self.config.cacheable_size_limit.as_u64();
        let cache = self.cache.clone();
        let stats = self.stats.clone();
        let timeout = self.config.store_timeout;
        let headers_for_store = headers.clone();
        let tag = self.config.auto_flush_tag.clone();

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
                    let doc = HttpCacheDocument {
                        status,
                        response_headers: headers_for_store,
                        etag: info.etag,
                        last_modified: info.last_modified,
                        vary: recorded_vary,
                        expires: info.expires,
                        body: allocation,
                    };
                    let now = Instant::now();
                    cache.put(key, doc, size, now + GENERIC_SAFETY_TTL, tag, now);
                    stats.record_store();
                    tracing::debug!(size, "stored response body in rubber cache");
                }
                ferron_cache::SinkOutcome::TooLarge => {
                    stats.record_skip();
                    tracing::debug!(limit, "response body exceeded the cacheable size limit, not stored");
                }
                ferron_cache::SinkOutcome::OutOfMemory => {
                    stats.record_skip();
                    tracing::warn!("rubber allocator has no room left for a new cache entry");
                }
                ferron_cache::SinkOutcome::Error(e) => {
                    stats.record_skip();
                    tracing::debug!(error = %e, "store branch failed before reaching eof");
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

/// Cancels any still-running store when the last reference to this cache
/// goes away, same guarantee `shutdown` gives explicitly (§4.8).
impl Drop for HttpCache {
    fn drop(&mut self) {
        self.stores.cancel_all();
    }
}
