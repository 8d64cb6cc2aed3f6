//! C5: the RFC-9111-style evaluator. Every function here is pure — no
//! cache, no clock side effects, no I/O — so each is testable on its own,
//! per §4.7. `HttpCache` (in `lib.rs`) is the only place these get wired
//! up to an actual `Cache`/`Rubber`.
//!
//! Grounded in two places: the cacheability decision (method check,
//! `Cache-Control` parsing via the `cache_control` crate, `no-store`/
//! `Cachability` handling) follows `ferron-modules-builtin`'s
//! `optional/cache.rs` `CacheDecision`/`should_cache_response` almost
//! line for line, generalized from a single-process in-memory map to a
//! reusable pure function. The conditional-request bits (`If-Match` /
//! `If-None-Match` / `If-Modified-Since` / `If-Unmodified-Since`, ETag
//! comparison) have no teacher counterpart, so they follow
//! `kornelski-rusty-http-cache-semantics`'s approach of treating RFC 9111
//! clauses as small, separately testable predicates over `http` crate
//! types.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

use cache_control::{Cachability, CacheControl};
use http::{HeaderMap, HeaderValue, Method, StatusCode};

/// What a request asks of the cache, extracted once up front so the rest
/// of the lookup path never re-parses headers.
#[derive(Debug, Clone, Default)]
pub struct HttpCacheRequestInfo {
    pub only_if_cached: bool,
    /// `Cache-Control: no-cache` or `Pragma: no-cache`, honoured only if
    /// the façade is configured to obey it (§6.1 `obey_no_cache`).
    pub no_cache: bool,
    pub if_match: Option<Vec<String>>,
    pub if_none_match: Option<Vec<String>>,
    pub if_modified_since: Option<SystemTime>,
    pub if_unmodified_since: Option<SystemTime>,
}

/// What was learned from a cacheable response at store time.
#[derive(Debug, Clone)]
pub struct HttpCacheResponseInfo {
    /// Wall-clock deadline; the façade converts this to a steady deadline
    /// via `Clock::wall_to_steady` before handing it to `Cache`.
    pub expires: SystemTime,
    pub etag: Option<String>,
    pub last_modified: Option<SystemTime>,
    /// Header names listed in the response's `Vary`.
    pub vary: Vec<String>,
}

/// The outcome of matching a request's conditional headers against a
/// stored item, applied before serving on any hit (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionalOutcome {
    PreconditionFailed,
    NotModified,
}

fn method_is_unsafe(method: &Method) -> bool {
    !matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE)
}

/// `request_invalidate`: true for methods whose completion should purge
/// the cache key before forwarding (§4.4 "Unsafe methods purge the key
/// before forwarding").
pub fn request_invalidate(method: &Method) -> bool {
    method_is_unsafe(method)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn parse_http_date(value: &str) -> Option<SystemTime> {
    httpdate::parse_http_date(value.trim()).ok()
}

fn parse_etag_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// `request_evaluate`: only `GET`/`HEAD` requests without a body are
/// lookups at all; everything else returns `None` (the caller treats a
/// `None` from a non-`GET`/`HEAD` request as a candidate for
/// `request_invalidate` instead, not as a cache lookup).
pub fn request_evaluate(
    method: &Method,
    headers: &HeaderMap,
    has_body: bool,
    obey_no_cache: bool,
) -> Option<HttpCacheRequestInfo> {
    if has_body {
        return None;
    }
    if !matches!(*method, Method::GET | Method::HEAD) {
        return None;
    }

    let cache_control = header_str(headers, "cache-control").and_then(CacheControl::from_value);
    let no_cache = obey_no_cache
        && (cache_control
            .as_ref()
            .map(|cc| matches!(cc.cachability, Some(Cachability::NoCache)))
            .unwrap_or(false)
            || header_str(headers, "pragma")
                .map(|v| v.eq_ignore_ascii_case("no-cache"))
                .unwrap_or(false));

    let only_if_cached = header_str(headers, "cache-control")
        .map(|raw| raw.split(',').any(|tok| tok.trim().eq_ignore_ascii_case("only-if-cached")))
        .unwrap_or(false);

    Some(HttpCacheRequestInfo {
        only_if_cached,
        no_cache,
        if_match: header_str(headers, "if-match").map(parse_etag_list),
        if_none_match: header_str(headers, "if-none-match").map(parse_etag_list),
        if_modified_since: header_str(headers, "if-modified-since").and_then(parse_http_date),
        if_unmodified_since: header_str(headers, "if-unmodified-since").and_then(parse_http_date),
    })
}

/// `response_evaluate`: is this response cacheable, and if so, when does
/// it expire? `extra_cacheable_status` lets a façade opt additional
/// non-error statuses in, per §4.4 "200, 204 (and optionally other
/// non-error selectors via policy)".
pub fn response_evaluate(
    status: StatusCode,
    headers: &HeaderMap,
    wall_now: SystemTime,
    extra_cacheable_status: impl Fn(StatusCode) -> bool,
) -> Option<HttpCacheResponseInfo> {
    let status_ok = matches!(status, StatusCode::OK | StatusCode::NO_CONTENT) || extra_cacheable_status(status);
    if !status_ok {
        return None;
    }

    let cache_control = header_str(headers, "cache-control").and_then(CacheControl::from_value);
    if let Some(cc) = &cache_control {
        if cc.no_store {
            return None;
        }
        if matches!(cc.cachability, Some(Cachability::Private)) {
            return None;
        }
    }

    let expires = cache_control
        .as_ref()
        .and_then(|cc| cc.s_max_age.or(cc.max_age))
        .map(|max_age| wall_now + max_age)
        .or_else(|| expires_from_header(headers, wall_now))?;

    Some(HttpCacheResponseInfo {
        expires,
        etag: header_str(headers, "etag").map(str::to_string),
        last_modified: header_str(headers, "last-modified").and_then(parse_http_date),
        vary: header_str(headers, "vary")
            .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
            .unwrap_or_default(),
    })
}

/// `Expires` adjusted by `Date` clock skew, per §4.4: "`Expires` adjusted
/// by `Date` clock skew". If the response carries no `Date`, `wall_now` is
/// used as the reference instant instead.
fn expires_from_header(headers: &HeaderMap, wall_now: SystemTime) -> Option<SystemTime> {
    let expires = header_str(headers, "expires").and_then(parse_http_date)?;
    let date = header_str(headers, "date")
        .and_then(parse_http_date)
        .unwrap_or(wall_now);

    let skew = wall_now
        .duration_since(date)
        .unwrap_or(Duration::ZERO);
    Some(expires + skew)
}

/// `copy_vary`: snapshot of the request headers named in `vary_names`, in
/// the order the names are given, captured at store time (or re-derived
/// at lookup time for comparison via [`vary_fits`]).
pub fn copy_vary(headers: &HeaderMap, vary_names: &[String]) -> BTreeMap<String, HeaderValue> {
    let mut snapshot = BTreeMap::new();
    for name in vary_names {
        if let Some(value) = headers.get(name.as_str()) {
            snapshot.insert(name.to_ascii_lowercase(), value.clone());
        }
    }
    snapshot
}

/// `vary_fits`: true iff, for every header name recorded at store time,
/// the current request carries the identical value (byte-exact; absence
/// in both counts as a match since `copy_vary` only inserts present
/// headers).
pub fn vary_fits(recorded_vary: &BTreeMap<String, HeaderValue>, request_headers: &HeaderMap) -> bool {
    recorded_vary
        .iter()
        .all(|(name, value)| request_headers.get(name.as_str()) == Some(value))
}

/// `prefer_cached`: true iff a revalidation response's entity tag matches
/// the stored one (strong comparison; a missing tag on either side never
/// matches).
pub fn prefer_cached(stored_etag: Option<&str>, new_etag: Option<&str>) -> bool {
    matches!((stored_etag, new_etag), (Some(a), Some(b)) if a == b)
}

/// Applies the conditional-request fast paths (§4.4) against a stored
/// item's validators, before serving a hit.
pub fn evaluate_conditional(
    request: &HttpCacheRequestInfo,
    stored_etag: Option<&str>,
    stored_last_modified: Option<SystemTime>,
) -> Option<ConditionalOutcome> {
    if let Some(if_match) = &request.if_match {
        let satisfied = if_match.iter().any(|tag| tag == "*")
            || stored_etag.map(|etag| if_match.iter().any(|tag| tag == etag)).unwrap_or(false);
        if !satisfied {
            return Some(ConditionalOutcome::PreconditionFailed);
        }
    }

    if let Some(if_none_match) = &request.if_none_match {
        let satisfied = if_none_match.iter().any(|tag| tag == "*")
            || stored_etag
                .map(|etag| if_none_match.iter().any(|tag| tag == etag))
                .unwrap_or(false);
        if satisfied {
            return Some(ConditionalOutcome::NotModified);
        }
    }

    if let (Some(if_modified_since), Some(last_modified)) = (request.if_modified_since, stored_last_modified) {
        if last_modified <= if_modified_since {
            return Some(ConditionalOutcome::NotModified);
        }
    }

    if let (Some(if_unmodified_since), Some(last_modified)) = (request.if_unmodified_since, stored_last_modified) {
        if last_modified > if_unmodified_since {
            return Some(ConditionalOutcome::PreconditionFailed);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(
                http::HeaderName::from_bytes(k.as_bytes()).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        map
    }

    #[test]
    fn post_is_not_a_lookup_candidate() {
        assert!(request_evaluate(&Method::POST, &HeaderMap::new(), false, true).is_none());
    }

    #[test]
    fn request_with_a_body_is_rejected() {
        assert!(request_evaluate(&Method::GET, &HeaderMap::new(), true, true).is_none());
    }

    #[test]
    fn no_cache_is_only_honoured_when_configured() {
        let h = headers(&[("cache-control", "no-cache")]);
        let obeying = request_evaluate(&Method::GET, &h, false, true).unwrap();
        assert!(obeying.no_cache);
        let ignoring = request_evaluate(&Method::GET, &h, false, false).unwrap();
        assert!(!ignoring.no_cache);
    }

    #[test]
    fn unsafe_methods_invalidate() {
        assert!(request_invalidate(&Method::PUT));
        assert!(request_invalidate(&Method::POST));
        assert!(request_invalidate(&Method::DELETE));
        assert!(!request_invalidate(&Method::GET));
        assert!(!request_invalidate(&Method::HEAD));
    }

    #[test]
    fn no_store_response_is_not_cacheable() {
        let h = headers(&[("cache-control", "no-store")]);
        assert!(response_evaluate(StatusCode::OK, &h, SystemTime::now(), |_| false).is_none());
    }

    #[test]
    fn error_status_is_not_cacheable_by_default() {
        let h = headers(&[("cache-control", "max-age=60")]);
        assert!(response_evaluate(StatusCode::INTERNAL_SERVER_ERROR, &h, SystemTime::now(), |_| false).is_none());
    }

    #[test]
    fn max_age_sets_expiry_relative_to_now() {
        let now = SystemTime::now();
        let h = headers(&[("cache-control", "max-age=60")]);
        let info = response_evaluate(StatusCode::OK, &h, now, |_| false).unwrap();
        assert_eq!(
            info.expires.duration_since(now).unwrap(),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn response_without_any_expiry_signal_is_rejected() {
        let h = HeaderMap::new();
        assert!(response_evaluate(StatusCode::OK, &h, SystemTime::now(), |_| false).is_none());
    }

    #[test]
    fn vary_fits_property_holds_for_copied_snapshot() {
        let vary_names = vec!["accept-language".to_string()];
        let request_headers = headers(&[("accept-language", "en")]);
        let recorded = copy_vary(&request_headers, &vary_names);
        assert!(vary_fits(&recorded, &request_headers));
    }

    #[test]
    fn vary_fits_rejects_a_different_value() {
        let vary_names = vec!["accept-language".to_string()];
        let stored_request = headers(&[("accept-language", "en")]);
        let recorded = copy_vary(&stored_request, &vary_names);
        let new_request = headers(&[("accept-language", "fr")]);
        assert!(!vary_fits(&recorded, &new_request));
    }

    #[test]
    fn prefer_cached_requires_matching_strong_etag() {
        assert!(prefer_cached(Some("\"v1\""), Some("\"v1\"")));
        assert!(!prefer_cached(Some("\"v1\""), Some("\"v2\"")));
        assert!(!prefer_cached(None, Some("\"v1\"")));
    }

    #[test]
    fn if_none_match_yields_not_modified() {
        let mut req = HttpCacheRequestInfo::default();
        req.if_none_match = Some(vec!["\"v1\"".to_string()]);
        assert_eq!(
            evaluate_conditional(&req, Some("\"v1\""), None),
            Some(ConditionalOutcome::NotModified)
        );
    }

    #[test]
    fn if_match_mismatch_yields_precondition_failed() {
        let mut req = HttpCacheRequestInfo::default();
        req.if_match = Some(vec!["\"v2\"".to_string()]);
        assert_eq!(
            evaluate_conditional(&req, Some("\"v1\""), None),
            Some(ConditionalOutcome::PreconditionFailed)
        );
    }
}
