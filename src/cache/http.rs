//! HTTP response cache
//!
//! Caches upstream responses according to the usual RFC 2616/9111 rules:
//! request and response cacheability checks, `Vary` tuples, server clock
//! skew for `Expires`, bounded effective TTLs, conditional revalidation
//! and invalidation by unsafe methods.  Response bodies are captured
//! into the rubber allocator by a background sink that never delays the
//! client.

use crate::body::Body;
use crate::cache::{Cache, CacheItem, CacheStats, Expiry};
use crate::error::{RelayError, Result};
use crate::http_date::parse_http_date;
use crate::mem::rubber::{Rubber, RubberAllocation};
use crate::mem::sink::{sink_to_rubber, SinkRubberOutcome};
use crate::resource::{
    HttpResponse, ResourceAddress, ResourceLoader, ResourceRequestParams,
};
use bytes::Bytes;
use http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

/// Bodies larger than this are never cached
pub const CACHEABLE_SIZE_LIMIT: usize = 512 * 1024;

/// Everything about the request that matters for caching
#[derive(Debug, Default)]
pub struct HttpCacheRequestInfo {
    /// The upstream has its own clock; `Expires` must be skew-adjusted
    pub is_remote: bool,

    pub has_query_string: bool,

    /// `Cache-Control: only-if-cached` was present
    pub only_if_cached: bool,

    pub if_none_match: Option<String>,
    pub if_modified_since: Option<String>,
}

/// Caching-relevant facts extracted from a response
#[derive(Debug, Clone, Default)]
pub struct HttpCacheResponseInfo {
    /// Absolute expiry (skew-adjusted); `None` means revalidate on every hit
    pub expires: Option<SystemTime>,

    pub last_modified: Option<String>,
    pub etag: Option<String>,
    pub vary: Option<String>,
}

/// Check whether the request could produce a cacheable response
pub fn request_evaluate(
    method: &Method,
    address: &ResourceAddress,
    headers: &HeaderMap,
    obey_no_cache: bool,
    has_request_body: bool,
) -> Option<HttpCacheRequestInfo> {
    if method != Method::GET || has_request_body {
        // RFC 2616 13.11 "Write-Through Mandatory"
        return None;
    }

    if headers.contains_key(header::RANGE) {
        return None;
    }

    // RFC 2616 14.8: a shared cache must not reuse responses to requests
    // with an Authorization header
    if headers.contains_key(header::AUTHORIZATION) {
        return None;
    }

    let mut info = HttpCacheRequestInfo::default();

    if let Some(cc) = header_str(headers, header::CACHE_CONTROL) {
        for s in cc.split(',') {
            let s = s.trim();
            if obey_no_cache && (s == "no-cache" || s == "no-store") {
                return None;
            }
            if s == "only-if-cached" {
                info.only_if_cached = true;
            }
        }
    } else if obey_no_cache {
        if header_str(headers, header::PRAGMA) == Some("no-cache") {
            return None;
        }
    }

    info.is_remote = address.is_remote();
    info.has_query_string = address.has_query_string();
    info.if_none_match = header_string(headers, header::IF_NONE_MATCH);
    info.if_modified_since = header_string(headers, header::IF_MODIFIED_SINCE);

    Some(info)
}

/// RFC 2616 13.10: unsafe methods invalidate the URL
pub fn request_invalidate(method: &Method) -> bool {
    method == Method::PUT || method == Method::DELETE || method == Method::POST
}

/// RFC 2616 13.4
fn status_cacheable(status: StatusCode) -> bool {
    matches!(
        status.as_u16(),
        200 | 203 | 206 | 300 | 301 | 410
    )
}

/// Difference between our clock and the server's, from its `Date` header.
///
/// `None` means the server did not send a usable `Date`, in which case a
/// remote response must not be cached at all.
fn server_date_offset(
    request_info: &HttpCacheRequestInfo,
    now: SystemTime,
    headers: &HeaderMap,
) -> Option<i64> {
    if !request_info.is_remote {
        // local upstream (FastCGI and friends) shares our clock
        return Some(0);
    }

    let date = header_str(headers, header::DATE).and_then(parse_http_date)?;
    Some(signed_delta(now, date))
}

fn signed_delta(a: SystemTime, b: SystemTime) -> i64 {
    match a.duration_since(b) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}

fn apply_offset(time: SystemTime, offset: i64) -> SystemTime {
    if offset >= 0 {
        time + Duration::from_secs(offset as u64)
    } else {
        time - Duration::from_secs((-offset) as u64)
    }
}

/// Check whether the response is cacheable for this request
pub fn response_evaluate(
    request_info: &HttpCacheRequestInfo,
    status: StatusCode,
    headers: &HeaderMap,
    body_available: Option<u64>,
) -> Option<HttpCacheResponseInfo> {
    if !status_cacheable(status) {
        return None;
    }

    if let Some(available) = body_available {
        if available > CACHEABLE_SIZE_LIMIT as u64 {
            return None;
        }
    }

    let now = SystemTime::now();
    let mut info = HttpCacheResponseInfo::default();

    if let Some(cc) = header_str(headers, header::CACHE_CONTROL) {
        for s in cc.split(',') {
            let s = s.trim();
            if s.starts_with("private") || s == "no-cache" || s == "no-store" {
                return None;
            }
            if let Some(param) = s.strip_prefix("max-age=") {
                // RFC 2616 14.9.3
                if let Ok(seconds) = param.parse::<u64>() {
                    if seconds > 0 {
                        info.expires = Some(now + Duration::from_secs(seconds));
                    }
                }
            }
        }
    }

    let offset = server_date_offset(request_info, now, headers)?;

    if info.expires.is_none() {
        // RFC 2616 14.9.3: max-age overrides Expires
        if let Some(expires) = header_str(headers, header::EXPIRES).and_then(parse_http_date) {
            let expires = apply_offset(expires, offset);
            if expires < now {
                debug!("invalid 'expires' header");
            }
            info.expires = Some(expires);
        }
    }

    if request_info.has_query_string && info.expires.is_none() {
        // RFC 2616 13.9: query URIs need an explicit expiration
        return None;
    }

    info.last_modified = header_string(headers, header::LAST_MODIFIED);
    info.etag = header_string(headers, header::ETAG);

    info.vary = header_string(headers, header::VARY).filter(|v| !v.is_empty());
    if info.vary.as_deref() == Some("*") {
        // RFC 2616 13.6
        return None;
    }

    if info.expires.is_some() || info.last_modified.is_some() || info.etag.is_some() {
        Some(info)
    } else {
        None
    }
}

/// Record the request-header values named by the response's `Vary`
pub fn copy_vary(vary: &str, request_headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for name in vary.split(',') {
        let name = name.trim().to_ascii_lowercase();
        if name.is_empty() {
            continue;
        }
        let value = request_headers
            .get(&name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        out.insert(name, value);
    }
    out
}

/// A cached item matches iff every recorded `Vary` value equals the new
/// request's value (missing headers count as empty)
pub fn vary_fits(stored: &BTreeMap<String, String>, request_headers: &HeaderMap) -> bool {
    stored.iter().all(|(name, value)| {
        let request_value = request_headers
            .get(name.as_str())
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        request_value == value
    })
}

/// The upper TTL limit; responses with a `Vary` header are assumed to be
/// more volatile
fn age_limit(vary: &BTreeMap<String, String>) -> Duration {
    const HOUR: Duration = Duration::from_secs(3600);

    if vary.is_empty() {
        return 7 * 24 * HOUR;
    }

    if vary.contains_key("x-cm4all-beng-user")
        || vary.contains_key("cookie")
        || vary.contains_key("cookie2")
    {
        // specific to one authenticated user
        return Duration::from_secs(300);
    }

    if vary.contains_key("x-widgetid") || vary.contains_key("x-widgethref") {
        // specific to one widget instance
        return Duration::from_secs(1800);
    }

    HOUR
}

/// Effective item expiry: server expiry clipped by the `Vary`-dependent
/// limit, one hour when the server sent none
pub fn calc_expires(expires: Option<SystemTime>, vary: &BTreeMap<String, String>) -> SystemTime {
    let now = SystemTime::now();

    let max_age = match expires {
        None => Duration::from_secs(3600),
        Some(expires) => match expires.duration_since(now) {
            Ok(d) => d,
            // already expired, bail out
            Err(_) => return expires,
        },
    };

    now + max_age.min(age_limit(vary))
}

/// The upstream returned a non-304 response whose ETag matches the
/// cached one: the resource has not changed, the origin was just too
/// lazy to check
pub fn prefer_cached(cached_etag: Option<&str>, response_headers: &HeaderMap) -> bool {
    let Some(cached_etag) = cached_etag else {
        return false;
    };
    header_str(response_headers, header::ETAG) == Some(cached_etag)
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> Option<&str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn header_string(headers: &HeaderMap, name: header::HeaderName) -> Option<String> {
    header_str(headers, name).map(str::to_string)
}

/// One cached response
pub struct HttpCacheItem {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub vary: BTreeMap<String, String>,
    pub info: HttpCacheResponseInfo,
    pub tag: Option<String>,
    pub body: Option<RubberAllocation>,
}

impl CacheItem for HttpCacheItem {
    fn size(&self) -> usize {
        let headers: usize = self
            .headers
            .iter()
            .map(|(name, value)| name.as_str().len() + value.len())
            .sum();
        160 + headers + self.body.as_ref().map_or(0, |b| b.size())
    }
}

/// Snapshot of a cache hit taken under the lock
struct CachedView {
    status: StatusCode,
    headers: HeaderMap,
    etag: Option<String>,
    last_modified: Option<String>,
    needs_revalidation: bool,
    body: Bytes,
}

/// The HTTP response cache proper
pub struct HttpCache {
    cache: Mutex<Cache<HttpCacheItem>>,
    rubber: Arc<Rubber>,
}

impl HttpCache {
    pub fn new(max_size: usize, rubber: Arc<Rubber>) -> Self {
        Self {
            cache: Mutex::new(Cache::new(max_size)),
            rubber,
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.lock().unwrap().stats()
    }

    pub fn flush(&self) -> usize {
        self.cache.lock().unwrap().flush()
    }

    /// Drop all items inserted under `tag`
    pub fn flush_tag(&self, tag: &str) -> usize {
        self.cache
            .lock()
            .unwrap()
            .remove_if(|_, item| item.tag.as_deref() == Some(tag))
    }

    pub fn expire_sweep(&self) -> usize {
        self.cache.lock().unwrap().expire_sweep()
    }

    /// Fetch a resource through the cache
    #[allow(clippy::too_many_arguments)]
    pub async fn serve(
        self: &Arc<Self>,
        inner: &Arc<dyn ResourceLoader>,
        params: ResourceRequestParams,
        method: Method,
        address: &ResourceAddress,
        status: Option<StatusCode>,
        headers: HeaderMap,
        body: Body,
    ) -> Result<HttpResponse> {
        let key = address.cache_key();

        if request_invalidate(&method) {
            let removed = self.cache.lock().unwrap().remove_match(&key, |_| true);
            if removed > 0 {
                debug!(key, removed, "invalidated by unsafe method");
            }
            return inner
                .send_request(params, method, address, status, headers, body)
                .await;
        }

        let Some(request_info) = request_evaluate(
            &method,
            address,
            &headers,
            params.obey_no_cache,
            !body.is_empty_body(),
        ) else {
            self.cache.lock().unwrap().note_miss();
            return inner
                .send_request(params, method, address, status, headers, body)
                .await;
        };

        let cached = self.lookup(&key, &headers);

        if let Some(view) = cached {
            if !view.needs_revalidation {
                debug!(key, "cache hit");
                return Ok(self.serve_cached(view, &request_info));
            }

            debug!(key, "revalidating");
            return self
                .revalidate(
                    inner,
                    params,
                    method,
                    address,
                    status,
                    headers,
                    request_info,
                    view,
                    key,
                )
                .await;
        }

        if request_info.only_if_cached {
            return Err(RelayError::message(
                StatusCode::GATEWAY_TIMEOUT,
                "Cache miss",
            ));
        }

        debug!(key, "cache miss");
        let response = inner
            .send_request(params.clone(), method, address, status, headers.clone(), body)
            .await?;
        Ok(self.handle_upstream(key, request_info, &headers, params.cache_tag, response))
    }

    fn lookup(&self, key: &str, request_headers: &HeaderMap) -> Option<CachedView> {
        let mut cache = self.cache.lock().unwrap();
        let item = cache.get(key, |item| vary_fits(&item.vary, request_headers))?;
        Some(CachedView {
            status: item.status,
            headers: item.headers.clone(),
            etag: item.info.etag.clone(),
            last_modified: item.info.last_modified.clone(),
            needs_revalidation: item.info.expires.is_none(),
            body: item
                .body
                .as_ref()
                .map(|b| b.to_bytes(0..b.size()))
                .unwrap_or_default(),
        })
    }

    /// Serve a fresh hit; a matching `If-None-Match` collapses it to 304
    fn serve_cached(&self, view: CachedView, request_info: &HttpCacheRequestInfo) -> HttpResponse {
        if let (Some(inm), Some(etag)) = (&request_info.if_none_match, &view.etag) {
            if inm.split(',').any(|t| t.trim() == etag || t.trim() == "*") {
                return HttpResponse::new(StatusCode::NOT_MODIFIED, view.headers, Body::empty());
            }
        }

        let len = view.body.len();
        let mut headers = view.headers;
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
        HttpResponse::new(view.status, headers, Body::full(view.body))
    }

    /// Revalidation-only hit: ask the upstream whether the copy is still
    /// good before serving it
    #[allow(clippy::too_many_arguments)]
    async fn revalidate(
        self: &Arc<Self>,
        inner: &Arc<dyn ResourceLoader>,
        params: ResourceRequestParams,
        method: Method,
        address: &ResourceAddress,
        status: Option<StatusCode>,
        mut headers: HeaderMap,
        request_info: HttpCacheRequestInfo,
        view: CachedView,
        key: String,
    ) -> Result<HttpResponse> {
        if let Some(etag) = &view.etag {
            if let Ok(value) = HeaderValue::from_str(etag) {
                headers.insert(header::IF_NONE_MATCH, value);
            }
        } else if let Some(lm) = &view.last_modified {
            if let Ok(value) = HeaderValue::from_str(lm) {
                headers.insert(header::IF_MODIFIED_SINCE, value);
            }
        }

        let response = match inner
            .send_request(
                params.clone(),
                method,
                address,
                status,
                headers.clone(),
                Body::empty(),
            )
            .await
        {
            Ok(response) => response,
            Err(e) => {
                // the stale copy beats an error
                warn!(key, "revalidation failed: {}", e);
                return Ok(self.serve_cached(view, &request_info));
            }
        };

        if response.status == StatusCode::NOT_MODIFIED {
            let mut cache = self.cache.lock().unwrap();
            cache.update_expiry(
                &key,
                |item| vary_fits(&item.vary, &headers),
                Expiry::at(calc_expires(None, &BTreeMap::new())),
            );
            drop(cache);
            return Ok(self.serve_cached(view, &request_info));
        }

        if prefer_cached(view.etag.as_deref(), &response.headers) {
            debug!(key, "upstream did not revalidate, but the ETag matches");
            return Ok(self.serve_cached(view, &request_info));
        }

        Ok(self.handle_upstream(key, request_info, &headers, params.cache_tag, response))
    }

    /// Decide whether the upstream response is cacheable; if so, capture
    /// it in the background while the client gets its copy immediately
    fn handle_upstream(
        self: &Arc<Self>,
        key: String,
        request_info: HttpCacheRequestInfo,
        request_headers: &HeaderMap,
        tag: Option<String>,
        response: HttpResponse,
    ) -> HttpResponse {
        let Some(info) = response_evaluate(
            &request_info,
            response.status,
            &response.headers,
            response.body.declared_len(),
        ) else {
            return response;
        };

        let vary = info
            .vary
            .as_deref()
            .map(|v| copy_vary(v, request_headers))
            .unwrap_or_default();
        let expiry = Expiry::at(calc_expires(info.expires, &vary));

        let (client_body, capture_body) = response.body.tee();
        let status = response.status;
        let response_headers = response.headers.clone();

        let this = self.clone();
        tokio::spawn(async move {
            let allocation =
                match sink_to_rubber(this.rubber.clone(), capture_body, CACHEABLE_SIZE_LIMIT).await
                {
                    Ok(SinkRubberOutcome::Done(allocation)) => Some(allocation),
                    Ok(SinkRubberOutcome::Empty) => None,
                    Ok(SinkRubberOutcome::TooLarge) => {
                        debug!(key, "not caching: body too large");
                        return;
                    }
                    Ok(SinkRubberOutcome::OutOfMemory) => {
                        warn!(key, "not caching: allocator full");
                        return;
                    }
                    Err(e) => {
                        debug!(key, "not caching: {}", e);
                        return;
                    }
                };

            let item = HttpCacheItem {
                status,
                headers: response_headers,
                vary: vary.clone(),
                info,
                tag,
                body: allocation,
            };
            let mut cache = this.cache.lock().unwrap();
            cache.put(&key, item, expiry, |old| old.vary == vary);
            debug!(key, "stored");
        });

        HttpResponse::new(status, response.headers, client_body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::HttpAddress;

    fn remote_address() -> ResourceAddress {
        ResourceAddress::Http(HttpAddress {
            https: false,
            host_and_port: "origin:80".to_string(),
            path: "/page".to_string(),
        })
    }

    fn get_info(headers: &HeaderMap) -> HttpCacheRequestInfo {
        request_evaluate(&Method::GET, &remote_address(), headers, true, false).unwrap()
    }

    #[test]
    fn test_request_evaluate_rejects_unsafe() {
        let headers = HeaderMap::new();
        assert!(
            request_evaluate(&Method::POST, &remote_address(), &headers, true, false).is_none()
        );
        assert!(request_evaluate(&Method::GET, &remote_address(), &headers, true, true).is_none());
    }

    #[test]
    fn test_request_evaluate_rejects_range_and_auth() {
        let mut headers = HeaderMap::new();
        headers.insert(header::RANGE, HeaderValue::from_static("bytes=0-1"));
        assert!(request_evaluate(&Method::GET, &remote_address(), &headers, true, false).is_none());

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic x"));
        assert!(request_evaluate(&Method::GET, &remote_address(), &headers, true, false).is_none());
    }

    #[test]
    fn test_no_cache_obeyed_and_overridden() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        assert!(request_evaluate(&Method::GET, &remote_address(), &headers, true, false).is_none());
        assert!(
            request_evaluate(&Method::GET, &remote_address(), &headers, false, false).is_some()
        );
    }

    #[test]
    fn test_response_evaluate_requires_date_for_remote() {
        let info = get_info(&HeaderMap::new());
        let mut headers = HeaderMap::new();
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("max-age=60"));

        // max-age works even without Date: the expiry is relative
        assert!(response_evaluate(&info, StatusCode::OK, &headers, Some(10)).is_some());

        // but Expires-based caching requires the server clock
        let mut headers = HeaderMap::new();
        headers.insert(
            header::EXPIRES,
            HeaderValue::from_static("Sun, 06 Nov 2094 08:49:37 GMT"),
        );
        assert!(response_evaluate(&info, StatusCode::OK, &headers, Some(10)).is_none());
    }

    #[test]
    fn test_response_evaluate_vary_star() {
        let info = get_info(&HeaderMap::new());
        let mut headers = HeaderMap::new();
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("max-age=60"));
        headers.insert(header::VARY, HeaderValue::from_static("*"));
        assert!(response_evaluate(&info, StatusCode::OK, &headers, Some(10)).is_none());
    }

    #[test]
    fn test_response_evaluate_private() {
        let info = get_info(&HeaderMap::new());
        let mut headers = HeaderMap::new();
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("private"));
        assert!(response_evaluate(&info, StatusCode::OK, &headers, Some(10)).is_none());
    }

    #[test]
    fn test_response_evaluate_size_limit() {
        let info = get_info(&HeaderMap::new());
        let mut headers = HeaderMap::new();
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("max-age=60"));
        assert!(response_evaluate(
            &info,
            StatusCode::OK,
            &headers,
            Some(CACHEABLE_SIZE_LIMIT as u64 + 1)
        )
        .is_none());

        // unknown size is fine, the sink enforces the limit later
        assert!(response_evaluate(&info, StatusCode::OK, &headers, None).is_some());
    }

    #[test]
    fn test_vary_matching() {
        let mut request_headers = HeaderMap::new();
        request_headers.insert("accept-language", HeaderValue::from_static("de"));

        let vary = copy_vary("Accept-Language", &request_headers);
        assert!(vary_fits(&vary, &request_headers));

        let mut other = HeaderMap::new();
        other.insert("accept-language", HeaderValue::from_static("en"));
        assert!(!vary_fits(&vary, &other));

        // missing header counts as empty string
        let vary_empty = copy_vary("Accept-Language", &HeaderMap::new());
        assert!(vary_fits(&vary_empty, &HeaderMap::new()));
        assert!(!vary_fits(&vary_empty, &request_headers));
    }

    #[test]
    fn test_age_limits() {
        let no_vary = BTreeMap::new();
        let week = age_limit(&no_vary);
        assert_eq!(week, Duration::from_secs(7 * 24 * 3600));

        let mut user = BTreeMap::new();
        user.insert("cookie".to_string(), String::new());
        assert_eq!(age_limit(&user), Duration::from_secs(300));

        let mut widget = BTreeMap::new();
        widget.insert("x-widgetid".to_string(), String::new());
        assert_eq!(age_limit(&widget), Duration::from_secs(1800));

        let mut other = BTreeMap::new();
        other.insert("accept".to_string(), String::new());
        assert_eq!(age_limit(&other), Duration::from_secs(3600));
    }

    #[test]
    fn test_prefer_cached() {
        let mut headers = HeaderMap::new();
        headers.insert(header::ETAG, HeaderValue::from_static("\"v1\""));
        assert!(prefer_cached(Some("\"v1\""), &headers));
        assert!(!prefer_cached(Some("\"v2\""), &headers));
        assert!(!prefer_cached(None, &headers));
    }

    #[test]
    fn test_request_invalidate() {
        assert!(request_invalidate(&Method::POST));
        assert!(request_invalidate(&Method::PUT));
        assert!(request_invalidate(&Method::DELETE));
        assert!(!request_invalidate(&Method::GET));
        assert!(!request_invalidate(&Method::HEAD));
    }
}
