//! Filter (transformation) cache
//!
//! Caches the output of filter resources, keyed by the identity of the
//! source body, the authenticated user and the filter address.  On a
//! miss the filter runs and its output is teed: one copy streams to the
//! caller, the other feeds a rubber sink under a one-minute deadline.
//! The caller never waits for the capture.
//!
//! Concurrent population of the same key is allowed; the last successful
//! insert wins.

use crate::body::Body;
use crate::cache::{Cache, CacheItem, CacheStats, Expiry};
use crate::error::Result;
use crate::mem::rubber::{Rubber, RubberAllocation};
use crate::mem::sink::{sink_to_rubber, SinkRubberOutcome};
use crate::resource::{
    HttpResponse, ResourceAddress, ResourceLoader, ResourceRequestParams,
};
use http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

/// Bodies larger than this are never cached
const CACHEABLE_SIZE_LIMIT: usize = 512 * 1024;

/// The capture sink must finish within this window or caching is aborted
const CAPTURE_DEADLINE: Duration = Duration::from_secs(60);

/// Default TTL when the filter response carries no max-age
const DEFAULT_EXPIRES: Duration = Duration::from_secs(7 * 24 * 3600);

/// One cached filter output
pub struct FilterCacheItem {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub tag: Option<String>,
    pub body: Option<RubberAllocation>,
}

impl CacheItem for FilterCacheItem {
    fn size(&self) -> usize {
        let headers: usize = self
            .headers
            .iter()
            .map(|(name, value)| name.as_str().len() + value.len())
            .sum();
        128 + headers + self.body.as_ref().map_or(0, |b| b.size())
    }
}

pub struct FilterCache {
    cache: Mutex<Cache<FilterCacheItem>>,
    rubber: Arc<Rubber>,
}

impl FilterCache {
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

    /// Drop every item inserted under `tag`
    pub fn flush_tag(&self, tag: &str) -> usize {
        self.cache
            .lock()
            .unwrap()
            .remove_if(|_, item| item.tag.as_deref() == Some(tag))
    }

    pub fn expire_sweep(&self) -> usize {
        self.cache.lock().unwrap().expire_sweep()
    }

    /// `source_id | user | filter_address_id`
    fn cache_key(params: &ResourceRequestParams, address: &ResourceAddress) -> Option<String> {
        let source_id = params.body_etag.as_deref()?;
        Some(format!(
            "{}|{}|{}",
            source_id,
            params.user.as_deref().unwrap_or(""),
            address.cache_key()
        ))
    }

    /// Run a filter through the cache
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
        let Some(key) = Self::cache_key(&params, address) else {
            // without a source identity the output cannot be keyed
            return inner
                .send_request(params, method, address, status, headers, body)
                .await;
        };

        {
            let mut cache = self.cache.lock().unwrap();
            if let Some(item) = cache.get(&key, |_| true) {
                debug!(key, "filter cache hit");
                let body = item
                    .body
                    .as_ref()
                    .map(|b| b.to_bytes(0..b.size()))
                    .unwrap_or_default();
                let mut response_headers = item.headers.clone();
                response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
                return Ok(HttpResponse::new(
                    item.status,
                    response_headers,
                    Body::full(body),
                ));
            }
        }

        debug!(key, "filter cache miss");
        let tag = params.cache_tag.clone();
        let response = inner
            .send_request(params, method, address, status, headers, body)
            .await?;

        if !self.cacheable(&response) {
            return Ok(response);
        }

        let (client_body, capture_body) = response.body.tee();
        let response_status = response.status;
        let response_headers = response.headers.clone();
        let expiry = Expiry::after(self.expires_of(&response.headers));

        let this = self.clone();
        tokio::spawn(async move {
            let captured = tokio::time::timeout(
                CAPTURE_DEADLINE,
                sink_to_rubber(this.rubber.clone(), capture_body, CACHEABLE_SIZE_LIMIT),
            )
            .await;

            let allocation = match captured {
                Err(_) => {
                    // deadline passed; the caller was served long ago
                    warn!(key, "capture timed out, not caching");
                    return;
                }
                Ok(Err(e)) => {
                    debug!(key, "not caching: {}", e);
                    return;
                }
                Ok(Ok(SinkRubberOutcome::Done(allocation))) => Some(allocation),
                Ok(Ok(SinkRubberOutcome::Empty)) => None,
                Ok(Ok(SinkRubberOutcome::TooLarge)) => {
                    debug!(key, "not caching: body too large");
                    return;
                }
                Ok(Ok(SinkRubberOutcome::OutOfMemory)) => {
                    warn!(key, "not caching: allocator full");
                    return;
                }
            };

            let item = FilterCacheItem {
                status: response_status,
                headers: response_headers,
                tag,
                body: allocation,
            };
            this.cache.lock().unwrap().put(&key, item, expiry, |_| true);
            debug!(key, "stored filter output");
        });

        Ok(HttpResponse::new(
            response.status,
            response.headers,
            client_body,
        ))
    }

    fn cacheable(&self, response: &HttpResponse) -> bool {
        if !response.status.is_success() {
            return false;
        }
        if let Some(len) = response.body.declared_len() {
            if len > CACHEABLE_SIZE_LIMIT as u64 {
                return false;
            }
        }
        true
    }

    fn expires_of(&self, headers: &HeaderMap) -> Duration {
        if let Some(cc) = headers
            .get(header::CACHE_CONTROL)
            .and_then(|v| v.to_str().ok())
        {
            for s in cc.split(',') {
                if let Some(param) = s.trim().strip_prefix("max-age=") {
                    if let Ok(seconds) = param.parse::<u64>() {
                        return Duration::from_secs(seconds);
                    }
                }
            }
        }
        DEFAULT_EXPIRES
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingFilter {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ResourceLoader for CountingFilter {
        async fn send_request(
            &self,
            _params: ResourceRequestParams,
            _method: Method,
            _address: &ResourceAddress,
            _status: Option<StatusCode>,
            _headers: HeaderMap,
            _body: Body,
        ) -> Result<HttpResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(HttpResponse::new(
                StatusCode::OK,
                HeaderMap::new(),
                Body::full(Bytes::from_static(b"filtered output")),
            ))
        }
    }

    fn filter_address(name: &str) -> ResourceAddress {
        ResourceAddress::Cgi(crate::resource::CgiAddress {
            kind: crate::resource::CgiKind::Was,
            path: format!("/usr/lib/filters/{}", name),
            path_info: None,
            query_string: None,
        })
    }

    fn params(source: &str, tag: Option<&str>) -> ResourceRequestParams {
        ResourceRequestParams {
            body_etag: Some(source.to_string()),
            user: Some("alice".to_string()),
            cache_tag: tag.map(str::to_string),
            ..Default::default()
        }
    }

    async fn run_once(
        cache: &Arc<FilterCache>,
        loader: &Arc<dyn ResourceLoader>,
        source: &str,
        tag: Option<&str>,
    ) -> Bytes {
        let response = cache
            .serve(
                loader,
                params(source, tag),
                Method::POST,
                &filter_address("md"),
                Some(StatusCode::OK),
                HeaderMap::new(),
                Body::full(Bytes::from_static(b"source")),
            )
            .await
            .unwrap();
        response.body.collect(1 << 20).await.unwrap()
    }

    #[tokio::test]
    async fn test_hit_skips_filter() {
        let rubber = Arc::new(Rubber::new(1 << 20));
        let cache = Arc::new(FilterCache::new(1 << 20, rubber));
        let filter = Arc::new(CountingFilter {
            calls: AtomicUsize::new(0),
        });
        let loader: Arc<dyn ResourceLoader> = filter.clone();

        let first = run_once(&cache, &loader, "etag1", None).await;
        assert_eq!(first, "filtered output");

        // give the capture task a chance to finish
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = run_once(&cache, &loader, "etag1", None).await;
        assert_eq!(second, "filtered output");
        assert_eq!(filter.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_different_source_misses() {
        let rubber = Arc::new(Rubber::new(1 << 20));
        let cache = Arc::new(FilterCache::new(1 << 20, rubber));
        let filter = Arc::new(CountingFilter {
            calls: AtomicUsize::new(0),
        });
        let loader: Arc<dyn ResourceLoader> = filter.clone();

        run_once(&cache, &loader, "etag1", None).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        run_once(&cache, &loader, "etag2", None).await;
        assert_eq!(filter.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_tag_invalidation() {
        let rubber = Arc::new(Rubber::new(1 << 20));
        let cache = Arc::new(FilterCache::new(1 << 20, rubber));
        let filter = Arc::new(CountingFilter {
            calls: AtomicUsize::new(0),
        });
        let loader: Arc<dyn ResourceLoader> = filter.clone();

        run_once(&cache, &loader, "etag1", Some("A")).await;
        run_once(&cache, &loader, "etag2", Some("B")).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cache.stats().entries, 2);

        assert_eq!(cache.flush_tag("A"), 1);
        assert_eq!(cache.stats().entries, 1);

        // the "A" entry is gone, the "B" entry survives
        run_once(&cache, &loader, "etag1", Some("A")).await;
        assert_eq!(filter.calls.load(Ordering::SeqCst), 3);
        run_once(&cache, &loader, "etag2", Some("B")).await;
        assert_eq!(filter.calls.load(Ordering::SeqCst), 3);
    }
}
