//! NFS file cache
//!
//! Serves files from NFS exports through an external client.  Small
//! files (up to 512 KiB) are kept whole in the rubber allocator together
//! with their stat data; larger files are streamed through untouched.
//! Range requests against a cached file are substring views over the
//! rubber body.

use crate::body::Body;
use crate::cache::{Cache, CacheItem, CacheStats, Expiry};
use crate::error::{RelayError, Result};
use crate::http_date::format_http_date;
use crate::mem::rubber::{Rubber, RubberAllocation};
use crate::mem::sink::{sink_to_rubber, SinkRubberOutcome};
use crate::resource::{HttpResponse, NfsAddress};
use async_trait::async_trait;
use http::{header, HeaderMap, HeaderValue, StatusCode};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tracing::debug;

/// Files larger than this bypass the cache
const CACHEABLE_SIZE_LIMIT: u64 = 512 * 1024;

/// Cached files are trusted for this long before the next stat
const ITEM_TTL: Duration = Duration::from_secs(60);

/// Subset of the stat result the cache keeps
#[derive(Debug, Clone, Copy)]
pub struct NfsStat {
    pub size: u64,
    pub mtime: SystemTime,
}

/// The external NFS client this cache drives
#[async_trait]
pub trait NfsClient: Send + Sync {
    async fn stat(&self, server: &str, export: &str, path: &str) -> Result<NfsStat>;

    /// Read `len` bytes starting at `offset` as a streamed body
    async fn read(
        &self,
        server: &str,
        export: &str,
        path: &str,
        offset: u64,
        len: u64,
    ) -> Result<Body>;
}

struct NfsCacheItem {
    stat: NfsStat,
    body: RubberAllocation,
}

impl CacheItem for NfsCacheItem {
    fn size(&self) -> usize {
        64 + self.body.size()
    }
}

pub struct NfsCache {
    cache: Mutex<Cache<NfsCacheItem>>,
    rubber: Arc<Rubber>,
    client: Arc<dyn NfsClient>,
}

impl NfsCache {
    pub fn new(max_size: usize, rubber: Arc<Rubber>, client: Arc<dyn NfsClient>) -> Self {
        Self {
            cache: Mutex::new(Cache::new(max_size)),
            rubber,
            client,
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.lock().unwrap().stats()
    }

    pub fn flush(&self) -> usize {
        self.cache.lock().unwrap().flush()
    }

    pub fn expire_sweep(&self) -> usize {
        self.cache.lock().unwrap().expire_sweep()
    }

    /// Serve a file, optionally a byte range of it
    pub async fn serve(
        self: &Arc<Self>,
        address: &NfsAddress,
        range: Option<(u64, u64)>,
    ) -> Result<HttpResponse> {
        let key = crate::resource::ResourceAddress::Nfs(address.clone()).cache_key();

        {
            let mut cache = self.cache.lock().unwrap();
            if let Some(item) = cache.get(&key, |_| true) {
                debug!(key, "nfs cache hit");
                let stat = item.stat;
                let body = item.body.to_bytes(0..item.body.size());
                drop(cache);
                return self.respond(address, stat, body, range);
            }
        }

        let stat = self
            .client
            .stat(&address.server, &address.export, &address.path)
            .await?;

        if stat.size > CACHEABLE_SIZE_LIMIT {
            debug!(key, size = stat.size, "nfs file too large, streaming");
            return self.stream_through(address, stat, range).await;
        }

        debug!(key, size = stat.size, "nfs cache miss");
        let body = self
            .client
            .read(&address.server, &address.export, &address.path, 0, stat.size)
            .await?;
        let (client_body, capture_body) = body.tee();

        let this = self.clone();
        let capture_key = key.clone();
        tokio::spawn(async move {
            match sink_to_rubber(
                this.rubber.clone(),
                capture_body,
                CACHEABLE_SIZE_LIMIT as usize,
            )
            .await
            {
                Ok(SinkRubberOutcome::Done(allocation)) => {
                    let item = NfsCacheItem {
                        stat,
                        body: allocation,
                    };
                    this.cache.lock().unwrap().put(
                        &capture_key,
                        item,
                        Expiry::after(ITEM_TTL),
                        |_| true,
                    );
                }
                _ => debug!(capture_key, "nfs capture not stored"),
            }
        });

        // small files are collected so ranges can be cut precisely
        let data = client_body.collect(CACHEABLE_SIZE_LIMIT as usize).await?;
        self.respond(address, stat, data, range)
    }

    /// Build the response for in-memory file data
    fn respond(
        &self,
        address: &NfsAddress,
        stat: NfsStat,
        data: bytes::Bytes,
        range: Option<(u64, u64)>,
    ) -> Result<HttpResponse> {
        let mut headers = HeaderMap::new();
        if let Some(content_type) = &address.content_type {
            if let Ok(value) = HeaderValue::from_str(content_type) {
                headers.insert(header::CONTENT_TYPE, value);
            }
        }
        if let Ok(value) = HeaderValue::from_str(&format_http_date(stat.mtime)) {
            headers.insert(header::LAST_MODIFIED, value);
        }

        match range {
            None => {
                headers.insert(header::CONTENT_LENGTH, HeaderValue::from(data.len()));
                Ok(HttpResponse::new(
                    StatusCode::OK,
                    headers,
                    Body::full(data),
                ))
            }
            Some((start, end)) => {
                if start > end || end >= stat.size {
                    return Err(RelayError::RangeNotSatisfiable { size: stat.size });
                }
                let slice = data.slice(start as usize..=end as usize);
                headers.insert(header::CONTENT_LENGTH, HeaderValue::from(slice.len()));
                if let Ok(value) = HeaderValue::from_str(&format!(
                    "bytes {}-{}/{}",
                    start, end, stat.size
                )) {
                    headers.insert(header::CONTENT_RANGE, value);
                }
                Ok(HttpResponse::new(
                    StatusCode::PARTIAL_CONTENT,
                    headers,
                    Body::full(slice),
                ))
            }
        }
    }

    /// Large file: hand the client stream through without caching
    async fn stream_through(
        &self,
        address: &NfsAddress,
        stat: NfsStat,
        range: Option<(u64, u64)>,
    ) -> Result<HttpResponse> {
        let mut headers = HeaderMap::new();
        if let Some(content_type) = &address.content_type {
            if let Ok(value) = HeaderValue::from_str(content_type) {
                headers.insert(header::CONTENT_TYPE, value);
            }
        }
        if let Ok(value) = HeaderValue::from_str(&format_http_date(stat.mtime)) {
            headers.insert(header::LAST_MODIFIED, value);
        }

        let (status, offset, len) = match range {
            None => (StatusCode::OK, 0, stat.size),
            Some((start, end)) => {
                if start > end || end >= stat.size {
                    return Err(RelayError::RangeNotSatisfiable { size: stat.size });
                }
                if let Ok(value) = HeaderValue::from_str(&format!(
                    "bytes {}-{}/{}",
                    start, end, stat.size
                )) {
                    headers.insert(header::CONTENT_RANGE, value);
                }
                (StatusCode::PARTIAL_CONTENT, start, end - start + 1)
            }
        };
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));

        let body = self
            .client
            .read(&address.server, &address.export, &address.path, offset, len)
            .await?;
        Ok(HttpResponse::new(status, headers, body))
    }
}
