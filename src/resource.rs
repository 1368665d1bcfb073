//! Resource addresses and resource loaders
//!
//! A [`ResourceAddress`] describes where a resource lives (local file,
//! HTTP upstream, CGI-like process, NFS export).  A [`ResourceLoader`]
//! fetches one; the concrete implementations compose: `Direct` talks to
//! the upstream transports, `Caching` wraps it with the HTTP response
//! cache, `Filter` wraps it with the filter cache.

use crate::body::Body;
use crate::error::Result;
use async_trait::async_trait;
use http::{HeaderMap, Method, StatusCode};
use std::sync::Arc;

/// A local file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAddress {
    pub path: String,

    /// Overrides Content-Type sniffing by extension
    pub content_type: Option<String>,

    /// Probe for a precompressed `.gz` sibling
    pub auto_gzipped: bool,

    /// Probe for a precompressed `.br` sibling
    pub auto_brotli: bool,

    /// Fixed path of a gzipped variant set by the translation server,
    /// probed after the automatic siblings
    pub gzipped: Option<String>,
}

impl FileAddress {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content_type: None,
            auto_gzipped: false,
            auto_brotli: false,
            gzipped: None,
        }
    }
}

/// An HTTP (or HTTP-over-local-socket) upstream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpAddress {
    pub https: bool,
    pub host_and_port: String,
    pub path: String,
}

impl HttpAddress {
    pub fn url(&self) -> String {
        format!(
            "{}://{}{}",
            if self.https { "https" } else { "http" },
            self.host_and_port,
            self.path
        )
    }
}

/// Flavor of a CGI-like upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgiKind {
    Cgi,
    FastCgi,
    Was,
    Lhttp,
}

/// A CGI-like upstream: a local program or application socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgiAddress {
    pub kind: CgiKind,
    pub path: String,
    pub path_info: Option<String>,
    pub query_string: Option<String>,
}

/// A file on an NFS export
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NfsAddress {
    pub server: String,
    pub export: String,
    pub path: String,
    pub content_type: Option<String>,
}

/// Tagged union of resource locations
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ResourceAddress {
    #[default]
    None,
    Local(FileAddress),
    Http(HttpAddress),
    Cgi(CgiAddress),
    Nfs(NfsAddress),
}

impl ResourceAddress {
    /// Canonical cache key for this address
    pub fn cache_key(&self) -> String {
        match self {
            ResourceAddress::None => String::new(),
            ResourceAddress::Local(file) => format!("file:{}", file.path),
            ResourceAddress::Http(http) => http.url(),
            ResourceAddress::Cgi(cgi) => format!(
                "cgi:{}{}{}",
                cgi.path,
                cgi.path_info.as_deref().unwrap_or(""),
                cgi.query_string
                    .as_deref()
                    .map(|q| format!("?{}", q))
                    .unwrap_or_default()
            ),
            ResourceAddress::Nfs(nfs) => {
                format!("nfs://{}{}{}", nfs.server, nfs.export, nfs.path)
            }
        }
    }

    /// Whether the upstream has its own clock (needed for Expires skew)
    pub fn is_remote(&self) -> bool {
        matches!(self, ResourceAddress::Http(_))
    }

    pub fn has_query_string(&self) -> bool {
        match self {
            ResourceAddress::Http(http) => http.path.contains('?'),
            ResourceAddress::Cgi(cgi) => cgi.query_string.is_some(),
            _ => false,
        }
    }

    /// Merge the request's path_info and query string into the address
    /// template delivered by the translation server
    pub fn apply(&self, path_info: Option<&str>, query_string: Option<&str>) -> ResourceAddress {
        let mut address = self.clone();
        match &mut address {
            ResourceAddress::Local(file) => {
                if let Some(info) = path_info {
                    file.path.push_str(info);
                }
            }
            ResourceAddress::Http(http) => {
                if let Some(info) = path_info {
                    http.path.push_str(info);
                }
                if let Some(query) = query_string {
                    http.path
                        .push(if http.path.contains('?') { '&' } else { '?' });
                    http.path.push_str(query);
                }
            }
            ResourceAddress::Cgi(cgi) => {
                if let Some(info) = path_info {
                    cgi.path_info = Some(match cgi.path_info.take() {
                        Some(mut existing) => {
                            existing.push_str(info);
                            existing
                        }
                        None => info.to_string(),
                    });
                }
                if let Some(query) = query_string {
                    cgi.query_string = Some(query.to_string());
                }
            }
            ResourceAddress::Nfs(nfs) => {
                if let Some(info) = path_info {
                    nfs.path.push_str(info);
                }
            }
            ResourceAddress::None => {}
        }
        address
    }
}

/// A response on its way back to the client
#[derive(Debug)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Body,
}

impl HttpResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: Body) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    pub fn plain(status: StatusCode, text: &str) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static("text/plain"),
        );
        Self {
            status,
            headers,
            body: Body::full(bytes::Bytes::copy_from_slice(text.as_bytes())),
        }
    }
}

/// Per-call options for a resource load
#[derive(Debug, Clone, Default)]
pub struct ResourceRequestParams {
    /// Pin the upstream selection for this session
    pub sticky_hash: Option<u64>,

    /// Tag for group invalidation of cached entries
    pub cache_tag: Option<String>,

    /// Identity of the request body (for the filter cache key)
    pub body_etag: Option<String>,

    /// Authenticated user (for the filter cache key)
    pub user: Option<String>,

    /// When false, request `Cache-Control: no-cache` is ignored
    pub obey_no_cache: bool,

    /// Record cache metrics for this call
    pub want_metrics: bool,
}

impl ResourceRequestParams {
    pub fn obeying_no_cache() -> Self {
        Self {
            obey_no_cache: true,
            ..Default::default()
        }
    }
}

/// Uniform resource fetching interface.
///
/// `status` carries the status of the response being filtered when this
/// loader runs as a filter stage; plain fetches pass `None`.
#[async_trait]
pub trait ResourceLoader: Send + Sync {
    async fn send_request(
        &self,
        params: ResourceRequestParams,
        method: Method,
        address: &ResourceAddress,
        status: Option<StatusCode>,
        headers: HeaderMap,
        body: Body,
    ) -> Result<HttpResponse>;
}

/// Transport for non-local addresses; implemented by the HTTP client,
/// FastCGI/WAS/CGI launchers and the NFS client outside this crate
#[async_trait]
pub trait UpstreamTransport: Send + Sync {
    async fn send_request(
        &self,
        method: Method,
        address: &ResourceAddress,
        status: Option<StatusCode>,
        headers: HeaderMap,
        body: Body,
    ) -> Result<HttpResponse>;
}

/// The innermost loader: hands the request to the matching transport
pub struct DirectResourceLoader {
    pub transport: Arc<dyn UpstreamTransport>,
}

#[async_trait]
impl ResourceLoader for DirectResourceLoader {
    async fn send_request(
        &self,
        _params: ResourceRequestParams,
        method: Method,
        address: &ResourceAddress,
        status: Option<StatusCode>,
        headers: HeaderMap,
        body: Body,
    ) -> Result<HttpResponse> {
        self.transport
            .send_request(method, address, status, headers, body)
            .await
    }
}

/// Loader wrapping another one with the HTTP response cache
pub struct CachingResourceLoader {
    pub inner: Arc<dyn ResourceLoader>,
    pub cache: Arc<crate::cache::http::HttpCache>,
}

#[async_trait]
impl ResourceLoader for CachingResourceLoader {
    async fn send_request(
        &self,
        params: ResourceRequestParams,
        method: Method,
        address: &ResourceAddress,
        status: Option<StatusCode>,
        headers: HeaderMap,
        body: Body,
    ) -> Result<HttpResponse> {
        self.cache
            .serve(&self.inner, params, method, address, status, headers, body)
            .await
    }
}

/// Loader wrapping another one with the filter cache
pub struct FilterResourceLoader {
    pub inner: Arc<dyn ResourceLoader>,
    pub cache: Arc<crate::cache::filter::FilterCache>,
}

#[async_trait]
impl ResourceLoader for FilterResourceLoader {
    async fn send_request(
        &self,
        params: ResourceRequestParams,
        method: Method,
        address: &ResourceAddress,
        status: Option<StatusCode>,
        headers: HeaderMap,
        body: Body,
    ) -> Result<HttpResponse> {
        self.cache
            .serve(&self.inner, params, method, address, status, headers, body)
            .await
    }
}
