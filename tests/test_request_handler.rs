//! End-to-end tests of the request state machine
//!
//! The translation service and the upstream transport are mocked; the
//! file system is real (tempdir).  Each scenario builds its own
//! instance, so caches never leak between tests.

use async_trait::async_trait;
use bytes::Bytes;
use edge_relay::body::Body;
use edge_relay::http_date::format_http_date;
use edge_relay::instance::{Instance, InstanceDeps};
use edge_relay::mem::pool::PoolId;
use edge_relay::request::{csrf, handler::handle_request, IncomingRequest};
use edge_relay::resource::{
    FileAddress, HttpAddress, HttpResponse, ResourceAddress, UpstreamTransport,
};
use edge_relay::translation::{TranslateRequest, TranslateResponse, TranslationService};
use edge_relay::{RelayConfig, RelayError};
use http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use std::io::Write as _;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Translation service driven by a closure
struct FnTranslation<F> {
    f: F,
    calls: AtomicUsize,
}

#[async_trait]
impl<F> TranslationService for FnTranslation<F>
where
    F: Fn(&TranslateRequest) -> TranslateResponse + Send + Sync,
{
    async fn send_request(
        &self,
        request: &TranslateRequest,
    ) -> edge_relay::Result<TranslateResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok((self.f)(request))
    }
}

/// Upstream transport driven by a closure
struct FnTransport<F> {
    f: F,
    calls: AtomicUsize,
}

#[async_trait]
impl<F> UpstreamTransport for FnTransport<F>
where
    F: Fn(&HeaderMap) -> HttpResponse + Send + Sync,
{
    async fn send_request(
        &self,
        _method: Method,
        _address: &ResourceAddress,
        _status: Option<StatusCode>,
        headers: HeaderMap,
        _body: Body,
    ) -> edge_relay::Result<HttpResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok((self.f)(&headers))
    }
}

struct NoUpstream;

#[async_trait]
impl UpstreamTransport for NoUpstream {
    async fn send_request(
        &self,
        _method: Method,
        _address: &ResourceAddress,
        _status: Option<StatusCode>,
        _headers: HeaderMap,
        _body: Body,
    ) -> edge_relay::Result<HttpResponse> {
        Err(RelayError::SocketProtocol("unexpected upstream call".into()))
    }
}

fn make_instance(
    translation: Arc<dyn TranslationService>,
    transport: Arc<dyn UpstreamTransport>,
) -> (Arc<Instance>, PoolId) {
    let instance = Instance::new(
        RelayConfig::default(),
        InstanceDeps {
            translation,
            transport,
            nfs_client: None,
            processor: None,
        },
    );
    let connection_pool = {
        let mut tree = instance.pool_tree.lock().unwrap();
        tree.new_linear(instance.root_pool, "connection", 0)
    };
    (instance, connection_pool)
}

fn incoming(method: Method, uri: &str, headers: HeaderMap) -> IncomingRequest {
    IncomingRequest {
        method,
        uri: uri.to_string(),
        headers,
        body: Body::empty(),
        remote_addr: "127.0.0.1".parse().unwrap(),
        is_tls: false,
        listener_tag: None,
    }
}

fn host_headers(host: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::HOST, HeaderValue::from_str(host).unwrap());
    headers
}

fn write_file(dir: &tempfile::TempDir, name: &str, content: &[u8]) -> String {
    let path = dir.path().join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(content).unwrap();
    path.to_str().unwrap().to_string()
}

fn local_translation(path: String) -> Arc<dyn TranslationService> {
    Arc::new(FnTranslation {
        calls: AtomicUsize::new(0),
        f: move |_req: &TranslateRequest| TranslateResponse {
            protocol_version: 3,
            address: Some(ResourceAddress::Local(FileAddress::new(path.clone()))),
            ..Default::default()
        },
    })
}

#[tokio::test]
async fn test_cached_static_file_with_revalidation() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(&dir, "x.html", b"hello");
    let (instance, pool) = make_instance(local_translation(path), Arc::new(NoUpstream));

    let response = handle_request(
        instance.clone(),
        pool,
        incoming(Method::GET, "/x.html", host_headers("h")),
    )
    .await;

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(
        response.headers.get(header::CONTENT_TYPE).unwrap(),
        "text/html"
    );
    assert!(response.headers.contains_key(header::LAST_MODIFIED));
    let etag = response.headers.get(header::ETAG).unwrap().clone();
    assert_eq!(response.body.collect(1024).await.unwrap(), "hello");

    // follow-up with the ETag is a 304 without body
    let mut headers = host_headers("h");
    headers.insert(header::IF_NONE_MATCH, etag);
    let response = handle_request(
        instance.clone(),
        pool,
        incoming(Method::GET, "/x.html", headers),
    )
    .await;
    assert_eq!(response.status, StatusCode::NOT_MODIFIED);
    assert!(!response.headers.contains_key(header::CONTENT_LENGTH));
    assert_eq!(response.body.collect(1024).await.unwrap(), "");
}

#[tokio::test]
async fn test_range_request() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(&dir, "x.html", b"hello");
    let (instance, pool) = make_instance(local_translation(path), Arc::new(NoUpstream));

    let mut headers = host_headers("h");
    headers.insert(header::RANGE, HeaderValue::from_static("bytes=1-3"));
    let response = handle_request(
        instance,
        pool,
        incoming(Method::GET, "/x.html", headers),
    )
    .await;

    assert_eq!(response.status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        response.headers.get(header::CONTENT_RANGE).unwrap(),
        "bytes 1-3/5"
    );
    assert_eq!(response.body.collect(1024).await.unwrap(), "ell");
}

#[tokio::test]
async fn test_range_unsatisfiable() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(&dir, "x.html", b"hello");
    let (instance, pool) = make_instance(local_translation(path), Arc::new(NoUpstream));

    let mut headers = host_headers("h");
    headers.insert(header::RANGE, HeaderValue::from_static("bytes=5-5"));
    let response = handle_request(
        instance,
        pool,
        incoming(Method::GET, "/x.html", headers),
    )
    .await;

    assert_eq!(response.status, StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(
        response.headers.get(header::CONTENT_RANGE).unwrap(),
        "bytes */5"
    );
}

#[tokio::test]
async fn test_head_request() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(&dir, "x.html", b"hello");
    let (instance, pool) = make_instance(local_translation(path), Arc::new(NoUpstream));

    let response = handle_request(
        instance,
        pool,
        incoming(Method::HEAD, "/x.html", host_headers("h")),
    )
    .await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.headers.get(header::CONTENT_LENGTH).unwrap(), "5");
    assert_eq!(response.body.collect(1024).await.unwrap(), "");
}

#[tokio::test]
async fn test_http_cache_hit_with_vary() {
    let translation: Arc<dyn TranslationService> = Arc::new(FnTranslation {
        calls: AtomicUsize::new(0),
        f: |_req: &TranslateRequest| TranslateResponse {
            protocol_version: 3,
            address: Some(ResourceAddress::Http(HttpAddress {
                https: false,
                host_and_port: "origin:80".to_string(),
                path: "/page".to_string(),
            })),
            ..Default::default()
        },
    });

    let transport = Arc::new(FnTransport {
        calls: AtomicUsize::new(0),
        f: |request_headers: &HeaderMap| {
            let language = request_headers
                .get(header::ACCEPT_LANGUAGE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            let mut headers = HeaderMap::new();
            headers.insert(header::VARY, HeaderValue::from_static("Accept-Language"));
            headers.insert(
                header::CACHE_CONTROL,
                HeaderValue::from_static("max-age=60"),
            );
            headers.insert(
                header::DATE,
                HeaderValue::from_str(&format_http_date(std::time::SystemTime::now())).unwrap(),
            );
            HttpResponse::new(
                StatusCode::OK,
                headers,
                Body::full(Bytes::from(language)),
            )
        },
    });
    let (instance, pool) = make_instance(translation, transport.clone());

    let request = |language: &'static str| {
        let mut headers = host_headers("h");
        headers.insert(
            header::ACCEPT_LANGUAGE,
            HeaderValue::from_static(language),
        );
        incoming(Method::GET, "/page", headers)
    };

    let response = handle_request(instance.clone(), pool, request("de")).await;
    assert_eq!(response.body.collect(1024).await.unwrap(), "de");
    assert_eq!(transport.calls.load(Ordering::SeqCst), 1);

    // give the capture sink time to store the body
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    // same language: served from the cache
    let response = handle_request(instance.clone(), pool, request("de")).await;
    assert_eq!(response.body.collect(1024).await.unwrap(), "de");
    assert_eq!(transport.calls.load(Ordering::SeqCst), 1);

    // different language: the Vary tuple does not match
    let response = handle_request(instance.clone(), pool, request("en")).await;
    assert_eq!(response.body.collect(1024).await.unwrap(), "en");
    assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_check_loop_bound() {
    let translation = Arc::new(FnTranslation {
        calls: AtomicUsize::new(0),
        f: |_req: &TranslateRequest| TranslateResponse {
            protocol_version: 3,
            check: Some(Bytes::from_static(b"check-payload")),
            ..Default::default()
        },
    });
    let (instance, pool) = make_instance(translation.clone(), Arc::new(NoUpstream));

    let response = handle_request(
        instance,
        pool,
        incoming(Method::GET, "/x", host_headers("h")),
    )
    .await;

    assert_eq!(response.status, StatusCode::BAD_GATEWAY);
    assert_eq!(
        response.body.collect(1024).await.unwrap(),
        "Too many consecutive CHECK packets"
    );
    // initial lookup plus at most four CHECK turns
    assert!(translation.calls.load(Ordering::SeqCst) <= 5);
}

#[tokio::test]
async fn test_https_only_redirect() {
    let translation: Arc<dyn TranslationService> = Arc::new(FnTranslation {
        calls: AtomicUsize::new(0),
        f: |_req: &TranslateRequest| TranslateResponse {
            protocol_version: 3,
            https_only: Some(443),
            ..Default::default()
        },
    });
    let (instance, pool) = make_instance(translation, Arc::new(NoUpstream));

    let response = handle_request(
        instance,
        pool,
        incoming(Method::GET, "/secure/page", host_headers("h")),
    )
    .await;

    assert_eq!(response.status, StatusCode::MOVED_PERMANENTLY);
    assert_eq!(
        response.headers.get(header::LOCATION).unwrap(),
        "https://h/secure/page"
    );
}

#[tokio::test]
async fn test_obsolete_translation_protocol() {
    let translation: Arc<dyn TranslationService> = Arc::new(FnTranslation {
        calls: AtomicUsize::new(0),
        f: |_req: &TranslateRequest| TranslateResponse {
            protocol_version: 1,
            ..Default::default()
        },
    });
    let (instance, pool) = make_instance(translation, Arc::new(NoUpstream));

    let response = handle_request(
        instance,
        pool,
        incoming(Method::GET, "/x", host_headers("h")),
    )
    .await;
    assert_eq!(response.status, StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn test_csrf_gate() {
    let translation: Arc<dyn TranslationService> = Arc::new(FnTranslation {
        calls: AtomicUsize::new(0),
        f: |_req: &TranslateRequest| TranslateResponse {
            protocol_version: 3,
            require_csrf_token: true,
            message: Some("ok".to_string()),
            ..Default::default()
        },
    });
    let (instance, pool) = make_instance(translation, Arc::new(NoUpstream));

    // a browser-like session with a known CSRF salt
    let lease = instance.sessions.create_session();
    let session_id = lease.id();
    let salt = lease.with(|s| s.csrf_salt).unwrap();

    let browser_headers = |token: Option<String>| {
        let mut headers = host_headers("h");
        headers.insert(
            header::USER_AGENT,
            HeaderValue::from_static("Mozilla/5.0"),
        );
        headers.insert(
            header::COOKIE,
            HeaderValue::from_str(&format!("beng_proxy_session={:032x}", session_id)).unwrap(),
        );
        if let Some(token) = token {
            headers.insert(
                "x-cm4all-csrf-token",
                HeaderValue::from_str(&token).unwrap(),
            );
        }
        headers
    };

    // POST without a token is refused
    let response = handle_request(
        instance.clone(),
        pool,
        incoming(Method::POST, "/submit", browser_headers(None)),
    )
    .await;
    assert_eq!(response.status, StatusCode::FORBIDDEN);

    // POST with a fresh token passes through to the handler
    let token = csrf::generate_token(salt, std::time::SystemTime::now());
    let response = handle_request(
        instance.clone(),
        pool,
        incoming(Method::POST, "/submit", browser_headers(Some(token))),
    )
    .await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body.collect(1024).await.unwrap(), "ok");

    // GET never needs a token
    let response = handle_request(
        instance.clone(),
        pool,
        incoming(Method::GET, "/submit", browser_headers(None)),
    )
    .await;
    assert_eq!(response.status, StatusCode::OK);
}

#[tokio::test]
async fn test_csrf_gate_without_session() {
    let translation: Arc<dyn TranslationService> = Arc::new(FnTranslation {
        calls: AtomicUsize::new(0),
        f: |_req: &TranslateRequest| TranslateResponse {
            protocol_version: 3,
            require_csrf_token: true,
            message: Some("ok".to_string()),
            ..Default::default()
        },
    });
    let (instance, pool) = make_instance(translation, Arc::new(NoUpstream));

    let no_session_headers = |token: Option<String>| {
        let mut headers = host_headers("h");
        headers.insert(
            header::USER_AGENT,
            HeaderValue::from_static("Mozilla/5.0"),
        );
        if let Some(token) = token {
            headers.insert(
                "x-cm4all-csrf-token",
                HeaderValue::from_str(&token).unwrap(),
            );
        }
        headers
    };

    // a malformed or missing token is refused even without a session
    let response = handle_request(
        instance.clone(),
        pool,
        incoming(Method::POST, "/submit", no_session_headers(None)),
    )
    .await;
    assert_eq!(response.status, StatusCode::FORBIDDEN);

    let response = handle_request(
        instance.clone(),
        pool,
        incoming(
            Method::POST,
            "/submit",
            no_session_headers(Some("not-a-token".to_string())),
        ),
    )
    .await;
    assert_eq!(response.status, StatusCode::FORBIDDEN);

    // a well-formed, fresh token passes: with no session there is no
    // salt to check the digest against, so the requirement is waived
    let token = csrf::generate_token(0x1234, std::time::SystemTime::now());
    let response = handle_request(
        instance.clone(),
        pool,
        incoming(
            Method::POST,
            "/submit",
            no_session_headers(Some(token)),
        ),
    )
    .await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body.collect(1024).await.unwrap(), "ok");

    // but a stale token is rejected before the session is consulted
    let old = std::time::SystemTime::now() - std::time::Duration::from_secs(7200);
    let token = csrf::generate_token(0x1234, old);
    let response = handle_request(
        instance.clone(),
        pool,
        incoming(
            Method::POST,
            "/submit",
            no_session_headers(Some(token)),
        ),
    )
    .await;
    assert_eq!(response.status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_message_response() {
    let translation: Arc<dyn TranslationService> = Arc::new(FnTranslation {
        calls: AtomicUsize::new(0),
        f: |_req: &TranslateRequest| TranslateResponse {
            protocol_version: 3,
            status: Some(StatusCode::TOO_MANY_REQUESTS),
            message: Some("slow down".to_string()),
            ..Default::default()
        },
    });
    let (instance, pool) = make_instance(translation, Arc::new(NoUpstream));

    let response = handle_request(
        instance,
        pool,
        incoming(Method::GET, "/x", host_headers("h")),
    )
    .await;
    assert_eq!(response.status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.body.collect(1024).await.unwrap(), "slow down");
}

#[tokio::test]
async fn test_empty_translation_response() {
    let translation: Arc<dyn TranslationService> = Arc::new(FnTranslation {
        calls: AtomicUsize::new(0),
        f: |_req: &TranslateRequest| TranslateResponse {
            protocol_version: 3,
            ..Default::default()
        },
    });
    let (instance, pool) = make_instance(translation, Arc::new(NoUpstream));

    let response = handle_request(
        instance,
        pool,
        incoming(Method::GET, "/x", host_headers("h")),
    )
    .await;
    assert_eq!(response.status, StatusCode::BAD_GATEWAY);
    assert_eq!(response.body.collect(1024).await.unwrap(), "Empty response");
}

#[tokio::test]
async fn test_server_and_date_headers_added() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(&dir, "x.txt", b"data");
    let (instance, pool) = make_instance(local_translation(path), Arc::new(NoUpstream));

    let response = handle_request(
        instance,
        pool,
        incoming(Method::GET, "/x.txt", host_headers("h")),
    )
    .await;
    assert!(response.headers.contains_key(header::SERVER));
    assert!(response.headers.contains_key(header::DATE));
}
