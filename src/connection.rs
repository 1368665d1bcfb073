//! Connection management
//!
//! Accept loop, one pool per connection (a child of the instance root
//! pool, with per-request pools below it), the hyper adapter that feeds
//! dissected requests into the state machine, and connection dropping
//! under pressure: when the connection budget is exceeded, the least
//! recently active connection is closed.

use crate::body::Body;
use crate::instance::Instance;
use crate::mem::pool::{PoolId, PoolRef};
use crate::request::handler::handle_request;
use crate::request::IncomingRequest;
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

/// Adapter presenting our [`Body`] to hyper
pub struct OutgoingBody(Body);

impl hyper::body::Body for OutgoingBody {
    type Data = Bytes;
    type Error = std::io::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<hyper::body::Frame<Bytes>, Self::Error>>> {
        let this = self.get_mut();
        match this.0.poll_chunk(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Ready(Some(Ok(data))) => {
                Poll::Ready(Some(Ok(hyper::body::Frame::data(data))))
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                e.to_string(),
            )))),
        }
    }
}

/// Pump a hyper request body into our channel-backed body.
///
/// Chunks are staged through a slice-backed multi-FIFO buffer so the
/// bytes live in the slice pool instead of scattered heap allocations
/// while they wait for the handler.
fn adapt_incoming_body(
    pool: Arc<crate::mem::slice_pool::SlicePool>,
    incoming: hyper::body::Incoming,
) -> Body {
    let declared = {
        use hyper::body::Body as _;
        let hint = incoming.size_hint();
        hint.exact()
    };
    if declared == Some(0) {
        return Body::empty();
    }

    let (tx, body) = Body::channel(declared);
    tokio::spawn(async move {
        let mut incoming = incoming;
        let mut staging = crate::mem::fifo::MultiFifoBuffer::new();
        while let Some(frame) = incoming.frame().await {
            match frame {
                Ok(frame) => {
                    if let Ok(data) = frame.into_data() {
                        staging.push(&pool, &data);
                    }
                    while !staging.is_empty() {
                        let chunk = staging.read(&pool);
                        let n = chunk.len();
                        if tx.send(chunk).await.is_err() {
                            staging.clear(&pool);
                            return;
                        }
                        staging.consume(&pool, n);
                    }
                }
                Err(e) => {
                    let _ = tx
                        .send_error(crate::error::RelayError::SocketProtocol(e.to_string()))
                        .await;
                    staging.clear(&pool);
                    return;
                }
            }
        }
        staging.clear(&pool);
    });
    body
}

struct ConnectionEntry {
    last_activity: Instant,
    abort: AbortHandle,
}

/// Tracks live connections and drops the most idle one under pressure
pub struct ConnectionManager {
    connections: Mutex<HashMap<u64, ConnectionEntry>>,
    next_id: AtomicU64,
    max_connections: usize,
}

impl ConnectionManager {
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            max_connections,
        }
    }

    pub fn count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn register(&self, id: u64, abort: AbortHandle) {
        let mut connections = self.connections.lock().unwrap();

        if connections.len() >= self.max_connections {
            // drop the least recently active connection
            if let Some((&victim, _)) = connections
                .iter()
                .min_by_key(|(_, entry)| entry.last_activity)
            {
                if let Some(entry) = connections.remove(&victim) {
                    warn!(victim, "dropping connection under pressure");
                    entry.abort.abort();
                }
            }
        }

        connections.insert(
            id,
            ConnectionEntry {
                last_activity: Instant::now(),
                abort,
            },
        );
    }

    fn touch(&self, id: u64) {
        if let Some(entry) = self.connections.lock().unwrap().get_mut(&id) {
            entry.last_activity = Instant::now();
        }
    }

    fn unregister(&self, id: u64) {
        self.connections.lock().unwrap().remove(&id);
    }
}

/// Serve one listener socket forever
pub async fn run_listener(
    instance: Arc<Instance>,
    manager: Arc<ConnectionManager>,
    listener: TcpListener,
    listener_tag: Option<String>,
) {
    info!(addr = ?listener.local_addr().ok(), "listening");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("accept failed: {}", e);
                continue;
            }
        };

        let instance = instance.clone();
        let manager_for_task = manager.clone();
        let tag = listener_tag.clone();
        let connection_id = manager.allocate_id();

        let task = tokio::spawn(async move {
            serve_connection(
                instance,
                manager_for_task.clone(),
                connection_id,
                stream,
                peer,
                tag,
            )
            .await;
            manager_for_task.unregister(connection_id);
        });
        manager.register(connection_id, task.abort_handle());
        debug!(connection_id, peer = %peer, "connection accepted");
    }
}

async fn serve_connection(
    instance: Arc<Instance>,
    manager: Arc<ConnectionManager>,
    connection_id: u64,
    stream: tokio::net::TcpStream,
    peer: SocketAddr,
    listener_tag: Option<String>,
) {
    // a pool per connection; requests allocate children of it
    let connection_pool: PoolRef = {
        let mut tree = instance.pool_tree.lock().unwrap();
        let id = tree.new_linear(instance.root_pool, "connection", 0);
        PoolRef::new(instance.pool_tree.clone(), id)
    };
    let connection_pool_id = connection_pool.id();

    let io = TokioIo::new(stream);
    let service = service_fn(move |request: hyper::Request<hyper::body::Incoming>| {
        let instance = instance.clone();
        let manager = manager.clone();
        handle_hyper_request(
            instance,
            manager,
            connection_id,
            connection_pool_id,
            peer.ip(),
            listener_tag.clone(),
            request,
        )
    });

    if let Err(e) = hyper::server::conn::http1::Builder::new()
        .serve_connection(io, service)
        .await
    {
        debug!(peer = %peer, "connection ended: {}", e);
    }

    drop(connection_pool);
}

async fn handle_hyper_request(
    instance: Arc<Instance>,
    manager: Arc<ConnectionManager>,
    connection_id: u64,
    connection_pool: PoolId,
    remote_addr: IpAddr,
    listener_tag: Option<String>,
    request: hyper::Request<hyper::body::Incoming>,
) -> std::result::Result<hyper::Response<OutgoingBody>, std::convert::Infallible> {
    manager.touch(connection_id);

    let (parts, body) = request.into_parts();
    let uri = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| parts.uri.path().to_string());

    let incoming = IncomingRequest {
        method: parts.method,
        uri,
        headers: parts.headers,
        body: adapt_incoming_body(instance.slice_pool.clone(), body),
        remote_addr,
        is_tls: false,
        listener_tag,
    };

    let response = handle_request(instance, connection_pool, incoming).await;

    let mut builder = hyper::Response::builder().status(response.status);
    if let Some(headers) = builder.headers_mut() {
        *headers = response.headers;
    }
    Ok(builder
        .body(OutgoingBody(response.body))
        .expect("response construction cannot fail"))
}
