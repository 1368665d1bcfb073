//! edge-relay
//!
//! The memory, caching and request-lifecycle core of a reverse HTTP
//! proxy.  The proxy terminates HTTP, asks an external translation
//! service how each request should be handled, and serves the response
//! from local files, upstream servers or one of the local caches, piping
//! bodies through a transformation pipeline on the way out.
//!
//! # Architecture
//!
//! - [`mem`]: the allocator layer: page regions, the slice pool for
//!   fixed-size objects, the rubber allocator for cache bodies (stable
//!   ids, in-place compaction), the request pool tree and slice-backed
//!   FIFO buffers
//! - [`cache`]: the generic keyed LRU cache and its four users: HTTP
//!   response cache, filter cache, NFS file cache, translation cache
//! - [`session`]: the in-memory session store with idle expiry,
//!   purge-on-pressure and the save/reload side channel
//! - [`request`]: the per-request state machine, the file handler and
//!   the response pipeline
//! - [`instance`]: the process-global singletons and periodic timers
//! - [`connection`], [`control`]: the HTTP listener and the datagram
//!   control channel
//!
//! The runtime model is cooperative: one tokio runtime per process,
//! every cache and allocator shared behind short critical sections,
//! every suspension point explicit.

pub mod body;
pub mod cache;
pub mod config;
pub mod connection;
pub mod control;
pub mod error;
pub mod http_date;
pub mod instance;
pub mod mem;
pub mod metrics;
pub mod request;
pub mod resource;
pub mod session;
pub mod translation;

// Re-export commonly used types
pub use body::Body;
pub use config::RelayConfig;
pub use error::{RelayError, Result};
pub use instance::{Instance, InstanceDeps};
pub use mem::rubber::Rubber;
pub use mem::slice_pool::SlicePool;
pub use request::handler::handle_request;
pub use request::IncomingRequest;
pub use resource::{HttpResponse, ResourceAddress, ResourceLoader, UpstreamTransport};
pub use session::SessionManager;
pub use translation::{TranslateRequest, TranslateResponse, TranslationService};
