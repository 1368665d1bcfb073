//! The process-global instance
//!
//! One [`Instance`] owns every process-wide singleton: the slice pool,
//! the rubber allocator, all four caches, the session manager, the pool
//! tree and the resource loader chain.  It also drives the periodic
//! timers: the one-minute cache/session sweep (which reseeds the session
//! PRNG), the ten-minute allocator compression, and the two-minute
//! session save.

use crate::cache::filter::FilterCache;
use crate::cache::http::HttpCache;
use crate::cache::nfs::{NfsCache, NfsClient};
use crate::cache::translate::TranslateCache;
use crate::config::RelayConfig;
use crate::mem::pool::{PoolId, PoolTree, SharedPoolTree};
use crate::mem::rubber::Rubber;
use crate::mem::slice_pool::SlicePool;
use crate::metrics::RelayMetrics;
use crate::request::response::{PassthroughProcessor, ResponseProcessor};
use crate::resource::{
    CachingResourceLoader, DirectResourceLoader, FilterResourceLoader, ResourceLoader,
    UpstreamTransport,
};
use crate::session::SessionManager;
use crate::translation::TranslationService;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Slice size used for I/O buffers and cache metadata
const DEFAULT_SLICE_SIZE: usize = 8192;
const SLICES_PER_AREA: u32 = 1024;

/// External collaborators injected at startup
pub struct InstanceDeps {
    pub translation: Arc<dyn TranslationService>,
    pub transport: Arc<dyn UpstreamTransport>,
    pub nfs_client: Option<Arc<dyn NfsClient>>,
    pub processor: Option<Arc<dyn ResponseProcessor>>,
}

pub struct Instance {
    pub config: RelayConfig,

    pub slice_pool: Arc<SlicePool>,
    pub rubber: Arc<Rubber>,
    pub pool_tree: SharedPoolTree,
    pub root_pool: PoolId,

    pub http_cache: Arc<HttpCache>,
    pub filter_cache: Arc<FilterCache>,
    pub nfs_cache: Option<Arc<NfsCache>>,
    pub translate_cache: Arc<TranslateCache>,

    pub sessions: Arc<SessionManager>,

    pub translation: Arc<dyn TranslationService>,
    pub direct_loader: Arc<dyn ResourceLoader>,
    pub cached_loader: Arc<dyn ResourceLoader>,
    pub filter_loader: Arc<dyn ResourceLoader>,
    pub processor: Arc<dyn ResponseProcessor>,

    pub metrics: RelayMetrics,
}

impl Instance {
    pub fn new(config: RelayConfig, deps: InstanceDeps) -> Arc<Self> {
        let slice_pool = Arc::new(SlicePool::new(DEFAULT_SLICE_SIZE, SLICES_PER_AREA));

        // the rubber map holds every cache body
        let rubber_size = (config.http_cache_size
            + config.filter_cache_size
            + config.nfs_cache_size)
            .max(64 * 1024 * 1024);
        let rubber = Arc::new(Rubber::new(rubber_size));

        let mut tree = PoolTree::new(Some(slice_pool.clone()));
        let root_pool = tree.new_root("root");
        let pool_tree: SharedPoolTree = Arc::new(Mutex::new(tree));

        let http_cache = Arc::new(HttpCache::new(config.http_cache_size, rubber.clone()));
        let filter_cache = Arc::new(FilterCache::new(config.filter_cache_size, rubber.clone()));
        let nfs_cache = deps.nfs_client.map(|client| {
            Arc::new(NfsCache::new(
                config.nfs_cache_size,
                rubber.clone(),
                client,
            ))
        });
        let translate_cache = Arc::new(TranslateCache::new(config.translate_cache_size));

        let sessions = Arc::new(SessionManager::new(
            config.session_idle_timeout(),
            config.session.max_sessions,
            config.cluster_node.zip(config.cluster_size),
        ));
        if let Some(path) = &config.session.save_path {
            sessions.load(&PathBuf::from(path));
        }

        let direct_loader: Arc<dyn ResourceLoader> = Arc::new(DirectResourceLoader {
            transport: deps.transport,
        });
        let cached_loader: Arc<dyn ResourceLoader> = Arc::new(CachingResourceLoader {
            inner: direct_loader.clone(),
            cache: http_cache.clone(),
        });
        let filter_loader: Arc<dyn ResourceLoader> = Arc::new(FilterResourceLoader {
            inner: direct_loader.clone(),
            cache: filter_cache.clone(),
        });

        Arc::new(Self {
            config,
            slice_pool,
            rubber,
            pool_tree,
            root_pool,
            http_cache,
            filter_cache,
            nfs_cache,
            translate_cache,
            sessions,
            translation: deps.translation,
            direct_loader,
            cached_loader,
            filter_loader,
            processor: deps
                .processor
                .unwrap_or_else(|| Arc::new(PassthroughProcessor)),
            metrics: RelayMetrics::new(),
        })
    }

    /// Start the periodic maintenance tasks
    pub fn spawn_timers(self: &Arc<Self>) {
        // minute sweep: expired cache items, idle sessions, PRNG reseed
        let instance = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            interval.tick().await;
            loop {
                interval.tick().await;
                instance.http_cache.expire_sweep();
                instance.filter_cache.expire_sweep();
                instance.translate_cache.expire_sweep();
                if let Some(nfs) = &instance.nfs_cache {
                    nfs.expire_sweep();
                }
                instance.sessions.cleanup();
                instance.pool_tree.lock().unwrap().commit();
            }
        });

        // ten-minute compression of the allocators
        let instance = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(600));
            interval.tick().await;
            loop {
                interval.tick().await;
                instance.compress();
            }
        });

        // two-minute session save
        if let Some(path) = self.config.session.save_path.clone() {
            let instance = self.clone();
            let path = PathBuf::from(path);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(120));
                interval.tick().await;
                loop {
                    interval.tick().await;
                    if let Err(e) = instance.sessions.save(&path) {
                        warn!("session save failed: {}", e);
                    }
                }
            });
        }

        info!("maintenance timers started");
    }

    /// Return unused allocator memory to the kernel
    pub fn compress(&self) {
        debug!("compressing allocators");
        self.slice_pool.compress();
        self.rubber.compress();
    }

    /// Control whether forked children inherit the big allocations
    pub fn fork_cow(&self, inherit: bool) {
        self.slice_pool.fork_cow(inherit);
        self.rubber.fork_cow(inherit);
    }

    /// Statistics snapshot for the control channel
    pub fn stats_json(&self) -> serde_json::Value {
        serde_json::json!({
            "http_cache": cache_stats_json(self.http_cache.stats()),
            "filter_cache": cache_stats_json(self.filter_cache.stats()),
            "translate_cache": cache_stats_json(self.translate_cache.stats()),
            "nfs_cache": self.nfs_cache.as_ref().map(|c| cache_stats_json(c.stats())),
            "sessions": self.sessions.count(),
            "slice_pool": self.slice_pool.stats(),
            "rubber": {
                "brutto_size": self.rubber.brutto_size(),
                "netto_size": self.rubber.netto_size(),
            },
        })
    }

    /// Prometheus exposition of the same numbers
    pub fn metrics_text(&self) -> String {
        self.metrics.render(self)
    }
}

fn cache_stats_json(stats: crate::cache::CacheStats) -> serde_json::Value {
    serde_json::json!({
        "entries": stats.entries,
        "bytes": stats.bytes,
        "hits": stats.hits,
        "misses": stats.misses,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::Body;
    use crate::error::Result;
    use crate::resource::{HttpResponse, ResourceAddress};
    use crate::translation::StaticTranslationService;
    use async_trait::async_trait;
    use http::{HeaderMap, Method, StatusCode};

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
        ) -> Result<HttpResponse> {
            Err(crate::error::RelayError::SocketProtocol(
                "no upstream configured".to_string(),
            ))
        }
    }

    pub(crate) fn test_instance() -> Arc<Instance> {
        Instance::new(
            RelayConfig::default(),
            InstanceDeps {
                translation: Arc::new(StaticTranslationService {
                    docroot: "/var/www".to_string(),
                }),
                transport: Arc::new(NoUpstream),
                nfs_client: None,
                processor: None,
            },
        )
    }

    #[tokio::test]
    async fn test_instance_construction() {
        let instance = test_instance();
        assert_eq!(instance.sessions.count(), 0);
        assert_eq!(instance.http_cache.stats().entries, 0);

        let stats = instance.stats_json();
        assert!(stats.get("rubber").is_some());
    }

    #[tokio::test]
    async fn test_compress_is_idempotent() {
        let instance = test_instance();
        instance.compress();
        instance.compress();
    }
}
