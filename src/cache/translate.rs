//! Cache for translation service responses
//!
//! Keyed by host and URI, with a per-item "vary" set of translation
//! commands deciding which request fields must match for a hit.
//! Invalidation works by cache tag (through a secondary index), by a
//! `(request, vary commands, site)` triple, by URI prefix and wholesale.

use crate::cache::{Cache, CacheItem, CacheStats, Expiry};
use crate::error::Result;
use crate::translation::{
    TranslateRequest, TranslateResponse, TranslationCommand, TranslationService,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};
use xxhash_rust::xxh3::xxh3_64;

/// Default TTL when the response carries no max-age
const DEFAULT_EXPIRES: Duration = Duration::from_secs(3600);

/// The request field a vary command selects
fn request_value(request: &TranslateRequest, command: TranslationCommand) -> String {
    match command {
        TranslationCommand::Uri => request.uri.clone(),
        TranslationCommand::Host => request.host.clone(),
        TranslationCommand::Session => request
            .session
            .as_ref()
            .map(|s| format!("{:016x}", xxh3_64(s)))
            .unwrap_or_default(),
        TranslationCommand::ListenerTag => request.listener_tag.clone().unwrap_or_default(),
        TranslationCommand::Language => request.accept_language.clone().unwrap_or_default(),
        TranslationCommand::UserAgent => request.user_agent.clone().unwrap_or_default(),
        TranslationCommand::QueryString => request.query_string.clone().unwrap_or_default(),
        TranslationCommand::User => request.user.clone().unwrap_or_default(),
        TranslationCommand::Authorization => request.authorization.clone().unwrap_or_default(),
    }
}

struct TranslateCacheItem {
    response: TranslateResponse,

    /// Which commands participated in the key, and the request values
    /// recorded for them
    vary: Vec<TranslationCommand>,
    values: HashMap<TranslationCommand, String>,

    uri: String,
    site: Option<String>,
    tag: Option<String>,
}

impl TranslateCacheItem {
    fn matches(&self, request: &TranslateRequest) -> bool {
        self.vary
            .iter()
            .all(|&command| self.values[&command] == request_value(request, command))
    }
}

impl CacheItem for TranslateCacheItem {
    /// The budget counts entries, not bytes
    fn size(&self) -> usize {
        1
    }
}

pub struct TranslateCache {
    cache: Mutex<Cache<TranslateCacheItem>>,

    /// tag -> primary keys, so tag invalidation does not scan everything
    by_tag: Mutex<HashMap<String, HashSet<String>>>,
}

impl TranslateCache {
    /// `max_entries` bounds the number of cached responses
    pub fn new(max_entries: usize) -> Self {
        Self {
            cache: Mutex::new(Cache::new(max_entries)),
            by_tag: Mutex::new(HashMap::new()),
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.lock().unwrap().stats()
    }

    fn primary_key(request: &TranslateRequest) -> String {
        format!("{}|{}", request.host, request.uri)
    }

    /// Look up a cached decision, or ask the translation service and
    /// remember its answer
    pub async fn get_or_translate(
        &self,
        service: &Arc<dyn TranslationService>,
        request: &TranslateRequest,
    ) -> Result<TranslateResponse> {
        let key = Self::primary_key(request);

        {
            let mut cache = self.cache.lock().unwrap();
            if let Some(item) = cache.get(&key, |item| item.matches(request)) {
                debug!(key, "translate cache hit");
                return Ok(item.response.clone());
            }
        }

        debug!(key, "translate cache miss");
        let response = service.send_request(request).await?;
        self.store(&key, request, &response);
        Ok(response)
    }

    fn store(&self, key: &str, request: &TranslateRequest, response: &TranslateResponse) {
        if response.uncached || response.max_age == Some(Duration::ZERO) {
            return;
        }

        // the default key is the full request identity
        let vary: Vec<TranslationCommand> = if response.vary.is_empty() {
            vec![TranslationCommand::Host, TranslationCommand::Uri]
        } else {
            response.vary.clone()
        };

        let values = vary
            .iter()
            .map(|&command| (command, request_value(request, command)))
            .collect();

        let item = TranslateCacheItem {
            response: response.clone(),
            vary,
            values,
            uri: request.uri.clone(),
            site: response.site.clone(),
            tag: response.cache_tag.clone(),
        };

        if let Some(tag) = &response.cache_tag {
            self.by_tag
                .lock()
                .unwrap()
                .entry(tag.clone())
                .or_default()
                .insert(key.to_string());
        }

        let ttl = response.max_age.unwrap_or(DEFAULT_EXPIRES);
        let matches = {
            let request = request.clone();
            move |other: &TranslateCacheItem| other.matches(&request)
        };
        self.cache
            .lock()
            .unwrap()
            .put(key, item, Expiry::after(ttl), matches);
    }

    pub fn flush(&self) -> usize {
        self.by_tag.lock().unwrap().clear();
        self.cache.lock().unwrap().flush()
    }

    /// Drop every item whose response declared `tag`
    pub fn invalidate_tag(&self, tag: &str) -> usize {
        let keys = match self.by_tag.lock().unwrap().remove(tag) {
            Some(keys) => keys,
            None => return 0,
        };

        let mut cache = self.cache.lock().unwrap();
        let mut removed = 0;
        for key in keys {
            removed += cache.remove_match(&key, |item| item.tag.as_deref() == Some(tag));
        }
        info!(tag, removed, "translate cache invalidated by tag");
        removed
    }

    /// Drop every item where, for each given command, the recorded value
    /// equals the invalidating request's value, and the site matches
    pub fn invalidate(
        &self,
        request: &TranslateRequest,
        commands: &[TranslationCommand],
        site: Option<&str>,
    ) -> usize {
        let removed = self.cache.lock().unwrap().remove_if(|_, item| {
            if let Some(site) = site {
                if item.site.as_deref() != Some(site) {
                    return false;
                }
            }
            commands.iter().all(|&command| {
                item.values
                    .get(&command)
                    .is_some_and(|value| *value == request_value(request, command))
            })
        });
        info!(removed, "translate cache invalidated");
        removed
    }

    /// Drop every item whose URI starts with `prefix`
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        self.cache
            .lock()
            .unwrap()
            .remove_if(|_, item| item.uri.starts_with(prefix))
    }

    pub fn expire_sweep(&self) -> usize {
        self.cache.lock().unwrap().expire_sweep()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingService {
        calls: AtomicUsize,
        template: TranslateResponse,
    }

    #[async_trait]
    impl TranslationService for CountingService {
        async fn send_request(&self, _request: &TranslateRequest) -> Result<TranslateResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.template.clone())
        }
    }

    fn service(template: TranslateResponse) -> (Arc<CountingService>, Arc<dyn TranslationService>) {
        let service = Arc::new(CountingService {
            calls: AtomicUsize::new(0),
            template,
        });
        let dynamic: Arc<dyn TranslationService> = service.clone();
        (service, dynamic)
    }

    fn request(host: &str, uri: &str) -> TranslateRequest {
        TranslateRequest {
            host: host.to_string(),
            uri: uri.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_hit_and_miss() {
        let cache = TranslateCache::new(100);
        let (counter, svc) = service(TranslateResponse {
            protocol_version: 3,
            ..Default::default()
        });

        cache
            .get_or_translate(&svc, &request("h", "/a"))
            .await
            .unwrap();
        cache
            .get_or_translate(&svc, &request("h", "/a"))
            .await
            .unwrap();
        assert_eq!(counter.calls.load(Ordering::SeqCst), 1);

        cache
            .get_or_translate(&svc, &request("h", "/b"))
            .await
            .unwrap();
        assert_eq!(counter.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_vary_on_user_agent() {
        let cache = TranslateCache::new(100);
        let (counter, svc) = service(TranslateResponse {
            protocol_version: 3,
            vary: vec![
                TranslationCommand::Host,
                TranslationCommand::Uri,
                TranslationCommand::UserAgent,
            ],
            ..Default::default()
        });

        let mut bot = request("h", "/a");
        bot.user_agent = Some("Googlebot".to_string());
        let mut browser = request("h", "/a");
        browser.user_agent = Some("Mozilla".to_string());

        cache.get_or_translate(&svc, &bot).await.unwrap();
        cache.get_or_translate(&svc, &browser).await.unwrap();
        assert_eq!(counter.calls.load(Ordering::SeqCst), 2);

        cache.get_or_translate(&svc, &bot).await.unwrap();
        assert_eq!(counter.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_tag_invalidation_removes_only_tagged() {
        let cache = TranslateCache::new(100);
        let (_, tagged) = service(TranslateResponse {
            protocol_version: 3,
            cache_tag: Some("T".to_string()),
            ..Default::default()
        });
        let (_, untagged) = service(TranslateResponse {
            protocol_version: 3,
            ..Default::default()
        });

        cache
            .get_or_translate(&tagged, &request("h", "/tagged"))
            .await
            .unwrap();
        cache
            .get_or_translate(&untagged, &request("h", "/plain"))
            .await
            .unwrap();

        assert_eq!(cache.invalidate_tag("T"), 1);
        assert_eq!(cache.stats().entries, 1);
        assert_eq!(cache.invalidate_tag("T"), 0);
    }

    #[tokio::test]
    async fn test_invalidate_by_request_values() {
        let cache = TranslateCache::new(100);
        let (_, svc) = service(TranslateResponse {
            protocol_version: 3,
            site: Some("siteA".to_string()),
            ..Default::default()
        });

        cache
            .get_or_translate(&svc, &request("h1", "/x"))
            .await
            .unwrap();
        cache
            .get_or_translate(&svc, &request("h2", "/x"))
            .await
            .unwrap();

        // only the h1 item matches the invalidation request
        let removed = cache.invalidate(
            &request("h1", "/anything"),
            &[TranslationCommand::Host],
            Some("siteA"),
        );
        assert_eq!(removed, 1);
        assert_eq!(cache.stats().entries, 1);

        // site mismatch removes nothing
        let removed = cache.invalidate(
            &request("h2", "/anything"),
            &[TranslationCommand::Host],
            Some("siteB"),
        );
        assert_eq!(removed, 0);
    }

    #[tokio::test]
    async fn test_invalidate_prefix() {
        let cache = TranslateCache::new(100);
        let (_, svc) = service(TranslateResponse {
            protocol_version: 3,
            ..Default::default()
        });

        cache
            .get_or_translate(&svc, &request("h", "/app/a"))
            .await
            .unwrap();
        cache
            .get_or_translate(&svc, &request("h", "/app/b"))
            .await
            .unwrap();
        cache
            .get_or_translate(&svc, &request("h", "/other"))
            .await
            .unwrap();

        assert_eq!(cache.invalidate_prefix("/app/"), 2);
        assert_eq!(cache.stats().entries, 1);
    }

    #[tokio::test]
    async fn test_uncached_response_not_stored() {
        let cache = TranslateCache::new(100);
        let (counter, svc) = service(TranslateResponse {
            protocol_version: 3,
            uncached: true,
            ..Default::default()
        });

        cache
            .get_or_translate(&svc, &request("h", "/a"))
            .await
            .unwrap();
        cache
            .get_or_translate(&svc, &request("h", "/a"))
            .await
            .unwrap();
        assert_eq!(counter.calls.load(Ordering::SeqCst), 2);
    }
}
