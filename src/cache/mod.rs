//! Caches built on the allocator layer
//!
//! All concrete caches (HTTP response, filter output, NFS file,
//! translation) share the generic keyed LRU cache in this module: string
//! key plus a caller-supplied match predicate, per-item expiry against
//! both clocks, and a size budget enforced by least-recently-used
//! eviction.

pub mod filter;
pub mod http;
pub mod nfs;
pub mod translate;

use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime};
use tracing::debug;

/// Implemented by cache payloads so the cache can charge them against
/// its size budget
pub trait CacheItem {
    /// Charged cost in bytes
    fn size(&self) -> usize;
}

/// Expiry deadlines on both clocks.
///
/// Expiry is checked against the wall clock so restarts and clock jumps
/// are respected; LRU ordering uses the steady clock.
#[derive(Debug, Clone, Copy)]
pub struct Expiry {
    pub steady: Instant,
    pub system: SystemTime,
}

impl Expiry {
    pub fn after(ttl: Duration) -> Self {
        Self {
            steady: Instant::now() + ttl,
            system: SystemTime::now() + ttl,
        }
    }

    pub fn at(system: SystemTime) -> Self {
        let ttl = system
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO);
        Self {
            steady: Instant::now() + ttl,
            system,
        }
    }

    fn is_expired(&self) -> bool {
        SystemTime::now() >= self.system
    }
}

struct Entry<T> {
    key: String,
    item: T,
    expiry: Expiry,
    last_accessed: Instant,
    size: usize,
}

/// Cache statistics for monitoring
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Generic keyed LRU cache with expiry and a match predicate
pub struct Cache<T: CacheItem> {
    map: HashMap<String, Vec<usize>>,
    entries: Vec<Option<Entry<T>>>,
    free: Vec<usize>,

    max_size: usize,
    current_size: usize,

    hits: u64,
    misses: u64,
}

impl<T: CacheItem> Cache<T> {
    pub fn new(max_size: usize) -> Self {
        Self {
            map: HashMap::new(),
            entries: Vec::new(),
            free: Vec::new(),
            max_size,
            current_size: 0,
            hits: 0,
            misses: 0,
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.map.values().map(|v| v.len()).sum(),
            bytes: self.current_size,
            hits: self.hits,
            misses: self.misses,
        }
    }

    /// Find the first unexpired item under `key` matched by `predicate`;
    /// touches its LRU position.  Expired items under the key are removed
    /// on the way.
    pub fn get(&mut self, key: &str, predicate: impl Fn(&T) -> bool) -> Option<&T> {
        self.remove_expired_under(key);

        let ids = self.map.get(key)?;
        let found = ids
            .iter()
            .copied()
            .find(|&id| predicate(&self.entries[id].as_ref().unwrap().item));

        match found {
            Some(id) => {
                self.hits += 1;
                let entry = self.entries[id].as_mut().unwrap();
                entry.last_accessed = Instant::now();
                Some(&self.entries[id].as_ref().unwrap().item)
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Record a miss on a key that was not even looked up (e.g. because
    /// the request was not cacheable)
    pub fn note_miss(&mut self) {
        self.misses += 1;
    }

    /// Insert an item, replacing any existing item under the same key
    /// that `predicate` matches, then evict until within budget
    pub fn put(&mut self, key: &str, item: T, expiry: Expiry, predicate: impl Fn(&T) -> bool) {
        self.remove_match(key, predicate);

        let size = item.size();
        let entry = Entry {
            key: key.to_string(),
            item,
            expiry,
            last_accessed: Instant::now(),
            size,
        };

        let id = match self.free.pop() {
            Some(id) => {
                self.entries[id] = Some(entry);
                id
            }
            None => {
                self.entries.push(Some(entry));
                self.entries.len() - 1
            }
        };
        self.map.entry(key.to_string()).or_default().push(id);
        self.current_size += size;

        self.evict_to_budget();
    }

    /// Refresh the expiry of the first item under `key` that `predicate`
    /// matches; used after a successful revalidation
    pub fn update_expiry(
        &mut self,
        key: &str,
        predicate: impl Fn(&T) -> bool,
        expiry: Expiry,
    ) -> bool {
        let Some(ids) = self.map.get(key) else {
            return false;
        };
        let found = ids
            .iter()
            .copied()
            .find(|&id| predicate(&self.entries[id].as_ref().unwrap().item));
        match found {
            Some(id) => {
                let entry = self.entries[id].as_mut().unwrap();
                entry.expiry = expiry;
                entry.last_accessed = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Remove items under `key` that `predicate` matches
    pub fn remove_match(&mut self, key: &str, predicate: impl Fn(&T) -> bool) -> usize {
        let Some(ids) = self.map.get(key) else {
            return 0;
        };
        let doomed: Vec<usize> = ids
            .iter()
            .copied()
            .filter(|&id| predicate(&self.entries[id].as_ref().unwrap().item))
            .collect();
        let n = doomed.len();
        for id in doomed {
            self.remove_entry(id);
        }
        n
    }

    /// Remove every item (any key) that `predicate` matches
    pub fn remove_if(&mut self, predicate: impl Fn(&str, &T) -> bool) -> usize {
        let doomed: Vec<usize> = self
            .entries
            .iter()
            .enumerate()
            .filter_map(|(id, entry)| {
                let entry = entry.as_ref()?;
                predicate(&entry.key, &entry.item).then_some(id)
            })
            .collect();
        let n = doomed.len();
        for id in doomed {
            self.remove_entry(id);
        }
        n
    }

    pub fn flush(&mut self) -> usize {
        self.remove_if(|_, _| true)
    }

    /// Drop all expired items; driven by the periodic sweep timer
    pub fn expire_sweep(&mut self) -> usize {
        let doomed: Vec<usize> = self
            .entries
            .iter()
            .enumerate()
            .filter_map(|(id, entry)| {
                entry
                    .as_ref()
                    .is_some_and(|e| e.expiry.is_expired())
                    .then_some(id)
            })
            .collect();
        let n = doomed.len();
        for id in doomed {
            self.remove_entry(id);
        }
        if n > 0 {
            debug!(removed = n, "cache sweep");
        }
        n
    }

    fn remove_expired_under(&mut self, key: &str) {
        let Some(ids) = self.map.get(key) else { return };
        let doomed: Vec<usize> = ids
            .iter()
            .copied()
            .filter(|&id| self.entries[id].as_ref().unwrap().expiry.is_expired())
            .collect();
        for id in doomed {
            self.remove_entry(id);
        }
    }

    fn remove_entry(&mut self, id: usize) {
        let entry = self.entries[id].take().unwrap();
        self.current_size -= entry.size;
        if let Some(ids) = self.map.get_mut(&entry.key) {
            ids.retain(|&i| i != id);
            if ids.is_empty() {
                self.map.remove(&entry.key);
            }
        }
        self.free.push(id);
    }

    /// Evict least recently used items until the size budget holds
    fn evict_to_budget(&mut self) {
        while self.current_size > self.max_size {
            let oldest = self
                .entries
                .iter()
                .enumerate()
                .filter_map(|(id, e)| e.as_ref().map(|e| (id, e.last_accessed)))
                .min_by_key(|&(_, at)| at);
            match oldest {
                Some((id, _)) => {
                    debug!(id, "cache eviction");
                    self.remove_entry(id);
                }
                None => break,
            }
        }
    }
}
