//! Session manager
//!
//! In-memory session store indexed by session id and by the opaque
//! "attach" bytes that coalesce multiple logins into one session.  Ids
//! come from a seeded PRNG that is reseeded by the periodic cleanup
//! timer; a cluster node id can be folded into generated ids so a load
//! balancer can route resumed sessions home.
//!
//! Sessions may be saved to a sidecar file every two minutes and are
//! reloaded at startup; the caches stay ephemeral, only sessions get
//! this side channel.

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// 128-bit session identifier
pub type SessionId = u128;

/// How many sessions one purge round may drop
const PURGE_BUCKET: usize = 256;

/// Magic number of the session save file
const SAVE_MAGIC: u32 = 0x53455353;

/// Per-realm state within a session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RealmSession {
    pub site: Option<String>,
    pub translate: Option<Vec<u8>>,
    pub user: Option<String>,
    pub user_expires_epoch: Option<u64>,

    /// Cookie jar for cookies the upstream set but the client must not see
    pub cookies: HashMap<String, String>,
}

impl RealmSession {
    pub fn user_valid(&self) -> bool {
        match (self.user.as_ref(), self.user_expires_epoch) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(_), Some(expires)) => {
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs() < expires)
                    .unwrap_or(false)
            }
        }
    }
}

/// One session record
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub csrf_salt: u64,
    pub expires: SystemTime,

    /// How often this session was resumed
    pub counter: u32,

    pub attach: Option<Bytes>,
    pub translate: Option<Bytes>,
    pub recover: Option<String>,
    pub realms: HashMap<String, RealmSession>,
}

impl Session {
    fn new(id: SessionId, csrf_salt: u64, idle: Duration) -> Self {
        Self {
            id,
            csrf_salt,
            expires: SystemTime::now() + idle,
            counter: 1,
            attach: None,
            translate: None,
            recover: None,
            realms: HashMap::new(),
        }
    }

    pub fn realm_mut(&mut self, realm: &str) -> &mut RealmSession {
        self.realms.entry(realm.to_string()).or_default()
    }

    fn has_user(&self) -> bool {
        self.realms.values().any(|r| r.user.is_some())
    }

    /// Higher score = dropped earlier under memory pressure
    fn purge_score(&self) -> u32 {
        if self.counter <= 1 {
            // never resumed, probably a bot
            return 1000;
        }
        if !self.has_user() {
            return 100;
        }
        10
    }

    /// Merge another session's state into this one; existing values win
    fn absorb(&mut self, other: Session) {
        if self.translate.is_none() {
            self.translate = other.translate;
        }
        if self.recover.is_none() {
            self.recover = other.recover;
        }
        for (name, realm) in other.realms {
            self.realms.entry(name).or_insert(realm);
        }
    }
}

struct ManagerInner {
    by_id: HashMap<SessionId, Session>,
    by_attach: HashMap<Bytes, SessionId>,
    rng: StdRng,
}

/// The session store; shared as `Arc<SessionManager>`
pub struct SessionManager {
    inner: Mutex<ManagerInner>,
    idle_timeout: Duration,
    max_sessions: usize,
    cluster: Option<(u8, u8)>,
}

impl SessionManager {
    pub fn new(
        idle_timeout: Duration,
        max_sessions: usize,
        cluster: Option<(u8, u8)>,
    ) -> Self {
        Self {
            inner: Mutex::new(ManagerInner {
                by_id: HashMap::new(),
                by_attach: HashMap::new(),
                rng: StdRng::from_entropy(),
            }),
            idle_timeout,
            max_sessions,
            cluster,
        }
    }

    pub fn count(&self) -> usize {
        self.inner.lock().unwrap().by_id.len()
    }

    /// Adjust an id so `id % cluster_size == cluster_node`
    fn apply_cluster(&self, id: SessionId) -> SessionId {
        match self.cluster {
            None => id,
            Some((node, size)) => {
                let size = size as u128;
                id - id % size + node as u128
            }
        }
    }

    fn generate_id(&self, inner: &mut ManagerInner) -> SessionId {
        loop {
            let id = self.apply_cluster(inner.rng.gen::<u128>());
            if !inner.by_id.contains_key(&id) {
                return id;
            }
        }
    }

    /// Create a new empty session
    pub fn create_session(self: &Arc<Self>) -> SessionLease {
        let mut inner = self.inner.lock().unwrap();

        if inner.by_id.len() >= self.max_sessions {
            drop(inner);
            self.purge();
            inner = self.inner.lock().unwrap();
        }

        let id = self.generate_id(&mut inner);
        let csrf_salt = inner.rng.gen::<u64>();
        let session = Session::new(id, csrf_salt, self.idle_timeout);
        inner.by_id.insert(id, session);
        debug!("session created: {:032x}", id);

        SessionLease {
            manager: self.clone(),
            id,
        }
    }

    /// Resume a session by id; touches expiry and the reuse counter
    pub fn find(self: &Arc<Self>, id: SessionId) -> Option<SessionLease> {
        let mut inner = self.inner.lock().unwrap();
        let idle = self.idle_timeout;
        let session = inner.by_id.get_mut(&id)?;
        session.expires = SystemTime::now() + idle;
        session.counter += 1;
        Some(SessionLease {
            manager: self.clone(),
            id,
        })
    }

    /// Bind `attach` bytes to a session, merging with an existing session
    /// that already carries them.  Returns the lease of the surviving
    /// session.
    pub fn attach(
        self: &Arc<Self>,
        lease: Option<SessionLease>,
        attach: Bytes,
    ) -> SessionLease {
        debug_assert!(!attach.is_empty());
        let mut inner = self.inner.lock().unwrap();

        if let Some(&existing_id) = inner.by_attach.get(&attach) {
            if let Some(lease) = lease {
                if lease.id != existing_id {
                    // merge the caller's session into the attached one
                    if let Some(source) = inner.by_id.remove(&lease.id) {
                        if let Some(old_attach) = &source.attach {
                            inner.by_attach.remove(old_attach);
                        }
                        if let Some(target) = inner.by_id.get_mut(&existing_id) {
                            target.absorb(source);
                        }
                    }
                    debug!("merged session into attach target");
                }
            }
            return SessionLease {
                manager: self.clone(),
                id: existing_id,
            };
        }

        let lease = match lease {
            Some(lease) => lease,
            None => {
                drop(inner);
                let lease = self.create_session();
                inner = self.inner.lock().unwrap();
                lease
            }
        };

        if let Some(session) = inner.by_id.get_mut(&lease.id) {
            if let Some(old_attach) = session.attach.replace(attach.clone()) {
                inner.by_attach.remove(&old_attach);
            }
            inner.by_attach.insert(attach, lease.id);
        }
        lease
    }

    pub fn erase(&self, id: SessionId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(session) = inner.by_id.remove(&id) {
            if let Some(attach) = &session.attach {
                inner.by_attach.remove(attach);
            }
        }
    }

    /// Drop one realm's state from a session
    pub fn discard_realm_session(&self, id: SessionId, realm: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(session) = inner.by_id.get_mut(&id) {
            session.realms.remove(realm);
        }
    }

    /// Drop the session carrying these attach bytes (control channel)
    pub fn discard_attach_session(&self, attach: &[u8]) -> bool {
        let id = {
            let inner = self.inner.lock().unwrap();
            inner.by_attach.get(attach).copied()
        };
        match id {
            Some(id) => {
                self.erase(id);
                true
            }
            None => false,
        }
    }

    /// Drop the most purgeable bucket of sessions, repeating until the
    /// count is below the cap
    pub fn purge(&self) {
        loop {
            let mut inner = self.inner.lock().unwrap();
            if inner.by_id.is_empty() {
                return;
            }

            let highest = inner
                .by_id
                .values()
                .map(|s| s.purge_score())
                .max()
                .unwrap_or(0);
            let victims: Vec<SessionId> = inner
                .by_id
                .values()
                .filter(|s| s.purge_score() == highest)
                .take(PURGE_BUCKET)
                .map(|s| s.id)
                .collect();

            info!(
                count = victims.len(),
                score = highest,
                "purging sessions"
            );
            for id in &victims {
                if let Some(session) = inner.by_id.remove(id) {
                    if let Some(attach) = &session.attach {
                        inner.by_attach.remove(attach);
                    }
                }
            }

            if inner.by_id.len() < self.max_sessions {
                return;
            }
            drop(inner);
        }
    }

    /// Remove idle sessions and reseed the PRNG; driven by the periodic
    /// cleanup timer
    pub fn cleanup(&self) {
        let mut inner = self.inner.lock().unwrap();
        let now = SystemTime::now();
        let before = inner.by_id.len();

        let expired: Vec<SessionId> = inner
            .by_id
            .values()
            .filter(|s| s.expires <= now)
            .map(|s| s.id)
            .collect();
        for id in expired {
            if let Some(session) = inner.by_id.remove(&id) {
                if let Some(attach) = &session.attach {
                    inner.by_attach.remove(attach);
                }
            }
        }

        let removed = before - inner.by_id.len();
        if removed > 0 {
            debug!(removed, "expired sessions");
        }

        inner.rng = StdRng::from_entropy();
    }

    /// Run `f` on a session; `None` when the session is gone
    fn with_session<R>(&self, id: SessionId, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        let mut inner = self.inner.lock().unwrap();
        inner.by_id.get_mut(&id).map(f)
    }

    /// Serialize all sessions to the sidecar file
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let saved: Vec<SavedSession> = {
            let inner = self.inner.lock().unwrap();
            inner.by_id.values().map(SavedSession::from).collect()
        };

        let payload = bincode::serialize(&saved)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let checksum = crc32fast::hash(&payload);

        let mut out = Vec::with_capacity(payload.len() + 8);
        out.extend_from_slice(&SAVE_MAGIC.to_le_bytes());
        out.extend_from_slice(&checksum.to_le_bytes());
        out.extend_from_slice(&payload);
        std::fs::write(path, out)?;
        debug!(count = saved.len(), "sessions saved");
        Ok(())
    }

    /// Reload sessions from the sidecar file; corrupt files are ignored
    pub fn load(&self, path: &Path) {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(_) => return,
        };
        if data.len() < 8 || data[0..4] != SAVE_MAGIC.to_le_bytes() {
            warn!("session file has a bad magic number");
            return;
        }
        let checksum = u32::from_le_bytes(data[4..8].try_into().unwrap());
        let payload = &data[8..];
        if crc32fast::hash(payload) != checksum {
            warn!("session file checksum mismatch");
            return;
        }

        let saved: Vec<SavedSession> = match bincode::deserialize(payload) {
            Ok(saved) => saved,
            Err(e) => {
                warn!("session file unreadable: {}", e);
                return;
            }
        };

        let now = SystemTime::now();
        let mut inner = self.inner.lock().unwrap();
        let mut restored = 0;
        for s in saved {
            let session = s.into_session();
            if session.expires <= now {
                continue;
            }
            if let Some(attach) = &session.attach {
                inner.by_attach.insert(attach.clone(), session.id);
            }
            inner.by_id.insert(session.id, session);
            restored += 1;
        }
        info!(restored, "sessions restored");
    }
}

/// RAII handle marking a session as in use
pub struct SessionLease {
    manager: Arc<SessionManager>,
    id: SessionId,
}

impl SessionLease {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Access the session; `None` when it was purged meanwhile
    pub fn with<R>(&self, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        self.manager.with_session(self.id, f)
    }
}

/// Persistent form of a session
#[derive(Serialize, Deserialize)]
struct SavedSession {
    id_high: u64,
    id_low: u64,
    csrf_salt: u64,
    expires_epoch: u64,
    counter: u32,
    attach: Option<Vec<u8>>,
    translate: Option<Vec<u8>>,
    recover: Option<String>,
    realms: HashMap<String, RealmSession>,
}

impl From<&Session> for SavedSession {
    fn from(s: &Session) -> Self {
        Self {
            id_high: (s.id >> 64) as u64,
            id_low: s.id as u64,
            csrf_salt: s.csrf_salt,
            expires_epoch: s
                .expires
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            counter: s.counter,
            attach: s.attach.as_ref().map(|b| b.to_vec()),
            translate: s.translate.as_ref().map(|b| b.to_vec()),
            recover: s.recover.clone(),
            realms: s.realms.clone(),
        }
    }
}

impl SavedSession {
    fn into_session(self) -> Session {
        Session {
            id: ((self.id_high as u128) << 64) | self.id_low as u128,
            csrf_salt: self.csrf_salt,
            expires: UNIX_EPOCH + Duration::from_secs(self.expires_epoch),
            counter: self.counter,
            attach: self.attach.map(Bytes::from),
            translate: self.translate.map(Bytes::from),
            recover: self.recover,
            realms: self.realms,
        }
    }
}
