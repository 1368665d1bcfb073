//! CSRF token generation and verification
//!
//! Tokens are derived from the per-session secret salt and a timestamp:
//! eight hex digits of epoch seconds followed by sixteen hex digits of
//! the keyed hash.  A token is accepted for one hour.  Format and time
//! window are checked before the session is consulted, so a request
//! without a session can still present a well-formed token.

use std::time::{Duration, SystemTime, UNIX_EPOCH};
use xxhash_rust::xxh3::xxh3_64;

/// Tokens older than this are rejected
const MAX_AGE: Duration = Duration::from_secs(3600);

/// Tolerated clock skew for tokens from the future
const MAX_SKEW: Duration = Duration::from_secs(60);

fn epoch_seconds(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn hash(salt: u64, stamp: u32) -> u64 {
    let mut input = [0u8; 12];
    input[..8].copy_from_slice(&salt.to_le_bytes());
    input[8..].copy_from_slice(&stamp.to_le_bytes());
    xxh3_64(&input)
}

/// A parsed token: timestamp plus keyed digest
#[derive(Debug, Clone, Copy)]
pub struct CsrfToken {
    pub stamp: u32,
    pub digest: u64,
}

impl CsrfToken {
    /// Syntactic parse only; no clock or salt involved
    pub fn parse(token: &str) -> Option<Self> {
        if token.len() != 24 {
            return None;
        }
        let stamp = u32::from_str_radix(&token[..8], 16).ok()?;
        let digest = u64::from_str_radix(&token[8..], 16).ok()?;
        Some(Self { stamp, digest })
    }

    /// Within the acceptance window around `now`
    pub fn time_valid(&self, now: SystemTime) -> bool {
        let now = epoch_seconds(now) as u32;
        if self.stamp > now {
            return (self.stamp - now) as u64 <= MAX_SKEW.as_secs();
        }
        (now - self.stamp) as u64 <= MAX_AGE.as_secs()
    }

    /// The digest matches this session salt
    pub fn matches_salt(&self, salt: u64) -> bool {
        self.digest == hash(salt, self.stamp)
    }
}

/// Build a token for the given session salt
pub fn generate_token(salt: u64, now: SystemTime) -> String {
    let stamp = epoch_seconds(now) as u32;
    format!("{:08x}{:016x}", stamp, hash(salt, stamp))
}

/// Full check: format, time window, salt
pub fn verify_token(salt: u64, token: &str, now: SystemTime) -> bool {
    match CsrfToken::parse(token) {
        Some(token) => token.time_valid(now) && token.matches_salt(salt),
        None => false,
    }
}
