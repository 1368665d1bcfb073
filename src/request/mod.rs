//! Per-request state
//!
//! One [`Request`] exists per in-flight HTTP exchange.  It owns a child
//! pool of the connection pool, the dissected URI, the translation
//! sub-state with all its loop counters, and the session bookkeeping.

pub mod csrf;
pub mod file;
pub mod handler;
pub mod response;

use crate::body::Body;
use crate::mem::pool::{PoolId, PoolLeakDetector, PoolRef, SharedPoolTree};
use crate::resource::ResourceAddress;
use crate::session::SessionId;
use crate::translation::{TranslateRequest, TranslateResponse};
use http::{HeaderMap, Method};
use std::net::IpAddr;

/// A dissected request URI: `{base ';' args path_info '?' query}`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DissectedUri {
    pub base: String,
    pub args: Option<String>,
    pub path_info: Option<String>,
    pub query: Option<String>,
}

impl DissectedUri {
    /// Quick syntactic verification and dissection; `None` on garbage
    pub fn parse(uri: &str) -> Option<Self> {
        if !uri.starts_with('/') || uri.bytes().any(|b| b < 0x20 || b == 0x7f) {
            return None;
        }

        let (path, query) = match uri.split_once('?') {
            Some((path, query)) => (path, Some(query.to_string())),
            None => (uri, None),
        };

        let (base, args, path_info) = match path.split_once(';') {
            None => (path.to_string(), None, None),
            Some((base, rest)) => {
                let (args, path_info) = match rest.split_once('/') {
                    Some((args, info)) => (args.to_string(), Some(format!("/{}", info))),
                    None => (rest.to_string(), None),
                };
                (base.to_string(), Some(args), path_info)
            }
        };

        Some(Self {
            base,
            args,
            path_info,
            query,
        })
    }
}

/// The dissected HTTP request handed in by the connection layer
pub struct IncomingRequest {
    pub method: Method,
    pub uri: String,
    pub headers: HeaderMap,
    pub body: Body,
    pub remote_addr: IpAddr,
    pub is_tls: bool,
    pub listener_tag: Option<String>,
}

/// Translation sub-state: the evolving request, the latest response, and
/// one bounded counter per looping feature
#[derive(Default)]
pub struct TranslateSubState {
    pub request: TranslateRequest,
    pub response: Option<TranslateResponse>,

    /// Response waiting for a CHAIN decision
    pub pending_response: Option<TranslateResponse>,

    pub previous: Option<TranslateResponse>,
    pub address: ResourceAddress,

    pub n_checks: u8,
    pub n_internal_redirects: u8,
    pub n_like_host: u8,
    pub n_want: u8,
    pub n_want_full_uri: u8,
    pub n_read_file: u8,
    pub n_path_exists: u8,
    pub n_file_not_found: u8,
    pub n_enotdir: u8,
    pub n_directory_index: u8,
    pub n_probe_path_suffixes: u8,
    pub n_chain: u8,
    pub n_layout: u8,
    pub n_auth: u8,

    pub want_user: bool,
    pub user_modified: bool,
    pub had_internal_redirect: bool,
}

/// The central per-request record
pub struct Request {
    /// Declared before `pool` so it unregisters before the pool dies
    _leak: PoolLeakDetector,

    pub pool: PoolRef,

    pub method: Method,
    pub raw_uri: String,
    pub uri: DissectedUri,
    pub headers: HeaderMap,
    pub body: Option<Body>,
    pub remote_addr: IpAddr,
    pub is_tls: bool,
    pub listener_tag: Option<String>,

    pub translate: TranslateSubState,

    pub session_id: Option<SessionId>,
    pub realm: String,
    pub user: Option<String>,
    pub stateless: bool,
    pub send_session_cookie: bool,

    /// A transformation has consumed the response body
    pub transformed: bool,
}

impl Request {
    pub fn new(
        pool_tree: SharedPoolTree,
        connection_pool: PoolId,
        incoming: IncomingRequest,
        uri: DissectedUri,
    ) -> Self {
        let pool = {
            let mut tree = pool_tree.lock().unwrap();
            let id = tree.new_linear(connection_pool, "request", 0);
            // the raw request line lives in the request arena so the
            // pool dump shows real per-request usage
            tree.memdup(id, incoming.uri.as_bytes());
            PoolRef::new(pool_tree.clone(), id)
        };
        let leak = PoolLeakDetector::new(pool_tree.clone(), pool.id());

        Self {
            _leak: leak,
            pool,
            method: incoming.method,
            raw_uri: incoming.uri,
            uri,
            headers: incoming.headers,
            body: Some(incoming.body),
            remote_addr: incoming.remote_addr,
            is_tls: incoming.is_tls,
            listener_tag: incoming.listener_tag,
            translate: TranslateSubState::default(),
            session_id: None,
            realm: "default".to_string(),
            user: None,
            stateless: false,
            send_session_cookie: false,
            transformed: false,
        }
    }

    /// Bots get no session state
    pub fn detect_stateless(&mut self) {
        let Some(user_agent) = self
            .headers
            .get(http::header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
        else {
            self.stateless = true;
            return;
        };
        let lowered = user_agent.to_ascii_lowercase();
        if ["bot", "crawler", "spider", "curl/", "wget/"]
            .iter()
            .any(|probe| lowered.contains(probe))
        {
            self.stateless = true;
        }
    }

    /// Pull the session id out of the Cookie header
    pub fn extract_session_cookie(&self, cookie_name: &str) -> Option<SessionId> {
        let cookies = self
            .headers
            .get(http::header::COOKIE)
            .and_then(|v| v.to_str().ok())?;
        for pair in cookies.split(';') {
            let Some((name, value)) = pair.trim().split_once('=') else {
                continue;
            };
            if name == cookie_name {
                return u128::from_str_radix(value, 16).ok();
            }
        }
        None
    }
}
