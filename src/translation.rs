//! Translation service model
//!
//! The translation service is the external configuration oracle: for
//! every request the core sends it a fingerprint of the request and gets
//! back a response describing how to handle it (resource address, auth
//! requirements, transformations, caching directives, further lookup
//! turns).  The wire protocol is out of scope here; the core only sees
//! the request/response structs and the async service trait.

use crate::error::Result;
use crate::resource::ResourceAddress;
use async_trait::async_trait;
use bytes::Bytes;
use http::StatusCode;
use std::net::IpAddr;
use std::time::Duration;

/// Commands that can participate in cache keys ("vary"), invalidations
/// and "want" turns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TranslationCommand {
    Uri,
    Host,
    Session,
    ListenerTag,
    Language,
    UserAgent,
    QueryString,
    User,
    Authorization,
}

/// One post-processing stage for a response
#[derive(Debug, Clone)]
pub enum Transformation {
    /// Pipe the response through a filter resource
    Filter {
        address: ResourceAddress,
        /// Pass the authenticated user to the filter
        reveal_user: bool,
    },

    /// XML processor
    Process { container: bool },

    /// CSS processor
    ProcessCss,

    /// Text processor
    ProcessText,

    /// Substitution engine
    Subst { pairs: Vec<(String, String)> },
}

/// A request to the translation service
#[derive(Debug, Clone, Default)]
pub struct TranslateRequest {
    pub listener_tag: Option<String>,
    pub host: String,
    pub uri: String,
    pub query_string: Option<String>,
    pub args: Option<String>,

    pub session: Option<Bytes>,
    pub user: Option<String>,
    pub user_agent: Option<String>,
    pub accept_language: Option<String>,
    pub authorization: Option<String>,

    /// Payloads echoed back on multi-turn lookups
    pub check: Option<Bytes>,
    pub check_header: Option<String>,
    pub auth: Option<Bytes>,
    pub http_auth: Option<Bytes>,
    pub token_auth: Option<Bytes>,
    pub auth_token: Option<String>,
    pub chain: Option<Bytes>,
    pub chain_header: Option<String>,
    pub layout: Option<Bytes>,
    pub internal_redirect: Option<Bytes>,
    pub want: Vec<TranslationCommand>,
    pub want_full_uri: Option<Bytes>,

    /// File system probe turns
    pub file_not_found: Option<Bytes>,
    pub enotdir: Option<Bytes>,
    pub directory_index: Option<Bytes>,
    pub probe_path_suffixes: Option<Bytes>,
    pub probe_suffix: Option<String>,
    pub read_file: Option<Bytes>,
    pub path_exists: Option<Bytes>,

    /// Content-Type lookup by URI suffix
    pub suffix: Option<String>,

    /// Error-document lookup
    pub error_document: Option<Bytes>,
    pub error_document_status: Option<StatusCode>,
}

/// A response from the translation service.
///
/// A sum of optional fields; the request state machine inspects them in
/// a fixed order.
#[derive(Debug, Clone, Default)]
pub struct TranslateResponse {
    pub protocol_version: u8,

    /// Where to fetch the resource
    pub address: Option<ResourceAddress>,
    pub base: Option<String>,

    /// Synthesized responses
    pub status: Option<StatusCode>,
    pub redirect: Option<String>,
    pub bounce: Option<String>,
    pub message: Option<String>,
    pub tiny_image: bool,
    pub www_authenticate: Option<String>,

    /// Session directives
    pub session: Option<Bytes>,
    pub realm: Option<String>,
    pub user: Option<String>,
    pub user_max_age: Option<Duration>,
    pub transparent: bool,
    pub discard_session: bool,
    pub secure_cookie: bool,
    pub attach_session: Option<Bytes>,
    pub recover_session: Option<String>,
    pub site: Option<String>,

    /// Security directives
    pub https_only: Option<u16>,
    pub allow_remote_networks: Vec<(IpAddr, u8)>,
    pub require_csrf_token: bool,
    pub send_csrf_token: bool,

    /// Multi-turn lookups
    pub defer: bool,
    pub previous: bool,
    pub check: Option<Bytes>,
    pub check_header: Option<String>,
    pub internal_redirect: Option<Bytes>,
    pub like_host: Option<String>,
    pub want: Vec<TranslationCommand>,
    pub want_full_uri: Option<Bytes>,
    pub want_user: bool,
    pub chain: Option<Bytes>,
    pub break_chain: bool,
    pub layout: Option<Bytes>,
    pub auth: Option<Bytes>,
    pub http_auth: Option<Bytes>,
    pub token_auth: Option<Bytes>,

    /// File system probe directives
    pub probe_path_suffixes: Option<Bytes>,
    pub probe_suffixes: Vec<String>,
    pub file_not_found: Option<Bytes>,
    pub enotdir: Option<Bytes>,
    pub directory_index: Option<Bytes>,
    pub read_file: Option<String>,
    pub path_exists: Option<Bytes>,

    /// Upstream cookies go into the session's cookie jar instead of the
    /// client
    pub collect_cookies: bool,

    /// Response post-processing
    pub transformations: Vec<Transformation>,
    pub filter_4xx: bool,
    pub error_document: Option<Bytes>,
    pub content_type: Option<String>,
    pub content_type_lookup: bool,
    pub auto_gzip: bool,

    /// Caching directives for the translation cache
    pub max_age: Option<Duration>,
    pub cache_tag: Option<String>,
    pub vary: Vec<TranslationCommand>,
    pub invalidate: Vec<TranslationCommand>,
    pub uncached: bool,
}

impl TranslateResponse {
    /// Whether any authentication turn is requested
    pub fn has_auth(&self) -> bool {
        self.auth.is_some()
    }
}

/// Check a remote address against the allowed networks; an empty list
/// allows everyone
pub fn remote_allowed(networks: &[(IpAddr, u8)], remote: IpAddr) -> bool {
    if networks.is_empty() {
        return true;
    }
    networks
        .iter()
        .any(|&(net, prefix)| ip_in_network(remote, net, prefix))
}

fn ip_in_network(ip: IpAddr, net: IpAddr, prefix: u8) -> bool {
    match (ip, net) {
        (IpAddr::V4(ip), IpAddr::V4(net)) => {
            let prefix = prefix.min(32) as u32;
            if prefix == 0 {
                return true;
            }
            let mask = u32::MAX << (32 - prefix);
            u32::from(ip) & mask == u32::from(net) & mask
        }
        (IpAddr::V6(ip), IpAddr::V6(net)) => {
            let prefix = prefix.min(128) as u32;
            if prefix == 0 {
                return true;
            }
            let mask = u128::MAX << (128 - prefix);
            u128::from(ip) & mask == u128::from(net) & mask
        }
        _ => false,
    }
}

/// The translation RPC.  Exactly one of `Ok(response)` or `Err` is
/// produced per call.
#[async_trait]
pub trait TranslationService: Send + Sync {
    async fn send_request(&self, request: &TranslateRequest) -> Result<TranslateResponse>;
}

/// Trivial built-in service: map every URI below a document root.
///
/// Useful for the standalone binary and for tests; real deployments talk
/// to an external translation server.
pub struct StaticTranslationService {
    pub docroot: String,
}

#[async_trait]
impl TranslationService for StaticTranslationService {
    async fn send_request(&self, request: &TranslateRequest) -> Result<TranslateResponse> {
        use crate::resource::FileAddress;

        let path = format!(
            "{}/{}",
            self.docroot.trim_end_matches('/'),
            request.uri.trim_start_matches('/')
        );
        Ok(TranslateResponse {
            protocol_version: 3,
            address: Some(ResourceAddress::Local(FileAddress::new(path))),
            vary: vec![TranslationCommand::Uri, TranslationCommand::Host],
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_allowed() {
        let networks = vec![("10.0.0.0".parse().unwrap(), 8)];
        assert!(remote_allowed(&networks, "10.1.2.3".parse().unwrap()));
        assert!(!remote_allowed(&networks, "192.168.1.1".parse().unwrap()));
        assert!(remote_allowed(&[], "192.168.1.1".parse().unwrap()));
    }

    #[test]
    fn test_ipv6_network_match() {
        let networks = vec![("fd00::".parse().unwrap(), 8)];
        assert!(remote_allowed(&networks, "fd00::1".parse().unwrap()));
        assert!(!remote_allowed(&networks, "2001:db8::1".parse().unwrap()));
    }
}
