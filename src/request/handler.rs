//! The request state machine
//!
//! Drives one HTTP request from dissection through translation turns,
//! authentication, dispatch, the transformation pipeline and response
//! finalization.  Every looping translation feature has its own bounded
//! counter; exceeding any of them produces a 502 with a specific
//! message instead of looping forever.

use super::file;
use super::response::{apply_transformations, finalize_response};
use super::{DissectedUri, IncomingRequest, Request};
use crate::body::Body;
use crate::error::{RelayError, Result};
use crate::instance::Instance;
use crate::mem::pool::PoolId;
use crate::resource::{
    FileAddress, HttpResponse, ResourceAddress, ResourceRequestParams,
};
use crate::session::SessionLease;
use crate::translation::{remote_allowed, TranslateRequest, TranslateResponse};
use bytes::Bytes;
use http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use std::sync::Arc;
use tracing::{debug, warn};

/// 1x1 transparent GIF for TINY_IMAGE responses
const TINY_GIF: &[u8] = &[
    0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x21, 0xf9, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, 0x2c, 0x00, 0x00,
    0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x02, 0x02, 0x44, 0x01, 0x00, 0x3b,
];

/// Outcome of one translation turn
enum Turn {
    /// Ask the translation service again
    Again,
    /// This is the final decision
    Final(Box<TranslateResponse>),
    /// Answer the client immediately
    Respond(HttpResponse),
}

pub struct RequestDriver {
    instance: Arc<Instance>,
    request: Request,
    session: Option<SessionLease>,
}

/// Entry point: process one incoming request into a response.
///
/// Never fails; errors become error responses here.
pub async fn handle_request(
    instance: Arc<Instance>,
    connection_pool: PoolId,
    incoming: IncomingRequest,
) -> HttpResponse {
    let Some(uri) = DissectedUri::parse(&incoming.uri) else {
        return HttpResponse::plain(StatusCode::BAD_REQUEST, "Malformed URI");
    };

    let request = Request::new(
        instance.pool_tree.clone(),
        connection_pool,
        incoming,
        uri,
    );
    let mut driver = RequestDriver {
        instance,
        request,
        session: None,
    };

    match driver.run().await {
        Ok(response) => response,
        Err(error) => driver.error_response(error).await,
    }
}

impl RequestDriver {
    async fn run(&mut self) -> Result<HttpResponse> {
        self.request.detect_stateless();

        if !self.request.stateless {
            let cookie_name = self.instance.config.session.cookie_name.clone();
            if let Some(id) = self.request.extract_session_cookie(&cookie_name) {
                self.session = self.instance.sessions.find(id);
                if self.session.is_some() {
                    self.request.session_id = Some(id);
                }
            }
        }

        self.build_initial_translate_request();

        let response = match self.translate_loop().await? {
            Turn::Respond(response) => return Ok(response),
            Turn::Final(response) => *response,
            Turn::Again => unreachable!(),
        };
        self.request.translate.response = Some(response.clone());

        self.check_csrf(&response)?;

        let mut http_response = self.dispatch(&response).await?;

        http_response = self.maybe_chain(&response, http_response).await?;

        http_response = apply_transformations(
            &self.instance,
            &mut self.request,
            &response,
            http_response,
        )
        .await?;

        finalize_response(
            &self.instance,
            &self.request,
            &self.session,
            &response,
            &mut http_response,
        );

        Ok(http_response)
    }

    fn build_initial_translate_request(&mut self) {
        let headers = &self.request.headers;
        let get = |name: header::HeaderName| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };

        let session_blob = self
            .session
            .as_ref()
            .and_then(|lease| lease.with(|s| s.translate.clone()))
            .flatten();

        self.request.translate.request = TranslateRequest {
            listener_tag: self.request.listener_tag.clone(),
            host: get(header::HOST).unwrap_or_default(),
            uri: self.request.uri.base.clone(),
            query_string: self.request.uri.query.clone(),
            args: self.request.uri.args.clone(),
            session: session_blob,
            user_agent: get(header::USER_AGENT),
            accept_language: get(header::ACCEPT_LANGUAGE),
            authorization: get(header::AUTHORIZATION),
            ..Default::default()
        };
    }

    /// One bounded counter check; exceeding it is a 502
    fn bump(counter: &mut u8, limit: u8, what: &str) -> Result<()> {
        *counter += 1;
        if *counter > limit {
            Err(RelayError::message(
                StatusCode::BAD_GATEWAY,
                format!("Too many consecutive {} packets", what),
            ))
        } else {
            Ok(())
        }
    }

    /// Issue translation requests until a final decision arrives
    async fn translate_loop(&mut self) -> Result<Turn> {
        loop {
            let request = self.request.translate.request.clone();
            let response = self
                .instance
                .translate_cache
                .get_or_translate(&self.instance.translation, &request)
                .await
                .map_err(|e| {
                    warn!("translation failed: {}", e);
                    RelayError::message(StatusCode::BAD_GATEWAY, "Configuration server failed")
                })?;

            match self.handle_translate_response(response).await? {
                Turn::Again => continue,
                done => return Ok(done),
            }
        }
    }

    async fn handle_translate_response(&mut self, response: TranslateResponse) -> Result<Turn> {
        if response.protocol_version < 2 {
            return Err(RelayError::message(
                StatusCode::BAD_GATEWAY,
                "Obsolete translation protocol",
            ));
        }

        if response.defer {
            return Err(RelayError::message(
                StatusCode::BAD_GATEWAY,
                "Translation server deferred",
            ));
        }

        if response.previous {
            let previous = self.request.translate.previous.clone().ok_or_else(|| {
                RelayError::message(StatusCode::BAD_GATEWAY, "No previous translation")
            })?;
            return Ok(Turn::Final(Box::new(previous)));
        }

        if !remote_allowed(&response.allow_remote_networks, self.request.remote_addr) {
            return Err(RelayError::Forbidden(
                "remote network not allowed".to_string(),
            ));
        }

        if let Some(port) = response.https_only {
            if !self.request.is_tls {
                return Ok(Turn::Respond(self.https_redirect(port)));
            }
        }

        self.apply_session_directives(&response);

        if let Some(respond) = self.check_auth(&response)? {
            return Ok(respond);
        }

        if let Some(turn) = self.check_multi_turn(&response)? {
            self.request.translate.previous = Some(response);
            return Ok(turn);
        }

        if self.check_file_probes(&response).await? {
            self.request.translate.previous = Some(response);
            return Ok(Turn::Again);
        }

        if self.check_content_type_lookup(&response) {
            self.request.translate.previous = Some(response);
            return Ok(Turn::Again);
        }

        self.request.translate.previous = Some(response.clone());
        Ok(Turn::Final(Box::new(response)))
    }

    fn https_redirect(&self, port: u16) -> HttpResponse {
        let host = self
            .request
            .headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("localhost");
        let host = host.split(':').next().unwrap_or(host);
        let location = if port == 443 || port == 0 {
            format!("https://{}{}", host, self.request.raw_uri)
        } else {
            format!("https://{}:{}{}", host, port, self.request.raw_uri)
        };

        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(&location) {
            headers.insert(header::LOCATION, value);
        }
        HttpResponse::new(StatusCode::MOVED_PERMANENTLY, headers, Body::empty())
    }

    fn apply_session_directives(&mut self, response: &TranslateResponse) {
        if response.transparent {
            self.request.stateless = true;
            self.session = None;
            self.request.session_id = None;
        } else if response.discard_session {
            if let Some(id) = self.request.session_id.take() {
                self.instance.sessions.erase(id);
            }
            self.session = None;
        }

        if let Some(realm) = &response.realm {
            self.request.realm = realm.clone();
        }

        let wants_session = response.session.is_some()
            || response.attach_session.is_some()
            || response.user.is_some()
            || response.recover_session.is_some();
        if wants_session && !self.request.stateless && self.session.is_none() {
            let lease = self.instance.sessions.create_session();
            self.request.session_id = Some(lease.id());
            self.request.send_session_cookie = true;
            self.session = Some(lease);
        }

        let Some(session) = &self.session else { return };

        if let Some(blob) = &response.session {
            session.with(|s| s.translate = Some(blob.clone()));
            self.request.translate.request.session = Some(blob.clone());
        }

        if let Some(recover) = &response.recover_session {
            session.with(|s| s.recover = Some(recover.clone()));
        }

        if let Some(attach) = &response.attach_session {
            let lease = self.session.take();
            let merged = self.instance.sessions.attach(lease, attach.clone());
            self.request.session_id = Some(merged.id());
            self.session = Some(merged);
        }

        if let Some(user) = &response.user {
            let realm = self.request.realm.clone();
            let max_age = response.user_max_age;
            if let Some(session) = &self.session {
                session.with(|s| {
                    let realm = s.realm_mut(&realm);
                    realm.user = Some(user.clone());
                    realm.user_expires_epoch = max_age.map(|d| {
                        (std::time::SystemTime::now() + d)
                            .duration_since(std::time::UNIX_EPOCH)
                            .map(|e| e.as_secs())
                            .unwrap_or(0)
                    });
                    if let Some(site) = &response.site {
                        realm.site = Some(site.clone());
                    }
                });
            }
            if self.request.user.as_deref() != Some(user.as_str()) {
                self.request.user = Some(user.clone());
                self.request.translate.user_modified = true;
            }
        } else if self.request.user.is_none() {
            // pick up the realm user from a resumed session
            let realm = self.request.realm.clone();
            if let Some(session) = &self.session {
                self.request.user = session
                    .with(|s| {
                        let realm = s.realm_mut(&realm);
                        realm.user_valid().then(|| realm.user.clone()).flatten()
                    })
                    .flatten();
            }
        }
    }

    /// Authentication turns; each is bounded like the other loops
    fn check_auth(&mut self, response: &TranslateResponse) -> Result<Option<Turn>> {
        if response.has_auth() {
            Self::bump(&mut self.request.translate.n_auth, 4, "AUTH")?;
            self.request.translate.request.auth = response.auth.clone();
            return Ok(Some(Turn::Again));
        }

        if let Some(payload) = &response.http_auth {
            let Some(authorization) = self
                .request
                .headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
            else {
                let mut headers = HeaderMap::new();
                let challenge = response
                    .www_authenticate
                    .clone()
                    .unwrap_or_else(|| "Basic realm=\"site\"".to_string());
                if let Ok(value) = HeaderValue::from_str(&challenge) {
                    headers.insert(header::WWW_AUTHENTICATE, value);
                }
                return Ok(Some(Turn::Respond(HttpResponse::new(
                    StatusCode::UNAUTHORIZED,
                    headers,
                    Body::full(Bytes::from_static(b"Unauthorized")),
                ))));
            };

            Self::bump(&mut self.request.translate.n_auth, 4, "HTTP_AUTH")?;
            self.request.translate.request.http_auth = Some(payload.clone());
            self.request.translate.request.authorization = Some(authorization.to_string());
            return Ok(Some(Turn::Again));
        }

        if let Some(payload) = &response.token_auth {
            let token = self
                .request
                .uri
                .query
                .as_deref()
                .and_then(|q| {
                    q.split('&')
                        .find_map(|pair| pair.strip_prefix("auth_token="))
                })
                .map(str::to_string);
            let Some(token) = token else {
                return Err(RelayError::Forbidden("missing auth token".to_string()));
            };

            Self::bump(&mut self.request.translate.n_auth, 4, "TOKEN_AUTH")?;
            self.request.translate.request.token_auth = Some(payload.clone());
            self.request.translate.request.auth_token = Some(token);
            return Ok(Some(Turn::Again));
        }

        Ok(None)
    }

    /// The classic multi-turn features; each bumps its counter and asks
    /// the translation service again
    fn check_multi_turn(&mut self, response: &TranslateResponse) -> Result<Option<Turn>> {
        let user = self.request.user.clone();
        let raw_uri = self.request.raw_uri.clone();
        let translate = &mut self.request.translate;

        if let Some(payload) = &response.check {
            Self::bump(&mut translate.n_checks, 4, "CHECK")?;
            translate.request.check = Some(payload.clone());
            translate.request.check_header = response.check_header.clone();
            return Ok(Some(Turn::Again));
        }

        if let Some(payload) = &response.internal_redirect {
            Self::bump(&mut translate.n_internal_redirects, 4, "INTERNAL_REDIRECT")?;
            translate.had_internal_redirect = true;
            translate.request.internal_redirect = Some(payload.clone());
            if let Some(uri) = &response.want_full_uri {
                translate.request.uri = String::from_utf8_lossy(uri).to_string();
            }
            return Ok(Some(Turn::Again));
        }

        if let Some(host) = &response.like_host {
            Self::bump(&mut translate.n_like_host, 2, "LIKE_HOST")?;
            translate.request.host = host.clone();
            return Ok(Some(Turn::Again));
        }

        if !response.want.is_empty() {
            Self::bump(&mut translate.n_want, 1, "WANT")?;
            translate.request.want = response.want.clone();
            return Ok(Some(Turn::Again));
        }

        if let Some(payload) = &response.want_full_uri {
            Self::bump(&mut translate.n_want_full_uri, 1, "WANT_FULL_URI")?;
            translate.request.want_full_uri = Some(payload.clone());
            translate.request.uri = raw_uri;
            return Ok(Some(Turn::Again));
        }

        if response.want_user {
            translate.want_user = true;
            if let Some(user) = &user {
                if translate.request.user.as_deref() != Some(user.as_str()) {
                    translate.request.user = Some(user.clone());
                    return Ok(Some(Turn::Again));
                }
            }
        }

        if let Some(payload) = &response.layout {
            Self::bump(&mut translate.n_layout, 2, "LAYOUT")?;
            translate.request.layout = Some(payload.clone());
            return Ok(Some(Turn::Again));
        }

        Ok(None)
    }

    /// Filesystem probe turns for file-backed addresses
    async fn check_file_probes(&mut self, response: &TranslateResponse) -> Result<bool> {
        if let Some(path) = &response.read_file {
            Self::bump(&mut self.request.translate.n_read_file, 1, "READ_FILE")?;
            let content = tokio::fs::read(path).await.unwrap_or_default();
            self.request.translate.request.read_file = Some(Bytes::from(content));
            return Ok(true);
        }

        let Some(ResourceAddress::Local(file)) = &response.address else {
            return Ok(false);
        };
        let path = self.effective_file_path(file);

        if let Some(payload) = &response.path_exists {
            if tokio::fs::metadata(&path).await.is_ok() {
                Self::bump(&mut self.request.translate.n_path_exists, 2, "PATH_EXISTS")?;
                self.request.translate.request.path_exists = Some(payload.clone());
                return Ok(true);
            }
        }

        if !response.probe_suffixes.is_empty() {
            Self::bump(
                &mut self.request.translate.n_probe_path_suffixes,
                2,
                "PROBE_PATH_SUFFIXES",
            )?;
            for suffix in &response.probe_suffixes {
                let candidate = format!("{}{}", path, suffix);
                if tokio::fs::metadata(&candidate).await.is_ok() {
                    self.request.translate.request.probe_path_suffixes =
                        response.probe_path_suffixes.clone();
                    self.request.translate.request.probe_suffix = Some(suffix.clone());
                    return Ok(true);
                }
            }
            return Err(RelayError::NotFound);
        }

        let probe = tokio::fs::metadata(&path).await;
        match probe {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if let Some(payload) = &response.file_not_found {
                    Self::bump(
                        &mut self.request.translate.n_file_not_found,
                        20,
                        "FILE_NOT_FOUND",
                    )?;
                    self.request.translate.request.file_not_found = Some(payload.clone());
                    return Ok(true);
                }
            }
            Err(e) if file::is_enotdir(&e) => {
                if let Some(payload) = &response.enotdir {
                    Self::bump(&mut self.request.translate.n_enotdir, 20, "ENOTDIR")?;
                    self.request.translate.request.enotdir = Some(payload.clone());
                    return Ok(true);
                }
            }
            Ok(metadata) if metadata.is_dir() => {
                if let Some(payload) = &response.directory_index {
                    Self::bump(
                        &mut self.request.translate.n_directory_index,
                        4,
                        "DIRECTORY_INDEX",
                    )?;
                    self.request.translate.request.directory_index = Some(payload.clone());
                    return Ok(true);
                }
            }
            _ => {}
        }

        Ok(false)
    }

    /// Translation lookup by URI suffix to determine the Content-Type
    fn check_content_type_lookup(&mut self, response: &TranslateResponse) -> bool {
        if !response.content_type_lookup {
            return false;
        }
        if self.request.translate.request.suffix.is_some() {
            return false;
        }
        let Some(ResourceAddress::Local(file)) = &response.address else {
            return false;
        };
        let Some(suffix) = file.path.rsplit('.').next() else {
            return false;
        };
        self.request.translate.request.suffix = Some(suffix.to_string());
        true
    }

    /// The effective file path with path_info merged in
    fn effective_file_path(&self, file: &FileAddress) -> String {
        match &self.request.uri.path_info {
            Some(info) => format!("{}{}", file.path, info),
            None => file.path.clone(),
        }
    }

    fn check_csrf(&self, response: &TranslateResponse) -> Result<()> {
        if !response.require_csrf_token {
            return Ok(());
        }
        if matches!(self.request.method, Method::GET | Method::HEAD) {
            return Ok(());
        }

        let bad_token = || RelayError::Forbidden("Bad CSRF token".to_string());

        // the token's format and time window are checked before the
        // session is even looked at
        let token = self
            .request
            .headers
            .get("x-cm4all-csrf-token")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(bad_token)?;
        let token = super::csrf::CsrfToken::parse(token).ok_or_else(bad_token)?;

        if !token.time_valid(std::time::SystemTime::now()) {
            return Err(bad_token());
        }

        // ignore this requirement if there is no session
        let Some(salt) = self
            .session
            .as_ref()
            .and_then(|lease| lease.with(|s| s.csrf_salt))
        else {
            return Ok(());
        };

        if !token.matches_salt(salt) {
            return Err(bad_token());
        }
        Ok(())
    }

    /// Route the request according to the final translation decision
    async fn dispatch(&mut self, response: &TranslateResponse) -> Result<HttpResponse> {
        if let Some(location) = &response.redirect {
            let status = response.status.unwrap_or(StatusCode::SEE_OTHER);
            let mut headers = HeaderMap::new();
            if let Ok(value) = HeaderValue::from_str(location) {
                headers.insert(header::LOCATION, value);
            }
            return Ok(HttpResponse::new(status, headers, Body::empty()));
        }

        if let Some(location) = &response.bounce {
            // bounce carries the original URI as a query parameter
            let target = format!(
                "{}{}",
                location,
                urlencode(&format!(
                    "{}{}",
                    self.request.translate.request.host, self.request.raw_uri
                ))
            );
            let mut headers = HeaderMap::new();
            if let Ok(value) = HeaderValue::from_str(&target) {
                headers.insert(header::LOCATION, value);
            }
            return Ok(HttpResponse::new(
                StatusCode::SEE_OTHER,
                headers,
                Body::empty(),
            ));
        }

        if let Some(message) = &response.message {
            let status = response.status.unwrap_or(StatusCode::OK);
            return Ok(HttpResponse::plain(status, message));
        }

        if response.tiny_image {
            let mut headers = HeaderMap::new();
            headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("image/gif"));
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(TINY_GIF.len()));
            return Ok(HttpResponse::new(
                StatusCode::OK,
                headers,
                Body::full(Bytes::from_static(TINY_GIF)),
            ));
        }

        if let Some(challenge) = &response.www_authenticate {
            let mut headers = HeaderMap::new();
            if let Ok(value) = HeaderValue::from_str(challenge) {
                headers.insert(header::WWW_AUTHENTICATE, value);
            }
            return Ok(HttpResponse::new(
                StatusCode::UNAUTHORIZED,
                headers,
                Body::full(Bytes::from_static(b"Unauthorized")),
            ));
        }

        let address = match &response.address {
            Some(address) => address,
            None => {
                if let Some(status) = response.status {
                    return Ok(HttpResponse::new(status, HeaderMap::new(), Body::empty()));
                }
                return Err(RelayError::message(StatusCode::BAD_GATEWAY, "Empty response"));
            }
        };

        match address {
            ResourceAddress::Local(file) => {
                let mut file = file.clone();
                if let Some(info) = &self.request.uri.path_info {
                    file.path.push_str(info);
                }
                if let Some(content_type) = &response.content_type {
                    file.content_type = Some(content_type.clone());
                }
                file::handle_file(
                    &self.instance.config.file,
                    &self.request.method,
                    &self.request.headers,
                    &file,
                    !response.transformations.is_empty(),
                )
                .await
            }

            ResourceAddress::Http(_) | ResourceAddress::Cgi(_) => {
                self.proxy_request(response, address).await
            }

            ResourceAddress::Nfs(nfs) => {
                let Some(nfs_cache) = &self.instance.nfs_cache else {
                    return Err(RelayError::message(
                        StatusCode::BAD_GATEWAY,
                        "NFS support not configured",
                    ));
                };
                let range = simple_range(&self.request.headers);
                nfs_cache.serve(nfs, range).await
            }

            ResourceAddress::None => {
                Err(RelayError::message(StatusCode::BAD_GATEWAY, "Empty response"))
            }
        }
    }

    /// Forward to an upstream through the caching resource loader
    async fn proxy_request(
        &mut self,
        response: &TranslateResponse,
        address: &ResourceAddress,
    ) -> Result<HttpResponse> {
        let effective = address.apply(
            self.request.uri.path_info.as_deref(),
            self.request.uri.query.as_deref(),
        );

        let mut headers = forward_headers(&self.request.headers);

        // cookie jar: replay cookies the jar holds for this realm
        if response.collect_cookies {
            if let Some(session) = &self.session {
                let realm = self.request.realm.clone();
                let jar = session
                    .with(|s| {
                        let realm = s.realm_mut(&realm);
                        realm
                            .cookies
                            .iter()
                            .map(|(k, v)| format!("{}={}", k, v))
                            .collect::<Vec<_>>()
                            .join("; ")
                    })
                    .unwrap_or_default();
                if !jar.is_empty() {
                    if let Ok(value) = HeaderValue::from_str(&jar) {
                        headers.insert(header::COOKIE, value);
                    }
                }
            }
        }

        let params = ResourceRequestParams {
            obey_no_cache: true,
            cache_tag: response.cache_tag.clone(),
            user: self.request.user.clone(),
            sticky_hash: self.request.session_id.map(|id| id as u64),
            ..Default::default()
        };

        let body = self.request.body.take().unwrap_or_else(Body::empty);
        let mut upstream = self
            .instance
            .cached_loader
            .send_request(params, self.request.method.clone(), &effective, None, headers, body)
            .await?;

        if response.collect_cookies {
            self.collect_cookies(&mut upstream.headers);
        }

        Ok(upstream)
    }

    /// Move upstream Set-Cookie headers into the session's cookie jar
    fn collect_cookies(&self, headers: &mut HeaderMap) {
        let Some(session) = &self.session else { return };

        let collected: Vec<(String, String)> = headers
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(|v| {
                let first = v.split(';').next()?;
                let (name, value) = first.split_once('=')?;
                Some((name.trim().to_string(), value.trim().to_string()))
            })
            .collect();
        if collected.is_empty() {
            return;
        }

        headers.remove(header::SET_COOKIE);
        let realm = self.request.realm.clone();
        session.with(|s| {
            let realm = s.realm_mut(&realm);
            for (name, value) in collected {
                realm.cookies.insert(name, value);
            }
        });
        debug!("cookies collected into session jar");
    }

    /// CHAIN: after the current upstream response, ask the translation
    /// service where to send it next
    async fn maybe_chain(
        &mut self,
        response: &TranslateResponse,
        upstream: HttpResponse,
    ) -> Result<HttpResponse> {
        let Some(chain) = &response.chain else {
            return Ok(upstream);
        };

        Self::bump(&mut self.request.translate.n_chain, 1, "CHAIN")?;
        debug!("chain decision requested");

        let mut chain_request = self.request.translate.request.clone();
        chain_request.chain = Some(chain.clone());
        chain_request.chain_header = Some(upstream.status.as_u16().to_string());

        let decision = self
            .instance
            .translate_cache
            .get_or_translate(&self.instance.translation, &chain_request)
            .await
            .map_err(|_| {
                RelayError::message(StatusCode::BAD_GATEWAY, "Configuration server failed")
            })?;

        if decision.chain.is_some() {
            return Err(RelayError::message(
                StatusCode::BAD_GATEWAY,
                "Too many consecutive CHAIN packets",
            ));
        }

        if decision.break_chain {
            return Ok(upstream);
        }

        let Some(target) = &decision.address else {
            return Ok(upstream);
        };

        // reissue the captured response to the chain target
        let mut headers = HeaderMap::new();
        if let Some(content_type) = upstream.headers.get(header::CONTENT_TYPE) {
            headers.insert(header::CONTENT_TYPE, content_type.clone());
        }
        let params = ResourceRequestParams {
            obey_no_cache: true,
            cache_tag: decision.cache_tag.clone(),
            user: self.request.user.clone(),
            ..Default::default()
        };
        self.instance
            .cached_loader
            .send_request(
                params,
                Method::POST,
                target,
                Some(upstream.status),
                headers,
                upstream.body,
            )
            .await
    }

    /// Map an error to a response, consulting the error document if one
    /// is configured
    pub async fn error_response(&mut self, error: RelayError) -> HttpResponse {
        if matches!(error, RelayError::NotModified) {
            return HttpResponse::new(StatusCode::NOT_MODIFIED, HeaderMap::new(), Body::empty());
        }

        let status = error.to_http_status();

        if let Some(response) = self.error_document(status).await {
            return response;
        }

        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain"),
        );
        if let RelayError::RangeNotSatisfiable { size } = &error {
            if let Ok(value) = HeaderValue::from_str(&format!("bytes */{}", size)) {
                headers.insert(header::CONTENT_RANGE, value);
            }
        }
        if let RelayError::MethodNotAllowed { allow } = &error {
            headers.insert(header::ALLOW, HeaderValue::from_static(allow));
        }

        let body = if self.instance.config.verbose_response {
            error.verbose_message()
        } else {
            match &error {
                RelayError::Message { message, .. } => message.clone(),
                other => other.canonical_phrase().to_string(),
            }
        };

        HttpResponse::new(status, headers, Body::full(Bytes::from(body)))
    }

    /// Fetch a configured error document; its body replaces the error
    /// body, the status stays
    async fn error_document(&mut self, status: StatusCode) -> Option<HttpResponse> {
        if !(status.is_client_error() || status.is_server_error()) || self.request.transformed {
            return None;
        }
        let translate = self.request.translate.response.clone()?;
        let payload = translate.error_document.clone()?;

        let mut request = self.request.translate.request.clone();
        request.error_document = Some(payload);
        request.error_document_status = Some(status);

        let decision = self
            .instance
            .translate_cache
            .get_or_translate(&self.instance.translation, &request)
            .await
            .ok()?;
        let address = decision.address?;

        let result = self
            .instance
            .cached_loader
            .send_request(
                ResourceRequestParams::obeying_no_cache(),
                Method::GET,
                &address,
                None,
                HeaderMap::new(),
                Body::empty(),
            )
            .await;

        match result {
            Ok(document) if document.status.is_success() => {
                debug!(status = status.as_u16(), "serving error document");
                Some(HttpResponse::new(status, document.headers, document.body))
            }
            _ => None,
        }
    }
}

/// Copy request headers for an upstream hop, dropping hop-by-hop headers
/// and the session cookie
fn forward_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        match *name {
            header::CONNECTION
            | header::TRANSFER_ENCODING
            | header::UPGRADE
            | header::TE
            | header::COOKIE
            | header::HOST => continue,
            _ => {
                out.insert(name.clone(), value.clone());
            }
        }
    }
    out
}

/// A plain single range, for the NFS path
fn simple_range(headers: &HeaderMap) -> Option<(u64, u64)> {
    let value = headers.get(header::RANGE)?.to_str().ok()?;
    let spec = value.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

fn urlencode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for b in input.bytes() {
        match b {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}
