//! Response post-processing
//!
//! The transformation pipeline (filters via the filter cache, the
//! XML/CSS/text processors, the substitution engine) and the final
//! header pass: `Server`, `Date`, `Vary`, the session cookie, the CSRF
//! token and on-the-fly gzip.

use super::{csrf, Request};
use crate::body::Body;
use crate::error::Result;
use crate::instance::Instance;
use crate::resource::{HttpResponse, ResourceRequestParams};
use crate::session::SessionLease;
use crate::translation::{Transformation, TranslateResponse, TranslationCommand};
use async_trait::async_trait;
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use std::io::Write as _;
use std::sync::Arc;
use tracing::debug;

/// Substitution and processor stages collect at most this much body
const TRANSFORM_BODY_LIMIT: usize = 4 * 1024 * 1024;

/// Bodies below this are not worth compressing
const GZIP_THRESHOLD: u64 = 256;

/// Which processor stage to run
#[derive(Debug, Clone, Copy)]
pub enum ProcessorKind {
    Xml { container: bool },
    Css,
    Text,
}

/// The XML/CSS/text processors are external collaborators: they consume
/// a status+headers+body and produce the same
#[async_trait]
pub trait ResponseProcessor: Send + Sync {
    async fn process(
        &self,
        kind: ProcessorKind,
        response: HttpResponse,
        request_body: Option<Body>,
    ) -> Result<HttpResponse>;
}

/// Default processor: passes the response through untouched
pub struct PassthroughProcessor;

#[async_trait]
impl ResponseProcessor for PassthroughProcessor {
    async fn process(
        &self,
        _kind: ProcessorKind,
        response: HttpResponse,
        _request_body: Option<Body>,
    ) -> Result<HttpResponse> {
        Ok(response)
    }
}

/// Run the translation response's transformation chain over the
/// response.  The first transformation may receive the request body;
/// thereafter bodies cascade from stage to stage.
pub async fn apply_transformations(
    instance: &Arc<Instance>,
    request: &mut Request,
    translate: &TranslateResponse,
    mut response: HttpResponse,
) -> Result<HttpResponse> {
    for (index, transformation) in translate.transformations.iter().enumerate() {
        // only a processor running as the first stage may consume the
        // request body
        let request_body = match transformation {
            Transformation::Process { .. }
            | Transformation::ProcessCss
            | Transformation::ProcessText
                if index == 0 =>
            {
                request.body.take()
            }
            _ => None,
        };

        response = match transformation {
            Transformation::Filter {
                address,
                reveal_user,
            } => {
                let source_id = response
                    .headers
                    .get(header::ETAG)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                let params = ResourceRequestParams {
                    body_etag: source_id,
                    user: reveal_user
                        .then(|| request.user.clone())
                        .flatten(),
                    cache_tag: translate.cache_tag.clone(),
                    obey_no_cache: true,
                    ..Default::default()
                };
                debug!("running filter");
                instance
                    .filter_loader
                    .send_request(
                        params,
                        Method::POST,
                        address,
                        Some(response.status),
                        response.headers,
                        response.body,
                    )
                    .await?
            }

            Transformation::Process { container } => {
                instance
                    .processor
                    .process(
                        ProcessorKind::Xml {
                            container: *container,
                        },
                        response,
                        request_body,
                    )
                    .await?
            }

            Transformation::ProcessCss => {
                instance
                    .processor
                    .process(ProcessorKind::Css, response, request_body)
                    .await?
            }

            Transformation::ProcessText => {
                instance
                    .processor
                    .process(ProcessorKind::Text, response, request_body)
                    .await?
            }

            Transformation::Subst { pairs } => apply_subst(response, pairs).await?,
        };

        request.transformed = true;
    }

    Ok(response)
}

/// The substitution engine: literal string replacement over the body
async fn apply_subst(
    response: HttpResponse,
    pairs: &[(String, String)],
) -> Result<HttpResponse> {
    if pairs.is_empty() {
        return Ok(response);
    }

    let HttpResponse {
        status,
        mut headers,
        body,
    } = response;

    let data = body.collect(TRANSFORM_BODY_LIMIT).await?;
    let mut text = String::from_utf8_lossy(&data).into_owned();
    for (from, to) in pairs {
        text = text.replace(from, to);
    }

    let data = Bytes::from(text);
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(data.len()));
    Ok(HttpResponse::new(status, headers, Body::full(data)))
}

/// The translation commands that become `Vary` request headers
fn vary_header_name(command: TranslationCommand) -> Option<&'static str> {
    match command {
        TranslationCommand::Language => Some("accept-language"),
        TranslationCommand::UserAgent => Some("user-agent"),
        TranslationCommand::Session | TranslationCommand::User => Some("cookie"),
        TranslationCommand::Authorization => Some("authorization"),
        _ => None,
    }
}

/// The final header pass before the response leaves the core
pub fn finalize_response(
    instance: &Arc<Instance>,
    request: &Request,
    session: &Option<SessionLease>,
    translate: &TranslateResponse,
    response: &mut HttpResponse,
) {
    let headers = &mut response.headers;

    headers.insert(
        header::SERVER,
        HeaderValue::from_static(concat!("edge-relay/", env!("CARGO_PKG_VERSION"))),
    );
    if !headers.contains_key(header::DATE) {
        if let Ok(value) = HeaderValue::from_str(&crate::http_date::format_http_date(
            std::time::SystemTime::now(),
        )) {
            headers.insert(header::DATE, value);
        }
    }

    // advertise what the translation decision depended on
    let vary: Vec<&str> = translate
        .vary
        .iter()
        .filter_map(|&command| vary_header_name(command))
        .collect();
    if !vary.is_empty() {
        let value = match headers.get(header::VARY).and_then(|v| v.to_str().ok()) {
            Some(existing) => format!("{}, {}", existing, vary.join(", ")),
            None => vary.join(", "),
        };
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(header::VARY, value);
        }
    }

    if request.send_session_cookie && !request.stateless {
        if let Some(id) = request.session_id {
            let mut cookie = format!(
                "{}={:032x}; Path=/; HttpOnly; SameSite=Lax",
                instance.config.session.cookie_name, id
            );
            if translate.secure_cookie || request.is_tls {
                cookie.push_str("; Secure");
            }
            if let Ok(value) = HeaderValue::from_str(&cookie) {
                headers.append(header::SET_COOKIE, value);
            }
        }
    }

    if translate.send_csrf_token {
        if let Some(salt) = session.as_ref().and_then(|l| l.with(|s| s.csrf_salt)) {
            let token = csrf::generate_token(salt, std::time::SystemTime::now());
            if let Ok(value) = HeaderValue::from_str(&token) {
                headers.insert("x-cm4all-csrf-token", value);
            }
        }
    }

    if translate.auto_gzip {
        maybe_gzip(request, response);
    }
}

fn compressible(headers: &HeaderMap) -> bool {
    if headers.contains_key(header::CONTENT_ENCODING) {
        return false;
    }
    let Some(content_type) = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };
    content_type.starts_with("text/")
        || content_type.starts_with("application/json")
        || content_type.starts_with("application/javascript")
        || content_type.starts_with("image/svg")
}

/// Compress a buffered response body when the client accepts gzip
fn maybe_gzip(request: &Request, response: &mut HttpResponse) {
    if response.status != StatusCode::OK {
        return;
    }
    let accepts = request
        .headers
        .get(header::ACCEPT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').any(|e| e.trim().starts_with("gzip")))
        .unwrap_or(false);
    if !accepts || !compressible(&response.headers) {
        return;
    }

    let Some(data) = response.body.full_bytes() else {
        return;
    };
    if (data.len() as u64) < GZIP_THRESHOLD {
        return;
    }

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    if encoder.write_all(&data).is_err() {
        return;
    }
    let Ok(compressed) = encoder.finish() else {
        return;
    };
    if compressed.len() >= data.len() {
        return;
    }

    debug!(
        from = data.len(),
        to = compressed.len(),
        "auto-gzip applied"
    );
    let headers = &mut response.headers;
    headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(compressed.len()));
    let value = match headers.get(header::VARY).and_then(|v| v.to_str().ok()) {
        Some(existing) if !existing.contains("accept-encoding") => {
            format!("{}, accept-encoding", existing)
        }
        Some(existing) => existing.to_string(),
        None => "accept-encoding".to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(header::VARY, value);
    }
    response.body = Body::full(Bytes::from(compressed));
}
