//! Local file handler
//!
//! Serves `Local` resource addresses: stat via async IO, conditional
//! request evaluation (`If-Match`, `If-None-Match`, `If-Modified-Since`,
//! `If-Unmodified-Since`, `Range`/`If-Range`), probing of precompressed
//! `.br`/`.gz` siblings, character-device streaming, and the legacy
//! inline-auth compatibility shim.

use crate::body::Body;
use crate::config::FileConfig;
use crate::error::{RelayError, Result};
use crate::http_date::{format_http_date, parse_http_date};
use crate::resource::{FileAddress, HttpResponse};
use bytes::Bytes;
use http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::time::SystemTime;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

/// Marker an HTML file must start with for the inline-auth shim to apply
const INLINE_AUTH_MARKER: &[u8] = b"<!--ACCESS-->";

/// Chunk size for streamed file bodies
const READ_CHUNK: usize = 64 * 1024;

/// Facts about the file needed across the handler
struct FileInfo {
    size: u64,
    mtime: SystemTime,
    etag: String,
}

fn make_etag(metadata: &std::fs::Metadata) -> String {
    format!(
        "\"{:x}-{:x}-{:x}\"",
        metadata.dev(),
        metadata.ino(),
        metadata.mtime()
    )
}

/// ENOTDIR appears when a path component is a regular file
pub fn is_enotdir(error: &std::io::Error) -> bool {
    error.raw_os_error() == Some(20)
}

fn classify(error: std::io::Error) -> RelayError {
    match error.kind() {
        std::io::ErrorKind::NotFound => RelayError::NotFound,
        std::io::ErrorKind::PermissionDenied => {
            RelayError::Forbidden("file access denied".to_string())
        }
        _ if is_enotdir(&error) => RelayError::NotFound,
        _ => RelayError::Io(error),
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: header::HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn etag_list_matches(list: &str, etag: &str) -> bool {
    list.split(',').any(|t| {
        let t = t.trim();
        t == "*" || t == etag
    })
}

/// `If-*` evaluation per RFC 9110 13.2.2 precedence
fn evaluate_conditionals(headers: &HeaderMap, info: &FileInfo) -> Result<()> {
    if let Some(if_match) = header_str(headers, header::IF_MATCH) {
        if !etag_list_matches(if_match, &info.etag) {
            return Err(RelayError::PreconditionFailed);
        }
    }

    if let Some(if_unmodified) =
        header_str(headers, header::IF_UNMODIFIED_SINCE).and_then(parse_http_date)
    {
        if info.mtime > if_unmodified {
            return Err(RelayError::PreconditionFailed);
        }
    }

    if let Some(if_none_match) = header_str(headers, header::IF_NONE_MATCH) {
        if etag_list_matches(if_none_match, &info.etag) {
            return Err(RelayError::NotModified);
        }
    } else if let Some(if_modified) =
        header_str(headers, header::IF_MODIFIED_SINCE).and_then(parse_http_date)
    {
        // second granularity: not newer means unchanged
        if info.mtime <= if_modified {
            return Err(RelayError::NotModified);
        }
    }

    Ok(())
}

/// Parsed single byte range
enum ParsedRange {
    None,
    Satisfiable(u64, u64),
    Unsatisfiable,
}

fn parse_range(headers: &HeaderMap, info: &FileInfo) -> ParsedRange {
    let Some(value) = header_str(headers, header::RANGE) else {
        return ParsedRange::None;
    };
    let Some(spec) = value.strip_prefix("bytes=") else {
        return ParsedRange::None;
    };
    if spec.contains(',') {
        // multiple ranges are served as the full entity
        return ParsedRange::None;
    }

    // If-Range: only honor the range when the entity is unchanged
    if let Some(if_range) = header_str(headers, header::IF_RANGE) {
        let matches = if if_range.starts_with('"') || if_range.starts_with("W/") {
            if_range == info.etag
        } else {
            parse_http_date(if_range).is_some_and(|t| info.mtime <= t)
        };
        if !matches {
            return ParsedRange::None;
        }
    }

    let Some((start, end)) = spec.split_once('-') else {
        return ParsedRange::None;
    };

    let (start, end) = match (start.trim(), end.trim()) {
        ("", suffix) => {
            // last N bytes
            let Ok(n) = suffix.parse::<u64>() else {
                return ParsedRange::None;
            };
            if n == 0 || info.size == 0 {
                return ParsedRange::Unsatisfiable;
            }
            (info.size.saturating_sub(n), info.size - 1)
        }
        (first, "") => {
            let Ok(a) = first.parse::<u64>() else {
                return ParsedRange::None;
            };
            if a >= info.size {
                return ParsedRange::Unsatisfiable;
            }
            (a, info.size - 1)
        }
        (first, last) => {
            let (Ok(a), Ok(b)) = (first.parse::<u64>(), last.parse::<u64>()) else {
                return ParsedRange::None;
            };
            if a > b || a >= info.size {
                return ParsedRange::Unsatisfiable;
            }
            (a, b.min(info.size - 1))
        }
    };
    ParsedRange::Satisfiable(start, end)
}

/// Content-Type from the translation response or by file extension
fn content_type_of(address: &FileAddress) -> &str {
    if let Some(content_type) = &address.content_type {
        return content_type;
    }
    match address.path.rsplit('.').next() {
        Some("html") | Some("htm") => "text/html",
        Some("css") => "text/css",
        Some("js") => "text/javascript",
        Some("json") => "application/json",
        Some("xml") => "text/xml",
        Some("txt") => "text/plain",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        Some("pdf") => "application/pdf",
        Some("woff2") => "font/woff2",
        _ => "application/octet-stream",
    }
}

fn accepts_encoding(headers: &HeaderMap, coding: &str) -> bool {
    header_str(headers, header::ACCEPT_ENCODING)
        .map(|value| {
            value.split(',').any(|e| {
                let e = e.trim();
                let name = e.split(';').next().unwrap_or(e).trim();
                name == coding || name == "*"
            })
        })
        .unwrap_or(false)
}

/// Stream a byte range of a file as a body
fn stream_file(path: String, offset: u64, len: u64) -> Body {
    let declared = (len != u64::MAX).then_some(len);
    let (tx, body) = Body::channel(declared);
    tokio::spawn(async move {
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) => {
                let _ = tx.send_error(classify(e)).await;
                return;
            }
        };
        if offset > 0 {
            if let Err(e) = file.seek(std::io::SeekFrom::Start(offset)).await {
                let _ = tx.send_error(classify(e)).await;
                return;
            }
        }

        let mut remaining = len;
        let mut buf = vec![0u8; READ_CHUNK];
        while remaining > 0 {
            let want = (remaining as usize).min(READ_CHUNK);
            match file.read(&mut buf[..want]).await {
                Ok(0) => break,
                Ok(n) => {
                    remaining -= n as u64;
                    if tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = tx.send_error(classify(e)).await;
                    break;
                }
            }
        }
    });
    body
}

/// Check HTTP basic credentials against the sibling `.access` file
async fn check_inline_auth(path: &str, headers: &HeaderMap) -> Result<()> {
    let unauthorized = || RelayError::Message {
        status: StatusCode::UNAUTHORIZED,
        message: "Unauthorized".to_string(),
    };

    let Some(authorization) = header_str(headers, header::AUTHORIZATION) else {
        return Err(unauthorized());
    };
    let Some(encoded) = authorization.strip_prefix("Basic ") else {
        return Err(unauthorized());
    };
    let decoded = base64_decode(encoded.trim()).ok_or_else(unauthorized)?;
    let credentials = String::from_utf8(decoded).map_err(|_| unauthorized())?;

    let access_path = format!("{}.access", path);
    let access = tokio::fs::read_to_string(&access_path)
        .await
        .map_err(|_| unauthorized())?;

    if access.lines().any(|line| line.trim() == credentials) {
        Ok(())
    } else {
        Err(unauthorized())
    }
}

/// Minimal base64 decoder for the Basic scheme
fn base64_decode(input: &str) -> Option<Vec<u8>> {
    fn value(c: u8) -> Option<u32> {
        match c {
            b'A'..=b'Z' => Some((c - b'A') as u32),
            b'a'..=b'z' => Some((c - b'a' + 26) as u32),
            b'0'..=b'9' => Some((c - b'0' + 52) as u32),
            b'+' => Some(62),
            b'/' => Some(63),
            _ => None,
        }
    }

    let input = input.trim_end_matches('=').as_bytes();
    let mut out = Vec::with_capacity(input.len() * 3 / 4);
    for chunk in input.chunks(4) {
        let mut acc = 0u32;
        for &c in chunk {
            acc = (acc << 6) | value(c)?;
        }
        let bits = chunk.len() * 6;
        acc <<= 24 - bits;
        let bytes = [(acc >> 16) as u8, (acc >> 8) as u8, acc as u8];
        out.extend_from_slice(&bytes[..(bits - 6) / 8]);
    }
    Some(out)
}

/// Serve a local file.
///
/// `transformed` suppresses the precompressed probing: a transformation
/// must see the plain body.
pub async fn handle_file(
    config: &FileConfig,
    method: &Method,
    headers: &HeaderMap,
    address: &FileAddress,
    transformed: bool,
) -> Result<HttpResponse> {
    let metadata = tokio::fs::metadata(&address.path)
        .await
        .map_err(classify)?;

    if metadata.file_type().is_char_device() {
        // byte stream, no ranges, no conditionals
        debug!(path = address.path, "serving character device");
        let mut response_headers = HeaderMap::new();
        response_headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/octet-stream"),
        );
        return Ok(HttpResponse::new(
            StatusCode::OK,
            response_headers,
            stream_file(address.path.clone(), 0, u64::MAX),
        ));
    }

    if !metadata.is_file() {
        return Err(RelayError::NotFound);
    }

    if config.legacy_inline_auth
        && address.path.starts_with(&config.legacy_inline_auth_prefix)
        && address.path.ends_with(".html")
    {
        let mut first = [0u8; INLINE_AUTH_MARKER.len()];
        if let Ok(mut file) = tokio::fs::File::open(&address.path).await {
            if file.read_exact(&mut first).await.is_ok() && first[..] == *INLINE_AUTH_MARKER {
                check_inline_auth(&address.path, headers).await?;
            }
        }
    }

    let info = FileInfo {
        size: metadata.len(),
        mtime: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        etag: make_etag(&metadata),
    };

    evaluate_conditionals(headers, &info)?;

    let mut response_headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(content_type_of(address)) {
        response_headers.insert(header::CONTENT_TYPE, value);
    }
    if let Ok(value) = HeaderValue::from_str(&format_http_date(info.mtime)) {
        response_headers.insert(header::LAST_MODIFIED, value);
    }
    if let Ok(value) = HeaderValue::from_str(&info.etag) {
        response_headers.insert(header::ETAG, value);
    }
    response_headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));

    let range = parse_range(headers, &info);

    // precompressed variants only for plain full-entity responses;
    // probe order: auto .br sibling, auto .gz sibling, then the fixed
    // gzipped path from the translation server
    if !transformed && matches!(range, ParsedRange::None) {
        if address.auto_gzipped || address.auto_brotli || address.gzipped.is_some() {
            response_headers.insert(header::VARY, HeaderValue::from_static("accept-encoding"));
        }

        let mut candidates: Vec<(&str, String)> = Vec::new();
        if address.auto_brotli {
            candidates.push(("br", format!("{}.br", address.path)));
        }
        if address.auto_gzipped {
            candidates.push(("gzip", format!("{}.gz", address.path)));
        }
        if let Some(gzipped) = &address.gzipped {
            candidates.push(("gzip", gzipped.clone()));
        }

        for (coding, candidate) in candidates {
            if !accepts_encoding(headers, coding) {
                continue;
            }
            if let Ok(compressed) = tokio::fs::metadata(&candidate).await {
                if compressed.is_file() {
                    debug!(path = candidate, coding, "serving precompressed variant");
                    if let Ok(value) = HeaderValue::from_str(coding) {
                        response_headers.insert(header::CONTENT_ENCODING, value);
                    }
                    response_headers
                        .insert(header::CONTENT_LENGTH, HeaderValue::from(compressed.len()));
                    let body = if method == Method::HEAD {
                        Body::empty()
                    } else {
                        stream_file(candidate, 0, compressed.len())
                    };
                    return Ok(HttpResponse::new(StatusCode::OK, response_headers, body));
                }
            }
        }
    }

    let (status, offset, len) = match range {
        ParsedRange::Unsatisfiable => {
            return Err(RelayError::RangeNotSatisfiable { size: info.size });
        }
        ParsedRange::None => (StatusCode::OK, 0, info.size),
        ParsedRange::Satisfiable(start, end) => {
            if let Ok(value) = HeaderValue::from_str(&format!(
                "bytes {}-{}/{}",
                start, end, info.size
            )) {
                response_headers.insert(header::CONTENT_RANGE, value);
            }
            (StatusCode::PARTIAL_CONTENT, start, end - start + 1)
        }
    };

    response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));

    let body = if method == Method::HEAD {
        Body::empty()
    } else {
        stream_file(address.path.clone(), offset, len)
    };
    Ok(HttpResponse::new(status, response_headers, body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &tempfile::TempDir, name: &str, content: &[u8]) -> String {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content).unwrap();
        path.to_str().unwrap().to_string()
    }

    fn config() -> FileConfig {
        FileConfig::default()
    }

    async fn serve(
        path: &str,
        headers: HeaderMap,
        method: Method,
    ) -> Result<HttpResponse> {
        let address = FileAddress::new(path);
        handle_file(&config(), &method, &headers, &address, false).await
    }

    #[tokio::test]
    async fn test_basic_get() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "x.html", b"hello");

        let response = serve(&path, HeaderMap::new(), Method::GET).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(
            response.headers.get(header::CONTENT_TYPE).unwrap(),
            "text/html"
        );
        assert!(response.headers.contains_key(header::ETAG));
        assert!(response.headers.contains_key(header::LAST_MODIFIED));
        assert_eq!(response.body.collect(1024).await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_missing_file_404() {
        let dir = tempfile::tempdir().unwrap();
        let path = format!("{}/missing", dir.path().display());
        match serve(&path, HeaderMap::new(), Method::GET).await {
            Err(RelayError::NotFound) => {}
            other => panic!("unexpected: {:?}", other.map(|r| r.status)),
        }
    }

    #[tokio::test]
    async fn test_if_none_match_304() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "x.html", b"hello");

        let first = serve(&path, HeaderMap::new(), Method::GET).await.unwrap();
        let etag = first.headers.get(header::ETAG).unwrap().clone();

        let mut headers = HeaderMap::new();
        headers.insert(header::IF_NONE_MATCH, etag);
        match serve(&path, headers, Method::GET).await {
            Err(RelayError::NotModified) => {}
            other => panic!("unexpected: {:?}", other.map(|r| r.status)),
        }
    }

    #[tokio::test]
    async fn test_if_match_mismatch_412() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "x.html", b"hello");

        let mut headers = HeaderMap::new();
        headers.insert(header::IF_MATCH, HeaderValue::from_static("\"other\""));
        match serve(&path, headers, Method::GET).await {
            Err(RelayError::PreconditionFailed) => {}
            other => panic!("unexpected: {:?}", other.map(|r| r.status)),
        }
    }

    #[tokio::test]
    async fn test_range_request() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "x.bin", b"hello");

        let mut headers = HeaderMap::new();
        headers.insert(header::RANGE, HeaderValue::from_static("bytes=1-3"));
        let response = serve(&path, headers, Method::GET).await.unwrap();
        assert_eq!(response.status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(
            response.headers.get(header::CONTENT_RANGE).unwrap(),
            "bytes 1-3/5"
        );
        assert_eq!(response.body.collect(1024).await.unwrap(), "ell");
    }

    #[tokio::test]
    async fn test_range_out_of_bounds_416() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "x.bin", b"hello");

        let mut headers = HeaderMap::new();
        headers.insert(header::RANGE, HeaderValue::from_static("bytes=5-5"));
        match serve(&path, headers, Method::GET).await {
            Err(RelayError::RangeNotSatisfiable { size: 5 }) => {}
            other => panic!("unexpected: {:?}", other.map(|r| r.status)),
        }
    }

    #[tokio::test]
    async fn test_suffix_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "x.bin", b"0123456789");

        let mut headers = HeaderMap::new();
        headers.insert(header::RANGE, HeaderValue::from_static("bytes=-3"));
        let response = serve(&path, headers, Method::GET).await.unwrap();
        assert_eq!(response.status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.body.collect(1024).await.unwrap(), "789");
    }

    #[tokio::test]
    async fn test_head_has_headers_no_body() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "x.html", b"hello");

        let response = serve(&path, HeaderMap::new(), Method::HEAD).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.headers.get(header::CONTENT_LENGTH).unwrap(), "5");
        assert_eq!(response.body.collect(1024).await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_precompressed_gzip_sibling() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "x.html", b"plain content here");
        write_file(&dir, "x.html.gz", b"pretend-gzip");

        let mut address = FileAddress::new(&path);
        address.auto_gzipped = true;

        let mut headers = HeaderMap::new();
        headers.insert(
            header::ACCEPT_ENCODING,
            HeaderValue::from_static("gzip, deflate"),
        );
        let response = handle_file(&config(), &Method::GET, &headers, &address, false)
            .await
            .unwrap();
        assert_eq!(
            response.headers.get(header::CONTENT_ENCODING).unwrap(),
            "gzip"
        );
        assert_eq!(response.body.collect(1024).await.unwrap(), "pretend-gzip");

        // without Accept-Encoding the plain file is served
        let response = handle_file(&config(), &Method::GET, &HeaderMap::new(), &address, false)
            .await
            .unwrap();
        assert!(response.headers.get(header::CONTENT_ENCODING).is_none());
    }

    #[tokio::test]
    async fn test_fixed_gzipped_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "x.html", b"plain content here");
        // the translation server names an unrelated path, not a sibling
        let gzipped = write_file(&dir, "x.compressed", b"fixed-gzip-variant");

        let mut address = FileAddress::new(&path);
        address.gzipped = Some(gzipped);

        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
        let response = handle_file(&config(), &Method::GET, &headers, &address, false)
            .await
            .unwrap();
        assert_eq!(
            response.headers.get(header::CONTENT_ENCODING).unwrap(),
            "gzip"
        );
        assert_eq!(
            response.body.collect(1024).await.unwrap(),
            "fixed-gzip-variant"
        );

        // the auto .gz sibling takes precedence when both are enabled
        write_file(&dir, "x.html.gz", b"sibling-gzip");
        address.auto_gzipped = true;
        let response = handle_file(&config(), &Method::GET, &headers, &address, false)
            .await
            .unwrap();
        assert_eq!(response.body.collect(1024).await.unwrap(), "sibling-gzip");

        // without Accept-Encoding the plain file is served
        let response = handle_file(&config(), &Method::GET, &HeaderMap::new(), &address, false)
            .await
            .unwrap();
        assert!(response.headers.get(header::CONTENT_ENCODING).is_none());
        assert_eq!(
            response.body.collect(1024).await.unwrap(),
            "plain content here"
        );
    }

    #[tokio::test]
    async fn test_directory_is_not_a_file() {
        let dir = tempfile::tempdir().unwrap();
        match serve(dir.path().to_str().unwrap(), HeaderMap::new(), Method::GET).await {
            Err(RelayError::NotFound) => {}
            other => panic!("unexpected: {:?}", other.map(|r| r.status)),
        }
    }

    #[test]
    fn test_base64_decode() {
        assert_eq!(base64_decode("YWxpY2U6c2VjcmV0").unwrap(), b"alice:secret");
        assert_eq!(base64_decode("YQ==").unwrap(), b"a");
        assert!(base64_decode("!!!").is_none());
    }

    #[tokio::test]
    async fn test_inline_auth_gate() {
        let dir = tempfile::tempdir().unwrap();
        let mut content = Vec::from(INLINE_AUTH_MARKER);
        content.extend_from_slice(b"\n<html></html>");
        let path = write_file(&dir, "x.html", &content);
        write_file(&dir, "x.html.access", b"alice:secret\n");

        let config = FileConfig {
            legacy_inline_auth: true,
            legacy_inline_auth_prefix: dir.path().to_str().unwrap().to_string(),
        };
        let address = FileAddress::new(&path);

        // no credentials
        let err = handle_file(&config, &Method::GET, &HeaderMap::new(), &address, false)
            .await
            .unwrap_err();
        assert_eq!(err.to_http_status(), StatusCode::UNAUTHORIZED);

        // good credentials
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Basic YWxpY2U6c2VjcmV0"),
        );
        let response = handle_file(&config, &Method::GET, &headers, &address, false)
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::OK);
    }
}
